//! Transport adapter: handshake, outbound batches and the inbound broadcast feed

use crate::game::GameObjects;
use crate::scheduler::EventManager;
use log::{debug, error, info, warn};
use shared::protocol::{
    topic_matches, Batch, Header, ProtocolError, Record, Request, Subscription,
    DEFAULT_PUBLISH_PORT, DEFAULT_REQUEST_PORT, GVT_TOPIC, MAX_DATAGRAM,
};
use shared::Event;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no reply from server within {0:?}")]
    ReplyTimeout(Duration),
    #[error("unexpected reply `{0}`")]
    BadReply(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub self_id: String,
    pub server_host: String,
    pub request_port: u16,
    pub publish_port: u16,
    /// `None` waits for replies forever
    pub reply_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            self_id: "A".to_string(),
            server_host: "127.0.0.1".to_string(),
            request_port: DEFAULT_REQUEST_PORT,
            publish_port: DEFAULT_PUBLISH_PORT,
            reply_timeout: Some(Duration::from_secs(2)),
        }
    }
}

impl ClientConfig {
    pub fn request_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.request_port)
    }

    pub fn publish_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.publish_port)
    }
}

pub struct Client<O> {
    self_id: String,
    manager: Arc<EventManager<O>>,
    // Held for a whole request/reply exchange so pairs never interleave
    requests: Mutex<UdpSocket>,
    subscriber: Arc<UdpSocket>,
    reply_timeout: Option<Duration>,
    shutdown: watch::Sender<bool>,
}

impl<O: GameObjects + 'static> Client<O> {
    /// Opens both channels and subscribes to the GVT topic. No handshake is
    /// performed until `connect`.
    pub async fn new(
        config: &ClientConfig,
        manager: Arc<EventManager<O>>,
    ) -> Result<Self, ClientError> {
        let requests = UdpSocket::bind("0.0.0.0:0").await?;
        requests.connect(config.request_addr()).await?;
        info!("Connecting to server on {}...", config.request_addr());

        let subscriber = UdpSocket::bind("0.0.0.0:0").await?;
        subscriber.connect(config.publish_addr()).await?;
        let subscribe = Subscription::Subscribe(GVT_TOPIC.to_string()).encode();
        subscriber.send(subscribe.as_bytes()).await?;
        info!("Subscribing to server on {}...", config.publish_addr());

        let (shutdown, _) = watch::channel(false);

        Ok(Client {
            self_id: config.self_id.clone(),
            manager,
            requests: Mutex::new(requests),
            subscriber: Arc::new(subscriber),
            reply_timeout: config.reply_timeout,
            shutdown,
        })
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn manager(&self) -> &Arc<EventManager<O>> {
        &self.manager
    }

    pub async fn is_connected(&self) -> bool {
        self.manager.registry().lock().await.session.connected
    }

    pub async fn is_replaying(&self) -> bool {
        self.manager.registry().lock().await.session.replaying
    }

    /// Applies a movement of this peer's own object and queues it for the
    /// next batch. Nothing happens while replaying; returns whether it was taken.
    pub async fn move_local(&self, event: Event) -> bool {
        let registry = self.manager.registry().lock().await;
        if registry.session.replaying {
            debug!("Ignoring local movement during replay");
            return false;
        }
        let mut stage = self.manager.stage().lock().await;
        if let Some(movement) = event.as_movement() {
            stage
                .objects
                .apply_movement(&movement.target, movement.x, movement.y, movement.flag);
        }
        stage.queue_local(event);
        true
    }

    async fn request(&self, message: &str) -> Result<String, ClientError> {
        let socket = self.requests.lock().await;
        socket.send(message.as_bytes()).await?;

        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let len = match self.reply_timeout {
            Some(limit) => timeout(limit, socket.recv(&mut buffer))
                .await
                .map_err(|_| ClientError::ReplyTimeout(limit))??,
            None => socket.recv(&mut buffer).await?,
        };

        Ok(String::from_utf8_lossy(&buffer[..len]).into_owned())
    }

    /// Handshake: announces the local time and stores the offset the server
    /// assigns. Returns that offset.
    pub async fn connect(&self) -> Result<f64, ClientError> {
        let local_time = self.manager.registry().lock().await.requested_time();
        let request = Request::Connect {
            peer_id: self.self_id.clone(),
            local_time,
        };

        let reply = self.request(&request.encode()).await?;
        let connected_time = reply
            .trim()
            .parse::<f64>()
            .map_err(|_| ClientError::BadReply(reply.clone()))?;

        {
            let mut registry = self.manager.registry().lock().await;
            registry.session.connected = true;
            registry.session.replaying = false;
            registry.session.connected_time = connected_time;
            registry.add_queue(&self.self_id);
        }

        info!("Connected to server (offset {:.3})", connected_time);
        Ok(connected_time)
    }

    /// Sends this peer's claim plus every pending movement of its own
    /// character. Does nothing while disconnected or replaying.
    pub async fn send_handler(&self) -> Result<(), ClientError> {
        let (requested_time, connected_time) = {
            let registry = self.manager.registry().lock().await;
            if !registry.session.connected || registry.session.replaying {
                return Ok(());
            }
            (registry.requested_time(), registry.session.connected_time)
        };

        let outbound = self.manager.stage().lock().await.take_outbound();

        let mut batch = Batch::new(Header::new(
            self.self_id.as_str(),
            requested_time + connected_time,
        ));
        for event in &outbound {
            // Only this peer's character is ours to publish
            if event.as_movement().map(|m| m.target.as_str()) != Some(self.self_id.as_str()) {
                continue;
            }
            if let Some(record) = Record::from_movement(&self.self_id, event, connected_time) {
                batch.push(record);
            }
        }

        let _ack = self.request(&Request::Sync(batch).encode()).await?;
        Ok(())
    }

    /// Spawns the worker that reads the publish channel and forwards decoded
    /// batches. The worker stops when the shutdown flag is raised or the
    /// receiver is dropped.
    pub fn spawn_subscriber(&self) -> mpsc::UnboundedReceiver<Batch> {
        let socket = Arc::clone(&self.subscriber);
        let mut shutdown = self.shutdown.subscribe();
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];

            loop {
                let len = tokio::select! {
                    _ = shutdown.changed() => break,
                    result = socket.recv(&mut buffer) => match result {
                        Ok(len) => len,
                        Err(e) => {
                            error!("Error receiving broadcast: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            continue;
                        }
                    },
                };

                let text = String::from_utf8_lossy(&buffer[..len]);
                match Batch::decode(&text) {
                    Ok(batch) => {
                        for rejected in &batch.rejected {
                            warn!("Skipping record from {}: {}", batch.header.sender, rejected);
                        }
                        if batch_tx.send(batch).is_err() {
                            break;
                        }
                    }
                    Err(ProtocolError::Empty) => debug!("Empty broadcast"),
                    Err(_) if !topic_matches(&text, GVT_TOPIC) => {
                        debug!("Ignoring broadcast outside topic {}", GVT_TOPIC)
                    }
                    Err(e) => warn!("Dropping broadcast: {}", e),
                }
            }

            debug!("Subscriber stopped");
        });

        batch_rx
    }

    /// Applies inbound batches until the session disconnects for good
    pub async fn subscribe_handler(&self, mut batches: mpsc::UnboundedReceiver<Batch>) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let batch = tokio::select! {
                _ = shutdown.changed() => break,
                batch = batches.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };

            if !self.is_connected().await {
                break;
            }
            self.apply_batch(batch).await;
        }

        debug!("Subscribe handler stopped");
    }

    /// Feeds one broadcast batch into the registry. While replaying the
    /// batch is consumed and discarded. Returns the number of events queued.
    pub async fn apply_batch(&self, batch: Batch) -> usize {
        let mut registry = self.manager.registry().lock().await;
        if registry.session.replaying {
            debug!("Discarding batch from {} during replay", batch.header.sender);
            return 0;
        }

        let connected_time = registry.session.connected_time;
        let claim = batch.header.time - connected_time;
        registry.set_claim(&batch.header.sender, claim);

        let mut queued = 0;
        for record in batch.records {
            match record {
                Record::Disconnect { peer_id, .. } => {
                    if peer_id == self.self_id {
                        continue;
                    }
                    registry.remove_source(&peer_id);
                    let mut stage = self.manager.stage().lock().await;
                    if stage.objects.contains(&peer_id) {
                        stage.objects.destroy_object(&peer_id);
                        info!("Client {} disconnected", peer_id);
                    }
                }

                Record::Movement {
                    ref queue_key,
                    ref peer_id,
                    x,
                    y,
                    ..
                } => {
                    if *peer_id == self.self_id {
                        continue;
                    }

                    {
                        let mut stage = self.manager.stage().lock().await;
                        if !stage.objects.contains(peer_id) {
                            stage.objects.create_object(peer_id, x, y);
                            info!("New client {}", peer_id);
                        }
                    }

                    let queue_key = queue_key.clone();
                    if queue_key != batch.header.sender {
                        registry.set_claim(&queue_key, claim);
                        registry.record_feed(&batch.header.sender, &queue_key);
                    }
                    if let Some(event) = record.into_movement_event(connected_time) {
                        registry.insert_event(event, &queue_key);
                        queued += 1;
                    }
                }
            }
        }

        queued
    }

    /// Leaves live synchronization. With `for_replay` the session stays up
    /// and only the registry is emptied; otherwise the session ends and the
    /// receive path shuts down. Either way peers are told `<id> D`.
    pub async fn disconnect(&self, for_replay: bool) -> Result<(), ClientError> {
        {
            let mut registry = self.manager.registry().lock().await;
            if for_replay {
                registry.session.replaying = true;
            } else {
                registry.session.connected = false;
            }
            registry.reset();
        }
        self.manager.stage().lock().await.clear_outbound();

        if for_replay {
            info!("Disconnected for replay");
        } else {
            self.shutdown.send_replace(true);
            let unsubscribe = Subscription::Unsubscribe(GVT_TOPIC.to_string()).encode();
            if let Err(e) = self.subscriber.send(unsubscribe.as_bytes()).await {
                warn!("Failed to unsubscribe: {}", e);
            }
            info!("Disconnected from server");
        }

        let request = Request::Disconnect {
            peer_id: self.self_id.clone(),
        };
        let _ack = self.request(&request.encode()).await?;
        Ok(())
    }
}
