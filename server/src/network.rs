//! Relay server: request/reply endpoint plus the GVT broadcast channel

use crate::client_manager::{ClientManager, Peer};
use log::{debug, error, info, warn};
use shared::protocol::{
    format_number, Batch, ProtocolError, Request, Subscription, ACK,
    DEFAULT_PUBLISH_PORT, DEFAULT_REQUEST_PORT, GVT_TOPIC, MAX_DATAGRAM, REJECT,
};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub request_port: u16,
    pub publish_port: u16,
    pub max_clients: usize,
    /// Silence after which a peer is evicted and announced as disconnected
    pub peer_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            request_port: DEFAULT_REQUEST_PORT,
            publish_port: DEFAULT_PUBLISH_PORT,
            max_clients: 16,
            peer_timeout: Duration::from_secs(5),
        }
    }
}

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    RequestReceived { text: String, addr: SocketAddr },
    SubscriptionReceived {
        subscription: Subscription,
        addr: SocketAddr,
    },
    PeerTimeout { peer: Peer },
    Shutdown,
}

/// Messages sent from the main loop to the sender task
#[derive(Debug)]
pub enum OutboundMessage {
    Reply { text: String, addr: SocketAddr },
    Publish { text: String },
}

pub struct Server {
    requests: Arc<UdpSocket>,
    publisher: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    started: Instant,
    peer_timeout: Duration,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl Server {
    pub async fn new(config: &ServerConfig) -> io::Result<Self> {
        let requests = UdpSocket::bind((config.host.as_str(), config.request_port)).await?;
        let publisher = UdpSocket::bind((config.host.as_str(), config.publish_port)).await?;
        info!(
            "Server listening on {} (requests) and {} (publish)",
            requests.local_addr()?,
            publisher.local_addr()?
        );

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Ok(Server {
            requests: Arc::new(requests),
            publisher: Arc::new(publisher),
            clients: Arc::new(RwLock::new(ClientManager::new(
                config.max_clients,
                config.peer_timeout,
            ))),
            started: Instant::now(),
            peer_timeout: config.peer_timeout,
            server_tx,
            server_rx,
            outbound_tx,
            outbound_rx,
        })
    }

    pub fn request_addr(&self) -> io::Result<SocketAddr> {
        self.requests.local_addr()
    }

    pub fn publish_addr(&self) -> io::Result<SocketAddr> {
        self.publisher.local_addr()
    }

    /// Handle for stopping `run` from another task
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Absolute time every peer's clock is translated into
    pub fn server_time(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Spawns task that continuously listens for requests
    fn spawn_request_receiver(&self) {
        let socket = Arc::clone(&self.requests);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let text = String::from_utf8_lossy(&buffer[..len]).into_owned();
                        if server_tx
                            .send(ServerMessage::RequestReceived { text, addr })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving request: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that listens for subscribe/unsubscribe datagrams
    fn spawn_subscription_receiver(&self) {
        let socket = Arc::clone(&self.publisher);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let text = String::from_utf8_lossy(&buffer[..len]);
                        let subscription = match Subscription::decode(&text) {
                            Ok(subscription) => subscription,
                            Err(e) => {
                                warn!("Ignoring datagram on publish socket from {}: {}", addr, e);
                                continue;
                            }
                        };
                        if server_tx
                            .send(ServerMessage::SubscriptionReceived { subscription, addr })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving subscription: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes the outgoing message queue
    fn spawn_sender(&mut self) {
        let requests = Arc::clone(&self.requests);
        let publisher = Arc::clone(&self.publisher);
        let clients = Arc::clone(&self.clients);
        let mut outbound_rx =
            std::mem::replace(&mut self.outbound_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                match message {
                    OutboundMessage::Reply { text, addr } => {
                        if let Err(e) = requests.send_to(text.as_bytes(), addr).await {
                            error!("Failed to reply to {}: {}", addr, e);
                        }
                    }
                    OutboundMessage::Publish { text } => {
                        let subscribers = clients.read().await.subscriber_addrs();
                        for addr in subscribers {
                            if let Err(e) = publisher.send_to(text.as_bytes(), addr).await {
                                error!("Failed to publish to {}: {}", addr, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that evicts peers whose lease ran out
    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();
        let period = (self.peer_timeout / 2).clamp(Duration::from_millis(10), Duration::from_secs(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                interval.tick().await;

                let timed_out = clients.write().await.check_timeouts();
                for peer in timed_out {
                    if server_tx.send(ServerMessage::PeerTimeout { peer }).is_err() {
                        return;
                    }
                }
            }
        });
    }

    fn reply(&self, text: impl Into<String>, addr: SocketAddr) {
        let message = OutboundMessage::Reply {
            text: text.into(),
            addr,
        };
        if let Err(e) = self.outbound_tx.send(message) {
            error!("Failed to queue reply: {}", e);
        }
    }

    fn publish(&self, text: impl Into<String>) {
        let message = OutboundMessage::Publish { text: text.into() };
        if let Err(e) = self.outbound_tx.send(message) {
            error!("Failed to queue broadcast: {}", e);
        }
    }

    fn publish_disconnect(&self, peer: &Peer) {
        let notice = Batch::disconnect_notice(&peer.id, peer.claimed_time);
        self.publish(notice.encode());
    }

    /// Processes one request and queues its reply
    async fn handle_request(&self, text: String, addr: SocketAddr) {
        let request = match Request::decode(&text) {
            Ok(request) => request,
            Err(ProtocolError::Empty) => {
                debug!("Empty request from {}", addr);
                self.reply(REJECT, addr);
                return;
            }
            Err(e) => {
                warn!("Rejecting request from {}: {}", addr, e);
                self.reply(REJECT, addr);
                return;
            }
        };

        match request {
            Request::Connect {
                peer_id,
                local_time,
            } => {
                let now = self.server_time();
                let admitted = self.clients.write().await.add_peer(&peer_id, addr, now);
                if admitted {
                    self.reply(format_number(now - local_time), addr);
                } else {
                    warn!("Server full, rejecting {}", peer_id);
                    self.reply(REJECT, addr);
                }
            }

            Request::Sync(batch) => {
                let sender = &batch.header.sender;
                for rejected in &batch.rejected {
                    warn!("Relaying batch from {} with bad record: {}", sender, rejected);
                }

                let admitted = self
                    .clients
                    .write()
                    .await
                    .record_claim(sender, addr, batch.header.time);
                if !admitted {
                    warn!("Server full, dropping batch from {}", sender);
                    self.reply(REJECT, addr);
                    return;
                }

                debug!(
                    "Batch from {} at {:.3} with {} records",
                    sender,
                    batch.header.time,
                    batch.records.len()
                );
                self.reply(ACK, addr);
                self.publish(text);
            }

            Request::Disconnect { peer_id } => {
                let removed = self.clients.write().await.remove_peer(&peer_id);
                self.reply(ACK, addr);
                if let Some(peer) = removed {
                    self.publish_disconnect(&peer);
                }
            }
        }
    }

    async fn handle_subscription(&self, subscription: Subscription, addr: SocketAddr) {
        let mut clients = self.clients.write().await;
        match subscription {
            Subscription::Subscribe(topic) if topic == GVT_TOPIC => {
                if clients.subscribe(addr) {
                    info!("Subscriber {} joined", addr);
                }
            }
            Subscription::Unsubscribe(topic) if topic == GVT_TOPIC => {
                if clients.unsubscribe(addr) {
                    info!("Subscriber {} left", addr);
                }
            }
            Subscription::Subscribe(topic) | Subscription::Unsubscribe(topic) => {
                warn!("Unknown topic {} from {}", topic, addr);
            }
        }
    }

    /// Main server loop
    pub async fn run(&mut self) -> io::Result<()> {
        self.spawn_request_receiver();
        self.spawn_subscription_receiver();
        self.spawn_sender();
        self.spawn_timeout_checker();

        info!("Server started successfully");

        while let Some(message) = self.server_rx.recv().await {
            match message {
                ServerMessage::RequestReceived { text, addr } => {
                    self.handle_request(text, addr).await;
                }
                ServerMessage::SubscriptionReceived { subscription, addr } => {
                    self.handle_subscription(subscription, addr).await;
                }
                ServerMessage::PeerTimeout { peer } => {
                    self.publish_disconnect(&peer);
                }
                ServerMessage::Shutdown => break,
            }
        }

        info!("Server shutting down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    struct Running {
        request_addr: SocketAddr,
        publish_addr: SocketAddr,
    }

    async fn start(max_clients: usize, peer_timeout: Duration) -> Running {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            request_port: 0,
            publish_port: 0,
            max_clients,
            peer_timeout,
        };
        let mut server = Server::new(&config).await.unwrap();
        let running = Running {
            request_addr: server.request_addr().unwrap(),
            publish_addr: server.publish_addr().unwrap(),
        };
        tokio::spawn(async move { server.run().await });
        running
    }

    async fn peer(server: &Running) -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(server.request_addr).await.unwrap();
        socket
    }

    async fn subscriber(server: &Running) -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(server.publish_addr).await.unwrap();
        socket.send(b"SUB GVT").await.unwrap();
        // Let the main loop register it
        tokio::time::sleep(Duration::from_millis(50)).await;
        socket
    }

    async fn exchange(socket: &UdpSocket, text: &str) -> String {
        socket.send(text.as_bytes()).await.unwrap();
        receive(socket).await.unwrap()
    }

    async fn receive(socket: &UdpSocket) -> Option<String> {
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let len = timeout(Duration::from_millis(500), socket.recv(&mut buffer))
            .await
            .ok()?
            .ok()?;
        Some(String::from_utf8_lossy(&buffer[..len]).into_owned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.request_port, 5555);
        assert_eq!(config.publish_port, 5556);
        assert_eq!(config.peer_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_connect_assigns_offset() {
        let server = start(4, Duration::from_secs(5)).await;
        let socket = peer(&server).await;

        let reply = exchange(&socket, "A -100.000000").await;
        let offset: f64 = reply.parse().unwrap();
        // Server time is a few milliseconds at most, so the offset is ~100
        assert!(offset >= 100.0);
        assert!(offset < 110.0);
    }

    #[tokio::test]
    async fn test_sync_is_acknowledged_and_published() {
        let server = start(4, Duration::from_secs(5)).await;
        let listener = subscriber(&server).await;
        let socket = peer(&server).await;
        exchange(&socket, "A 0.000000").await;

        let batch = "A GVT 3.000000\nA E 2.500000 A 1.000000 2.000000 1\n";
        assert_eq!(exchange(&socket, batch).await, ACK);
        assert_eq!(receive(&listener).await.as_deref(), Some(batch));
    }

    #[tokio::test]
    async fn test_malformed_request_rejected() {
        let server = start(4, Duration::from_secs(5)).await;
        let listener = subscriber(&server).await;
        let socket = peer(&server).await;

        assert_eq!(exchange(&socket, "A GVT nope").await, REJECT);
        assert_eq!(exchange(&socket, "hello there friend stranger").await, REJECT);
        assert!(receive(&listener).await.is_none());
    }

    #[tokio::test]
    async fn test_server_full() {
        let server = start(1, Duration::from_secs(5)).await;
        let first = peer(&server).await;
        let second = peer(&server).await;

        assert_ne!(exchange(&first, "A 0.000000").await, REJECT);
        assert_eq!(exchange(&second, "B 0.000000").await, REJECT);
        assert_eq!(exchange(&second, "B GVT 1.000000\n").await, REJECT);
    }

    #[tokio::test]
    async fn test_disconnect_publishes_notice() {
        let server = start(4, Duration::from_secs(5)).await;
        let listener = subscriber(&server).await;
        let socket = peer(&server).await;
        exchange(&socket, "A 0.000000").await;
        exchange(&socket, "A GVT 5.000000\n").await;
        assert!(receive(&listener).await.is_some());

        assert_eq!(exchange(&socket, "A D").await, ACK);
        let notice = receive(&listener).await.unwrap();
        assert_eq!(notice, "A GVT 5.000000\nC A D\n");

        // Unknown peers are acknowledged without a notice
        assert_eq!(exchange(&socket, "A D").await, ACK);
        assert!(receive(&listener).await.is_none());
    }

    #[tokio::test]
    async fn test_lease_eviction_publishes_notice() {
        let server = start(4, Duration::from_millis(100)).await;
        let listener = subscriber(&server).await;
        let socket = peer(&server).await;
        exchange(&socket, "B 0.000000").await;
        exchange(&socket, "B GVT 2.000000\n").await;
        receive(&listener).await;

        let notice = receive(&listener).await.unwrap();
        let batch = assert_ok!(Batch::decode(&notice));
        assert_eq!(batch.header.sender, "B");
        assert_approx_eq!(batch.header.time, 2.0);
        assert_eq!(batch.records[0].peer_id(), "B");
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_broadcasts() {
        let server = start(4, Duration::from_secs(5)).await;
        let listener = subscriber(&server).await;
        listener.send(b"UNSUB GVT").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let socket = peer(&server).await;
        exchange(&socket, "A 0.000000").await;
        assert_eq!(exchange(&socket, "A GVT 1.000000\n").await, ACK);
        assert!(receive(&listener).await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let config = ServerConfig {
            request_port: 0,
            publish_port: 0,
            ..ServerConfig::default()
        };
        let mut server = Server::new(&config).await.unwrap();
        let shutdown = server.shutdown_handle();
        let handle = tokio::spawn(async move { server.run().await });

        shutdown.send(ServerMessage::Shutdown).unwrap();
        let result = timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
