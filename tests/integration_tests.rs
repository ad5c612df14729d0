//! Integration tests for the synchronization core against a real relay server
//!
//! Every test starts a server on ephemeral loopback ports and connects peers
//! driven by manual clocks, so only network delivery is left to timing.

use client::clock::ManualClock;
use client::game::{Characters, GameObjects};
use client::network::{Client, ClientConfig, ClientError};
use client::scheduler::EventManager;
use server::network::{Server, ServerConfig};
use shared::Event;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_test::assert_ok;

struct Running {
    request_addr: SocketAddr,
    publish_addr: SocketAddr,
}

async fn start_server(max_clients: usize, peer_timeout: Duration) -> Running {
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

struct Peer {
    client: Arc<Client<Characters>>,
    clock: Arc<ManualClock>,
}

impl Peer {
    fn manager(&self) -> &Arc<EventManager<Characters>> {
        self.client.manager()
    }
}

/// Creates a peer with its own character, subscribed but not yet connected
async fn peer(id: &str, server: &Running) -> Peer {
    let clock = Arc::new(ManualClock::new(0.0));
    let mut characters = Characters::new();
    characters.create_object(id, 0.0, 0.0);
    let (manager, _notices) = EventManager::new(id, clock.clone(), characters);

    let config = ClientConfig {
        self_id: id.to_string(),
        server_host: "127.0.0.1".to_string(),
        request_port: server.request_addr.port(),
        publish_port: server.publish_addr.port(),
        reply_timeout: Some(Duration::from_secs(1)),
    };
    let client = Arc::new(Client::new(&config, Arc::new(manager)).await.unwrap());
    Peer { client, clock }
}

/// Connects a peer and starts its receive path and drain loop
async fn join(id: &str, server: &Running) -> Peer {
    let peer = peer(id, server).await;
    assert_ok!(peer.client.connect().await);

    let batches = peer.client.spawn_subscriber();
    let client = Arc::clone(&peer.client);
    tokio::spawn(async move { client.subscribe_handler(batches).await });
    let manager = Arc::clone(peer.manager());
    tokio::spawn(async move { manager.keep_executing_events(Duration::from_millis(5)).await });

    // Let the server register the subscription
    sleep(Duration::from_millis(50)).await;
    peer
}

/// NETWORK SYNCHRONIZATION TESTS
mod sync_tests {
    use super::*;

    /// A movement sent by one peer is executed by the other once GVT passes it
    #[tokio::test]
    async fn movement_propagates_between_peers() {
        let server = start_server(4, Duration::from_secs(5)).await;
        let a = join("A", &server).await;
        let b = join("B", &server).await;

        a.manager()
            .queue_local_movement(Event::movement(1.0, "A", "A", 5.0, 6.0, true))
            .await;
        a.clock.set_time(2.0);
        assert_ok!(a.client.send_handler().await);

        let mut created = false;
        for _ in 0..100 {
            if b.manager().stage().lock().await.objects.contains("A") {
                created = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(created, "B never learned about A");

        // B's own claim only moves with the echo of its own batch
        b.clock.set_time(5.0);
        assert_ok!(b.client.send_handler().await);

        let mut moves = 0;
        for _ in 0..100 {
            moves = b.manager().stage().lock().await.objects.get("A").unwrap().moves;
            if moves > 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(moves, 1);

        let stage = b.manager().stage().lock().await;
        let character = stage.objects.get("A").unwrap();
        assert_eq!((character.x, character.y, character.positive), (5.0, 6.0, true));
        drop(stage);

        // A's echo carries nothing A would execute
        let registry = a.manager().registry().lock().await;
        assert_eq!(registry.pending(), 0);
        assert!(registry.is_paired());
        assert_eq!(a.manager().stage().lock().await.objects.len(), 1);
    }

    /// Leaving peers are removed from everyone else's registry and world
    #[tokio::test]
    async fn disconnect_cleans_up_remote_peer() {
        let server = start_server(4, Duration::from_secs(5)).await;
        let a = join("A", &server).await;
        let b = join("B", &server).await;

        a.clock.set_time(1.0);
        assert_ok!(a.client.send_handler().await);
        for _ in 0..100 {
            if b.manager().registry().lock().await.claim("A").is_some() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(b.manager().registry().lock().await.claim("A").is_some());

        assert_ok!(a.client.disconnect(false).await);
        assert!(!a.client.is_connected().await);

        let mut gone = false;
        for _ in 0..100 {
            let registry = b.manager().registry().lock().await;
            if registry.claim("A").is_none() && registry.queue_len("A").is_none() {
                gone = true;
                break;
            }
            drop(registry);
            sleep(Duration::from_millis(10)).await;
        }
        assert!(gone, "A is still registered at B");
        assert!(b.manager().registry().lock().await.is_paired());
    }

    /// A peer that goes silent is evicted by the server lease, which
    /// releases the GVT of everyone else
    #[tokio::test]
    async fn lease_releases_stalled_peer() {
        let server = start_server(4, Duration::from_millis(200)).await;
        let a = join("A", &server).await;
        let b = join("B", &server).await;

        // A claims an early time and then stops talking
        a.clock.set_time(1.0);
        assert_ok!(a.client.send_handler().await);
        sleep(Duration::from_millis(50)).await;

        b.clock.set_time(10.0);
        {
            let mut registry = b.manager().registry().lock().await;
            registry.set_claim("B", 10.0);
            if registry.claim("A").is_some() {
                assert!(registry.update_gvt() < 10.0);
            }
        }

        let mut released = false;
        for _ in 0..100 {
            let mut registry = b.manager().registry().lock().await;
            // B is evicted too and hears its own stale claim; keep it current
            registry.set_claim("B", 10.0);
            if registry.claim("A").is_none() && registry.update_gvt() >= 10.0 {
                released = true;
                break;
            }
            drop(registry);
            sleep(Duration::from_millis(20)).await;
        }
        assert!(released, "stalled peer still holds back GVT");
    }

    /// The server refuses handshakes beyond its capacity
    #[tokio::test]
    async fn server_full_rejects_handshake() {
        let server = start_server(1, Duration::from_secs(5)).await;
        let _a = join("A", &server).await;
        let b = peer("B", &server).await;

        match b.client.connect().await {
            Err(ClientError::BadReply(reply)) => assert_eq!(reply, "ERR"),
            other => panic!("Unexpected handshake result: {:?}", other),
        }
        assert!(!b.client.is_connected().await);
    }
}
