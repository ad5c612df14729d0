//! Peer roster and subscriber list for the relay server
//!
//! Tracks which peers take part in synchronization, the last time each one
//! claimed, and when it was last heard from. Peers that stay silent longer
//! than the lease are evicted so their stale claim cannot hold every other
//! peer's GVT back forever.

use log::info;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A peer registered through the handshake
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: String,
    /// Request socket the peer talks from
    pub addr: SocketAddr,
    /// Last time we received any request from this peer
    pub last_seen: Instant,
    /// Latest claimed time, in server time
    pub claimed_time: f64,
}

impl Peer {
    pub fn new(id: &str, addr: SocketAddr, claimed_time: f64) -> Self {
        Self {
            id: id.to_string(),
            addr,
            last_seen: Instant::now(),
            claimed_time,
        }
    }

    pub fn touch(&mut self, addr: SocketAddr, claimed_time: f64) {
        self.addr = addr;
        self.last_seen = Instant::now();
        self.claimed_time = claimed_time;
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

pub struct ClientManager {
    peers: HashMap<String, Peer>,
    subscribers: HashSet<SocketAddr>,
    max_clients: usize,
    timeout: Duration,
}

impl ClientManager {
    pub fn new(max_clients: usize, timeout: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            subscribers: HashSet::new(),
            max_clients,
            timeout,
        }
    }

    /// Registers a peer, replacing any previous entry with the same id.
    /// Returns false when the server is full.
    pub fn add_peer(&mut self, id: &str, addr: SocketAddr, claimed_time: f64) -> bool {
        if !self.peers.contains_key(id) && self.peers.len() >= self.max_clients {
            return false;
        }

        info!("Peer {} connected from {}", id, addr);
        self.peers
            .insert(id.to_string(), Peer::new(id, addr, claimed_time));
        true
    }

    pub fn remove_peer(&mut self, id: &str) -> Option<Peer> {
        let peer = self.peers.remove(id)?;
        info!("Peer {} disconnected", peer.id);
        Some(peer)
    }

    /// Stores a fresh claim and renews the lease. A peer that syncs without a
    /// handshake (for example after its lease ran out) is registered again if
    /// there is room. Returns false if the peer could not be admitted.
    pub fn record_claim(&mut self, id: &str, addr: SocketAddr, claimed_time: f64) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) => {
                peer.touch(addr, claimed_time);
                true
            }
            None => self.add_peer(id, addr, claimed_time),
        }
    }

    pub fn claimed_time(&self, id: &str) -> Option<f64> {
        self.peers.get(id).map(|peer| peer.claimed_time)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    /// Removes and returns every peer whose lease has run out
    pub fn check_timeouts(&mut self) -> Vec<Peer> {
        let timeout = self.timeout;
        let expired: Vec<String> = self
            .peers
            .values()
            .filter(|peer| peer.is_timed_out(timeout))
            .map(|peer| peer.id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| {
                info!("Peer {} timed out", id);
                self.peers.remove(id)
            })
            .collect()
    }

    pub fn subscribe(&mut self, addr: SocketAddr) -> bool {
        self.subscribers.insert(addr)
    }

    pub fn unsubscribe(&mut self, addr: SocketAddr) -> bool {
        self.subscribers.remove(&addr)
    }

    pub fn subscriber_addrs(&self) -> Vec<SocketAddr> {
        self.subscribers.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    #[test]
    fn test_peer_timeout() {
        let mut peer = Peer::new("A", test_addr(), 0.0);
        assert!(!peer.is_timed_out(Duration::from_secs(1)));

        peer.last_seen = Instant::now() - Duration::from_secs(2);
        assert!(peer.is_timed_out(Duration::from_secs(1)));

        peer.touch(test_addr2(), 4.0);
        assert!(!peer.is_timed_out(Duration::from_secs(1)));
        assert_eq!(peer.addr, test_addr2());
    }

    #[test]
    fn test_add_and_remove_peer() {
        let mut manager = ClientManager::new(2, Duration::from_secs(5));
        assert!(manager.is_empty());

        assert!(manager.add_peer("A", test_addr(), 1.0));
        assert!(manager.contains("A"));
        assert_eq!(manager.len(), 1);

        let peer = manager.remove_peer("A").unwrap();
        assert_eq!(peer.id, "A");
        assert!(manager.remove_peer("A").is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_max_capacity() {
        let mut manager = ClientManager::new(1, Duration::from_secs(5));
        assert!(manager.add_peer("A", test_addr(), 0.0));
        assert!(!manager.add_peer("B", test_addr2(), 0.0));
        assert_eq!(manager.len(), 1);

        // Reconnecting under the same id does not need a free slot
        assert!(manager.add_peer("A", test_addr2(), 3.0));
        assert_eq!(manager.claimed_time("A"), Some(3.0));
    }

    #[test]
    fn test_record_claim() {
        let mut manager = ClientManager::new(1, Duration::from_secs(5));
        assert!(manager.record_claim("A", test_addr(), 2.5));
        assert_approx_eq!(manager.claimed_time("A").unwrap(), 2.5);

        assert!(manager.record_claim("A", test_addr(), 7.0));
        assert_approx_eq!(manager.claimed_time("A").unwrap(), 7.0);

        assert!(!manager.record_claim("B", test_addr2(), 1.0));
        assert_eq!(manager.claimed_time("B"), None);
    }

    #[test]
    fn test_check_timeouts() {
        let mut manager = ClientManager::new(3, Duration::from_millis(500));
        manager.add_peer("A", test_addr(), 1.0);
        manager.add_peer("B", test_addr2(), 2.0);

        manager.peers.get_mut("B").unwrap().last_seen = Instant::now() - Duration::from_secs(1);

        let expired = manager.check_timeouts();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "B");
        assert_approx_eq!(expired[0].claimed_time, 2.0);
        assert!(manager.contains("A"));
        assert!(!manager.contains("B"));

        assert!(manager.check_timeouts().is_empty());
    }

    #[test]
    fn test_subscribers() {
        let mut manager = ClientManager::new(2, Duration::from_secs(5));
        assert!(manager.subscribe(test_addr()));
        assert!(!manager.subscribe(test_addr()));
        assert!(manager.subscribe(test_addr2()));
        assert_eq!(manager.subscriber_addrs().len(), 2);

        assert!(manager.unsubscribe(test_addr()));
        assert!(!manager.unsubscribe(test_addr()));
        assert_eq!(manager.subscriber_addrs(), vec![test_addr2()]);
    }
}
