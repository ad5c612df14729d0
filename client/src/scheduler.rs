//! Time-gated multi-source event scheduler
//!
//! Every source (a peer, or a replay session) owns a min-heap of pending
//! events and a claimed time: the promise that it will deliver nothing earlier.
//! The global virtual time (GVT) is the minimum of the local clock and every
//! claim, and only events at or before GVT are dispatched. Because the bound
//! holds for every queue at once, each queue is drained on its own without a
//! global merge.
//!
//! Two locks guard the state. The registry lock covers queues, claims and the
//! session flags, and is held for a whole `execute_events` pass. The stage lock
//! covers the game objects and this peer's outbound movements, and is taken
//! only around a single movement dispatch. Lock order is registry, then stage.

use crate::clock::Clock;
use crate::game::{GameObjects, Stage};
use log::{debug, info, warn};
use shared::{Event, EventKind};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, MissedTickBehavior};

/// Connection flags shared by the transport adapter and replay controller
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub connected: bool,
    pub replaying: bool,
    /// Offset from the local clock to the server's absolute time
    pub connected_time: f64,
}

/// Messages from the scheduler to the replay owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    PlaybackFinished,
}

/// Heap entry ordered so that `BinaryHeap` pops the earliest event first
#[derive(Debug)]
struct Pending(Event);

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.execute_time.total_cmp(&self.0.execute_time)
    }
}

/// Source queues, claimed times and session state.
///
/// Every source id has both a queue and a claim or neither; the methods here
/// add and remove them together. Queue keys a peer feeds under another name
/// are tracked per sender and leave with it.
pub struct Registry {
    queues: HashMap<String, BinaryHeap<Pending>>,
    claims: HashMap<String, f64>,
    feeds: HashMap<String, HashSet<String>>,
    gvt: f64,
    timeline: Arc<dyn Clock>,
    pub session: Session,
}

impl Registry {
    pub fn new(timeline: Arc<dyn Clock>) -> Self {
        let gvt = timeline.current_time();
        Self {
            queues: HashMap::new(),
            claims: HashMap::new(),
            feeds: HashMap::new(),
            gvt,
            timeline,
            session: Session::default(),
        }
    }

    /// Registers a source with an empty queue and a claim at the current
    /// time. Returns false if the source already exists.
    pub fn add_queue(&mut self, source_id: &str) -> bool {
        if self.queues.contains_key(source_id) {
            return false;
        }
        let now = self.timeline.current_time();
        self.queues.insert(source_id.to_string(), BinaryHeap::new());
        self.claims.insert(source_id.to_string(), now);
        debug!("Added queue {} claiming {:.3}", source_id, now);
        true
    }

    /// Drops a source's queue and the events still in it, returning how many
    /// were discarded
    pub fn remove_queue(&mut self, source_id: &str) -> Option<usize> {
        self.queues.remove(source_id).map(|queue| queue.len())
    }

    pub fn remove_gvt(&mut self, source_id: &str) -> Option<f64> {
        self.claims.remove(source_id)
    }

    /// Removes both the queue and the claim of a source, along with every
    /// queue key it fed
    pub fn remove_source(&mut self, source_id: &str) -> bool {
        let mut removed = self.drop_source(source_id);
        if let Some(keys) = self.feeds.remove(source_id) {
            for key in keys {
                if key != source_id {
                    removed |= self.drop_source(&key);
                }
            }
        }
        removed
    }

    fn drop_source(&mut self, source_id: &str) -> bool {
        let dropped = self.remove_queue(source_id);
        let claim = self.remove_gvt(source_id);
        if let Some(count) = dropped.filter(|count| *count > 0) {
            debug!("Discarded {} pending events from {}", count, source_id);
        }
        dropped.is_some() || claim.is_some()
    }

    /// Remembers that `sender` delivers events under `queue_key`
    pub fn record_feed(&mut self, sender: &str, queue_key: &str) {
        if sender != queue_key {
            self.feeds
                .entry(sender.to_string())
                .or_default()
                .insert(queue_key.to_string());
        }
    }

    pub fn fed_keys(&self, sender: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .feeds
            .get(sender)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn insert_event(&mut self, event: Event, source_id: &str) {
        self.add_queue(source_id);
        if let Some(queue) = self.queues.get_mut(source_id) {
            queue.push(Pending(event));
        }
    }

    pub fn set_claim(&mut self, source_id: &str, time: f64) {
        self.add_queue(source_id);
        self.claims.insert(source_id.to_string(), time);
    }

    pub fn claim(&self, source_id: &str) -> Option<f64> {
        self.claims.get(source_id).copied()
    }

    /// How far the local simulation wants to advance
    pub fn requested_time(&self) -> f64 {
        self.timeline.current_time()
    }

    pub fn update_gvt(&mut self) -> f64 {
        self.gvt = self
            .claims
            .values()
            .copied()
            .fold(self.requested_time(), f64::min);
        self.gvt
    }

    pub fn gvt(&self) -> f64 {
        self.gvt
    }

    pub fn timeline(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.timeline)
    }

    pub fn set_timeline(&mut self, timeline: Arc<dyn Clock>) {
        self.timeline = timeline;
    }

    /// Destroys every queued event without dispatching it
    pub fn clear_events(&mut self) -> usize {
        let mut cleared = 0;
        for queue in self.queues.values_mut() {
            cleared += queue.len();
            queue.clear();
        }
        cleared
    }

    /// Clears all events and forgets every source
    pub fn reset(&mut self) {
        let cleared = self.clear_events();
        self.queues.clear();
        self.claims.clear();
        self.feeds.clear();
        debug!("Registry reset, {} events discarded", cleared);
    }

    pub fn queue_len(&self, source_id: &str) -> Option<usize> {
        self.queues.get(source_id).map(|queue| queue.len())
    }

    /// Total number of events waiting across all sources
    pub fn pending(&self) -> usize {
        self.queues.values().map(|queue| queue.len()).sum()
    }

    pub fn queue_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.queues.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn claim_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.claims.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_paired(&self) -> bool {
        self.queues.len() == self.claims.len()
            && self.queues.keys().all(|id| self.claims.contains_key(id))
    }

    /// Pops every event at or before `gvt`, each queue in time order
    fn drain_ready(&mut self, gvt: f64) -> Vec<Event> {
        let mut ready = Vec::new();
        for queue in self.queues.values_mut() {
            while let Some(top) = queue.peek() {
                if top.0.execute_time > gvt {
                    break;
                }
                if let Some(Pending(event)) = queue.pop() {
                    ready.push(event);
                }
            }
        }
        ready
    }
}

/// Owns the registry and the stage and runs the GVT-gated drain
pub struct EventManager<O> {
    self_id: String,
    registry: Mutex<Registry>,
    stage: Mutex<Stage<O>>,
    notices: mpsc::UnboundedSender<Notice>,
}

impl<O: GameObjects> EventManager<O> {
    /// Creates the manager with this peer's own queue already registered.
    /// The receiver yields `Notice::PlaybackFinished` when a recorded log runs out.
    pub fn new(
        self_id: &str,
        timeline: Arc<dyn Clock>,
        objects: O,
    ) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let mut registry = Registry::new(timeline);
        registry.add_queue(self_id);

        let manager = Self {
            self_id: self_id.to_string(),
            registry: Mutex::new(registry),
            stage: Mutex::new(Stage::new(objects)),
            notices,
        };
        (manager, notice_rx)
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn registry(&self) -> &Mutex<Registry> {
        &self.registry
    }

    pub fn stage(&self) -> &Mutex<Stage<O>> {
        &self.stage
    }

    /// Appends a movement produced by the local game loop to the outbound
    /// list. Only the stage lock is taken.
    pub async fn queue_local_movement(&self, event: Event) {
        self.stage.lock().await.queue_local(event);
    }

    /// Recomputes GVT and dispatches every ready event.
    ///
    /// The caller holds the registry lock for the whole pass. Returns the
    /// number of events dispatched.
    pub async fn execute_events(&self, registry: &mut Registry) -> usize {
        let gvt = registry.update_gvt();
        let ready = registry.drain_ready(gvt);
        let count = ready.len();

        for event in ready {
            self.dispatch(registry, event).await;
        }

        count
    }

    /// Drain loop: one `execute_events` pass per tick while connected
    pub async fn keep_executing_events(&self, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let mut registry = self.registry.lock().await;
            if !registry.session.connected {
                break;
            }
            self.execute_events(&mut registry).await;
        }

        info!("Event drain stopped");
    }

    async fn dispatch(&self, registry: &mut Registry, event: Event) {
        match &event.kind {
            EventKind::Movement(movement) => {
                let mut stage = self.stage.lock().await;
                if !stage.objects.apply_movement(
                    &movement.target,
                    movement.x,
                    movement.y,
                    movement.flag,
                ) {
                    warn!(
                        "Movement at {:.3} for unknown object {}",
                        event.execute_time, movement.target
                    );
                }
                stage.recorder.capture(&event);
            }

            EventKind::Disconnect { peer_id } => {
                if *peer_id == self.self_id {
                    return;
                }
                registry.remove_source(peer_id);
                let mut stage = self.stage.lock().await;
                if stage.objects.contains(peer_id) {
                    stage.objects.destroy_object(peer_id);
                    info!("Client {} disconnected", peer_id);
                }
            }

            EventKind::EndPlayback => {
                if self.notices.send(Notice::PlaybackFinished).is_err() {
                    warn!("Playback finished but nobody is listening");
                }
            }
        }
    }
}
