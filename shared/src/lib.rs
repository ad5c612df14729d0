//! Event model and wire protocol shared by the synchronization client and the relay server.

pub mod protocol;

/// Queue key reserved for the recorded log of a replay session
pub const REPLAY_QUEUE_KEY: &str = "R";

/// A position update for one game object, addressed by id
#[derive(Debug, Clone, PartialEq)]
pub struct Movement {
    pub target: String,
    pub x: f64,
    pub y: f64,
    /// Direction indicator passed through to the object unchanged
    pub flag: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Movement(Movement),
    Disconnect { peer_id: String },
    EndPlayback,
}

/// A timestamped event waiting in a source queue.
///
/// `execute_time` is a reading of the local simulation clock; the scheduler
/// dispatches an event only once the global virtual time has reached it.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub execute_time: f64,
    pub source_id: String,
    pub kind: EventKind,
}

impl Event {
    pub fn movement(
        execute_time: f64,
        source_id: impl Into<String>,
        target: impl Into<String>,
        x: f64,
        y: f64,
        flag: bool,
    ) -> Self {
        Self {
            execute_time,
            source_id: source_id.into(),
            kind: EventKind::Movement(Movement {
                target: target.into(),
                x,
                y,
                flag,
            }),
        }
    }

    pub fn disconnect(
        execute_time: f64,
        source_id: impl Into<String>,
        peer_id: impl Into<String>,
    ) -> Self {
        Self {
            execute_time,
            source_id: source_id.into(),
            kind: EventKind::Disconnect {
                peer_id: peer_id.into(),
            },
        }
    }

    /// Marker that closes a recorded log
    pub fn end_playback(execute_time: f64) -> Self {
        Self {
            execute_time,
            source_id: REPLAY_QUEUE_KEY.to_string(),
            kind: EventKind::EndPlayback,
        }
    }

    pub fn as_movement(&self) -> Option<&Movement> {
        match &self.kind {
            EventKind::Movement(movement) => Some(movement),
            _ => None,
        }
    }

    pub fn is_movement(&self) -> bool {
        matches!(self.kind, EventKind::Movement(_))
    }

    /// Returns the same event moved by `offset` on the time axis
    pub fn shifted(mut self, offset: f64) -> Self {
        self.execute_time += offset;
        self
    }
}
