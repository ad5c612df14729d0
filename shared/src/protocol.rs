//! Line-oriented text protocol spoken between peers and the relay server
//!
//! Every message is newline separated, every line space separated. Numbers are
//! decimal text with six fractional digits and flags are the literals `1`/`0`.
//!
//! Request/reply channel:
//! - `<id> <time>` connects and is answered with the decimal `connectedTime`
//! - `<id> GVT <time>` followed by movement lines is answered with `ACK`
//! - `<id> D` announces a departure and is answered with `ACK`
//!
//! Publish channel (subscribers register with `SUB GVT`):
//! - `<id> GVT <time>` header, then record lines
//! - movement record: `<queueKey> E <executeTime> <peerId> <x> <y> <flag>`
//! - disconnect record: `<queueKey> <peerId> D`

use crate::Event;
use thiserror::Error;

pub const GVT_TOPIC: &str = "GVT";
pub const MOVEMENT_KIND: &str = "E";
pub const DISCONNECT_KIND: &str = "D";
/// Queue key the relay server uses for the disconnect notices it originates
pub const NOTICE_QUEUE_KEY: &str = "C";
pub const ACK: &str = "ACK";
pub const REJECT: &str = "ERR";
pub const SUBSCRIBE: &str = "SUB";
pub const UNSUBSCRIBE: &str = "UNSUB";

pub const DEFAULT_REQUEST_PORT: u16 = 5555;
pub const DEFAULT_PUBLISH_PORT: u16 = 5556;
/// Large enough for any batch a peer produces between two sends
pub const MAX_DATAGRAM: usize = 65_507;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("malformed header `{0}`")]
    MalformedHeader(String),
    #[error("line {line}: expected {expected} fields, found {found}")]
    FieldCount {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("line {line}: `{value}` is not a decimal number")]
    InvalidNumber { line: usize, value: String },
    #[error("line {line}: flag must be `1` or `0`, found `{value}`")]
    InvalidFlag { line: usize, value: String },
    #[error("unrecognized request `{0}`")]
    UnknownRequest(String),
}

pub fn format_number(value: f64) -> String {
    format!("{:.6}", value)
}

fn parse_number(line: usize, value: &str) -> Result<f64, ProtocolError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|number| number.is_finite())
        .ok_or_else(|| ProtocolError::InvalidNumber {
            line,
            value: value.to_string(),
        })
}

fn parse_flag(line: usize, value: &str) -> Result<bool, ProtocolError> {
    match value {
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err(ProtocolError::InvalidFlag {
            line,
            value: value.to_string(),
        }),
    }
}

/// First line of every batch: who is speaking and the time it claims
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub sender: String,
    pub time: f64,
}

impl Header {
    pub fn new(sender: impl Into<String>, time: f64) -> Self {
        Self {
            sender: sender.into(),
            time,
        }
    }

    pub fn encode(&self) -> String {
        format!("{} {} {}", self.sender, GVT_TOPIC, format_number(self.time))
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [sender, topic, time] if *topic == GVT_TOPIC => Ok(Self {
                sender: sender.to_string(),
                time: parse_number(1, time)?,
            }),
            _ => Err(ProtocolError::MalformedHeader(line.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Movement {
        queue_key: String,
        execute_time: f64,
        peer_id: String,
        x: f64,
        y: f64,
        flag: bool,
    },
    Disconnect {
        queue_key: String,
        peer_id: String,
    },
}

impl Record {
    /// Builds the record for a movement event, moving its time by `offset`.
    /// Returns `None` for any other event kind.
    pub fn from_movement(queue_key: &str, event: &Event, offset: f64) -> Option<Self> {
        let movement = event.as_movement()?;
        Some(Record::Movement {
            queue_key: queue_key.to_string(),
            execute_time: event.execute_time + offset,
            peer_id: movement.target.clone(),
            x: movement.x,
            y: movement.y,
            flag: movement.flag,
        })
    }

    pub fn queue_key(&self) -> &str {
        match self {
            Record::Movement { queue_key, .. } | Record::Disconnect { queue_key, .. } => queue_key,
        }
    }

    pub fn peer_id(&self) -> &str {
        match self {
            Record::Movement { peer_id, .. } | Record::Disconnect { peer_id, .. } => peer_id,
        }
    }

    /// Converts a movement record into a local event, subtracting `offset`
    /// from the recorded time.
    pub fn into_movement_event(self, offset: f64) -> Option<Event> {
        match self {
            Record::Movement {
                queue_key,
                execute_time,
                peer_id,
                x,
                y,
                flag,
            } => Some(Event::movement(
                execute_time - offset,
                queue_key,
                peer_id,
                x,
                y,
                flag,
            )),
            Record::Disconnect { .. } => None,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Record::Movement {
                queue_key,
                execute_time,
                peer_id,
                x,
                y,
                flag,
            } => format!(
                "{} {} {} {} {} {} {}",
                queue_key,
                MOVEMENT_KIND,
                format_number(*execute_time),
                peer_id,
                format_number(*x),
                format_number(*y),
                if *flag { "1" } else { "0" }
            ),
            Record::Disconnect { queue_key, peer_id } => {
                format!("{} {} {}", queue_key, peer_id, DISCONNECT_KIND)
            }
        }
    }

    pub fn decode(line_number: usize, line: &str) -> Result<Self, ProtocolError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [queue_key, peer_id, kind] if *kind == DISCONNECT_KIND => Ok(Record::Disconnect {
                queue_key: queue_key.to_string(),
                peer_id: peer_id.to_string(),
            }),
            [queue_key, _kind, execute_time, peer_id, x, y, flag] => Ok(Record::Movement {
                queue_key: queue_key.to_string(),
                execute_time: parse_number(line_number, execute_time)?,
                peer_id: peer_id.to_string(),
                x: parse_number(line_number, x)?,
                y: parse_number(line_number, y)?,
                flag: parse_flag(line_number, flag)?,
            }),
            _ => Err(ProtocolError::FieldCount {
                line: line_number,
                expected: 7,
                found: fields.len(),
            }),
        }
    }
}

/// One multi-line message: a header plus the records that decoded cleanly.
///
/// Record lines that fail to decode are kept in `rejected` so the receiver can
/// report them without dropping the rest of the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub header: Header,
    pub records: Vec<Record>,
    pub rejected: Vec<ProtocolError>,
}

impl Batch {
    pub fn new(header: Header) -> Self {
        Self {
            header,
            records: Vec::new(),
            rejected: Vec::new(),
        }
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn encode(&self) -> String {
        let mut message = self.header.encode();
        message.push('\n');
        for record in &self.records {
            message.push_str(&record.encode());
            message.push('\n');
        }
        message
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        if text.trim().is_empty() {
            return Err(ProtocolError::Empty);
        }

        let mut lines = text.lines();
        let header = Header::decode(lines.next().unwrap_or_default())?;
        let mut batch = Batch::new(header);

        for (index, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            // Header is line 1
            match Record::decode(index + 2, line) {
                Ok(record) => batch.records.push(record),
                Err(e) => batch.rejected.push(e),
            }
        }

        Ok(batch)
    }

    /// Notice published when `peer_id` leaves, carrying its last claim
    pub fn disconnect_notice(peer_id: &str, claimed_time: f64) -> Self {
        let mut batch = Batch::new(Header::new(peer_id, claimed_time));
        batch.push(Record::Disconnect {
            queue_key: NOTICE_QUEUE_KEY.to_string(),
            peer_id: peer_id.to_string(),
        });
        batch
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Connect { peer_id: String, local_time: f64 },
    Sync(Batch),
    Disconnect { peer_id: String },
}

impl Request {
    pub fn encode(&self) -> String {
        match self {
            Request::Connect {
                peer_id,
                local_time,
            } => format!("{} {}", peer_id, format_number(*local_time)),
            Request::Sync(batch) => batch.encode(),
            Request::Disconnect { peer_id } => format!("{} {}", peer_id, DISCONNECT_KIND),
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        if text.trim().is_empty() {
            return Err(ProtocolError::Empty);
        }

        let first = text.lines().next().unwrap_or_default();
        let fields: Vec<&str> = first.split_whitespace().collect();
        match fields.as_slice() {
            [peer_id, kind] if *kind == DISCONNECT_KIND => Ok(Request::Disconnect {
                peer_id: peer_id.to_string(),
            }),
            [peer_id, local_time] => Ok(Request::Connect {
                peer_id: peer_id.to_string(),
                local_time: parse_number(1, local_time)?,
            }),
            [_, topic, _] if *topic == GVT_TOPIC => Ok(Request::Sync(Batch::decode(text)?)),
            _ => Err(ProtocolError::UnknownRequest(first.to_string())),
        }
    }
}

/// Control datagrams sent to the publish endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum Subscription {
    Subscribe(String),
    Unsubscribe(String),
}

impl Subscription {
    pub fn encode(&self) -> String {
        match self {
            Subscription::Subscribe(topic) => format!("{} {}", SUBSCRIBE, topic),
            Subscription::Unsubscribe(topic) => format!("{} {}", UNSUBSCRIBE, topic),
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let fields: Vec<&str> = text.split_whitespace().collect();
        match fields.as_slice() {
            [command, topic] if *command == SUBSCRIBE => {
                Ok(Subscription::Subscribe(topic.to_string()))
            }
            [command, topic] if *command == UNSUBSCRIBE => {
                Ok(Subscription::Unsubscribe(topic.to_string()))
            }
            [] => Err(ProtocolError::Empty),
            _ => Err(ProtocolError::UnknownRequest(text.trim().to_string())),
        }
    }
}

/// Whether a published message belongs to `topic` (the header's second field)
pub fn topic_matches(message: &str, topic: &str) -> bool {
    message
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .is_some_and(|field| field == topic)
}
