use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Wire name of the broadcast recipient.
pub const BROADCAST: &str = "broadcast";

/// Opaque key-value payload carried by a [`BusMessage`].
pub type Payload = serde_json::Map<String, Value>;

/// Converts a JSON value into a [`Payload`].
///
/// Objects are taken as-is; any other value is wrapped under the `value` key.
pub fn into_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        Value::Null => Payload::new(),
        other => {
            let mut map = Payload::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Current UTC time truncated to the millisecond precision of the wire format.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Addressee of a [`BusMessage`]: one subscriber id or every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Recipient {
    /// A specific subscriber id.
    Agent(String),
    /// Every subscriber except the sender, plus broadcast-only subscribers.
    Broadcast,
}

impl Recipient {
    /// Creates a directed recipient.
    pub fn agent(id: impl Into<String>) -> Self {
        Self::from(id.into())
    }

    /// Returns `true` for [`Recipient::Broadcast`].
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Recipient::Broadcast)
    }

    /// The wire representation of this recipient.
    pub fn as_str(&self) -> &str {
        match self {
            Recipient::Agent(id) => id,
            Recipient::Broadcast => BROADCAST,
        }
    }
}

impl From<String> for Recipient {
    fn from(s: String) -> Self {
        if s == BROADCAST {
            Recipient::Broadcast
        } else {
            Recipient::Agent(s)
        }
    }
}

impl From<&str> for Recipient {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<Recipient> for String {
    fn from(r: Recipient) -> Self {
        match r {
            Recipient::Agent(id) => id,
            Recipient::Broadcast => BROADCAST.to_string(),
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of message kinds understood on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// An agent reports its own lifecycle status.
    StatusUpdate,
    /// The orchestrator hands a task to an agent.
    TaskRequest,
    /// An agent reports a finished task.
    TaskComplete,
    /// An agent reports a failure, optionally tied to a task.
    Error,
    /// A UI asked to open the mission-control view.
    MissionControlOpen,
    /// An agent finished starting up.
    AgentStarted,
    /// An agent finished shutting down.
    AgentStopped,
    /// The workspace context snapshot changed.
    ContextUpdate,
    /// Free-form log line from an agent.
    Log,
}

impl MessageType {
    /// The wire name of this message type.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::StatusUpdate => "STATUS_UPDATE",
            MessageType::TaskRequest => "TASK_REQUEST",
            MessageType::TaskComplete => "TASK_COMPLETE",
            MessageType::Error => "ERROR",
            MessageType::MissionControlOpen => "MISSION_CONTROL_OPEN",
            MessageType::AgentStarted => "AGENT_STARTED",
            MessageType::AgentStopped => "AGENT_STOPPED",
            MessageType::ContextUpdate => "CONTEXT_UPDATE",
            MessageType::Log => "LOG",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message exchanged on the [`MessageBus`](crate::MessageBus).
///
/// Handlers only ever see `&BusMessage`, so a message cannot change once it
/// has been published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Unique identifier for this message.
    pub id: Uuid,
    /// Id of the sender.
    pub from: String,
    /// Addressee: a subscriber id or broadcast.
    pub to: Recipient,
    /// Kind of the message.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Arbitrary key-value payload.
    #[serde(default)]
    pub payload: Payload,
    /// Creation time, carried as epoch milliseconds on the wire.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl BusMessage {
    /// Creates a new message stamped with the current time.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<Recipient>,
        kind: MessageType,
        payload: Payload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.into(),
            to: to.into(),
            kind,
            payload,
            timestamp: now_millis(),
        }
    }

    /// Creates a message addressed to every subscriber.
    pub fn broadcast(from: impl Into<String>, kind: MessageType, payload: Payload) -> Self {
        Self::new(from, Recipient::Broadcast, kind, payload)
    }

    /// Creates a message addressed to one subscriber id.
    pub fn directed(
        from: impl Into<String>,
        to: impl Into<String>,
        kind: MessageType,
        payload: Payload,
    ) -> Self {
        Self::new(from, Recipient::agent(to), kind, payload)
    }

    /// Returns `true` if this message is addressed to everyone.
    pub fn is_broadcast(&self) -> bool {
        self.to.is_broadcast()
    }

    /// Looks up a string field of the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}
