//! Messages and message type identifiers.
//!
//! A [`Message`] is a type tag plus an ordered list of [`Value`] fields.
//! Known tags map to a [`MessageType`]; the dispatcher resolves handlers
//! by that enum, never by string comparison at dispatch time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::wire::value::Value;

// ── MessageType ──────────────────────────────────────────────────

/// Every message type this engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    /// Capability exchange.
    Hello,
    /// Round-trip probe carrying the sender's clock.
    Ping,
    /// Reply to a ping, echoing the sender's clock.
    PingEcho,
    /// A compressed window-region update.
    Draw,
    /// Client acknowledgement of a draw.
    DamageSequence,
    /// Window properties (size, title, ...).
    WindowMetadata,
    /// Mid-session change of the client's supported picture encodings.
    Encodings,
    /// Orderly close with a human-readable reason.
    Disconnect,
    /// Recoverable error notification.
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 9] = [
        MessageType::Hello,
        MessageType::Ping,
        MessageType::PingEcho,
        MessageType::Draw,
        MessageType::DamageSequence,
        MessageType::WindowMetadata,
        MessageType::Encodings,
        MessageType::Disconnect,
        MessageType::Error,
    ];

    /// The tag written on the wire.
    pub const fn tag(self) -> &'static str {
        match self {
            MessageType::Hello => "hello",
            MessageType::Ping => "ping",
            MessageType::PingEcho => "ping_echo",
            MessageType::Draw => "draw",
            MessageType::DamageSequence => "damage-sequence",
            MessageType::WindowMetadata => "window-metadata",
            MessageType::Encodings => "encodings",
            MessageType::Disconnect => "disconnect",
            MessageType::Error => "error",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }

    /// Minimum number of fields a well-formed message of this type carries.
    pub const fn min_arity(self) -> usize {
        match self {
            MessageType::Hello => 1,
            MessageType::Ping => 1,
            MessageType::PingEcho => 1,
            MessageType::Draw => 8,
            MessageType::DamageSequence => 5,
            MessageType::WindowMetadata => 2,
            MessageType::Encodings => 1,
            MessageType::Disconnect => 1,
            MessageType::Error => 1,
        }
    }

    /// Whether this type belongs to the low-latency control class.
    pub const fn is_control(self) -> bool {
        !matches!(self, MessageType::Draw)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

// ── Message ──────────────────────────────────────────────────────

/// A type tag followed by ordered, self-describing fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: String,
    pub fields: Vec<Value>,
}

impl Message {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Vec::new(),
        }
    }

    pub fn of(message_type: MessageType) -> Self {
        Self::new(message_type.tag())
    }

    /// Append a field, builder style.
    pub fn with(mut self, value: impl Into<Value>) -> Self {
        self.fields.push(value.into());
        self
    }

    /// The known type of this message, if any.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_tag(&self.kind)
    }

    pub fn field(&self, index: usize) -> Option<&Value> {
        self.fields.get(index)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.kind)?;
        for (i, v) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrip() {
        for t in MessageType::ALL {
            assert_eq!(MessageType::from_tag(t.tag()), Some(t));
        }
    }

    #[test]
    fn unknown_tag() {
        assert!(MessageType::from_tag("clipboard-token").is_none());
        assert!(Message::new("clipboard-token").message_type().is_none());
    }

    #[test]
    fn only_draw_is_bulk() {
        let bulk: Vec<_> = MessageType::ALL
            .into_iter()
            .filter(|t| !t.is_control())
            .collect();
        assert_eq!(bulk, vec![MessageType::Draw]);
    }

    #[test]
    fn display_elides_payloads() {
        let m = Message::of(MessageType::Draw)
            .with(1u64)
            .with(vec![0u8; 4096]);
        assert_eq!(m.to_string(), "draw(1, <4096 bytes>)");
    }
}
