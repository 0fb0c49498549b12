//! Typed views of the wire messages.
//!
//! A [`Packet`] is what handlers work with; a [`Message`] is what the wire
//! codec moves. Conversion checks the minimum arity and the field types of
//! known messages. Trailing fields a peer adds are ignored, and message
//! types this engine does not know survive as [`Packet::Unknown`].
//!
//! # Field layouts
//!
//! ```text
//! hello            caps: map
//! ping             time_us
//! ping_echo        echoed_time_us [, backlog]
//! draw             wid, x, y, w, h, coding, data, seq [, options]
//! damage-sequence  seq, wid, w, h, decode_time_us [, message]
//! window-metadata  wid, props: map
//! encodings        names: list
//! disconnect       reason
//! error            message
//! ```

use std::collections::BTreeMap;

use crate::damage::Rect;
use crate::encode::types::Codec;
use crate::error::{DecodeError, HandshakeError};
use crate::message::{Message, MessageType};
use crate::wire::codec::serialized_len;
use crate::wire::compression::{self, Compression};
use crate::wire::value::Value;

/// Version spoken by this engine. Peers must match exactly.
pub const PROTOCOL_VERSION: u32 = 1;

// ── Capabilities ─────────────────────────────────────────────────

/// What a peer advertises in its `hello`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub protocol_version: u32,
    /// Compression algorithms, in preference order.
    pub compressors: Vec<Compression>,
    pub encryption: bool,
    /// Picture encodings the peer can produce or decode.
    pub encodings: Vec<Codec>,
    pub max_message_size: u64,
}

/// The outcome of a successful capability exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedCaps {
    pub compression: Compression,
    pub encodings: Vec<Codec>,
    pub encryption: bool,
    pub max_message_size: usize,
}

impl Capabilities {
    fn to_map(&self) -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        map.insert("version".into(), Value::from(self.protocol_version));
        map.insert(
            "compressors".into(),
            Value::List(self.compressors.iter().map(|c| c.name().into()).collect()),
        );
        map.insert("encryption".into(), Value::Bool(self.encryption));
        map.insert(
            "encodings".into(),
            Value::List(self.encodings.iter().map(|c| c.name().into()).collect()),
        );
        map.insert("max_message_size".into(), Value::from(self.max_message_size));
        map
    }

    /// Unknown compressor and encoding names are skipped.
    fn from_map(map: &BTreeMap<String, Value>) -> Result<Self, String> {
        let version = map
            .get("version")
            .and_then(Value::as_int)
            .ok_or("missing version")?;
        let compressors = map
            .get("compressors")
            .and_then(Value::as_str_list)
            .unwrap_or_default()
            .iter()
            .filter_map(|n| Compression::from_name(n))
            .collect();
        let encodings = map
            .get("encodings")
            .and_then(Value::as_str_list)
            .unwrap_or_default()
            .iter()
            .filter_map(|n| Codec::from_name(n))
            .collect();
        Ok(Self {
            protocol_version: u32::try_from(version).map_err(|_| "version out of range")?,
            compressors,
            encryption: map
                .get("encryption")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            encodings,
            max_message_size: map
                .get("max_message_size")
                .and_then(Value::as_int)
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(0),
        })
    }

    /// Find common ground with `remote`, in our preference order.
    pub fn negotiate(&self, remote: &Capabilities) -> Result<NegotiatedCaps, HandshakeError> {
        if self.protocol_version != remote.protocol_version {
            return Err(HandshakeError::VersionMismatch {
                local: self.protocol_version,
                remote: remote.protocol_version,
            });
        }
        if self.encryption != remote.encryption {
            return Err(HandshakeError::Encryption(if self.encryption {
                "peer does not encrypt"
            } else {
                "peer requires encryption"
            }));
        }
        let compression = compression::negotiate(&self.compressors, &remote.compressors)
            .ok_or(HandshakeError::NoCommonCompression)?;
        let encodings: Vec<Codec> = self
            .encodings
            .iter()
            .copied()
            .filter(|c| remote.encodings.contains(c))
            .collect();
        if !encodings.contains(&Codec::Rgb) {
            return Err(HandshakeError::NoCommonEncoding);
        }
        let max = match remote.max_message_size {
            0 => self.max_message_size,
            n => self.max_message_size.min(n),
        };
        Ok(NegotiatedCaps {
            compression,
            encodings,
            encryption: self.encryption,
            max_message_size: max as usize,
        })
    }
}

// ── Draw ─────────────────────────────────────────────────────────

/// One encoded window-region update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawPacket {
    pub window_id: u64,
    pub rect: Rect,
    pub codec: Codec,
    pub data: Vec<u8>,
    pub sequence: u64,
    pub options: BTreeMap<String, Value>,
}

// ── DamageAck ────────────────────────────────────────────────────

/// Client acknowledgement of a draw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DamageAck {
    pub sequence: u64,
    pub window_id: u64,
    pub width: u32,
    pub height: u32,
    /// Time spent decoding, in microseconds. Negative means the client
    /// could not decode the update and needs it again.
    pub decode_time_us: i64,
    pub message: Option<String>,
}

impl DamageAck {
    pub fn failed(&self) -> bool {
        self.decode_time_us < 0
    }
}

// ── Packet ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Hello(Capabilities),
    Ping { time_us: u64 },
    PingEcho { echoed_us: u64, backlog: Option<u64> },
    Draw(DrawPacket),
    DamageSequence(DamageAck),
    WindowMetadata {
        window_id: u64,
        properties: BTreeMap<String, Value>,
    },
    /// Mid-session change of the client's supported picture encodings.
    Encodings(Vec<Codec>),
    Disconnect { reason: String },
    Error { message: String },
    /// A message type this engine does not know, kept for logging.
    Unknown(Message),
}

impl Packet {
    /// The known type, `None` for [`Packet::Unknown`].
    pub fn message_type(&self) -> Option<MessageType> {
        Some(match self {
            Packet::Hello(_) => MessageType::Hello,
            Packet::Ping { .. } => MessageType::Ping,
            Packet::PingEcho { .. } => MessageType::PingEcho,
            Packet::Draw(_) => MessageType::Draw,
            Packet::DamageSequence(_) => MessageType::DamageSequence,
            Packet::WindowMetadata { .. } => MessageType::WindowMetadata,
            Packet::Encodings(_) => MessageType::Encodings,
            Packet::Disconnect { .. } => MessageType::Disconnect,
            Packet::Error { .. } => MessageType::Error,
            Packet::Unknown(_) => return None,
        })
    }

    /// Key under which a still-queued copy may be replaced.
    pub fn coalesce_key(&self) -> Option<String> {
        match self {
            Packet::WindowMetadata { window_id, .. } => Some(format!("window-metadata:{window_id}")),
            Packet::Encodings(_) => Some("encodings".to_string()),
            _ => None,
        }
    }

    pub fn to_message(self) -> Message {
        match self {
            Packet::Hello(caps) => Message::of(MessageType::Hello).with(caps.to_map()),
            Packet::Ping { time_us } => Message::of(MessageType::Ping).with(time_us),
            Packet::PingEcho { echoed_us, backlog } => {
                let m = Message::of(MessageType::PingEcho).with(echoed_us);
                match backlog {
                    Some(b) => m.with(b),
                    None => m,
                }
            }
            Packet::Draw(d) => Message::of(MessageType::Draw)
                .with(d.window_id)
                .with(d.rect.x)
                .with(d.rect.y)
                .with(d.rect.width)
                .with(d.rect.height)
                .with(d.codec.name())
                .with(d.data)
                .with(d.sequence)
                .with(d.options),
            Packet::DamageSequence(ack) => {
                let m = Message::of(MessageType::DamageSequence)
                    .with(ack.sequence)
                    .with(ack.window_id)
                    .with(ack.width)
                    .with(ack.height)
                    .with(ack.decode_time_us);
                match ack.message {
                    Some(text) => m.with(text),
                    None => m,
                }
            }
            Packet::WindowMetadata {
                window_id,
                properties,
            } => Message::of(MessageType::WindowMetadata)
                .with(window_id)
                .with(properties),
            Packet::Encodings(codecs) => Message::of(MessageType::Encodings).with(Value::List(
                codecs.iter().map(|c| c.name().into()).collect(),
            )),
            Packet::Disconnect { reason } => Message::of(MessageType::Disconnect).with(reason),
            Packet::Error { message } => Message::of(MessageType::Error).with(message),
            Packet::Unknown(message) => message,
        }
    }

    /// Interpret a decoded message.
    ///
    /// Errors only for known types with missing or mistyped fields.
    pub fn from_message(message: Message) -> Result<Packet, DecodeError> {
        let Some(kind) = message.message_type() else {
            return Ok(Packet::Unknown(message));
        };
        let frame_len = serialized_len(&message);
        let bad = |what: &str| DecodeError::new(frame_len, format!("{kind}: {what}"));

        if message.len() < kind.min_arity() {
            return Err(bad(&format!(
                "expected at least {} fields, got {}",
                kind.min_arity(),
                message.len()
            )));
        }

        let mut fields = message.fields;
        let int = |fields: &[Value], i: usize, name: &str| {
            fields[i]
                .as_int()
                .ok_or_else(|| bad(&format!("field {name} is {}", fields[i].type_name())))
        };
        let uint = |fields: &[Value], i: usize, name: &str| {
            int(fields, i, name).and_then(|v| u64::try_from(v).map_err(|_| bad(&format!("{name} is negative"))))
        };
        let dim = |fields: &[Value], i: usize, name: &str| {
            uint(fields, i, name).and_then(|v| u32::try_from(v).map_err(|_| bad(&format!("{name} out of range"))))
        };
        let string = |fields: &mut [Value], i: usize, name: &str| match std::mem::replace(
            &mut fields[i],
            Value::Int(0),
        ) {
            Value::Str(s) => Ok(s),
            other => Err(bad(&format!("field {name} is {}", other.type_name()))),
        };

        let packet = match kind {
            MessageType::Hello => {
                let map = fields[0].as_map().ok_or_else(|| bad("capabilities are not a map"))?;
                Packet::Hello(Capabilities::from_map(map).map_err(|e| bad(&e))?)
            }
            MessageType::Ping => Packet::Ping {
                time_us: uint(&fields, 0, "time")?,
            },
            MessageType::PingEcho => Packet::PingEcho {
                echoed_us: uint(&fields, 0, "time")?,
                backlog: fields.get(1).and_then(Value::as_int).and_then(|v| u64::try_from(v).ok()),
            },
            MessageType::Draw => {
                let rect = Rect::new(
                    dim(&fields, 1, "x")?,
                    dim(&fields, 2, "y")?,
                    dim(&fields, 3, "w")?,
                    dim(&fields, 4, "h")?,
                );
                let coding = string(&mut fields, 5, "coding")?;
                let codec =
                    Codec::from_name(&coding).ok_or_else(|| bad(&format!("unknown coding {coding}")))?;
                let data = match std::mem::replace(&mut fields[6], Value::Int(0)) {
                    Value::Bytes(b) => b,
                    other => return Err(bad(&format!("field data is {}", other.type_name()))),
                };
                let options = match fields.get_mut(8) {
                    Some(Value::Map(m)) => std::mem::take(m),
                    _ => BTreeMap::new(),
                };
                Packet::Draw(DrawPacket {
                    window_id: uint(&fields, 0, "wid")?,
                    rect,
                    codec,
                    data,
                    sequence: uint(&fields, 7, "seq")?,
                    options,
                })
            }
            MessageType::DamageSequence => Packet::DamageSequence(DamageAck {
                sequence: uint(&fields, 0, "seq")?,
                window_id: uint(&fields, 1, "wid")?,
                width: dim(&fields, 2, "w")?,
                height: dim(&fields, 3, "h")?,
                decode_time_us: int(&fields, 4, "decode_time")?,
                message: fields.get(5).and_then(Value::as_str).map(str::to_string),
            }),
            MessageType::WindowMetadata => {
                let window_id = uint(&fields, 0, "wid")?;
                let properties = match std::mem::replace(&mut fields[1], Value::Int(0)) {
                    Value::Map(m) => m,
                    other => return Err(bad(&format!("properties is {}", other.type_name()))),
                };
                Packet::WindowMetadata {
                    window_id,
                    properties,
                }
            }
            MessageType::Encodings => {
                let names = fields[0]
                    .as_str_list()
                    .ok_or_else(|| bad("encodings is not a list"))?;
                Packet::Encodings(names.iter().filter_map(|n| Codec::from_name(n)).collect())
            }
            MessageType::Disconnect => Packet::Disconnect {
                reason: string(&mut fields, 0, "reason")?,
            },
            MessageType::Error => Packet::Error {
                message: string(&mut fields, 0, "message")?,
            },
        };
        Ok(packet)
    }
}

impl From<Packet> for Message {
    fn from(packet: Packet) -> Self {
        packet.to_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> Capabilities {
        Capabilities {
            protocol_version: PROTOCOL_VERSION,
            compressors: vec![Compression::Zstd, Compression::Zlib, Compression::None],
            encryption: false,
            encodings: vec![Codec::Rgb, Codec::Lossy, Codec::Video],
            max_message_size: 1 << 20,
        }
    }

    fn roundtrip(p: Packet) -> Packet {
        Packet::from_message(p.to_message()).unwrap()
    }

    #[test]
    fn packets_survive_conversion() {
        let draw = Packet::Draw(DrawPacket {
            window_id: 3,
            rect: Rect::new(10, 20, 30, 40),
            codec: Codec::Lossy,
            data: vec![1, 2, 3],
            sequence: 99,
            options: BTreeMap::from([("quality".to_string(), Value::Int(40))]),
        });
        assert_eq!(roundtrip(draw.clone()), draw);

        let ack = Packet::DamageSequence(DamageAck {
            sequence: 5,
            window_id: 3,
            width: 30,
            height: 40,
            decode_time_us: -1,
            message: Some("corrupt".into()),
        });
        assert_eq!(roundtrip(ack.clone()), ack);

        for p in [
            Packet::Hello(caps()),
            Packet::Ping { time_us: 123 },
            Packet::PingEcho { echoed_us: 123, backlog: Some(4) },
            Packet::Encodings(vec![Codec::Rgb]),
            Packet::Disconnect { reason: "bye".into() },
            Packet::Error { message: "oops".into() },
        ] {
            assert_eq!(roundtrip(p.clone()), p);
        }
    }

    #[test]
    fn trailing_fields_are_ignored() {
        let m = Message::of(MessageType::Ping).with(7u64).with("future");
        assert_eq!(Packet::from_message(m).unwrap(), Packet::Ping { time_us: 7 });
    }

    #[test]
    fn short_messages_are_rejected() {
        let m = Message::of(MessageType::Draw).with(1u64).with(2u64);
        let err = Packet::from_message(m).unwrap_err();
        assert!(err.description.contains("at least 8"));
    }

    #[test]
    fn mistyped_fields_are_rejected() {
        let m = Message::of(MessageType::Ping).with("not a number");
        assert!(Packet::from_message(m).is_err());
    }

    #[test]
    fn unknown_types_pass_through() {
        let m = Message::new("clipboard-token").with(1u64);
        match Packet::from_message(m.clone()).unwrap() {
            Packet::Unknown(inner) => assert_eq!(inner, m),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn negotiation_prefers_local_order() {
        let local = caps();
        let remote = Capabilities {
            compressors: vec![Compression::Zlib, Compression::Zstd],
            encodings: vec![Codec::Rgb, Codec::Video],
            max_message_size: 4096,
            ..caps()
        };
        let agreed = local.negotiate(&remote).unwrap();
        assert_eq!(agreed.compression, Compression::Zstd);
        assert_eq!(agreed.encodings, vec![Codec::Rgb, Codec::Video]);
        assert_eq!(agreed.max_message_size, 4096);
    }

    #[test]
    fn negotiation_failures() {
        let local = caps();

        let old = Capabilities { protocol_version: 0, ..caps() };
        assert!(matches!(local.negotiate(&old), Err(HandshakeError::VersionMismatch { .. })));

        let no_rgb = Capabilities { encodings: vec![Codec::Video], ..caps() };
        assert_eq!(local.negotiate(&no_rgb), Err(HandshakeError::NoCommonEncoding));

        let no_comp = Capabilities { compressors: vec![], ..caps() };
        assert_eq!(local.negotiate(&no_comp), Err(HandshakeError::NoCommonCompression));

        let enc = Capabilities { encryption: true, ..caps() };
        assert!(matches!(local.negotiate(&enc), Err(HandshakeError::Encryption(_))));
    }

    #[test]
    fn unknown_capability_names_are_skipped() {
        let mut map = caps().to_map();
        map.insert(
            "encodings".into(),
            Value::List(vec!["h265".into(), "rgb".into()]),
        );
        let parsed = Capabilities::from_map(&map).unwrap();
        assert_eq!(parsed.encodings, vec![Codec::Rgb]);
    }

    #[test]
    fn failed_ack() {
        let ack = DamageAck {
            sequence: 1,
            window_id: 1,
            width: 1,
            height: 1,
            decode_time_us: -1,
            message: None,
        };
        assert!(ack.failed());
    }
}
