//! Message dispatch table.
//!
//! Handlers are registered per [`MessageType`] and invoked synchronously,
//! in arrival order, with mutable access to the owner's context `C`.
//! Unknown and unregistered types are logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::RdxError;
use crate::message::{Message, MessageType};
use crate::network::queue::{Priority, SendQueue};
use crate::packet::Packet;

pub type Handler<C> = Box<dyn Fn(&mut C, Packet) -> Result<(), RdxError> + Send>;

/// What happened to one dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Handled,
    /// No handler, or an unknown type.
    Ignored,
    /// A known type whose fields did not parse.
    Malformed,
}

pub struct Dispatcher<C> {
    handlers: HashMap<MessageType, Handler<C>>,
    queue: Arc<SendQueue>,
}

impl<C> Dispatcher<C> {
    pub fn new(queue: Arc<SendQueue>) -> Self {
        Self {
            handlers: HashMap::new(),
            queue,
        }
    }

    /// Register `handler` for `message_type`, replacing any previous one.
    pub fn register<F>(&mut self, message_type: MessageType, handler: F)
    where
        F: Fn(&mut C, Packet) -> Result<(), RdxError> + Send + 'static,
    {
        if self.handlers.insert(message_type, Box::new(handler)).is_some() {
            debug!(%message_type, "handler replaced");
        }
    }

    pub fn is_registered(&self, message_type: MessageType) -> bool {
        self.handlers.contains_key(&message_type)
    }

    /// Route one inbound message to its handler.
    ///
    /// Malformed messages are answered with an `error` message. Handler
    /// errors are returned to the caller.
    pub fn dispatch(&self, ctx: &mut C, message: Message) -> Result<Dispatched, RdxError> {
        let packet = match Packet::from_message(message) {
            Ok(Packet::Unknown(message)) => {
                debug!(kind = %message.kind, fields = message.len(), "ignoring unknown message type");
                return Ok(Dispatched::Ignored);
            }
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "malformed message");
                let notice = Packet::Error {
                    message: e.to_string(),
                };
                let _ = self.send(notice, Priority::Control);
                return Ok(Dispatched::Malformed);
            }
        };

        let Some(message_type) = packet.message_type() else {
            return Ok(Dispatched::Ignored);
        };
        match self.handlers.get(&message_type) {
            Some(handler) => {
                handler(ctx, packet)?;
                Ok(Dispatched::Handled)
            }
            None => {
                debug!(%message_type, "no handler registered");
                Ok(Dispatched::Ignored)
            }
        }
    }

    /// Queue an outbound packet without waiting.
    ///
    /// Bulk packets fail with [`QueueError::Full`](crate::error::QueueError::Full)
    /// when the bulk class is at capacity.
    pub fn send(&self, packet: Packet, priority: Priority) -> Result<(), RdxError> {
        let key = packet.coalesce_key();
        self.queue
            .try_push(packet.to_message(), priority, key)
            .map_err(RdxError::from)
    }

    /// Queue an outbound packet, waiting up to `timeout` for space.
    pub async fn send_timeout(
        &self,
        packet: Packet,
        priority: Priority,
        timeout: Duration,
    ) -> Result<(), RdxError> {
        let key = packet.coalesce_key();
        self.queue
            .push_timeout(packet.to_message(), priority, key, timeout)
            .await
    }

    pub fn queue(&self) -> &Arc<SendQueue> {
        &self.queue
    }
}

/// Default class for a packet.
pub fn priority_of(packet: &Packet) -> Priority {
    match packet.message_type() {
        Some(t) if !t.is_control() => Priority::Bulk,
        _ => Priority::Control,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::error::QueueError;
    use crate::packet::DrawPacket;
    use crate::damage::Rect;
    use crate::encode::types::Codec;

    #[derive(Default)]
    struct Ctx {
        pings: Vec<u64>,
        errors: Vec<String>,
    }

    fn dispatcher() -> Dispatcher<Ctx> {
        let mut d = Dispatcher::new(Arc::new(SendQueue::new(8, 1)));
        d.register(MessageType::Ping, |ctx: &mut Ctx, p| {
            if let Packet::Ping { time_us } = p {
                ctx.pings.push(time_us);
            }
            Ok(())
        });
        d.register(MessageType::Error, |ctx: &mut Ctx, p| {
            if let Packet::Error { message } = p {
                ctx.errors.push(message);
            }
            Ok(())
        });
        d
    }

    #[test]
    fn routes_in_arrival_order() {
        let d = dispatcher();
        let mut ctx = Ctx::default();
        for t in [3u64, 1, 2] {
            let m = Packet::Ping { time_us: t }.to_message();
            assert_eq!(d.dispatch(&mut ctx, m).unwrap(), Dispatched::Handled);
        }
        assert_eq!(ctx.pings, vec![3, 1, 2]);
    }

    #[test]
    fn unknown_and_unregistered_are_ignored() {
        let d = dispatcher();
        let mut ctx = Ctx::default();
        let unknown = Message::new("clipboard-token").with(1u64);
        assert_eq!(d.dispatch(&mut ctx, unknown).unwrap(), Dispatched::Ignored);

        let unregistered = Packet::Disconnect { reason: "x".into() }.to_message();
        assert_eq!(d.dispatch(&mut ctx, unregistered).unwrap(), Dispatched::Ignored);
        assert!(ctx.pings.is_empty());
    }

    #[test]
    fn malformed_message_is_reported_to_peer() {
        let d = dispatcher();
        let mut ctx = Ctx::default();
        let bad = Message::of(MessageType::Ping).with("soon");
        assert_eq!(d.dispatch(&mut ctx, bad).unwrap(), Dispatched::Malformed);

        let reply = d.queue().try_pop().unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Error));
    }

    #[test]
    fn handler_errors_propagate() {
        let mut d = dispatcher();
        d.register(MessageType::Ping, |_: &mut Ctx, _| Err(RdxError::ProtocolViolation("no")));
        let mut ctx = Ctx::default();
        let m = Packet::Ping { time_us: 1 }.to_message();
        assert!(d.dispatch(&mut ctx, m).is_err());
    }

    #[test]
    fn bulk_send_reports_backpressure() {
        let d = dispatcher();
        let draw = |seq| {
            Packet::Draw(DrawPacket {
                window_id: 1,
                rect: Rect::new(0, 0, 1, 1),
                codec: Codec::Rgb,
                data: vec![0; 4],
                sequence: seq,
                options: BTreeMap::new(),
            })
        };
        assert_eq!(priority_of(&draw(0)), Priority::Bulk);
        d.send(draw(1), Priority::Bulk).unwrap();
        assert!(matches!(
            d.send(draw(2), Priority::Bulk),
            Err(RdxError::Queue(QueueError::Full { .. }))
        ));
        // Control traffic still flows.
        d.send(Packet::Ping { time_us: 0 }, Priority::Control).unwrap();
    }

    #[test]
    fn metadata_updates_coalesce() {
        let d = dispatcher();
        let meta = |title: &str| Packet::WindowMetadata {
            window_id: 4,
            properties: BTreeMap::from([("title".to_string(), title.into())]),
        };
        d.send(meta("a"), Priority::Control).unwrap();
        d.send(meta("b"), Priority::Control).unwrap();
        assert_eq!(d.queue().depth(), 1);
        let m = Packet::from_message(d.queue().try_pop().unwrap()).unwrap();
        assert_eq!(m, meta("b"));
    }

    #[tokio::test]
    async fn send_timeout_gives_up() {
        let d = dispatcher();
        d.send(Packet::Ping { time_us: 0 }, Priority::Bulk).unwrap();
        let res = d
            .send_timeout(Packet::Ping { time_us: 1 }, Priority::Bulk, Duration::from_millis(10))
            .await;
        assert!(matches!(res, Err(RdxError::Timeout(_))));
    }
}
