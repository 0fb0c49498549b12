//! Reference client.
//!
//! Decodes draws in per-window sequence order, acknowledges each one
//! with a `damage-sequence` message, and answers pings. A draw that
//! fails to decode is acknowledged with a negative decode time so the
//! host sends the region again.
//!
//! Used by the integration tests and as the model for real clients.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::damage::Rect;
use crate::dispatch::Dispatcher;
use crate::encode::types::Codec;
use crate::encode::{FrameDecoder, UpdateSequencer};
use crate::error::RdxError;
use crate::message::MessageType;
use crate::network::handshake::local_capabilities;
use crate::network::{Connection, ConnectionEvent, Priority, SendQueue};
use crate::packet::{DamageAck, DrawPacket, Packet};
use crate::transport::FrameTransport;
use crate::wire::{Side, Value};

/// Something the client did in response to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientUpdate {
    Drawn {
        window_id: u64,
        sequence: u64,
        rect: Rect,
        codec: Codec,
    },
    DecodeFailed {
        window_id: u64,
        sequence: u64,
        reason: String,
    },
    Metadata {
        window_id: u64,
    },
}

pub struct ClientState {
    decoder: FrameDecoder,
    sequencer: UpdateSequencer,
    queue: Arc<SendQueue>,
    metadata: HashMap<u64, BTreeMap<String, Value>>,
    updates: VecDeque<ClientUpdate>,
    host_reason: Option<String>,
}

impl ClientState {
    fn apply(&mut self, draw: DrawPacket) -> Result<(), RdxError> {
        let started = Instant::now();
        let (window_id, sequence, rect, codec) = (draw.window_id, draw.sequence, draw.rect, draw.codec);

        let (decode_time_us, message, update) = match self.decoder.decode_and_apply(&draw) {
            Ok(_) => {
                let us = started.elapsed().as_micros() as i64;
                let update = ClientUpdate::Drawn {
                    window_id,
                    sequence,
                    rect,
                    codec,
                };
                (us, None, update)
            }
            Err(e) => {
                warn!(window_id, sequence, error = %e, "draw failed to decode");
                let update = ClientUpdate::DecodeFailed {
                    window_id,
                    sequence,
                    reason: e.description.clone(),
                };
                (-1, Some(e.description), update)
            }
        };
        self.updates.push_back(update);

        let ack = Packet::DamageSequence(DamageAck {
            sequence,
            window_id,
            width: rect.width,
            height: rect.height,
            decode_time_us,
            message,
        });
        self.queue.try_push(ack.to_message(), Priority::Control, None)?;
        Ok(())
    }
}

fn handlers(queue: Arc<SendQueue>) -> Dispatcher<ClientState> {
    let mut d = Dispatcher::new(queue.clone());

    d.register(MessageType::Draw, |s: &mut ClientState, packet| {
        let Packet::Draw(draw) = packet else {
            return Ok(());
        };
        for ready in s.sequencer.push(draw) {
            s.apply(ready)?;
        }
        Ok(())
    });

    let replies = queue;
    d.register(MessageType::Ping, move |_: &mut ClientState, packet| {
        if let Packet::Ping { time_us } = packet {
            let echo = Packet::PingEcho {
                echoed_us: time_us,
                backlog: Some(replies.depth() as u64),
            };
            replies.try_push(echo.to_message(), Priority::Control, None)?;
        }
        Ok(())
    });

    d.register(MessageType::WindowMetadata, |s: &mut ClientState, packet| {
        if let Packet::WindowMetadata {
            window_id,
            properties,
        } = packet
        {
            s.metadata.entry(window_id).or_default().extend(properties);
            s.updates.push_back(ClientUpdate::Metadata { window_id });
        }
        Ok(())
    });

    d.register(MessageType::Disconnect, |s: &mut ClientState, packet| {
        if let Packet::Disconnect { reason } = packet {
            info!(%reason, "host disconnecting");
            s.host_reason = Some(reason);
        }
        Ok(())
    });

    d.register(MessageType::Error, |_: &mut ClientState, packet| {
        if let Packet::Error { message } = packet {
            warn!(%message, "host reported an error");
        }
        Ok(())
    });

    d
}

pub struct Client {
    connection: Connection,
    dispatcher: Dispatcher<ClientState>,
    state: ClientState,
    closed: Option<String>,
}

impl Client {
    /// Handshake with a host over `transport`.
    pub async fn connect<T: FrameTransport>(
        transport: T,
        config: &EngineConfig,
    ) -> Result<Client, RdxError> {
        let local = local_capabilities(&config.protocol, &config.encoding.encodings);
        let connection =
            Connection::establish(transport, Side::Client, local, &config.protocol).await?;
        let decoder = FrameDecoder::with_max_size(config.encoding.max_surface_size);
        Ok(Self::with_decoder(connection, decoder))
    }

    pub fn new(connection: Connection) -> Self {
        Self::with_decoder(connection, FrameDecoder::new())
    }

    pub fn with_decoder(connection: Connection, decoder: FrameDecoder) -> Self {
        let queue = connection.queue();
        Self {
            dispatcher: handlers(queue.clone()),
            state: ClientState {
                decoder,
                sequencer: UpdateSequencer::default(),
                queue,
                metadata: HashMap::new(),
                updates: VecDeque::new(),
                host_reason: None,
            },
            connection,
            closed: None,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Process inbound messages until the next update. `None` once the
    /// connection is closed.
    pub async fn next_update(&mut self) -> Option<ClientUpdate> {
        loop {
            if let Some(update) = self.state.updates.pop_front() {
                return Some(update);
            }
            if self.closed.is_some() {
                return None;
            }
            match self.connection.recv().await {
                ConnectionEvent::Message(message) => {
                    if let Err(e) = self.dispatcher.dispatch(&mut self.state, message) {
                        warn!(error = %e, "handler failed");
                    }
                }
                ConnectionEvent::Closed { reason } => {
                    debug!(%reason, "client connection closed");
                    self.closed = Some(reason);
                }
            }
        }
    }

    /// Tell the host which encodings this client decodes from now on.
    pub fn send_encodings(&self, codecs: Vec<Codec>) -> Result<(), RdxError> {
        self.dispatcher.send(Packet::Encodings(codecs), Priority::Control)
    }

    /// Current pixels of a window: `(width, height, bpp, pixels)`.
    pub fn surface(&self, window_id: u64) -> Option<(u32, u32, usize, &[u8])> {
        self.state.decoder.surface(window_id)
    }

    pub fn pixel(&self, window_id: u64, x: u32, y: u32) -> Option<&[u8]> {
        self.state.decoder.pixel(window_id, x, y)
    }

    pub fn metadata(&self, window_id: u64) -> Option<&BTreeMap<String, Value>> {
        self.state.metadata.get(&window_id)
    }

    /// Reason the host gave in its `disconnect`, if any.
    pub fn host_reason(&self) -> Option<&str> {
        self.state.host_reason.as_deref()
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<&str> {
        self.closed.as_deref()
    }

    pub async fn close(&mut self, reason: &str) {
        self.connection.close(reason).await;
        self.closed.get_or_insert_with(|| reason.to_string());
    }
}
