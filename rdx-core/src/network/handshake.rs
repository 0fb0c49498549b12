//! Capability exchange.
//!
//! Both peers send `hello` immediately and then wait for the other's.
//! Hellos always travel uncompressed and in clear; the negotiated
//! compression and cipher apply from the next frame on.

use tracing::{debug, warn};

use crate::config::ProtocolConfig;
use crate::encode::types::Codec;
use crate::error::{HandshakeError, RdxError};
use crate::message::Message;
use crate::packet::{Capabilities, PROTOCOL_VERSION, Packet};
use crate::transport::{BoxFrameSink, BoxFrameSource};
use crate::wire::WireCodec;

/// What this engine advertises, given its configuration.
pub fn local_capabilities(config: &ProtocolConfig, encodings: &[Codec]) -> Capabilities {
    Capabilities {
        protocol_version: PROTOCOL_VERSION,
        compressors: config.compressors.clone(),
        encryption: config.encryption_secret.is_some(),
        encodings: encodings.to_vec(),
        max_message_size: config.max_message_size as u64,
    }
}

pub(crate) async fn send_message(
    sink: &mut BoxFrameSink,
    codec: &mut WireCodec,
    message: Message,
) -> Result<(), RdxError> {
    for frame in codec.encoder.encode(message)? {
        sink.write_frame(frame).await?;
    }
    Ok(())
}

/// Send our `hello` and return the peer's capabilities.
pub(crate) async fn exchange_hello(
    source: &mut BoxFrameSource,
    sink: &mut BoxFrameSink,
    codec: &mut WireCodec,
    local: &Capabilities,
) -> Result<Capabilities, RdxError> {
    send_message(sink, codec, Packet::Hello(local.clone()).to_message()).await?;

    loop {
        let frame = source
            .read_frame()
            .await?
            .ok_or_else(|| HandshakeError::PeerDisconnected("connection closed".into()))?;
        let message = match codec.decoder.decode(frame) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(e) => return Err(HandshakeError::InvalidHello(e.description).into()),
        };
        debug!(%message, "handshake message");

        match Packet::from_message(message) {
            Ok(Packet::Hello(remote)) => return Ok(remote),
            Ok(Packet::Disconnect { reason }) => {
                return Err(HandshakeError::PeerDisconnected(reason).into());
            }
            Ok(Packet::Unknown(message)) => {
                warn!(kind = %message.kind, "ignoring unknown message before hello");
            }
            Ok(other) => {
                return Err(HandshakeError::InvalidHello(format!(
                    "expected hello, got {}",
                    other.to_message().kind
                ))
                .into());
            }
            Err(e) => return Err(HandshakeError::InvalidHello(e.description).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FrameTransport, StreamTransport};

    #[tokio::test]
    async fn hellos_cross() {
        let cfg = ProtocolConfig::default();
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (mut a_src, mut a_sink) = StreamTransport::new(a, 1 << 20, "a").split();
        let (mut b_src, mut b_sink) = StreamTransport::new(b, 1 << 20, "b").split();

        let host = local_capabilities(&cfg, &[Codec::Rgb, Codec::Video]);
        let client = local_capabilities(&cfg, &[Codec::Rgb]);

        let (mut ca, mut cb) = (WireCodec::new(&cfg), WireCodec::new(&cfg));
        let (ra, rb) = tokio::join!(
            exchange_hello(&mut a_src, &mut a_sink, &mut ca, &host),
            exchange_hello(&mut b_src, &mut b_sink, &mut cb, &client),
        );
        assert_eq!(ra.unwrap(), client);
        assert_eq!(rb.unwrap(), host);
    }

    #[tokio::test]
    async fn peer_closing_early_is_reported() {
        let cfg = ProtocolConfig::default();
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (mut src, mut sink) = StreamTransport::new(a, 1 << 20, "a").split();
        drop(b);

        let mut codec = WireCodec::new(&cfg);
        let local = local_capabilities(&cfg, &[Codec::Rgb]);
        assert!(exchange_hello(&mut src, &mut sink, &mut codec, &local).await.is_err());
    }
}
