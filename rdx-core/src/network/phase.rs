//! Connection lifecycle state machine.
//!
//! Transitions are validated and return `Result` instead of panicking.

use std::time::Instant;

use crate::error::RdxError;

// ── ConnectionPhase ──────────────────────────────────────────────

/// ```text
///  Connecting ──► Handshaking ──► Active ──► Closing ──► Closed
///       │              │                                   ▲
///       └──────────────┴───────────────────────────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    /// Transport established, nothing exchanged yet.
    #[default]
    Connecting,

    /// `hello` sent, waiting for the peer's.
    Handshaking,

    /// Capabilities agreed; traffic flows.
    Active {
        since: Instant,
    },

    /// `disconnect` queued, draining the send queue.
    Closing,

    /// Terminal.
    Closed,
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Handshaking => write!(f, "Handshaking"),
            Self::Active { .. } => write!(f, "Active"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

impl ConnectionPhase {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// How long the connection has been active, `None` in any other phase.
    pub fn active_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Active { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Connecting`.
    pub fn begin_handshake(&mut self) -> Result<(), RdxError> {
        match self {
            Self::Connecting => {
                *self = Self::Handshaking;
                Ok(())
            }
            _ => Err(RdxError::ProtocolViolation(
                "cannot handshake: not in Connecting state",
            )),
        }
    }

    /// Valid from: `Handshaking`.
    pub fn complete_handshake(&mut self) -> Result<(), RdxError> {
        match self {
            Self::Handshaking => {
                *self = Self::Active {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(RdxError::ProtocolViolation(
                "cannot complete handshake: not in Handshaking state",
            )),
        }
    }

    /// Valid from: `Handshaking`, `Active`.
    pub fn begin_close(&mut self) -> Result<(), RdxError> {
        match self {
            Self::Handshaking | Self::Active { .. } => {
                *self = Self::Closing;
                Ok(())
            }
            _ => Err(RdxError::ProtocolViolation(
                "cannot close: not in Handshaking or Active state",
            )),
        }
    }

    /// Valid from: `Closing`, `Connecting` and `Handshaking` (failure).
    pub fn finish_close(&mut self) -> Result<(), RdxError> {
        match self {
            Self::Closing | Self::Connecting | Self::Handshaking => {
                *self = Self::Closed;
                Ok(())
            }
            _ => Err(RdxError::ProtocolViolation(
                "cannot finish close: not in a closable state",
            )),
        }
    }

    /// Jump to `Closed` from anywhere, for fatal transport errors.
    pub fn force_close(&mut self) {
        *self = Self::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_lifecycle() {
        let mut phase = ConnectionPhase::default();
        assert_eq!(phase, ConnectionPhase::Connecting);

        phase.begin_handshake().unwrap();
        assert_eq!(phase, ConnectionPhase::Handshaking);

        phase.complete_handshake().unwrap();
        assert!(phase.is_active());
        assert!(phase.active_duration().is_some());

        phase.begin_close().unwrap();
        assert_eq!(phase, ConnectionPhase::Closing);

        phase.finish_close().unwrap();
        assert!(phase.is_closed());
    }

    #[test]
    fn handshake_failure_closes_directly() {
        let mut phase = ConnectionPhase::Handshaking;
        phase.finish_close().unwrap();
        assert!(phase.is_closed());
    }

    #[test]
    fn invalid_transitions() {
        let mut phase = ConnectionPhase::Closed;
        assert!(phase.begin_handshake().is_err());
        assert!(phase.begin_close().is_err());

        let mut phase = ConnectionPhase::Connecting;
        assert!(phase.complete_handshake().is_err());

        let mut phase = ConnectionPhase::Active {
            since: Instant::now(),
        };
        assert!(phase.finish_close().is_err());
        phase.force_close();
        assert!(phase.is_closed());
    }

    #[test]
    fn display_format() {
        assert_eq!(ConnectionPhase::Connecting.to_string(), "Connecting");
        assert_eq!(
            ConnectionPhase::Active {
                since: Instant::now()
            }
            .to_string(),
            "Active"
        );
        assert_eq!(ConnectionPhase::Closed.to_string(), "Closed");
    }
}
