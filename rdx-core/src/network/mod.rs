pub mod connection;
pub mod handshake;
pub mod phase;
pub mod queue;

pub use connection::{Connection, ConnectionEvent, ConnectionStats, StatsSnapshot};
pub use handshake::local_capabilities;
pub use phase::ConnectionPhase;
pub use queue::{Priority, SendQueue};
