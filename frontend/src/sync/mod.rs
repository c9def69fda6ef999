//! Cross-context synchronization: transports, envelope codec and the
//! protocol session built on top of them.

pub mod connection;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod session;
pub mod storage;
pub mod transport;

pub use connection::{ConnectionState, ConnectionStatus, Heartbeat, HeartbeatAction};
pub use envelope::{decode, encode, Envelope, EnvelopeRejection};
pub use error::{StorageError, TransportError};
pub use memory::{MemoryBroadcast, MemoryHub, MemoryStorage, MemoryWindow};
pub use session::{DropReason, SessionEvent, SessionRole, SyncDiagnostics, SyncSession};
pub use storage::{KeyValueStore, StorageTransport, TimerStore};
pub use transport::{
    Incoming, PrimaryStatus, ReconnectPolicy, SyncTransport, Transport, TransportEvent,
    TransportKind, TransportStats,
};
