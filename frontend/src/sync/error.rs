use super::transport::TransportKind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("{0:?} transport is not supported by this host")]
    Unavailable(TransportKind),
    #[error("{0:?} transport is closed")]
    Closed(TransportKind),
    #[error("{kind:?} transport write failed: {reason}")]
    Write { kind: TransportKind, reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("no transport tier accepted the message")]
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("storage is not available")]
    Unavailable,
    #[error("failed to read '{key}': {reason}")]
    Read { key: String, reason: String },
    #[error("failed to write '{key}': {reason}")]
    Write { key: String, reason: String },
    #[error("failed to decode '{key}': {reason}")]
    Decode { key: String, reason: String },
}
