//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur during protocol operations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum allowed size.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Failed to serialize a frame or payload.
    #[error("encoding failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Bytes are not a valid frame or payload for the requested type.
    #[error("decoding failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Empty message received.
    #[error("empty message")]
    EmptyMessage,

    /// A file part descriptor is not `[total, current]` with `1 <= current <= total`.
    #[error("invalid file parts {parts:?}")]
    InvalidParts { parts: Vec<u64> },
}
