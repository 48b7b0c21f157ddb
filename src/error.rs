//! Error types for tapwire.

use thiserror::Error;

/// Main error type for all tapwire operations.
///
/// "Not enough bytes yet" is never an error: delimiter and reader APIs
/// express it as `Ok(None)` and callers retry after more input arrives.
#[derive(Debug, Error)]
pub enum TapwireError {
    /// I/O error on the underlying endpoint.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error (inconsistent frame length, bad handshake, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Header-compression context error (bad index, table overflow, ...).
    #[error("Header compression error: {0}")]
    Hpack(String),

    /// A reassembled unit did not match the expected protocol grammar.
    #[error("Decode error: {0}")]
    Decode(String),

    /// An edited message could not be serialized back to the wire.
    #[error("Encode error: {0}")]
    Encode(String),

    /// Hand-off queue closed; no further writes are accepted.
    #[error("Hand-off queue closed")]
    ChannelClosed,
}

/// Result type alias using TapwireError.
pub type Result<T> = std::result::Result<T, TapwireError>;
