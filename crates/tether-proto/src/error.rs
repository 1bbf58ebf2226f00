//! Protocol-level errors.

use thiserror::Error;

/// Errors produced while framing or parsing IRC lines.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The line exceeded the codec's maximum length.
    #[error("line too long: {actual} bytes (limit {limit})")]
    LineTooLong {
        /// Observed length in bytes.
        actual: usize,
        /// Configured limit.
        limit: usize,
    },

    /// The message was empty after stripping line endings.
    #[error("empty message")]
    EmptyMessage,

    /// A message carried a prefix or tags section but no verb.
    #[error("missing command in: {0:?}")]
    MissingCommand(String),

    /// Underlying transport error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
