//! Error types for data parsing in btlink-types.

use thiserror::Error;

/// Errors that can occur when parsing addresses or decoding fragments.
///
/// This error type is platform-agnostic and does not include
/// Bluetooth-specific errors (those belong in btlink-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The input did not have the shape of a hardware address.
    #[error("Invalid address '{input}': {reason}")]
    InvalidAddress {
        /// The rejected input.
        input: String,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// Not enough bytes to decode a value.
    #[error("Insufficient bytes: expected {expected}, got {actual}")]
    InsufficientBytes {
        /// Minimum number of bytes required.
        expected: usize,
        /// Number of bytes available.
        actual: usize,
    },

    /// A decoded value was out of range.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

impl ParseError {
    pub(crate) fn address(input: &str, reason: &'static str) -> Self {
        Self::InvalidAddress {
            input: input.to_string(),
            reason,
        }
    }
}

/// Result type alias using btlink-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
