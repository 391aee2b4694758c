//! Error types for btlink-core.
//!
//! Two layers of failure exist. [`PlatformError`] is what a Bluetooth
//! backend reports for a single request, either synchronously from the
//! request call or later through a result callback. [`Error`] is what the
//! public adapter API returns. Per-peer send failures are described by
//! [`FailureReason`], which also travels through the error callback.
//!
//! # Retrying
//!
//! | Failure | Retryable | Notes |
//! |---------|-----------|-------|
//! | [`FailureReason::ConnectFailed`] | yes | Peer may be busy or out of range |
//! | [`FailureReason::WriteFailed`] | yes | GATT writes fail transiently |
//! | [`FailureReason::Disconnected`] | yes | Link dropped mid-transfer |
//! | [`FailureReason::Timeout`] | yes | Session watchdog expired |
//! | [`FailureReason::PeerNotFound`] | no | Already waited for discovery |
//! | [`FailureReason::Cancelled`] | no | Caller asked to stop |
//! | [`FailureReason::AdapterStopped`] | no | Adapter is shutting down |
//!
//! [`crate::RetryConfig`] on [`crate::AdapterConfig`] controls how many
//! times the send coordinator re-runs a failed unicast.

use std::time::Duration;

use btlink_types::{ParseError, PeerAddress};
use thiserror::Error;

use crate::config::ConfigError;
use crate::pending::SendReport;
use crate::platform::CapabilityError;

/// Errors returned by the transport adapter.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth stack error from a native backend.
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),

    /// A caller-supplied argument was rejected before any platform call.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A peer address could not be parsed.
    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] ParseError),

    /// The payload does not fit in a single datagram.
    #[error("Payload of {len} bytes exceeds the {max} byte datagram limit")]
    PayloadTooLarge {
        /// Payload length.
        len: usize,
        /// Largest accepted payload.
        max: usize,
    },

    /// The adapter has not been started.
    #[error("Adapter not started")]
    NotStarted,

    /// The adapter is already running.
    #[error("Adapter already started")]
    AlreadyStarted,

    /// The platform cannot provide a configured role or transport.
    #[error("Unsupported: {0}")]
    Unsupported(CapabilityError),

    /// At least one target of a send did not succeed.
    #[error("Send failed: {reason}")]
    SendFailed {
        /// Reason of the first failing target.
        reason: FailureReason,
        /// Per-target accounting for the send.
        report: SendReport,
    },

    /// The task pool could not accept or run work.
    #[error("Task pool error: {0}")]
    TaskPool(String),

    /// A platform request was rejected.
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why a single target of a send did not succeed.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FailureReason {
    /// The peer never appeared in the discovery list.
    PeerNotFound,
    /// A multicast found nobody to send to.
    NoPeersDiscovered,
    /// The peer has no live link in the accepting role.
    PeerNotConnected,
    /// The platform reported a failed connection attempt.
    ConnectFailed(String),
    /// Capability discovery failed on an established link.
    CapabilityDiscoveryFailed(String),
    /// A write was rejected or reported an error.
    WriteFailed(String),
    /// A server notification was rejected or reported an error.
    NotifyFailed(String),
    /// The link dropped before the transfer finished.
    Disconnected,
    /// No progress within the operation timeout.
    Timeout(Duration),
    /// The send was cancelled by the caller.
    Cancelled,
    /// The adapter was stopped while the send was in flight.
    AdapterStopped,
    /// The local Bluetooth adapter was switched off.
    AdapterDisabled,
    /// Any other platform rejection.
    Platform(String),
}

impl FailureReason {
    /// Whether re-running the send may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed(_)
                | Self::WriteFailed(_)
                | Self::NotifyFailed(_)
                | Self::Disconnected
                | Self::Timeout(_)
                | Self::Platform(_)
        )
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerNotFound => write!(f, "peer not found"),
            Self::NoPeersDiscovered => write!(f, "no peers discovered"),
            Self::PeerNotConnected => write!(f, "peer not connected"),
            Self::ConnectFailed(msg) => write!(f, "connect failed: {}", msg),
            Self::CapabilityDiscoveryFailed(msg) => {
                write!(f, "capability discovery failed: {}", msg)
            }
            Self::WriteFailed(msg) => write!(f, "write failed: {}", msg),
            Self::NotifyFailed(msg) => write!(f, "notify failed: {}", msg),
            Self::Disconnected => write!(f, "peer disconnected"),
            Self::Timeout(d) => write!(f, "no progress for {:?}", d),
            Self::Cancelled => write!(f, "cancelled"),
            Self::AdapterStopped => write!(f, "adapter stopped"),
            Self::AdapterDisabled => write!(f, "adapter disabled"),
            Self::Platform(msg) => write!(f, "platform error: {}", msg),
        }
    }
}

/// Errors reported by a Bluetooth platform backend.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum PlatformError {
    /// The request was refused.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The backend has no handle for this peer.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerAddress),

    /// The backend does not implement this request.
    #[error("{0} is not supported by this platform")]
    Unsupported(&'static str),

    /// A platform status code other than success.
    #[error("platform status {0}")]
    Status(i32),

    /// The local radio is off or unavailable.
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,
}

/// Result type for platform requests.
pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

impl Error {
    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create an invalid parameter error.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter(message.into())
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// The failure reason, if this is a send failure.
    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match self {
            Self::SendFailed { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// The send report, if this is a send failure.
    pub fn report(&self) -> Option<&SendReport> {
        match self {
            Self::SendFailed { report, .. } => Some(report),
            _ => None,
        }
    }

    /// Whether re-running the failed operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Bluetooth(_) => true,
            Error::SendFailed { reason, .. } => reason.is_retryable(),
            Error::Platform(_) => true,
            Error::Timeout { .. } => true,
            Error::Io(_) => true,
            Error::InvalidParameter(_)
            | Error::InvalidAddress(_)
            | Error::PayloadTooLarge { .. }
            | Error::NotStarted
            | Error::AlreadyStarted
            | Error::Unsupported(_)
            | Error::TaskPool(_)
            | Error::InvalidConfig(_)
            | Error::Config(_) => false,
        }
    }
}

#[cfg(feature = "btleplug")]
impl From<btleplug::Error> for Error {
    fn from(err: btleplug::Error) -> Self {
        Error::Bluetooth(err.to_string())
    }
}

/// Result type alias using btlink-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::{SendMode, SendReport};

    #[test]
    fn test_failure_reason_display() {
        assert_eq!(FailureReason::PeerNotFound.to_string(), "peer not found");
        assert_eq!(
            FailureReason::NoPeersDiscovered.to_string(),
            "no peers discovered"
        );
        assert!(
            FailureReason::WriteFailed("status 133".into())
                .to_string()
                .contains("status 133")
        );
        assert!(
            FailureReason::Timeout(Duration::from_secs(30))
                .to_string()
                .contains("30s")
        );
    }

    #[test]
    fn test_send_failed_display_carries_reason() {
        let err = Error::SendFailed {
            reason: FailureReason::PeerNotFound,
            report: SendReport::empty(SendMode::Unicast),
        };
        assert_eq!(err.to_string(), "Send failed: peer not found");
        assert_eq!(err.failure_reason(), Some(&FailureReason::PeerNotFound));
        assert!(err.report().is_some());
    }

    #[test]
    fn test_retry_classification() {
        assert!(FailureReason::ConnectFailed("busy".into()).is_retryable());
        assert!(FailureReason::Disconnected.is_retryable());
        assert!(!FailureReason::PeerNotFound.is_retryable());
        assert!(!FailureReason::Cancelled.is_retryable());
        assert!(!FailureReason::AdapterStopped.is_retryable());

        assert!(!Error::NotStarted.is_retryable());
        assert!(!Error::invalid_parameter("empty payload").is_retryable());
        assert!(Error::Platform(PlatformError::Status(133)).is_retryable());
    }

    #[test]
    fn test_platform_error_display() {
        let addr: PeerAddress = "AA:BB:CC:DD:EE:01".parse().unwrap();
        assert_eq!(
            PlatformError::UnknownPeer(addr).to_string(),
            "unknown peer AA:BB:CC:DD:EE:01"
        );
        assert_eq!(
            PlatformError::Unsupported("notify").to_string(),
            "notify is not supported by this platform"
        );
    }

    #[test]
    fn test_parse_error_conversion() {
        let parse = "zz".parse::<PeerAddress>().unwrap_err();
        let err: Error = parse.into();
        assert!(matches!(err, Error::InvalidAddress(_)));
    }
}
