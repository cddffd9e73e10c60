//! Error types for commune
//!
//! All modules use `CommuneResult<T>` as their return type. Errors that are
//! cached against a transformation checksum and broadcast to its consumers
//! live in [`TransformationError`], which is cheap to clone.

use crate::checksum::Checksum;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for commune operations
pub type CommuneResult<T> = Result<T, CommuneError>;

/// Failure of one transformation, as seen by every consumer attached to it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformationError {
    /// The transformation's own code failed
    #[error("Transformation failed: {0}")]
    Execution(String),

    /// A peer reported that the transformation failed there
    #[error("Remote transformation failed: {0}")]
    Remote(String),

    /// An input buffer could not be found locally or on any peer
    #[error("Cache miss: no buffer known for checksum {0}")]
    CacheMiss(Checksum),

    /// Someone stopped the job on purpose
    #[error("Transformation was hard-cancelled")]
    HardCancelled,

    /// A peer kept asking for resubmission
    #[error("Transformation restarted {0} times, giving up")]
    RestartExceeded(u32),

    /// Local execution is not allowed and no peer could run the job
    #[error("Local execution unavailable: {0}")]
    LocalDisabled(String),
}

impl TransformationError {
    /// Deliberate stops that callers must not confuse with a failing transformation
    pub fn is_fatal_stop(&self) -> bool {
        matches!(self, Self::HardCancelled | Self::RestartExceeded(_))
    }

    /// Whether this error is remembered against the transformation checksum
    pub fn is_sticky(&self) -> bool {
        !matches!(self, Self::HardCancelled)
    }
}

/// All errors that can occur in commune
#[derive(Error, Debug)]
pub enum CommuneError {
    // Transformation errors
    #[error(transparent)]
    Transformation(#[from] TransformationError),

    #[error("Unknown transformation: {0}")]
    UnknownTransformation(Checksum),

    #[error("Invalid transformation: {0}")]
    InvalidTransformation(String),

    #[error("Invalid checksum: {0}")]
    InvalidChecksum(String),

    // Protocol errors
    #[error("Protocol mismatch: peer speaks {theirs}, we speak {ours}")]
    ProtocolMismatch { ours: String, theirs: String },

    #[error("Peer {0} is already connected")]
    DuplicatePeer(String),

    #[error("Invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("Frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Peer {peer} did not answer within {duration_ms} ms")]
    PeerTimeout { peer: String, duration_ms: u64 },

    #[error("Peer {peer} reported an error: {message}")]
    RemoteError { peer: String, message: String },

    #[error("Request refused by servant configuration: {0}")]
    NotServed(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker protocol error: {0}")]
    Worker(String),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl From<std::io::Error> for CommuneError {
    fn from(source: std::io::Error) -> Self {
        Self::io("peer transport", source)
    }
}

impl CommuneError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create an invalid frame error
    pub fn invalid_frame(reason: impl Into<String>) -> Self {
        Self::InvalidFrame {
            reason: reason.into(),
        }
    }

    /// Errors that mean "this peer has no opinion" rather than a real failure
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::PeerTimeout { .. } | Self::Io { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ProtocolMismatch { .. } => Some("Upgrade both instances to the same release"),
            Self::Transformation(TransformationError::Execution(_)) => {
                Some("The failure is cached; clear it before retrying the transformation")
            }
            Self::Transformation(TransformationError::LocalDisabled(_)) => {
                Some("Set execution.local_cores above 0 or connect a transformation servant")
            }
            Self::ConfigInvalid { .. } => Some("Run: commune config show"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CommuneError::DuplicatePeer("peer-a".to_string());
        assert!(err.to_string().contains("already connected"));
    }

    #[test]
    fn error_hint() {
        let err = CommuneError::ProtocolMismatch {
            ours: "0.3".to_string(),
            theirs: "0.2".to_string(),
        };
        assert!(err.hint().is_some());
        assert!(CommuneError::ConnectionClosed.hint().is_none());
    }

    #[test]
    fn hard_cancel_is_distinct_from_failure() {
        let cancelled = TransformationError::HardCancelled;
        let failed = TransformationError::Execution("boom".to_string());
        assert!(cancelled.is_fatal_stop());
        assert!(!failed.is_fatal_stop());
        assert!(!cancelled.is_sticky());
        assert!(failed.is_sticky());
        assert_ne!(cancelled.to_string(), failed.to_string());
    }

    #[test]
    fn transient_errors() {
        assert!(CommuneError::ConnectionClosed.is_transient());
        assert!(CommuneError::PeerTimeout {
            peer: "b".to_string(),
            duration_ms: 5000
        }
        .is_transient());
        assert!(!CommuneError::DuplicatePeer("x".to_string()).is_transient());
    }

    #[test]
    fn transformation_error_converts() {
        let err: CommuneError = TransformationError::RestartExceeded(100).into();
        assert!(err.to_string().contains("100"));
    }
}
