//! # Error Types
//!
//! Custom error types for Param Sync using `thiserror`.

use thiserror::Error;

/// Main error type for Param Sync
#[derive(Debug, Error)]
pub enum ParamSyncError {
    /// Transport unavailable; never retried
    #[error("No connection to flight controller: {0}")]
    NoConnection(String),

    /// No echo arrived within the retry budget
    #[error("Timed out waiting for {name} after {attempts} attempt(s)")]
    Timeout { name: String, attempts: u32 },

    /// Read-back after a lost echo returned a different value
    #[error("{name} read back as {actual} after writing {expected}")]
    VerificationMismatch {
        name: String,
        expected: f32,
        actual: f32,
    },

    /// Caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Metadata catalog could not be loaded
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ParamSyncError {
    /// Name of the parameter the failure belongs to, if any
    pub fn parameter(&self) -> Option<&str> {
        match self {
            Self::Timeout { name, .. } | Self::VerificationMismatch { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// Result type alias for Param Sync
pub type Result<T> = std::result::Result<T, ParamSyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_name_reported_for_write_failures() {
        let err = ParamSyncError::Timeout {
            name: "ANGLE_MAX".to_string(),
            attempts: 3,
        };
        assert_eq!(err.parameter(), Some("ANGLE_MAX"));
        assert_eq!(
            err.to_string(),
            "Timed out waiting for ANGLE_MAX after 3 attempt(s)"
        );

        let err = ParamSyncError::VerificationMismatch {
            name: "RC1_MIN".to_string(),
            expected: 1000.0,
            actual: 1100.0,
        };
        assert_eq!(err.parameter(), Some("RC1_MIN"));
    }

    #[test]
    fn test_connection_errors_have_no_parameter() {
        let err = ParamSyncError::NoConnection("link closed".to_string());
        assert_eq!(err.parameter(), None);
        assert!(ParamSyncError::Cancelled.parameter().is_none());
    }
}
