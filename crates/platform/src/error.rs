//! Error types for skiff

use std::fmt;

/// Unified error type for all skiff operations.
///
/// The variants mirror the failure classes of the SSH transport and
/// connection layers. Everything except `Auth` and `Channel` is fatal to the
/// transport that produced it.
#[derive(Debug)]
pub enum SkiffError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Wire format error (framing, length, padding)
    Wire(String),

    /// Cryptographic error (MAC/tag mismatch, decryption or key derivation failure)
    Crypto(String),

    /// Protocol error (packet illegal in the current state)
    Protocol(String),

    /// Algorithm negotiation failure (no common algorithm)
    Negotiation(String),

    /// Authentication failure (credential-level, retryable within the auth budget)
    Auth(String),

    /// Channel-level failure; carries the local channel id it affects
    Channel {
        /// Local id of the affected channel
        id: u32,
        /// Human-readable description
        reason: String,
    },

    /// Transport closed (peer DISCONNECT or socket EOF)
    Disconnected {
        /// SSH disconnect reason code
        code: u32,
        /// Human-readable description
        message: String,
    },

    /// Operation timed out
    Timeout(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for SkiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkiffError::Io(e) => write!(f, "IO error: {}", e),
            SkiffError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SkiffError::Wire(msg) => write!(f, "Wire format error: {}", msg),
            SkiffError::Crypto(msg) => write!(f, "Crypto error: {}", msg),
            SkiffError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SkiffError::Negotiation(msg) => write!(f, "Negotiation failure: {}", msg),
            SkiffError::Auth(msg) => write!(f, "Authentication failure: {}", msg),
            SkiffError::Channel { id, reason } => {
                write!(f, "Channel {} error: {}", id, reason)
            }
            SkiffError::Disconnected { code, message } => {
                write!(f, "Transport closed (reason {}): {}", code, message)
            }
            SkiffError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            SkiffError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for SkiffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SkiffError::Io(e) => Some(e),
            SkiffError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SkiffError {
    fn from(err: std::io::Error) -> Self {
        SkiffError::Io(err)
    }
}

/// Result type for skiff operations
pub type SkiffResult<T> = Result<T, SkiffError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SkiffError::Config("Invalid configuration".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let skiff_err: SkiffError = io_err.into();
        assert!(matches!(skiff_err, SkiffError::Io(_)));
    }

    #[test]
    fn test_channel_error_carries_id() {
        let err = SkiffError::Channel {
            id: 3,
            reason: "window overrun".to_string(),
        };
        assert_eq!(err.to_string(), "Channel 3 error: window overrun");
    }

    #[test]
    fn test_result_type() {
        fn example() -> SkiffResult<i32> {
            Ok(42)
        }

        assert_eq!(example().unwrap(), 42);
    }
}
