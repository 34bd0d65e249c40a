//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption or authentication failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Invalid or malformed nonce.
    #[error("invalid nonce: {0}")]
    InvalidNonce(String),

    /// Attempted an encrypted operation before a session was established.
    #[error("no session: key exchange has not completed")]
    NoSession,

    // Frame errors
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Advertised frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Stream ended before a complete frame body arrived.
    #[error("truncated frame: expected {expected} bytes, got {got}")]
    TruncatedFrame {
        /// Length advertised by the prefix.
        expected: usize,
        /// Bytes actually read before EOF.
        got: usize,
    },

    /// I/O failure on the underlying byte stream.
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}
