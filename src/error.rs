//! # Error Types
//!
//! Error handling for the replication protocol engine.
//!
//! Every handler returns [`Result`]. Errors are always local to the message that
//! produced them: the dispatcher decides from the variant whether the peer that
//! sent the message has to be disconnected (see [`ProtocolError::is_fatal_for_peer`])
//! and otherwise logs and drops the message.
//!
//! ## Error Categories
//! - **Decode Errors**: truncated or malformed wire data
//! - **Handshake Errors**: certificate, signature and key agreement failures
//! - **Connection Errors**: configuration mismatches, unexpected or unknown senders
//! - **Routing Errors**: missing objects/behaviours, disabled features, permissions
//! - **Cryptographic Errors**: sealing/opening failures
//!
//! ## Example Usage
//! ```rust
//! use replica_protocol::core::BitReader;
//! use replica_protocol::error::ProtocolError;
//!
//! let mut reader = BitReader::new(&[]);
//! match reader.read_u64_packed() {
//!     Err(ProtocolError::TruncatedInput { needed, remaining }) => {
//!         assert_eq!((needed, remaining), (1, 0));
//!     }
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Lock errors
    pub const ERR_HANDLER_WRITE_LOCK: &str = "Failed to acquire write lock on message handlers";
    pub const ERR_HANDLER_READ_LOCK: &str = "Failed to acquire read lock on message handlers";
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Decode errors
    pub const ERR_INVALID_BOOL: &str = "Boolean byte must be 0 or 1";
    pub const ERR_INVALID_UTF8: &str = "String is not valid UTF-8";
    pub const ERR_NEGATIVE_LENGTH: &str = "Negative payload length";
    pub const ERR_INVALID_SWITCH_ID: &str = "Scene switch id must be 16 bytes";

    /// Handshake errors
    pub const ERR_CERTIFICATE_INVALID: &str = "Certificate failed verification";
    pub const ERR_HOSTNAME_MISMATCH: &str = "Certificate does not match the expected host";
    pub const ERR_NO_RSA_KEY: &str = "No RSA key found in certificate";
    pub const ERR_NO_DSA_KEY: &str = "No DSA key found in certificate";
    pub const ERR_INVALID_SIGNATURE: &str = "Invalid key exchange signature";
    pub const ERR_INVALID_SIGNATURE_TYPE: &str = "Invalid signature type";
    pub const ERR_INVALID_PUBLIC_VALUE: &str = "Key exchange public value must be 32 bytes";
    pub const ERR_NON_CONTRIBUTORY: &str = "Key exchange produced a non-contributory secret";
    pub const ERR_MISSING_IDENTITY: &str = "Signing is enabled but no server identity is set";
    pub const ERR_MISSING_VERIFIER: &str = "Signing is enabled but no certificate verifier is set";
    pub const ERR_KEY_EXCHANGE_CONSUMED: &str = "Key exchange context was already consumed";

    /// Cryptographic errors
    pub const ERR_ENCRYPTION_FAILED: &str = "Encryption failed";
    pub const ERR_DECRYPTION_FAILED: &str = "Decryption failed";
    pub const ERR_NO_SESSION_KEY: &str = "No session key established for peer";

    /// Routing errors
    pub const ERR_NETWORKED_VAR_DISABLED: &str = "networked variables are disabled";
}

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Truncated input: needed {needed} bytes, {remaining} remaining")]
    TruncatedInput { needed: usize, remaining: usize },

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Configuration mismatch: local hash {local:#018x}, remote hash {remote:#018x}")]
    ConfigMismatch { local: u64, remote: u64 },

    #[error("Missing target: {0}")]
    MissingTarget(String),

    #[error("Feature disabled: {0}")]
    FeatureDisabled(&'static str),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Unknown client: {0}")]
    UnknownClient(u64),

    #[error("Duplicate network id: {0}")]
    DuplicateNetworkId(u64),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Variable '{field}' encodes to {len} bytes, over the {max} byte field limit")]
    FieldTooLarge {
        field: String,
        len: usize,
        max: usize,
    },

    #[error("Batch of {len} entries exceeds the {max} entry limit")]
    BatchTooLarge { len: usize, max: usize },

    #[error("Response abandoned before completion")]
    ResponseAbandoned,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether the peer that produced this error must be disconnected.
    ///
    /// Malformed traffic, failed handshakes, incompatible configurations and
    /// undecryptable payloads end the connection. Everything else is logged and
    /// the offending message dropped.
    pub fn is_fatal_for_peer(&self) -> bool {
        matches!(
            self,
            ProtocolError::TruncatedInput { .. }
                | ProtocolError::MalformedInput(_)
                | ProtocolError::HandshakeFailed(_)
                | ProtocolError::ConfigMismatch { .. }
                | ProtocolError::DecryptionFailure
        )
    }

    pub(crate) fn handshake(reason: &str) -> Self {
        ProtocolError::HandshakeFailed(reason.to_string())
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
