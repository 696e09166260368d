//! Error types and handling for the secure-session core.
//!
//! Every public operation returns [`Result`]. Errors are grouped into the
//! classes callers need to react to differently: malformed input, failed
//! authentication, protocol state problems and failures surfaced by the
//! key-material or key-store collaborators.

use std::sync::Arc;
use thiserror::Error;

/// Result type alias for the secure-session library
pub type Result<T> = std::result::Result<T, SessionCoreError>;

/// Coarse classification of a [`SessionCoreError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed lengths, hex, encodings or missing fields
    Validation,
    /// Signature or AEAD tag mismatch, or an unusable message counter
    Authentication,
    /// Wrong message kind, consumed prekey, exhausted chain
    ProtocolState,
    /// Failure reported by the key manager or key store
    Collaborator,
    /// Invalid or unreadable configuration
    Configuration,
}

/// Top-level error type for all secure-session operations
#[derive(Error, Debug, Clone)]
pub enum SessionCoreError {
    /// Structurally invalid input
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Cryptographic authentication failure
    #[error("Authentication error: {0}")]
    Authentication(#[from] AuthenticationError),

    /// Protocol state violation
    #[error("Protocol state error: {0}")]
    ProtocolState(#[from] ProtocolStateError),

    /// Error surfaced by a collaborator
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An error annotated with the operation and conversation it occurred in
    #[error("{operation} failed for conversation {conversation}: {source}")]
    Context {
        /// Name of the failing operation
        operation: &'static str,
        /// Public conversation identifier
        conversation: String,
        /// The wrapped error
        #[source]
        source: Box<SessionCoreError>,
    },
}

/// Malformed lengths, encodings and missing fields
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A key or secret had the wrong number of bytes
    #[error("Invalid key length for {what}: expected {expected}, got {actual}")]
    InvalidKeyLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A hex-encoded field could not be decoded
    #[error("Invalid hex in {field}: {reason}")]
    InvalidHex { field: String, reason: String },

    /// A base64-encoded field could not be decoded
    #[error("Invalid base64 in {field}: {reason}")]
    InvalidBase64 { field: String, reason: String },

    /// A required message field is absent
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    /// A required handshake metadata entry is absent
    #[error("Missing metadata field: {field}")]
    MissingMetadataField { field: &'static str },

    /// The message kind tag is not one this core understands
    #[error("Unknown message kind: {kind}")]
    UnknownMessageKind { kind: String },

    /// The message violates the closed per-kind layout
    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    /// Private and public halves of a key pair do not belong together
    #[error("Key pair halves do not match")]
    MismatchedKeyPair,

    /// JSON or binary (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Signature and AEAD failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationError {
    /// The AEAD tag did not verify; no plaintext is released
    #[error("Decryption failed")]
    DecryptionFailed,

    /// The envelope signature did not verify
    #[error("Invalid message signature")]
    InvalidSignature,

    /// The prekey bundle is malformed or its signed prekey signature is invalid
    #[error("Invalid prekey bundle: {reason}")]
    InvalidBundle { reason: String },

    /// No message key for this counter (already consumed or never skipped).
    ///
    /// The counter travels unauthenticated, so this is reported as an
    /// authentication failure rather than a state problem.
    #[error("Message key not found for ratchet key {ratchet_key} counter {counter}")]
    KeyNotFound { ratchet_key: String, counter: u32 },

    /// A message claims a counter too far ahead of its chain
    #[error("Too many skipped messages: {requested} (limit {limit})")]
    TooManySkippedMessages { requested: u32, limit: u32 },
}

/// Protocol state violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolStateError {
    /// An operation received a message of the wrong kind
    #[error("Wrong message kind: expected {expected}, got {actual}")]
    WrongMessageKind {
        expected: crate::protocol::MessageKind,
        actual: crate::protocol::MessageKind,
    },

    /// A prekey named by handshake metadata is not available
    #[error("Missing prekey: {reason}")]
    MissingPreKey { reason: String },

    /// A chain counter would overflow
    #[error("Chain counter exhausted")]
    ChainExhausted,

    /// The prekey store has no signed prekey to publish
    #[error("No signed prekey available")]
    NoSignedPreKey,
}

/// Errors surfaced, unmodified, from collaborators
#[derive(Error, Debug, Clone)]
pub enum CollaboratorError {
    /// The key manager is locked or otherwise unavailable
    #[error("Key manager unavailable")]
    KeyManagerUnavailable,

    /// The ratchet key store failed
    #[error("Key store {operation} failed: {source}")]
    KeyStore {
        operation: &'static str,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Missing required configuration
    #[error("Missing configuration: {field}")]
    MissingField { field: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation { path: String },
}

impl SessionCoreError {
    /// Wrap this error with the operation and conversation it belongs to
    pub fn with_context(self, operation: &'static str, conversation: impl Into<String>) -> Self {
        Self::Context {
            operation,
            conversation: conversation.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through context wrappers
    pub fn root(&self) -> &SessionCoreError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::ProtocolState(_) => ErrorKind::ProtocolState,
            Self::Collaborator(_) => ErrorKind::Collaborator,
            Self::Config(_) => ErrorKind::Configuration,
            Self::Context { source, .. } => source.kind(),
        }
    }

    /// Returns true if retrying after fixing the environment may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.root(),
            Self::Collaborator(CollaboratorError::KeyManagerUnavailable)
                | Self::Collaborator(CollaboratorError::Io(_))
        )
    }

    /// Returns true if this error indicates forged or tampered input
    pub fn is_security_violation(&self) -> bool {
        self.kind() == ErrorKind::Authentication
    }
}

impl From<std::io::Error> for SessionCoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Collaborator(CollaboratorError::Io(err.to_string()))
    }
}

impl From<serde_json::Error> for SessionCoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(ValidationError::Serialization(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SessionCoreError::Validation(ValidationError::InvalidKeyLength {
            what: "shared secret",
            expected: 32,
            actual: 31,
        });
        assert!(error.to_string().contains("expected 32, got 31"));
    }

    #[test]
    fn test_error_kind() {
        let error: SessionCoreError = AuthenticationError::DecryptionFailed.into();
        assert_eq!(error.kind(), ErrorKind::Authentication);
        assert!(error.is_security_violation());

        let error: SessionCoreError = ProtocolStateError::ChainExhausted.into();
        assert_eq!(error.kind(), ErrorKind::ProtocolState);
        assert!(!error.is_security_violation());

        let error: SessionCoreError = AuthenticationError::TooManySkippedMessages {
            requested: 5000,
            limit: 1000,
        }
        .into();
        assert!(error.is_security_violation());
    }

    #[test]
    fn test_context_is_transparent_for_classification() {
        let error: SessionCoreError = AuthenticationError::InvalidSignature.into();
        let wrapped = error.with_context("receive", "conv:0011223344556677");

        assert_eq!(wrapped.kind(), ErrorKind::Authentication);
        assert!(matches!(
            wrapped.root(),
            SessionCoreError::Authentication(AuthenticationError::InvalidSignature)
        ));
        assert!(wrapped.to_string().contains("receive failed"));
    }

    #[test]
    fn test_error_recovery() {
        let locked: SessionCoreError = CollaboratorError::KeyManagerUnavailable.into();
        assert!(locked.is_recoverable());

        let forged: SessionCoreError = AuthenticationError::InvalidSignature.into();
        assert!(!forged.is_recoverable());
    }
}
