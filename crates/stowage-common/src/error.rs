//! Common error types for the Stowage crates.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`StowageError`].
pub type StowageResult<T> = Result<T, StowageError>;

/// Errors shared by every store backend and the distribution engine.
#[derive(Error, Diagnostic, Debug)]
pub enum StowageError {
    /// The requested object is absent from the store.
    #[error("{object} not found in {store} store")]
    #[diagnostic(code(stowage::not_found))]
    NotFound {
        /// Store that was asked.
        store: String,
        /// Description of the missing object (flavor and digest, or a reference).
        object: String,
    },

    /// An object already stored under a digest has a different size.
    #[error("Digest {digest} clashed (size: {existing} vs {incoming})")]
    #[diagnostic(
        code(stowage::digest_clash),
        help("Two payloads with one digest cannot exist; the stored object is likely corrupt")
    )]
    DigestClash {
        /// The shared digest.
        digest: String,
        /// Size of the stored object.
        existing: u64,
        /// Size of the incoming object.
        incoming: u64,
    },

    /// Content did not hash to the digest it was supplied with.
    #[error("Digest mismatch: expected {expected}, content hashes to {actual}")]
    #[diagnostic(code(stowage::digest_mismatch))]
    DigestMismatch {
        /// Digest the caller promised.
        expected: String,
        /// Digest computed from the bytes.
        actual: String,
    },

    /// A stream delivered a different number of bytes than its descriptor states.
    #[error("Size mismatch for {digest}: expected {expected} bytes, received {actual}")]
    #[diagnostic(code(stowage::size_mismatch))]
    SizeMismatch {
        /// Digest of the object being transferred.
        digest: String,
        /// Size from the descriptor.
        expected: u64,
        /// Bytes actually received.
        actual: u64,
    },

    /// Manifest kind outside the recognised OCI and Docker types.
    #[error("Unsupported artifact type: {media_type:?}")]
    #[diagnostic(
        code(stowage::unsupported_media_type),
        help("Only OCI image manifests/indexes and Docker v2 manifests/lists are handled")
    )]
    UnsupportedMediaType {
        /// The rejected media type.
        media_type: String,
    },

    /// The backend does not offer this capability.
    #[error("{store} store does not support {operation}")]
    #[diagnostic(code(stowage::unsupported))]
    Unsupported {
        /// Store kind.
        store: String,
        /// Operation that was attempted.
        operation: String,
    },

    /// The registry answered with something the distribution protocol does not allow.
    #[error(
        "Registry protocol error{}: {message}",
        .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
    )]
    #[diagnostic(code(stowage::registry))]
    RegistryProtocol {
        /// HTTP status, when a response was received.
        status: Option<u16>,
        /// Description of the failure.
        message: String,
    },

    /// Transport-level failure talking to a registry.
    #[error("Network error: {message}")]
    #[diagnostic(code(stowage::network))]
    Network {
        /// The error message.
        message: String,
    },

    /// A registry acknowledged a manifest under a different digest than we sent.
    #[error("Registry stored manifest as {actual}, expected {expected}")]
    #[diagnostic(
        code(stowage::registry_digest_mismatch),
        help("The registry rewrote the manifest bytes; refusing to continue")
    )]
    RegistryDigestMismatch {
        /// Digest of the bytes we uploaded.
        expected: String,
        /// Digest reported by the registry.
        actual: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(stowage::config))]
    Configuration {
        /// The error message.
        message: String,
    },

    /// Malformed digest string.
    #[error("Invalid digest: {value:?}")]
    #[diagnostic(
        code(stowage::invalid_digest),
        help("Digests look like sha256:<64 lowercase hex characters>")
    )]
    InvalidDigest {
        /// The rejected value.
        value: String,
    },

    /// Malformed image reference.
    #[error("Invalid reference {reference:?}: {reason}")]
    #[diagnostic(code(stowage::invalid_reference))]
    InvalidReference {
        /// The rejected reference.
        reference: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Credential lookup failed.
    #[error("Credential error: {message}")]
    #[diagnostic(code(stowage::credential))]
    Credential {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(stowage::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(stowage::serialization))]
    Serialization(String),
}

impl StowageError {
    /// Build a [`StowageError::NotFound`].
    pub fn not_found(store: impl Into<String>, object: impl Into<String>) -> Self {
        Self::NotFound {
            store: store.into(),
            object: object.into(),
        }
    }

    /// Build a [`StowageError::Unsupported`].
    pub fn unsupported(store: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            store: store.into(),
            operation: operation.into(),
        }
    }

    /// Whether this error only signals absence.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the backend lacks the requested capability.
    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

impl From<serde_json::Error> for StowageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
