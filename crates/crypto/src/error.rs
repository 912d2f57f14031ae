//! Error taxonomy for the encryption and migration subsystem.
//!
//! Encrypt-path and decrypt-path failures are distinct types so callers can
//! apply different retry and alerting policy to each. Batch migration has its
//! own error type carrying the failing item id and migration id, raised only
//! in fail-fast mode; single-item migration reports crypto failures in its
//! result instead of returning them.

use std::time::Duration;

use thiserror::Error;

/// Result alias for encrypt-path operations.
pub type EncryptionResult<T> = Result<T, EncryptionError>;

/// Result alias for decrypt-path operations.
pub type DecryptionResult<T> = Result<T, DecryptionError>;

/// Failure on the encrypt path (protector construction or `protect`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncryptionError {
    /// Caller passed an empty payload. This is a contract violation, not a
    /// runtime condition, and is never retryable.
    #[error("payload must not be empty")]
    EmptyPayload,

    /// The requested algorithm has no operable protector implementation.
    #[error("unsupported encryption algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Context fields would produce an ambiguous purpose string.
    #[error("invalid encryption context: {0}")]
    InvalidContext(String),

    /// Service options failed validation at construction.
    #[error("invalid encryption options: {0}")]
    InvalidConfiguration(String),

    /// The key provider could not supply material for the requested key.
    #[error("key material unavailable for '{key_id}' v{key_version}: {message}")]
    KeyUnavailable { key_id: String, key_version: u32, message: String },

    /// Key material was present but unusable (wrong length, bad encoding).
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// The underlying cipher rejected the operation.
    #[error("cipher failure: {0}")]
    Cipher(String),

    /// Payload compression failed before encryption.
    #[error("compression failed: {0}")]
    Compression(String),
}

impl EncryptionError {
    /// Whether retrying the same call can reasonably succeed.
    ///
    /// Provider outages are transient; everything else indicates a caller
    /// bug or a configuration problem.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::KeyUnavailable { .. })
    }
}

/// Failure on the decrypt path, including ciphertext-integrity failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptionError {
    /// The encoded payload does not match the expected wire layout.
    #[error("malformed encrypted payload: {0}")]
    MalformedPayload(String),

    /// The metadata header declared a format version we do not speak.
    #[error("unsupported payload format version: {0}")]
    UnsupportedFormatVersion(u8),

    /// The authenticated cipher rejected the ciphertext. Covers tampering,
    /// truncation, and decryption under the wrong key or purpose.
    #[error("ciphertext integrity check failed")]
    IntegrityCheckFailed,

    /// The record's algorithm has no operable protector implementation.
    #[error("unsupported encryption algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Context fields would produce an ambiguous purpose string.
    #[error("invalid encryption context: {0}")]
    InvalidContext(String),

    /// The key provider could not supply material for the record's key.
    #[error("key material unavailable for '{key_id}' v{key_version}: {message}")]
    KeyUnavailable { key_id: String, key_version: u32, message: String },

    /// Protector construction failed for a reason other than the above.
    #[error("protector failure: {0}")]
    Protector(String),

    /// The string-typed API received bytes that are not valid base64.
    #[error("base64 decode failed: {0}")]
    Encoding(String),

    /// Decompression of the recovered plaintext failed.
    #[error("decompression failed: {0}")]
    Decompression(String),
}

impl DecryptionError {
    /// Whether retrying the same call can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::KeyUnavailable { .. })
    }
}

/// Umbrella for APIs that can fail on either crypto path.
///
/// Kept transparent so matching on the inner type stays natural:
///
/// ```rust,ignore
/// match err {
///     CryptoError::Encryption(e) => alert_on_encrypt(e),
///     CryptoError::Decryption(e) => alert_on_decrypt(e),
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Decryption(#[from] DecryptionError),
}

impl CryptoError {
    /// Whether retrying the same call can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Encryption(e) => e.is_retryable(),
            Self::Decryption(e) => e.is_retryable(),
        }
    }
}

/// Batch-migration failure. Raised only when `continue_on_error` is off or
/// the batch options are unusable; recorded item failures stay inside the
/// batch result otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationError {
    /// Fail-fast abort: the named item failed and the batch stopped.
    #[error("migration {migration_id} aborted at item '{item_id}': {source}")]
    ItemFailed {
        migration_id: String,
        item_id: String,
        #[source]
        source: CryptoError,
    },

    /// Fail-fast abort: the named item exceeded its per-item timeout.
    #[error("migration {migration_id} aborted at item '{item_id}': timed out after {timeout:?}")]
    ItemTimedOut { migration_id: String, item_id: String, timeout: Duration },

    /// The batch options failed validation.
    #[error("invalid migration options: {0}")]
    InvalidOptions(String),
}

impl MigrationError {
    /// The id of the migration run this error belongs to, when known.
    pub fn migration_id(&self) -> Option<&str> {
        match self {
            Self::ItemFailed { migration_id, .. } | Self::ItemTimedOut { migration_id, .. } => {
                Some(migration_id)
            }
            Self::InvalidOptions(_) => None,
        }
    }

    /// The id of the failing item, when the error identifies one.
    pub fn item_id(&self) -> Option<&str> {
        match self {
            Self::ItemFailed { item_id, .. } | Self::ItemTimedOut { item_id, .. } => Some(item_id),
            Self::InvalidOptions(_) => None,
        }
    }
}
