//! Purpose-scoped payload protectors and their cache.
//!
//! A [`PayloadProtector`] binds the cipher to one purpose string: the
//! working key is derived from the root key material *and* the purpose, so
//! ciphertext produced for one tenant/purpose scope can never be opened
//! under another even when both share a logical key. The
//! [`ProtectorCache`] keys protectors by purpose string; hits never
//! re-enter the key provider.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{DecryptionError, EncryptionError};
use crate::keys::KEY_LEN;
use crate::model::EncryptionAlgorithm;

/// AES-GCM nonce length (96 bits).
pub const IV_LEN: usize = 12;
/// AES-GCM authentication tag length.
pub const TAG_LEN: usize = 16;

/// Output of [`PayloadProtector::protect`]: the parts of an encrypted
/// payload before framing or record assembly.
#[derive(Debug, Clone)]
pub struct ProtectedPayload {
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub auth_tag: Option<Vec<u8>>,
}

/// Symmetric protector bound to one purpose/key scope.
pub struct PayloadProtector {
    purpose: String,
    algorithm: EncryptionAlgorithm,
    cipher: Aes256Gcm,
}

impl fmt::Debug for PayloadProtector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadProtector")
            .field("purpose", &self.purpose)
            .field("algorithm", &self.algorithm)
            .field("cipher", &"[REDACTED]")
            .finish()
    }
}

impl PayloadProtector {
    /// Build a protector for `purpose` from 32-byte root material.
    ///
    /// Only AES-256-GCM is operable; `Aes256CbcHmac` exists for legacy
    /// record recognition and is rejected here.
    pub fn new(
        algorithm: EncryptionAlgorithm,
        root_material: &[u8],
        purpose: &str,
    ) -> Result<Self, EncryptionError> {
        if algorithm != EncryptionAlgorithm::Aes256Gcm {
            return Err(EncryptionError::UnsupportedAlgorithm(algorithm.to_string()));
        }
        if root_material.len() != KEY_LEN {
            return Err(EncryptionError::InvalidKeyMaterial(format!(
                "expected {KEY_LEN} bytes, got {}",
                root_material.len()
            )));
        }

        let derived = derive_purpose_key(root_material, purpose);
        let cipher = Aes256Gcm::new_from_slice(derived.as_ref())
            .map_err(|e| EncryptionError::Cipher(format!("failed to create cipher: {e}")))?;

        Ok(Self { purpose: purpose.to_string(), algorithm, cipher })
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    pub fn algorithm(&self) -> EncryptionAlgorithm {
        self.algorithm
    }

    /// Encrypt `plaintext` under this scope with a fresh random nonce.
    pub fn protect(&self, plaintext: &[u8]) -> Result<ProtectedPayload, EncryptionError> {
        let mut nonce_bytes = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let mut sealed = self
            .cipher
            .encrypt(&Nonce::from(nonce_bytes), plaintext)
            .map_err(|e| EncryptionError::Cipher(format!("encryption failed: {e}")))?;

        // aes-gcm appends the tag; carry it separately in the record form.
        let tag = sealed.split_off(sealed.len() - TAG_LEN);
        Ok(ProtectedPayload { iv: nonce_bytes.to_vec(), ciphertext: sealed, auth_tag: Some(tag) })
    }

    /// Decrypt and authenticate one payload. Any tampering with the
    /// ciphertext, tag, or IV surfaces as an integrity failure.
    pub fn unprotect(
        &self,
        iv: &[u8],
        ciphertext: &[u8],
        auth_tag: Option<&[u8]>,
    ) -> Result<Vec<u8>, DecryptionError> {
        let nonce_bytes: [u8; IV_LEN] = iv.try_into().map_err(|_| {
            DecryptionError::MalformedPayload(format!(
                "iv must be {IV_LEN} bytes, got {}",
                iv.len()
            ))
        })?;
        let tag = auth_tag.ok_or_else(|| {
            DecryptionError::MalformedPayload("missing authentication tag".to_string())
        })?;
        if tag.len() != TAG_LEN {
            return Err(DecryptionError::MalformedPayload(format!(
                "auth tag must be {TAG_LEN} bytes, got {}",
                tag.len()
            )));
        }

        let mut sealed = Vec::with_capacity(ciphertext.len() + tag.len());
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        self.cipher
            .decrypt(&Nonce::from(nonce_bytes), sealed.as_ref())
            .map_err(|_| DecryptionError::IntegrityCheckFailed)
    }
}

/// Derive the purpose-scoped working key: SHA-256 over the root material,
/// a domain separator, and the purpose string.
fn derive_purpose_key(root_material: &[u8], purpose: &str) -> Zeroizing<[u8; KEY_LEN]> {
    let mut hasher = Sha256::new();
    hasher.update(root_material);
    hasher.update([0u8]);
    hasher.update(purpose.as_bytes());
    Zeroizing::new(hasher.finalize().into())
}

/// Snapshot of protector-cache usage for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectorCacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Thread-safe protector cache keyed by purpose string.
///
/// Unbounded growth is avoided by clearing on key rotation; the purpose
/// space is otherwise bounded by the tenant/purpose combinations in actual
/// traffic.
#[derive(Default)]
pub struct ProtectorCache {
    map: RwLock<HashMap<String, Arc<PayloadProtector>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ProtectorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the protector for `purpose`, building it with `init` on a
    /// miss. `init` runs at most once per miss; a concurrent insert wins
    /// and the duplicate is dropped.
    pub fn get_or_create(
        &self,
        purpose: &str,
        init: impl FnOnce() -> Result<PayloadProtector, EncryptionError>,
    ) -> Result<Arc<PayloadProtector>, EncryptionError> {
        if let Some(found) = self.map.read().get(purpose) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(found));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let built = Arc::new(init()?);
        let mut map = self.map.write();
        let entry = map.entry(purpose.to_string()).or_insert(built);
        Ok(Arc::clone(entry))
    }

    /// Drop every cached protector. Called on key rotation so subsequent
    /// calls re-resolve keys through the provider.
    pub fn clear(&self) {
        self.map.write().clear();
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn stats(&self) -> ProtectorCacheStats {
        ProtectorCacheStats {
            size: self.len(),
            hits: self.hits.load(Ordering::Acquire),
            misses: self.misses.load(Ordering::Acquire),
        }
    }
}

impl fmt::Debug for ProtectorCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("ProtectorCache")
            .field("size", &stats.size)
            .field("hits", &stats.hits)
            .field("misses", &stats.misses)
            .finish()
    }
}
