//! Key provisioning and lifecycle.
//!
//! Key material lives behind the [`KeyProvider`] seam; persistence and
//! escrow of rotated keys are the host platform's concern. This module owns
//! what the subsystem itself must track: which logical key is `Active`,
//! which retired keys remain `DecryptOnly`, and when the rotation schedule
//! says the active key is due.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::time::SystemTime;
use tracing::warn;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::EncryptionError;
use crate::model::{KeyDescriptor, KeyState};

/// Root key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Short, log-safe identifier for key material: the first 8 bytes of its
/// SHA-256 digest, hex-encoded.
pub fn key_fingerprint(material: &[u8]) -> String {
    let digest = Sha256::digest(material);
    hex::encode(&digest[..8])
}

/// Generate 32 bytes of random root key material.
pub fn generate_key_material() -> Zeroizing<Vec<u8>> {
    let mut material = Zeroizing::new(vec![0u8; KEY_LEN]);
    OsRng.fill_bytes(&mut material);
    material
}

/// Source of root key material, keyed by logical key id and version.
///
/// Implementations are expected to be cheap to call but are still shielded
/// by the protector cache: a cache hit never re-enters the provider.
pub trait KeyProvider: Send + Sync {
    /// Return the 32-byte root material for a logical key.
    fn key_material(
        &self,
        key_id: &str,
        key_version: u32,
    ) -> Result<Zeroizing<Vec<u8>>, EncryptionError>;

    /// Mint a fresh logical key and return its descriptor. The provider
    /// retains the material so the key stays resolvable for decryption.
    fn mint_key(&self) -> Result<KeyDescriptor, EncryptionError>;
}

/// Process-local [`KeyProvider`] holding material in memory.
///
/// Suitable for tests and single-node deployments; production deployments
/// wrap a platform KMS behind the same trait.
#[derive(Default)]
pub struct InMemoryKeyProvider {
    keys: RwLock<HashMap<(String, u32), Zeroizing<Vec<u8>>>>,
}

impl InMemoryKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register fixed material for a known key id/version, e.g. to decrypt
    /// data produced elsewhere.
    pub fn seed_key(
        &self,
        key_id: impl Into<String>,
        key_version: u32,
        material: Vec<u8>,
    ) -> Result<KeyDescriptor, EncryptionError> {
        if material.len() != KEY_LEN {
            return Err(EncryptionError::InvalidKeyMaterial(format!(
                "expected {KEY_LEN} bytes, got {}",
                material.len()
            )));
        }
        let key_id = key_id.into();
        let fingerprint = key_fingerprint(&material);
        self.keys.write().insert((key_id.clone(), key_version), Zeroizing::new(material));
        Ok(KeyDescriptor {
            key_id,
            version: key_version,
            state: KeyState::Active,
            created_at: Utc::now(),
            fingerprint,
        })
    }
}

impl std::fmt::Debug for InMemoryKeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryKeyProvider").field("keys", &self.keys.read().len()).finish()
    }
}

impl KeyProvider for InMemoryKeyProvider {
    fn key_material(
        &self,
        key_id: &str,
        key_version: u32,
    ) -> Result<Zeroizing<Vec<u8>>, EncryptionError> {
        self.keys
            .read()
            .get(&(key_id.to_string(), key_version))
            .cloned()
            .ok_or_else(|| EncryptionError::KeyUnavailable {
                key_id: key_id.to_string(),
                key_version,
                message: "not present in provider".to_string(),
            })
    }

    fn mint_key(&self) -> Result<KeyDescriptor, EncryptionError> {
        let key_id = format!("key-{}", Uuid::new_v4());
        let material = generate_key_material();
        let fingerprint = key_fingerprint(&material);
        self.keys.write().insert((key_id.clone(), 1), material);
        Ok(KeyDescriptor {
            key_id,
            version: 1,
            state: KeyState::Active,
            created_at: Utc::now(),
            fingerprint,
        })
    }
}

/// The set of logical keys the service knows: exactly one `Active`, the
/// rest `DecryptOnly`.
#[derive(Debug, Clone)]
pub struct KeyRing {
    active: KeyDescriptor,
    retired: Vec<KeyDescriptor>,
}

impl KeyRing {
    pub fn new(mut active: KeyDescriptor) -> Self {
        active.state = KeyState::Active;
        Self { active, retired: Vec::new() }
    }

    pub fn active(&self) -> &KeyDescriptor {
        &self.active
    }

    /// Activate `new_active`, demoting the current active key to
    /// `DecryptOnly`. Returns the demoted descriptor.
    pub fn rotate(&mut self, mut new_active: KeyDescriptor) -> KeyDescriptor {
        new_active.state = KeyState::Active;
        let mut previous = std::mem::replace(&mut self.active, new_active);
        previous.state = KeyState::DecryptOnly;
        self.retired.push(previous.clone());
        previous
    }

    /// Look up a descriptor by key id, preferring the active key.
    pub fn descriptor(&self, key_id: &str) -> Option<&KeyDescriptor> {
        if self.active.key_id == key_id {
            return Some(&self.active);
        }
        self.retired.iter().rev().find(|k| k.key_id == key_id)
    }

    /// All known descriptors, active first.
    pub fn descriptors(&self) -> Vec<KeyDescriptor> {
        let mut all = Vec::with_capacity(1 + self.retired.len());
        all.push(self.active.clone());
        all.extend(self.retired.iter().cloned());
        all
    }
}

/// Tracks when the active key was last rotated and whether the configured
/// interval has elapsed.
#[derive(Debug, Clone)]
pub struct KeyRotationSchedule {
    /// Number of days between rotations.
    pub rotation_days: u32,
    last_rotation: Option<SystemTime>,
}

impl KeyRotationSchedule {
    pub fn new(rotation_days: u32) -> Self {
        Self { rotation_days, last_rotation: None }
    }

    /// Whether the rotation interval has elapsed since the last recorded
    /// rotation. Never rotates on first use; a clock that went backwards is
    /// treated as zero elapsed time and logged.
    pub fn should_rotate(&self) -> bool {
        match self.last_rotation {
            Some(last) => {
                let elapsed = SystemTime::now().duration_since(last).unwrap_or_else(|e| {
                    warn!(
                        error = %e,
                        "system clock went backwards during rotation check, treating as zero elapsed"
                    );
                    std::time::Duration::ZERO
                });
                elapsed.as_secs() > u64::from(self.rotation_days) * 24 * 3600
            }
            None => false,
        }
    }

    /// Record that a rotation happened now.
    pub fn record_rotation(&mut self) {
        self.last_rotation = Some(SystemTime::now());
    }

    /// Days since the last rotation, or `None` if never rotated.
    pub fn days_since_last_rotation(&self) -> Option<u64> {
        self.last_rotation.map(|last| {
            SystemTime::now()
                .duration_since(last)
                .unwrap_or(std::time::Duration::ZERO)
                .as_secs()
                / (24 * 3600)
        })
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for key provisioning and lifecycle.
    use std::time::Duration;

    use super::*;

    #[test]
    fn mint_key_produces_resolvable_active_key() {
        let provider = InMemoryKeyProvider::new();
        let descriptor = provider.mint_key().unwrap();

        assert_eq!(descriptor.state, KeyState::Active);
        assert_eq!(descriptor.version, 1);
        assert_eq!(descriptor.fingerprint.len(), 16);

        let material = provider.key_material(&descriptor.key_id, 1).unwrap();
        assert_eq!(material.len(), KEY_LEN);
        assert_eq!(key_fingerprint(&material), descriptor.fingerprint);
    }

    #[test]
    fn unknown_key_is_a_retryable_unavailability() {
        let provider = InMemoryKeyProvider::new();
        let err = provider.key_material("ghost", 1).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn seed_key_rejects_wrong_length_material() {
        let provider = InMemoryKeyProvider::new();
        assert!(provider.seed_key("k1", 1, vec![0u8; 16]).is_err());
        assert!(provider.seed_key("k1", 1, vec![0u8; 32]).is_ok());
    }

    /// Rotating twice leaves exactly one `Active` key and all previously
    /// active keys `DecryptOnly`.
    #[test]
    fn double_rotation_leaves_single_active_key() {
        let provider = InMemoryKeyProvider::new();
        let mut ring = KeyRing::new(provider.mint_key().unwrap());

        ring.rotate(provider.mint_key().unwrap());
        ring.rotate(provider.mint_key().unwrap());

        let descriptors = ring.descriptors();
        assert_eq!(descriptors.len(), 3);
        let active: Vec<_> =
            descriptors.iter().filter(|k| k.state == KeyState::Active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].key_id, ring.active().key_id);
        assert!(descriptors
            .iter()
            .filter(|k| k.key_id != ring.active().key_id)
            .all(|k| k.state == KeyState::DecryptOnly));
    }

    #[test]
    fn ring_resolves_retired_descriptors() {
        let provider = InMemoryKeyProvider::new();
        let first = provider.mint_key().unwrap();
        let mut ring = KeyRing::new(first.clone());
        ring.rotate(provider.mint_key().unwrap());

        let retired = ring.descriptor(&first.key_id).unwrap();
        assert_eq!(retired.state, KeyState::DecryptOnly);
        assert!(ring.descriptor("ghost").is_none());
    }

    #[test]
    fn schedule_does_not_rotate_on_first_use() {
        let schedule = KeyRotationSchedule::new(90);
        assert!(!schedule.should_rotate());
        assert!(schedule.days_since_last_rotation().is_none());
    }

    #[test]
    fn schedule_rotates_after_interval_elapses() {
        let mut schedule = KeyRotationSchedule::new(0);
        schedule.last_rotation =
            Some(SystemTime::now().checked_sub(Duration::from_secs(24 * 3600 + 1)).unwrap());
        assert!(schedule.should_rotate());
    }

    #[test]
    fn schedule_tolerates_clock_going_backwards() {
        let mut schedule = KeyRotationSchedule::new(90);
        schedule.last_rotation =
            Some(SystemTime::now().checked_add(Duration::from_secs(3600)).unwrap());
        assert!(!schedule.should_rotate());
        assert_eq!(schedule.days_since_last_rotation(), Some(0));
    }

    #[test]
    fn fingerprints_differ_across_material() {
        let a = generate_key_material();
        let b = generate_key_material();
        assert_ne!(key_fingerprint(&a), key_fingerprint(&b));
    }
}
