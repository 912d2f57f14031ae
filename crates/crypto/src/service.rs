//! Message payload encryption service.
//!
//! [`MessageEncryptionService`] is the single entry point the pipeline and
//! the migration engine use for payload crypto. It owns the key ring, the
//! rotation schedule, and the protector cache; callers only ever hand it
//! plaintext bytes and an [`EncryptionContext`].
//!
//! Two payload shapes are supported:
//!
//! - **Framed bytes** (`encrypt_message`/`decrypt_message`): a self-
//!   describing blob `header? || iv || ciphertext || auth_tag`, suitable for
//!   stuffing into an opaque payload slot. String variants wrap the bytes in
//!   base64.
//! - **Structured records** (`encrypt_record`/`decrypt_record`):
//!   [`EncryptedData`] carrying key id, version, algorithm, and tenant
//!   alongside the raw parts. Records are never compressed or framed; the
//!   migration engine works exclusively on this shape.

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::EncryptionOptions;
use crate::error::{DecryptionError, EncryptionError};
use crate::keys::{key_fingerprint, KeyProvider, KeyRing, KeyRotationSchedule};
use crate::model::{EncryptedData, EncryptionAlgorithm, EncryptionContext, KeyDescriptor};
use crate::protector::{PayloadProtector, ProtectorCache, ProtectorCacheStats, IV_LEN, TAG_LEN};

/// Framed-payload format version.
const FORMAT_VERSION: u8 = 1;
/// Header flags: payload was gzip-compressed before encryption.
const FLAG_COMPRESSED: u8 = 0b0000_0001;
/// `[version, flags, reserved]`.
const HEADER_LEN: usize = 3;

/// Outcome of [`MessageEncryptionService::rotate_keys`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRotation {
    /// The newly minted active key.
    pub new_key: KeyDescriptor,
    /// The previous active key, now decrypt-only.
    pub previous_key: KeyDescriptor,
}

/// Context with every field resolved against the service defaults and the
/// active key. Encrypt and decrypt both canonicalize through this so the
/// derived purpose strings line up.
struct ResolvedContext {
    key_id: String,
    key_version: u32,
    algorithm: EncryptionAlgorithm,
    tenant_id: Option<String>,
    purpose: Option<String>,
}

impl ResolvedContext {
    fn purpose_string(&self, base: &str) -> String {
        EncryptionContext {
            key_id: Some(self.key_id.clone()),
            key_version: Some(self.key_version),
            algorithm: Some(self.algorithm),
            tenant_id: self.tenant_id.clone(),
            purpose: self.purpose.clone(),
        }
        .purpose_string(base)
    }
}

pub struct MessageEncryptionService {
    options: EncryptionOptions,
    provider: Arc<dyn KeyProvider>,
    ring: RwLock<KeyRing>,
    schedule: RwLock<KeyRotationSchedule>,
    cache: ProtectorCache,
}

impl fmt::Debug for MessageEncryptionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEncryptionService")
            .field("options", &self.options)
            .field("active_key", &self.ring.read().active().key_id)
            .field("cache", &self.cache)
            .finish()
    }
}

impl MessageEncryptionService {
    /// Build the service: validate options and establish the active key.
    ///
    /// With `current_key_id` set, the provider must already hold material
    /// for that key at version 1; otherwise a fresh key is minted.
    pub fn new(
        options: EncryptionOptions,
        provider: Arc<dyn KeyProvider>,
    ) -> Result<Self, EncryptionError> {
        options.validate().map_err(EncryptionError::InvalidConfiguration)?;

        let active = match &options.current_key_id {
            Some(key_id) => {
                let material = provider.key_material(key_id, 1)?;
                KeyDescriptor {
                    key_id: key_id.clone(),
                    version: 1,
                    state: crate::model::KeyState::Active,
                    created_at: Utc::now(),
                    fingerprint: key_fingerprint(&material),
                }
            }
            None => provider.mint_key()?,
        };

        info!(
            key_id = %active.key_id,
            fingerprint = %active.fingerprint,
            "encryption service initialized"
        );

        let schedule = KeyRotationSchedule::new(options.key_rotation_interval_days);
        Ok(Self {
            options,
            provider,
            ring: RwLock::new(KeyRing::new(active)),
            schedule: RwLock::new(schedule),
            cache: ProtectorCache::new(),
        })
    }

    pub fn options(&self) -> &EncryptionOptions {
        &self.options
    }

    /// Descriptor of the current active key.
    pub fn active_key(&self) -> KeyDescriptor {
        self.ring.read().active().clone()
    }

    /// All known key descriptors, active first.
    pub fn key_descriptors(&self) -> Vec<KeyDescriptor> {
        self.ring.read().descriptors()
    }

    /// Snapshot of protector-cache usage.
    pub fn protector_cache_stats(&self) -> ProtectorCacheStats {
        self.cache.stats()
    }

    /// Whether the configured rotation interval has elapsed.
    pub fn rotation_due(&self) -> bool {
        self.schedule.read().should_rotate()
    }

    /// Encrypt a payload into the framed byte form.
    pub fn encrypt_message(
        &self,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> Result<Vec<u8>, EncryptionError> {
        if plaintext.is_empty() {
            return Err(EncryptionError::EmptyPayload);
        }
        let resolved = self.resolve(context)?;
        let protector = self.protector_for(&resolved)?;

        let compress = self.options.enable_compression_by_default;
        let prepared: Vec<u8>;
        let body = if compress {
            prepared = gzip_compress(plaintext)?;
            prepared.as_slice()
        } else {
            plaintext
        };

        let sealed = protector.protect(body)?;
        debug!(
            key_id = %resolved.key_id,
            key_version = resolved.key_version,
            compressed = compress,
            plaintext_len = plaintext.len(),
            "payload encrypted"
        );

        let tag = sealed.auth_tag.unwrap_or_default();
        let mut framed = Vec::with_capacity(
            if self.options.include_metadata_header { HEADER_LEN } else { 0 }
                + sealed.iv.len()
                + sealed.ciphertext.len()
                + tag.len(),
        );
        if self.options.include_metadata_header {
            let flags = if compress { FLAG_COMPRESSED } else { 0 };
            framed.extend_from_slice(&[FORMAT_VERSION, flags, 0]);
        }
        framed.extend_from_slice(&sealed.iv);
        framed.extend_from_slice(&sealed.ciphertext);
        framed.extend_from_slice(&tag);
        Ok(framed)
    }

    /// Decrypt a framed byte payload produced by [`encrypt_message`].
    ///
    /// With headers enabled the flags byte decides decompression; without
    /// headers the service options do.
    ///
    /// [`encrypt_message`]: Self::encrypt_message
    pub fn decrypt_message(
        &self,
        payload: &[u8],
        context: &EncryptionContext,
    ) -> Result<Vec<u8>, DecryptionError> {
        let (body, compressed) = if self.options.include_metadata_header {
            if payload.len() < HEADER_LEN {
                return Err(DecryptionError::MalformedPayload(
                    "payload shorter than metadata header".to_string(),
                ));
            }
            if payload[0] != FORMAT_VERSION {
                return Err(DecryptionError::UnsupportedFormatVersion(payload[0]));
            }
            (&payload[HEADER_LEN..], payload[1] & FLAG_COMPRESSED != 0)
        } else {
            (payload, self.options.enable_compression_by_default)
        };

        if body.len() < IV_LEN + TAG_LEN + 1 {
            return Err(DecryptionError::MalformedPayload(format!(
                "payload too short: {} bytes after header",
                body.len()
            )));
        }
        let iv = &body[..IV_LEN];
        let ciphertext = &body[IV_LEN..body.len() - TAG_LEN];
        let tag = &body[body.len() - TAG_LEN..];

        let resolved = self.resolve(context).map_err(encrypt_to_decrypt_error)?;
        let protector = self.protector_for(&resolved).map_err(encrypt_to_decrypt_error)?;

        let plaintext = protector.unprotect(iv, ciphertext, Some(tag))?;
        if compressed {
            gzip_decompress(&plaintext)
        } else {
            Ok(plaintext)
        }
    }

    /// Encrypt a UTF-8 string; the framed bytes are returned base64-encoded.
    pub fn encrypt_message_str(
        &self,
        plaintext: &str,
        context: &EncryptionContext,
    ) -> Result<String, EncryptionError> {
        let framed = self.encrypt_message(plaintext.as_bytes(), context)?;
        Ok(BASE64.encode(framed))
    }

    /// Decrypt a base64 payload produced by [`encrypt_message_str`].
    ///
    /// [`encrypt_message_str`]: Self::encrypt_message_str
    pub fn decrypt_message_str(
        &self,
        payload: &str,
        context: &EncryptionContext,
    ) -> Result<String, DecryptionError> {
        let framed = BASE64
            .decode(payload)
            .map_err(|e| DecryptionError::Encoding(e.to_string()))?;
        let plaintext = self.decrypt_message(&framed, context)?;
        String::from_utf8(plaintext)
            .map_err(|e| DecryptionError::Encoding(format!("payload is not UTF-8: {e}")))
    }

    /// Encrypt into a structured [`EncryptedData`] record.
    pub fn encrypt_record(
        &self,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> Result<EncryptedData, EncryptionError> {
        if plaintext.is_empty() {
            return Err(EncryptionError::EmptyPayload);
        }
        let resolved = self.resolve(context)?;
        let protector = self.protector_for(&resolved)?;
        let sealed = protector.protect(plaintext)?;

        Ok(EncryptedData {
            ciphertext: sealed.ciphertext,
            iv: sealed.iv,
            auth_tag: sealed.auth_tag,
            key_id: resolved.key_id,
            key_version: resolved.key_version,
            algorithm: resolved.algorithm,
            tenant_id: resolved.tenant_id,
            encrypted_at: Utc::now(),
        })
    }

    /// Decrypt a structured record.
    ///
    /// The record's own key id, version, algorithm, and tenant take
    /// precedence over the context; the context contributes the purpose (and
    /// tenant only when the record carries none). Records stay decryptable
    /// after rotation as long as the provider retains the retired material.
    pub fn decrypt_record(
        &self,
        data: &EncryptedData,
        context: &EncryptionContext,
    ) -> Result<Vec<u8>, DecryptionError> {
        data.validate().map_err(DecryptionError::MalformedPayload)?;
        context.validate().map_err(DecryptionError::InvalidContext)?;

        let resolved = ResolvedContext {
            key_id: data.key_id.clone(),
            key_version: data.key_version,
            algorithm: data.algorithm,
            tenant_id: data.tenant_id.clone().or_else(|| context.tenant_id.clone()),
            purpose: context.purpose.clone(),
        };
        let protector = self.protector_for(&resolved).map_err(encrypt_to_decrypt_error)?;
        protector.unprotect(&data.iv, &data.ciphertext, data.auth_tag.as_deref())
    }

    /// Mint a new active key and demote the previous one to decrypt-only.
    ///
    /// The ring swap and the protector-cache clear happen under one write
    /// lock, so no caller can observe the new ring with stale protectors.
    pub fn rotate_keys(&self) -> Result<KeyRotation, EncryptionError> {
        let new_key = self.provider.mint_key()?;
        let previous_key = {
            let mut ring = self.ring.write();
            let previous = ring.rotate(new_key.clone());
            self.cache.clear();
            previous
        };
        self.schedule.write().record_rotation();

        info!(
            new_key_id = %new_key.key_id,
            new_fingerprint = %new_key.fingerprint,
            previous_key_id = %previous_key.key_id,
            "encryption key rotated"
        );
        Ok(KeyRotation { new_key, previous_key })
    }

    /// Health probe: a canary encrypt/decrypt round trip with the default
    /// context. Never panics; failures are logged and reported as `false`.
    pub fn validate_configuration(&self) -> bool {
        let canary = b"encryption-configuration-canary";
        let context = EncryptionContext::default();
        match self
            .encrypt_message(canary, &context)
            .map_err(|e| e.to_string())
            .and_then(|sealed| {
                self.decrypt_message(&sealed, &context).map_err(|e| e.to_string())
            }) {
            Ok(plaintext) => plaintext == canary,
            Err(error) => {
                warn!(%error, "encryption configuration validation failed");
                false
            }
        }
    }

    /// Fill in context defaults from the options and the active key.
    fn resolve(&self, context: &EncryptionContext) -> Result<ResolvedContext, EncryptionError> {
        context.validate().map_err(EncryptionError::InvalidContext)?;

        let ring = self.ring.read();
        let key_id = context.key_id.clone().unwrap_or_else(|| ring.active().key_id.clone());
        let key_version = context
            .key_version
            .or_else(|| ring.descriptor(&key_id).map(|d| d.version))
            .unwrap_or(1);
        drop(ring);

        Ok(ResolvedContext {
            key_id,
            key_version,
            algorithm: context.algorithm.unwrap_or(self.options.default_algorithm),
            tenant_id: context.tenant_id.clone(),
            purpose: context.purpose.clone(),
        })
    }

    /// Fetch or build the protector for a resolved context. Cache hits never
    /// touch the key provider.
    fn protector_for(
        &self,
        resolved: &ResolvedContext,
    ) -> Result<Arc<PayloadProtector>, EncryptionError> {
        let purpose = resolved.purpose_string(&self.options.base_purpose);
        self.cache.get_or_create(&purpose, || {
            let material = self.provider.key_material(&resolved.key_id, resolved.key_version)?;
            PayloadProtector::new(resolved.algorithm, &material, &purpose)
        })
    }
}

/// Map protector-construction failures onto the decrypt-path taxonomy.
fn encrypt_to_decrypt_error(err: EncryptionError) -> DecryptionError {
    match err {
        EncryptionError::UnsupportedAlgorithm(a) => DecryptionError::UnsupportedAlgorithm(a),
        EncryptionError::InvalidContext(m) => DecryptionError::InvalidContext(m),
        EncryptionError::KeyUnavailable { key_id, key_version, message } => {
            DecryptionError::KeyUnavailable { key_id, key_version, message }
        }
        other => DecryptionError::Protector(other.to_string()),
    }
}

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|()| encoder.finish())
        .map_err(|e| EncryptionError::Compression(e.to_string()))
}

fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>, DecryptionError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| DecryptionError::Decompression(e.to_string()))?;
    Ok(out)
}
