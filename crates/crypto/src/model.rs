//! Value types shared across the encryption and migration services.
//!
//! [`EncryptedData`] is the structured form of an encrypted payload as it
//! travels through the dispatch pipeline; [`EncryptionContext`] is the
//! caller-supplied scope (tenant, purpose, key) for a single encrypt or
//! decrypt call. Both are plain serde containers with no behavior beyond
//! validation and purpose-string derivation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of payload encryption algorithms.
///
/// `Aes256CbcHmac` is retained so legacy records deserialize and migration
/// policy can target them, but the protector only operates AES-256-GCM;
/// requesting a CBC protector fails with an unsupported-algorithm error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionAlgorithm {
    #[serde(rename = "AES-256-GCM")]
    Aes256Gcm,
    #[serde(rename = "AES-256-CBC-HMAC")]
    Aes256CbcHmac,
}

impl EncryptionAlgorithm {
    /// Wire name used in serialized records and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aes256Gcm => "AES-256-GCM",
            Self::Aes256CbcHmac => "AES-256-CBC-HMAC",
        }
    }
}

impl fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AES-256-GCM" => Ok(Self::Aes256Gcm),
            "AES-256-CBC-HMAC" => Ok(Self::Aes256CbcHmac),
            other => Err(format!("unknown encryption algorithm: {other}")),
        }
    }
}

/// An encrypted payload record with its key scope and framing metadata.
///
/// Immutable once produced; migration replaces the whole record rather than
/// mutating fields in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    pub ciphertext: Vec<u8>,
    /// Cipher IV (96-bit nonce for AES-256-GCM).
    pub iv: Vec<u8>,
    /// Authentication tag, present for AEAD algorithms.
    pub auth_tag: Option<Vec<u8>>,
    pub key_id: String,
    pub key_version: u32,
    pub algorithm: EncryptionAlgorithm,
    pub tenant_id: Option<String>,
    pub encrypted_at: DateTime<Utc>,
}

impl EncryptedData {
    /// Check the record invariants: ciphertext and IV are never empty.
    pub fn validate(&self) -> Result<(), String> {
        if self.ciphertext.is_empty() {
            return Err("ciphertext must not be empty".to_string());
        }
        if self.iv.is_empty() {
            return Err("iv must not be empty".to_string());
        }
        Ok(())
    }
}

/// Caller-supplied scope for one encrypt or decrypt call.
///
/// Every field is optional; absence means "use the service default". Two
/// contexts with identical present fields always derive byte-identical
/// purpose strings, which the protector cache depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionContext {
    pub key_id: Option<String>,
    pub key_version: Option<u32>,
    pub algorithm: Option<EncryptionAlgorithm>,
    pub tenant_id: Option<String>,
    pub purpose: Option<String>,
}

impl EncryptionContext {
    /// Context scoped to a tenant, everything else defaulted.
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self { tenant_id: Some(tenant_id.into()), ..Self::default() }
    }

    /// Derive the purpose string for this context.
    ///
    /// Present fields are concatenated in fixed order (base purpose,
    /// `Tenant:<id>`, `Purpose:<p>`, `Key:<id>`, `Version:<n>`), joined by
    /// `:`. The result is both the protector-derivation input and the
    /// protector cache key.
    pub fn purpose_string(&self, base: &str) -> String {
        let mut parts: Vec<String> = vec![base.to_string()];
        if let Some(tenant) = &self.tenant_id {
            parts.push(format!("Tenant:{tenant}"));
        }
        if let Some(purpose) = &self.purpose {
            parts.push(format!("Purpose:{purpose}"));
        }
        if let Some(key_id) = &self.key_id {
            parts.push(format!("Key:{key_id}"));
        }
        if let Some(version) = self.key_version {
            parts.push(format!("Version:{version}"));
        }
        parts.join(":")
    }

    /// Reject tenant/purpose values that would make the purpose-string
    /// encoding ambiguous.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(tenant) = &self.tenant_id {
            if tenant.contains(':') {
                return Err(format!("tenant id must not contain ':': {tenant}"));
            }
        }
        if let Some(purpose) = &self.purpose {
            if purpose.contains(':') {
                return Err(format!("purpose must not contain ':': {purpose}"));
            }
        }
        Ok(())
    }
}

/// Lifecycle state of a logical key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyState {
    /// Used for new encryptions. At most one key is active at a time.
    Active,
    /// Retained only to decrypt legacy ciphertext.
    DecryptOnly,
}

/// Public descriptor of a logical key. Never carries key material; the
/// fingerprint is a short SHA-256 prefix safe for logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDescriptor {
    pub key_id: String,
    pub version: u32,
    pub state: KeyState,
    pub created_at: DateTime<Utc>,
    pub fingerprint: String,
}

#[cfg(test)]
mod tests {
    //! Unit tests for the data model.
    use super::*;

    fn sample_record() -> EncryptedData {
        EncryptedData {
            ciphertext: vec![1, 2, 3],
            iv: vec![0; 12],
            auth_tag: Some(vec![0; 16]),
            key_id: "k1".into(),
            key_version: 1,
            algorithm: EncryptionAlgorithm::Aes256Gcm,
            tenant_id: None,
            encrypted_at: Utc::now(),
        }
    }

    /// Validates the purpose-string field ordering required by the cache:
    /// Tenant, Purpose, Key, Version after the base segment.
    #[test]
    fn purpose_string_orders_fields() {
        let ctx = EncryptionContext {
            key_id: Some("k1".into()),
            key_version: Some(5),
            algorithm: None,
            tenant_id: Some("t1".into()),
            purpose: Some("audit-log".into()),
        };

        assert_eq!(
            ctx.purpose_string("base"),
            "base:Tenant:t1:Purpose:audit-log:Key:k1:Version:5"
        );
    }

    /// Contexts with identical present fields must derive byte-identical
    /// purpose strings.
    #[test]
    fn purpose_string_is_deterministic() {
        let a = EncryptionContext::for_tenant("t1");
        let b = EncryptionContext::for_tenant("t1");
        assert_eq!(a.purpose_string("base"), b.purpose_string("base"));

        let defaulted = EncryptionContext::default();
        assert_eq!(defaulted.purpose_string("base"), "base");
    }

    #[test]
    fn absent_fields_are_omitted_not_defaulted() {
        let ctx = EncryptionContext { purpose: Some("audit-log".into()), ..Default::default() };
        assert_eq!(ctx.purpose_string("base"), "base:Purpose:audit-log");
    }

    #[test]
    fn context_rejects_separator_in_tenant_and_purpose() {
        assert!(EncryptionContext::for_tenant("t:1").validate().is_err());
        let ctx = EncryptionContext { purpose: Some("a:b".into()), ..Default::default() };
        assert!(ctx.validate().is_err());
        assert!(EncryptionContext::for_tenant("t1").validate().is_ok());
    }

    #[test]
    fn record_invariants_reject_empty_ciphertext_and_iv() {
        assert!(sample_record().validate().is_ok());

        let mut no_ct = sample_record();
        no_ct.ciphertext.clear();
        assert!(no_ct.validate().is_err());

        let mut no_iv = sample_record();
        no_iv.iv.clear();
        assert!(no_iv.validate().is_err());
    }

    #[test]
    fn algorithm_round_trips_through_wire_name() {
        for alg in [EncryptionAlgorithm::Aes256Gcm, EncryptionAlgorithm::Aes256CbcHmac] {
            assert_eq!(alg.as_str().parse::<EncryptionAlgorithm>(), Ok(alg));
        }
        assert!("ROT13".parse::<EncryptionAlgorithm>().is_err());
    }

    #[test]
    fn record_serializes_algorithm_by_wire_name() {
        let json = serde_json::to_string(&sample_record()).unwrap();
        assert!(json.contains("\"AES-256-GCM\""));
        let back: EncryptedData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample_record_with_time(back.encrypted_at));
    }

    fn sample_record_with_time(at: DateTime<Utc>) -> EncryptedData {
        EncryptedData { encrypted_at: at, ..sample_record() }
    }
}
