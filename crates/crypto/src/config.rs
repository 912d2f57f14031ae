//! Configuration surface for the encryption subsystem.
//!
//! These options are supplied by the host application's configuration layer;
//! this crate only consumes them. Both structs follow the usual pattern:
//! serde derive, a `Default` that matches production behavior, and a
//! `validate()` gate run at service construction.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::{EncryptedData, EncryptionAlgorithm};
use crate::policy::MigrationPolicy;

/// Options for [`MessageEncryptionService`](crate::service::MessageEncryptionService)
/// and the encryption middleware stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionOptions {
    /// Master switch; when off the middleware passes messages through.
    pub enabled: bool,

    /// Logical key to encrypt with. `None` lets the key provider mint one at
    /// service construction.
    pub current_key_id: Option<String>,

    /// Prepend the 3-byte metadata header `[version, flags, reserved]` to
    /// every encrypted payload.
    pub include_metadata_header: bool,

    /// Algorithm for new encryptions when the context does not specify one.
    pub default_algorithm: EncryptionAlgorithm,

    /// Gzip-compress payloads before encryption (recorded in the header
    /// flags byte).
    pub enable_compression_by_default: bool,

    /// Days between scheduled key rotations.
    pub key_rotation_interval_days: u32,

    /// Encrypt every non-excluded message, not just sensitive-marked ones.
    pub encrypt_by_default: bool,

    /// Message runtime types the encryption middleware never touches.
    pub excluded_message_types: HashSet<String>,

    /// Base segment of every derived purpose string.
    pub base_purpose: String,
}

impl Default for EncryptionOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            current_key_id: None,
            include_metadata_header: true,
            default_algorithm: EncryptionAlgorithm::Aes256Gcm,
            enable_compression_by_default: false,
            key_rotation_interval_days: 90,
            encrypt_by_default: false,
            excluded_message_types: HashSet::new(),
            base_purpose: "RelayMesh.Messaging".to_string(),
        }
    }
}

impl EncryptionOptions {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.key_rotation_interval_days == 0 {
            return Err("key_rotation_interval_days must be greater than 0".to_string());
        }
        if self.base_purpose.is_empty() {
            return Err("base_purpose must not be empty".to_string());
        }
        if self.base_purpose.contains(':') {
            return Err("base_purpose must not contain ':'".to_string());
        }
        Ok(())
    }
}

/// Hook invoked after a successful lazy re-encryption with the original and
/// migrated records.
pub type ReEncryptedHook = Arc<dyn Fn(&EncryptedData, &EncryptedData) + Send + Sync>;

/// Options for the lazy re-encryption middleware stage.
#[derive(Clone)]
pub struct LazyReEncryptionOptions {
    /// When off the stage passes messages through untouched.
    pub enabled: bool,

    /// On migration failure, log and forward the original record instead of
    /// failing the stage.
    pub continue_on_failure: bool,

    /// Algorithm to re-encrypt under; `None` keeps the service default.
    pub target_algorithm: Option<EncryptionAlgorithm>,

    /// Key to re-encrypt under; `None` uses the active key.
    pub target_key_id: Option<String>,

    /// Decides which records discovered in traffic need migration.
    pub policy: MigrationPolicy,

    /// Optional observer for completed re-encryptions.
    pub on_reencrypted: Option<ReEncryptedHook>,
}

impl Default for LazyReEncryptionOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            continue_on_failure: true,
            target_algorithm: None,
            target_key_id: None,
            policy: MigrationPolicy::default(),
            on_reencrypted: None,
        }
    }
}

impl fmt::Debug for LazyReEncryptionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyReEncryptionOptions")
            .field("enabled", &self.enabled)
            .field("continue_on_failure", &self.continue_on_failure)
            .field("target_algorithm", &self.target_algorithm)
            .field("target_key_id", &self.target_key_id)
            .field("policy", &self.policy)
            .field("on_reencrypted", &self.on_reencrypted.as_ref().map(|_| "[hook]"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for configuration defaults and validation.
    use super::*;

    #[test]
    fn default_options_are_valid() {
        let options = EncryptionOptions::default();
        assert!(options.validate().is_ok());
        assert!(options.enabled);
        assert!(options.include_metadata_header);
        assert_eq!(options.default_algorithm, EncryptionAlgorithm::Aes256Gcm);
        assert_eq!(options.key_rotation_interval_days, 90);
        assert!(!options.encrypt_by_default);
    }

    #[test]
    fn validation_rejects_zero_rotation_interval() {
        let options = EncryptionOptions { key_rotation_interval_days: 0, ..Default::default() };
        assert!(options.validate().is_err());
    }

    #[test]
    fn validation_rejects_separator_in_base_purpose() {
        let options = EncryptionOptions { base_purpose: "a:b".into(), ..Default::default() };
        assert!(options.validate().is_err());

        let empty = EncryptionOptions { base_purpose: String::new(), ..Default::default() };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn options_deserialize_with_partial_fields() {
        let options: EncryptionOptions =
            serde_json::from_str(r#"{"enabled": false, "encrypt_by_default": true}"#).unwrap();
        assert!(!options.enabled);
        assert!(options.encrypt_by_default);
        assert_eq!(options.key_rotation_interval_days, 90);
    }

    #[test]
    fn lazy_options_debug_redacts_hook() {
        let options = LazyReEncryptionOptions {
            on_reencrypted: Some(Arc::new(|_, _| {})),
            ..Default::default()
        };
        let rendered = format!("{options:?}");
        assert!(rendered.contains("[hook]"));
        assert!(options.continue_on_failure);
    }
}
