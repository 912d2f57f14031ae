//! Migration-policy evaluation.
//!
//! A [`MigrationPolicy`] is pure data: it can be deserialized from
//! configuration, shared across threads, and evaluated any number of times
//! without side effects. [`requires_migration`] is the single decision
//! function both the batch engine and the lazy re-encryption middleware use.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{EncryptedData, EncryptionAlgorithm};

/// Conditions under which previously-encrypted data must be re-encrypted.
///
/// Triggers are OR-ed; `tenant_ids` is not a trigger but an exclusion gate
/// that scopes the whole policy to a set of tenants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationPolicy {
    /// Records encrypted under any of these keys must migrate.
    pub deprecated_key_ids: HashSet<String>,

    /// Records encrypted under any of these algorithms must migrate.
    pub deprecated_algorithms: HashSet<EncryptionAlgorithm>,

    /// When set, records not already on this algorithm must migrate.
    pub target_algorithm: Option<EncryptionAlgorithm>,

    /// When set, records older than this must migrate.
    pub max_key_age: Option<Duration>,

    /// When set, records encrypted before this instant must migrate.
    pub encrypted_before: Option<DateTime<Utc>>,

    /// When set, only records belonging to these tenants are in scope;
    /// everything else is excluded regardless of the triggers above.
    /// `None` means all tenants are in scope.
    pub tenant_ids: Option<HashSet<String>>,
}

impl MigrationPolicy {
    /// Policy that deprecates a single key.
    pub fn deprecating_key(key_id: impl Into<String>) -> Self {
        Self { deprecated_key_ids: HashSet::from([key_id.into()]), ..Self::default() }
    }

    /// Whether the policy has any trigger configured at all.
    pub fn has_triggers(&self) -> bool {
        !self.deprecated_key_ids.is_empty()
            || !self.deprecated_algorithms.is_empty()
            || self.target_algorithm.is_some()
            || self.max_key_age.is_some()
            || self.encrypted_before.is_some()
    }
}

/// Decide whether a record needs migration under the given policy.
///
/// Pure and side-effect-free. Returns `true` iff at least one trigger holds
/// AND the record's tenant is in scope. Tenant scoping wins over every
/// trigger: a record outside the tenant scope (including records with no
/// tenant when a scope is set) never migrates.
pub fn requires_migration(data: &EncryptedData, policy: &MigrationPolicy) -> bool {
    if let Some(tenants) = &policy.tenant_ids {
        match &data.tenant_id {
            Some(tenant) if tenants.contains(tenant) => {}
            _ => return false,
        }
    }

    if policy.deprecated_key_ids.contains(&data.key_id) {
        return true;
    }
    if policy.deprecated_algorithms.contains(&data.algorithm) {
        return true;
    }
    if let Some(target) = policy.target_algorithm {
        if data.algorithm != target {
            return true;
        }
    }
    if let Some(max_age) = policy.max_key_age {
        let age = Utc::now()
            .signed_duration_since(data.encrypted_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age > max_age {
            return true;
        }
    }
    if let Some(cutoff) = policy.encrypted_before {
        if data.encrypted_at < cutoff {
            return true;
        }
    }

    false
}
