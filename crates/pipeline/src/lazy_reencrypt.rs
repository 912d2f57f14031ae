//! Lazy re-encryption middleware stage.
//!
//! Runs in the pre-processing phase: when a message arrives carrying an
//! encrypted payload record that the configured [`MigrationPolicy`] flags as
//! stale, the record is re-encrypted in place as a side effect of normal
//! traffic, so a key rotation drains old ciphertext without a dedicated
//! batch run.
//!
//! [`MigrationPolicy`]: relaymesh_crypto::MigrationPolicy

use std::sync::Arc;

use relaymesh_crypto::{
    EncryptionContext, EncryptionMigrationService, LazyReEncryptionOptions,
};
use tracing::{debug, info, warn};

use crate::context::{
    property_keys, DispatchMessage, DispatchMiddleware, MessageContext, MessageResult, Next,
};

pub struct LazyReEncryptionMiddleware {
    migration: Arc<EncryptionMigrationService>,
    options: LazyReEncryptionOptions,
}

impl LazyReEncryptionMiddleware {
    pub fn new(
        migration: Arc<EncryptionMigrationService>,
        options: LazyReEncryptionOptions,
    ) -> Self {
        Self { migration, options }
    }
}

impl DispatchMiddleware for LazyReEncryptionMiddleware {
    fn invoke(
        &self,
        message: &mut dyn DispatchMessage,
        context: &mut MessageContext,
        next: Next<'_>,
    ) -> MessageResult {
        if !self.options.enabled {
            return next(message, context);
        }
        let Some(record) = context.encrypted_payload().cloned() else {
            return next(message, context);
        };
        if !self.migration.requires_migration(&record, &self.options.policy) {
            return next(message, context);
        }

        // Source scope comes from the record itself; the target scope from
        // configuration, with tenant/purpose falling back to the context.
        let source_context = EncryptionContext {
            key_id: Some(record.key_id.clone()),
            key_version: Some(record.key_version),
            algorithm: Some(record.algorithm),
            tenant_id: record.tenant_id.clone(),
            purpose: context.purpose().map(str::to_string),
        };
        let target_context = EncryptionContext {
            key_id: self.options.target_key_id.clone(),
            algorithm: self.options.target_algorithm,
            tenant_id: record
                .tenant_id
                .clone()
                .or_else(|| context.tenant_id().map(str::to_string)),
            purpose: context.purpose().map(str::to_string),
            ..Default::default()
        };

        let result = self.migration.migrate(&record, &source_context, &target_context);
        if result.success {
            let migrated = match result.migrated {
                Some(migrated) => migrated,
                None => {
                    // A successful result always carries the record.
                    warn!(key_id = %record.key_id, "migration result missing record");
                    return next(message, context);
                }
            };
            info!(
                original_key = %record.key_id,
                migrated_key = %migrated.key_id,
                "payload lazily re-encrypted"
            );
            context.set_property(property_keys::WAS_LAZILY_REENCRYPTED, "true");
            context.set_property(property_keys::ORIGINAL_KEY_ID, record.key_id.clone());
            context.set_property(property_keys::MIGRATED_KEY_ID, migrated.key_id.clone());
            if let Some(hook) = &self.options.on_reencrypted {
                hook(&record, &migrated);
            }
            context.set_encrypted_payload(migrated);
            return next(message, context);
        }

        let error = result.error.unwrap_or_else(|| "migration failed".to_string());
        if self.options.continue_on_failure {
            warn!(
                key_id = %record.key_id,
                error = %error,
                "lazy re-encryption failed, forwarding original record"
            );
            return next(message, context);
        }
        debug!(key_id = %record.key_id, "aborting stage on re-encryption failure");
        MessageResult::failure(format!(
            "lazy re-encryption failed for key '{}': {error}",
            record.key_id
        ))
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for the lazy re-encryption skip and failure paths.
    use relaymesh_crypto::{
        EncryptionOptions, InMemoryKeyProvider, MessageEncryptionService, MigrationPolicy,
    };

    use super::*;
    use crate::context::RawMessage;

    fn migration_service() -> (Arc<MessageEncryptionService>, Arc<EncryptionMigrationService>) {
        let encryption = Arc::new(
            MessageEncryptionService::new(
                EncryptionOptions::default(),
                Arc::new(InMemoryKeyProvider::new()),
            )
            .unwrap(),
        );
        let migration = Arc::new(EncryptionMigrationService::new(Arc::clone(&encryption)));
        (encryption, migration)
    }

    fn passthrough_next(called: &mut bool) -> Next<'_> {
        Box::new(move |_, _| {
            *called = true;
            MessageResult::success()
        })
    }

    #[test]
    fn no_encrypted_payload_is_a_pass_through() {
        let (_, migration) = migration_service();
        let middleware =
            LazyReEncryptionMiddleware::new(migration, LazyReEncryptionOptions::default());
        let mut message = RawMessage::new("OrderPlaced", b"plain".to_vec());
        let mut ctx = MessageContext::new();
        let mut called = false;

        let result = middleware.invoke(&mut message, &mut ctx, passthrough_next(&mut called));
        assert!(result.succeeded);
        assert!(called);
        assert!(ctx.property(property_keys::WAS_LAZILY_REENCRYPTED).is_none());
    }

    #[test]
    fn fresh_record_is_left_alone() {
        let (encryption, migration) = migration_service();
        let record = encryption
            .encrypt_record(b"payload", &EncryptionContext::default())
            .unwrap();
        let options = LazyReEncryptionOptions {
            policy: MigrationPolicy::deprecating_key("some-other-key"),
            ..Default::default()
        };
        let middleware = LazyReEncryptionMiddleware::new(migration, options);

        let mut message = RawMessage::new("OrderPlaced", Vec::new());
        let mut ctx = MessageContext::new();
        ctx.set_encrypted_payload(record.clone());
        let mut called = false;

        middleware.invoke(&mut message, &mut ctx, passthrough_next(&mut called));
        assert!(called);
        assert_eq!(ctx.encrypted_payload().unwrap(), &record);
    }

    #[test]
    fn stage_aborts_when_continue_on_failure_is_off() {
        let (encryption, migration) = migration_service();
        let mut record = encryption
            .encrypt_record(b"payload", &EncryptionContext::default())
            .unwrap();
        // point the record at a key the provider cannot resolve
        record.key_id = "ghost-key".into();
        let options = LazyReEncryptionOptions {
            policy: MigrationPolicy::deprecating_key("ghost-key"),
            continue_on_failure: false,
            ..Default::default()
        };
        let middleware = LazyReEncryptionMiddleware::new(migration, options);

        let mut message = RawMessage::new("OrderPlaced", Vec::new());
        let mut ctx = MessageContext::new();
        ctx.set_encrypted_payload(record);
        let mut called = false;

        let result = middleware.invoke(&mut message, &mut ctx, passthrough_next(&mut called));
        assert!(!result.succeeded);
        assert!(!called);
        assert!(result.error.unwrap().contains("ghost-key"));
    }
}
