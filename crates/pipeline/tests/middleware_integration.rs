//! End-to-end tests for the middleware stages working together: encrypt on
//! the way out, lazily migrate stale ciphertext, decrypt on the way in.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use relaymesh_crypto::{
    EncryptionContext, EncryptionMigrationService, EncryptionOptions, InMemoryKeyProvider,
    LazyReEncryptionOptions, MessageEncryptionService, MigrationPolicy,
};
use relaymesh_pipeline::{
    property_keys, DispatchMessage, DispatchMiddleware, LazyReEncryptionMiddleware,
    MessageContext, MessageDirection, MessageEncryptionMiddleware, MessageResult, RawMessage,
};

fn encryption_service(options: EncryptionOptions) -> Arc<MessageEncryptionService> {
    Arc::new(
        MessageEncryptionService::new(options, Arc::new(InMemoryKeyProvider::new())).unwrap(),
    )
}

/// A payload encrypted by the outgoing stage decrypts cleanly through the
/// incoming stage of the same service.
#[test]
fn outgoing_then_incoming_round_trip() {
    let service = encryption_service(EncryptionOptions::default());
    let middleware = MessageEncryptionMiddleware::new(Arc::clone(&service));

    let mut message = RawMessage::sensitive("PaymentCaptured", b"card data".to_vec());
    let mut ctx = MessageContext::new();
    ctx.set_tenant_id("tenant-a");

    let result = middleware.invoke(
        &mut message,
        &mut ctx,
        Box::new(|_, _| MessageResult::success()),
    );
    assert!(result.succeeded);
    assert_ne!(message.payload(), b"card data");

    ctx.set_direction(MessageDirection::Incoming);
    let result = middleware.invoke(
        &mut message,
        &mut ctx,
        Box::new(|_, _| MessageResult::success()),
    );
    assert!(result.succeeded);
    assert_eq!(message.payload(), b"card data");
}

/// After a rotation, a record from the old key flowing through the lazy
/// stage is re-encrypted under the new key, the migration facts are
/// recorded, and the hook observes both records.
#[test]
fn lazy_stage_migrates_stale_record_in_traffic() {
    let service = encryption_service(EncryptionOptions::default());
    let migration = Arc::new(EncryptionMigrationService::new(Arc::clone(&service)));

    let ctx_tenant = EncryptionContext::for_tenant("tenant-a");
    let record = service.encrypt_record(b"ledger entry", &ctx_tenant).unwrap();
    let old_key = record.key_id.clone();
    service.rotate_keys().unwrap();

    let hook_calls = Arc::new(AtomicUsize::new(0));
    let hook_counter = Arc::clone(&hook_calls);
    let options = LazyReEncryptionOptions {
        policy: MigrationPolicy::deprecating_key(old_key.clone()),
        on_reencrypted: Some(Arc::new(move |original, migrated| {
            assert_ne!(original.key_id, migrated.key_id);
            hook_counter.fetch_add(1, Ordering::SeqCst);
        })),
        ..Default::default()
    };
    let middleware = LazyReEncryptionMiddleware::new(Arc::clone(&migration), options);

    let mut message = RawMessage::new("LedgerSynced", Vec::new());
    let mut ctx = MessageContext::new();
    ctx.set_encrypted_payload(record);

    let result = middleware.invoke(
        &mut message,
        &mut ctx,
        Box::new(|_, _| MessageResult::success()),
    );
    assert!(result.succeeded);
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);

    let migrated = ctx.encrypted_payload().unwrap().clone();
    assert_ne!(migrated.key_id, old_key);
    assert_eq!(migrated.tenant_id.as_deref(), Some("tenant-a"));
    assert_eq!(ctx.property(property_keys::WAS_LAZILY_REENCRYPTED), Some("true"));
    assert_eq!(ctx.property(property_keys::ORIGINAL_KEY_ID), Some(old_key.as_str()));
    assert_eq!(
        ctx.property(property_keys::MIGRATED_KEY_ID),
        Some(migrated.key_id.as_str())
    );

    // the migrated record still opens under the new key
    assert_eq!(
        service.decrypt_record(&migrated, &ctx_tenant).unwrap(),
        b"ledger entry"
    );

    // a second pass finds nothing left to migrate
    let mut called = false;
    middleware.invoke(
        &mut message,
        &mut ctx,
        Box::new(|_, _| {
            called = true;
            MessageResult::success()
        }),
    );
    assert!(called);
    assert_eq!(ctx.encrypted_payload().unwrap(), &migrated);
}

/// With `continue_on_failure` (the default), a failed lazy migration logs
/// and forwards the original record instead of failing the stage.
#[test]
fn lazy_stage_forwards_original_on_failure_by_default() {
    let service = encryption_service(EncryptionOptions::default());
    let migration = Arc::new(EncryptionMigrationService::new(Arc::clone(&service)));

    let mut record = service
        .encrypt_record(b"payload", &EncryptionContext::default())
        .unwrap();
    record.key_id = "ghost-key".into();

    let options = LazyReEncryptionOptions {
        policy: MigrationPolicy::deprecating_key("ghost-key"),
        ..Default::default()
    };
    let middleware = LazyReEncryptionMiddleware::new(migration, options);

    let mut message = RawMessage::new("OrderPlaced", Vec::new());
    let mut ctx = MessageContext::new();
    ctx.set_encrypted_payload(record.clone());
    let mut called = false;

    let result = middleware.invoke(
        &mut message,
        &mut ctx,
        Box::new(|_, _| {
            called = true;
            MessageResult::success()
        }),
    );
    assert!(result.succeeded);
    assert!(called);
    assert_eq!(ctx.encrypted_payload().unwrap(), &record);
    assert!(ctx.property(property_keys::WAS_LAZILY_REENCRYPTED).is_none());
}

/// A disabled lazy stage never inspects the record.
#[test]
fn disabled_lazy_stage_is_inert() {
    let service = encryption_service(EncryptionOptions::default());
    let migration = Arc::new(EncryptionMigrationService::new(Arc::clone(&service)));
    let record = service
        .encrypt_record(b"payload", &EncryptionContext::default())
        .unwrap();

    let options = LazyReEncryptionOptions {
        enabled: false,
        policy: MigrationPolicy::deprecating_key(record.key_id.clone()),
        ..Default::default()
    };
    let middleware = LazyReEncryptionMiddleware::new(migration, options);

    let mut message = RawMessage::new("OrderPlaced", Vec::new());
    let mut ctx = MessageContext::new();
    ctx.set_encrypted_payload(record.clone());

    middleware.invoke(&mut message, &mut ctx, Box::new(|_, _| MessageResult::success()));
    assert_eq!(ctx.encrypted_payload().unwrap(), &record);
}
