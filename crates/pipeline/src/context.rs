//! Middleware boundary contracts.
//!
//! The pipeline-composition engine that owns ordering, retries, and dispatch
//! lives outside this crate; these are the narrow shapes it hands each
//! middleware stage: a message, a mutable context, and a continuation.
//! Single-item payload crypto is synchronous CPU work, so the middleware
//! contract is synchronous too.

use std::collections::HashMap;

use relaymesh_crypto::EncryptedData;

/// Well-known keys in the context item bag.
pub mod item_keys {
    pub const ENCRYPTED_PAYLOAD: &str = "EncryptedPayload";
    pub const DISABLE_ENCRYPTION: &str = "DisableEncryption";
    pub const MESSAGE_DIRECTION: &str = "MessageDirection";
    pub const TENANT_ID: &str = "TenantId";
    pub const PURPOSE: &str = "Purpose";
}

/// Well-known keys in the post-hoc properties bag.
pub mod property_keys {
    pub const WAS_LAZILY_REENCRYPTED: &str = "WasLazilyReEncrypted";
    pub const ORIGINAL_KEY_ID: &str = "OriginalKeyID";
    pub const MIGRATED_KEY_ID: &str = "MigratedKeyID";
}

/// Which way the current message is travelling through the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageDirection {
    #[default]
    Outgoing,
    Incoming,
}

/// A message as seen by middleware: a runtime type name and a payload slot.
///
/// `is_sensitive` is an explicit capability, not reflection: message types
/// that want default encryption opt in by overriding it.
pub trait DispatchMessage {
    fn type_name(&self) -> &str;
    fn payload(&self) -> &[u8];
    fn set_payload(&mut self, payload: Vec<u8>);

    /// Marks the message as carrying sensitive data that should be
    /// encrypted even when `encrypt_by_default` is off.
    fn is_sensitive(&self) -> bool {
        false
    }
}

/// Minimal owned [`DispatchMessage`], used by hosts without a richer message
/// model and throughout the tests.
#[derive(Debug, Clone)]
pub struct RawMessage {
    type_name: String,
    payload: Vec<u8>,
    sensitive: bool,
}

impl RawMessage {
    pub fn new(type_name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self { type_name: type_name.into(), payload, sensitive: false }
    }

    pub fn sensitive(type_name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self { type_name: type_name.into(), payload, sensitive: true }
    }
}

impl DispatchMessage for RawMessage {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    fn is_sensitive(&self) -> bool {
        self.sensitive
    }
}

/// One typed value in the context item bag.
#[derive(Debug, Clone)]
pub enum ContextItem {
    Flag(bool),
    Text(String),
    Direction(MessageDirection),
    Encrypted(EncryptedData),
}

/// Per-message pipeline state: a typed item bag for in-flight values and a
/// string properties bag for post-hoc facts. Both are owned by the pipeline
/// runtime and shared down the middleware chain.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    items: HashMap<String, ContextItem>,
    properties: HashMap<String, String>,
}

impl MessageContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_item(&mut self, key: impl Into<String>, item: ContextItem) {
        self.items.insert(key.into(), item);
    }

    pub fn item(&self, key: &str) -> Option<&ContextItem> {
        self.items.get(key)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set_encrypted_payload(&mut self, data: EncryptedData) {
        self.set_item(item_keys::ENCRYPTED_PAYLOAD, ContextItem::Encrypted(data));
    }

    pub fn encrypted_payload(&self) -> Option<&EncryptedData> {
        match self.item(item_keys::ENCRYPTED_PAYLOAD) {
            Some(ContextItem::Encrypted(data)) => Some(data),
            _ => None,
        }
    }

    pub fn set_disable_encryption(&mut self, disabled: bool) {
        self.set_item(item_keys::DISABLE_ENCRYPTION, ContextItem::Flag(disabled));
    }

    pub fn encryption_disabled(&self) -> bool {
        matches!(self.item(item_keys::DISABLE_ENCRYPTION), Some(ContextItem::Flag(true)))
    }

    pub fn set_direction(&mut self, direction: MessageDirection) {
        self.set_item(item_keys::MESSAGE_DIRECTION, ContextItem::Direction(direction));
    }

    /// Current direction; outgoing when unset.
    pub fn direction(&self) -> MessageDirection {
        match self.item(item_keys::MESSAGE_DIRECTION) {
            Some(ContextItem::Direction(direction)) => *direction,
            _ => MessageDirection::default(),
        }
    }

    pub fn set_tenant_id(&mut self, tenant_id: impl Into<String>) {
        self.set_item(item_keys::TENANT_ID, ContextItem::Text(tenant_id.into()));
    }

    pub fn tenant_id(&self) -> Option<&str> {
        match self.item(item_keys::TENANT_ID) {
            Some(ContextItem::Text(tenant)) => Some(tenant.as_str()),
            _ => None,
        }
    }

    pub fn set_purpose(&mut self, purpose: impl Into<String>) {
        self.set_item(item_keys::PURPOSE, ContextItem::Text(purpose.into()));
    }

    pub fn purpose(&self) -> Option<&str> {
        match self.item(item_keys::PURPOSE) {
            Some(ContextItem::Text(purpose)) => Some(purpose.as_str()),
            _ => None,
        }
    }
}

/// Outcome of a middleware stage or of the whole remaining chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageResult {
    pub succeeded: bool,
    pub error: Option<String>,
}

impl MessageResult {
    pub fn success() -> Self {
        Self { succeeded: true, error: None }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self { succeeded: false, error: Some(error.into()) }
    }
}

/// Continuation invoking the rest of the middleware chain.
pub type Next<'a> = Box<dyn FnOnce(&mut dyn DispatchMessage, &mut MessageContext) -> MessageResult + 'a>;

/// One stage in the dispatch pipeline.
pub trait DispatchMiddleware: Send + Sync {
    fn invoke(
        &self,
        message: &mut dyn DispatchMessage,
        context: &mut MessageContext,
        next: Next<'_>,
    ) -> MessageResult;
}

#[cfg(test)]
mod tests {
    //! Unit tests for the context item and property bags.
    use super::*;

    #[test]
    fn direction_defaults_to_outgoing() {
        let mut ctx = MessageContext::new();
        assert_eq!(ctx.direction(), MessageDirection::Outgoing);

        ctx.set_direction(MessageDirection::Incoming);
        assert_eq!(ctx.direction(), MessageDirection::Incoming);
    }

    #[test]
    fn typed_accessors_ignore_mismatched_items() {
        let mut ctx = MessageContext::new();
        ctx.set_item(item_keys::TENANT_ID, ContextItem::Flag(true));
        assert!(ctx.tenant_id().is_none());

        ctx.set_tenant_id("tenant-a");
        assert_eq!(ctx.tenant_id(), Some("tenant-a"));
    }

    #[test]
    fn properties_are_separate_from_items() {
        let mut ctx = MessageContext::new();
        ctx.set_property(property_keys::ORIGINAL_KEY_ID, "k1");
        assert_eq!(ctx.property(property_keys::ORIGINAL_KEY_ID), Some("k1"));
        assert!(ctx.item(property_keys::ORIGINAL_KEY_ID).is_none());
    }

    #[test]
    fn raw_message_sensitivity_is_explicit() {
        let plain = RawMessage::new("OrderPlaced", b"body".to_vec());
        let marked = RawMessage::sensitive("PaymentCaptured", b"body".to_vec());
        assert!(!plain.is_sensitive());
        assert!(marked.is_sensitive());
    }
}
