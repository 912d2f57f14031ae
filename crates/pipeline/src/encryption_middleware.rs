//! Payload-encryption middleware stage.
//!
//! Runs in the serialization phase of the dispatch pipeline: outgoing
//! payloads are encrypted before the rest of the chain sees them, incoming
//! payloads are decrypted before the handler runs. Crypto failures never
//! escape as errors; they become a failed [`MessageResult`] so the
//! pipeline's own retry and poison-message handling governs recovery.

use std::sync::Arc;

use relaymesh_crypto::{EncryptionContext, MessageEncryptionService};
use tracing::{debug, error};

use crate::context::{
    DispatchMessage, DispatchMiddleware, MessageContext, MessageDirection, MessageResult, Next,
};

pub struct MessageEncryptionMiddleware {
    service: Arc<MessageEncryptionService>,
}

impl MessageEncryptionMiddleware {
    pub fn new(service: Arc<MessageEncryptionService>) -> Self {
        Self { service }
    }

    fn skip(&self, message: &dyn DispatchMessage, context: &MessageContext) -> bool {
        let options = self.service.options();
        if !options.enabled {
            return true;
        }
        if options.excluded_message_types.contains(message.type_name()) {
            debug!(message_type = message.type_name(), "message type excluded from encryption");
            return true;
        }
        if context.encryption_disabled() {
            return true;
        }
        // Encrypt only when configured to by default or the message opts in.
        !(options.encrypt_by_default || message.is_sensitive())
    }

    fn crypto_context(&self, context: &MessageContext) -> EncryptionContext {
        EncryptionContext {
            key_id: self.service.options().current_key_id.clone(),
            tenant_id: context.tenant_id().map(str::to_string),
            purpose: context.purpose().map(str::to_string),
            ..Default::default()
        }
    }
}

impl DispatchMiddleware for MessageEncryptionMiddleware {
    fn invoke(
        &self,
        message: &mut dyn DispatchMessage,
        context: &mut MessageContext,
        next: Next<'_>,
    ) -> MessageResult {
        if self.skip(message, context) {
            return next(message, context);
        }

        let crypto_context = self.crypto_context(context);
        match context.direction() {
            MessageDirection::Outgoing => {
                match self.service.encrypt_message(message.payload(), &crypto_context) {
                    Ok(sealed) => {
                        message.set_payload(sealed);
                        next(message, context)
                    }
                    Err(err) => {
                        error!(
                            message_type = message.type_name(),
                            error = %err,
                            "payload encryption failed"
                        );
                        MessageResult::failure(format!("payload encryption failed: {err}"))
                    }
                }
            }
            MessageDirection::Incoming => {
                match self.service.decrypt_message(message.payload(), &crypto_context) {
                    Ok(plaintext) => {
                        message.set_payload(plaintext);
                        next(message, context)
                    }
                    Err(err) => {
                        error!(
                            message_type = message.type_name(),
                            error = %err,
                            "payload decryption failed"
                        );
                        MessageResult::failure(format!("payload decryption failed: {err}"))
                    }
                }
            }
        }
    }
}
