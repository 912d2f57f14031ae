//! Dispatch-pipeline middleware for RelayMesh payload encryption.
//!
//! The pipeline-composition engine lives outside this crate; this crate
//! owns the middleware boundary contracts ([`context`]) and the two stages
//! that integrate `relaymesh-crypto` into message flow:
//!
//! - [`MessageEncryptionMiddleware`] encrypts outgoing and decrypts incoming
//!   payloads in the serialization phase.
//! - [`LazyReEncryptionMiddleware`] opportunistically re-encrypts stale
//!   ciphertext discovered during normal traffic in the pre-processing
//!   phase.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod context;
pub mod encryption_middleware;
pub mod lazy_reencrypt;

pub use context::{
    item_keys, property_keys, ContextItem, DispatchMessage, DispatchMiddleware, MessageContext,
    MessageDirection, MessageResult, Next, RawMessage,
};
pub use encryption_middleware::MessageEncryptionMiddleware;
pub use lazy_reencrypt::LazyReEncryptionMiddleware;
