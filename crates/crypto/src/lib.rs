//! Message-payload encryption and key-rotation/migration for RelayMesh.
//!
//! Payloads flowing through the dispatch pipeline are encrypted under
//! tenant- and purpose-scoped AES-256-GCM keys. This crate owns:
//!
//! - the encrypted-record data model and the purpose-string derivation the
//!   protector cache is keyed by ([`model`]),
//! - key provisioning, the active/decrypt-only key ring, and the rotation
//!   schedule ([`keys`]),
//! - the payload protectors and their cache ([`protector`]),
//! - [`MessageEncryptionService`], the end-to-end encrypt/decrypt surface
//!   with framing, compression, and rotation ([`service`]),
//! - the migration-policy evaluator ([`policy`]) and
//!   [`EncryptionMigrationService`], the single-item and batch re-encryption
//!   engine ([`migration`]).
//!
//! The pipeline middleware that wires these into message flow lives in the
//! `relaymesh-pipeline` crate.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod config;
pub mod error;
pub mod keys;
pub mod migration;
pub mod model;
pub mod policy;
pub mod protector;
pub mod service;

pub use config::{EncryptionOptions, LazyReEncryptionOptions, ReEncryptedHook};
pub use error::{
    CryptoError, DecryptionError, DecryptionResult, EncryptionError, EncryptionResult,
    MigrationError,
};
pub use keys::{
    generate_key_material, key_fingerprint, InMemoryKeyProvider, KeyProvider, KeyRing,
    KeyRotationSchedule,
};
pub use migration::{
    BatchItemFailure, BatchMigrationResult, BatchOptions, EncryptionMigrationService,
    MigrationEstimate, MigrationItem, MigrationProgress, MigrationResult, MigrationRunState,
    MigrationState, MigrationStatistics, ProgressCallback,
};
pub use model::{
    EncryptedData, EncryptionAlgorithm, EncryptionContext, KeyDescriptor, KeyState,
};
pub use policy::{requires_migration, MigrationPolicy};
pub use protector::{PayloadProtector, ProtectedPayload, ProtectorCache, ProtectorCacheStats};
pub use service::{KeyRotation, MessageEncryptionService};
