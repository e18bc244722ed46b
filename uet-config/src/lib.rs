//! Persistent tenant and application configuration for the UET demo server.
//! Secrets are kept in plaintext in memory and, when enabled, sealed into
//! `ENC[...]` envelopes in the YAML file on disk.

pub mod crypto;
pub mod logging;
pub mod model;
pub mod policy;
pub mod settings;
pub mod store;

pub use crypto::{CryptoError, EnvelopeCipher, KeySource};
pub use model::{Application, ApplicationType, Document, Tenant, ValidationError};
pub use settings::Settings;
pub use store::{ConfigStore, ErrorKind, StoreError};
