//! Field-level encryption for configuration secrets. The envelope format,
//! the cipher that produces it and the key material it is keyed with each
//! live in their own submodule so the at-rest format can be audited alone.

pub mod cipher;
pub mod envelope;
pub mod keys;

use std::path::PathBuf;

use thiserror::Error;

pub use cipher::EnvelopeCipher;
pub use envelope::{is_envelope, looks_like_envelope, Algorithm, Envelope};
pub use keys::KeySource;

/// Length in bytes of every derived cipher key.
pub const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length; expected {KEY_LEN} bytes")]
    InvalidKeyLength,
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("unsupported envelope algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("base64 decoding failed: {0}")]
    Base64DecodeFailed(String),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("decrypted value is not valid utf-8")]
    InvalidUtf8,
    #[error("key derivation failed: {0}")]
    DerivationFailed(String),
    #[error("key file {path} unusable: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
