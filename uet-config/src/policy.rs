//! Which record fields hold secrets, and how the cipher is applied to them.
//!
//! The policy works on generic YAML mappings rather than the typed model so
//! that partially encrypted or hand-edited documents can be processed before
//! they are validated.

use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::crypto::{is_envelope, looks_like_envelope, CryptoError, EnvelopeCipher};

/// Field names whose values are encrypted at rest.
pub const SENSITIVE_FIELDS: [&str; 3] = ["client_secret", "admin_api_secret", "signing_key"];

/// Top-level lists whose records the policy walks.
const RECORD_LISTS: [&str; 2] = ["tenants", "applications"];

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to encrypt {field}: {source}")]
    Encrypt {
        field: &'static str,
        #[source]
        source: CryptoError,
    },
    #[error("failed to decrypt {field}: {source}")]
    Decrypt {
        field: &'static str,
        #[source]
        source: CryptoError,
    },
}

impl PolicyError {
    pub fn field(&self) -> &'static str {
        match self {
            PolicyError::Encrypt { field, .. } | PolicyError::Decrypt { field, .. } => *field,
        }
    }
}

pub fn is_sensitive(field: &str) -> bool {
    SENSITIVE_FIELDS.contains(&field)
}

/// Encrypts every sensitive field that is non-empty and not already a
/// well-formed envelope. Returns how many fields were changed.
///
/// Stops at the first failing field; fields changed before it stay changed.
pub fn encrypt_fields(record: &mut Mapping, cipher: &EnvelopeCipher) -> Result<usize, PolicyError> {
    let mut changed = 0;
    for field in SENSITIVE_FIELDS {
        let Some(Value::String(value)) = record.get_mut(field) else {
            continue;
        };
        if value.is_empty() || is_envelope(value) {
            continue;
        }
        *value = cipher
            .encrypt(value)
            .map_err(|source| PolicyError::Encrypt { field, source })?;
        changed += 1;
    }
    Ok(changed)
}

/// Decrypts every sensitive field that carries an envelope tag, leaving
/// plaintext values alone. A tagged value that fails to parse or open is an
/// error. Returns how many fields were changed.
pub fn decrypt_fields(record: &mut Mapping, cipher: &EnvelopeCipher) -> Result<usize, PolicyError> {
    let mut changed = 0;
    for field in SENSITIVE_FIELDS {
        let Some(Value::String(value)) = record.get_mut(field) else {
            continue;
        };
        if !looks_like_envelope(value) {
            continue;
        }
        *value = cipher
            .decrypt(value)
            .map_err(|source| PolicyError::Decrypt { field, source })?;
        changed += 1;
    }
    Ok(changed)
}

/// Applies [`encrypt_fields`] to every tenant and application record.
pub fn encrypt_document(document: &mut Value, cipher: &EnvelopeCipher) -> Result<usize, PolicyError> {
    let mut changed = 0;
    for record in records_mut(document) {
        changed += encrypt_fields(record, cipher)?;
    }
    Ok(changed)
}

/// Applies [`decrypt_fields`] to every tenant and application record.
pub fn decrypt_document(document: &mut Value, cipher: &EnvelopeCipher) -> Result<usize, PolicyError> {
    let mut changed = 0;
    for record in records_mut(document) {
        changed += decrypt_fields(record, cipher)?;
    }
    Ok(changed)
}

fn records_mut(document: &mut Value) -> Vec<&mut Mapping> {
    let mut records = Vec::new();
    let Value::Mapping(root) = document else {
        return records;
    };
    for (key, value) in root.iter_mut() {
        let is_record_list = key.as_str().is_some_and(|name| RECORD_LISTS.contains(&name));
        if let (true, Value::Sequence(items)) = (is_record_list, value) {
            records.extend(items.iter_mut().filter_map(Value::as_mapping_mut));
        }
    }
    records
}
