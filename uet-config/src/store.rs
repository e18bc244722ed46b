//! The configuration store: one in-memory [`Document`] behind a
//! reader-writer lock, written through to a YAML file on every mutation.
//!
//! Secrets are plaintext in memory. When the document has encryption enabled
//! they are decrypted on load and re-encrypted on every save, so the backing
//! file only ever holds envelopes for sensitive fields.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_yaml::Value;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::crypto::{CryptoError, EnvelopeCipher, KeySource};
use crate::model::{Application, Document, Tenant, ValidationError};
use crate::policy::{self, PolicyError};

const ENCRYPTION_FLAG: &str = "encryption_enabled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Tenant,
    Application,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Tenant => "tenant",
            EntityKind::Application => "application",
        })
    }
}

/// Coarse classification of [`StoreError`], for callers that only need to
/// decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Parse,
    Validation,
    NotFound,
    Crypto,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("config file unreadable at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config file unwritable at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config parse failed: {0}")]
    Parse(#[source] serde_yaml::Error),
    #[error("config serialization failed: {0}")]
    Serialize(#[source] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),
    #[error("{kind} with id '{id}' already exists")]
    Conflict { kind: EntityKind, id: String },
    #[error("{kind} with id '{id}' not found")]
    NotFound { kind: EntityKind, id: String },
    #[error("key material unavailable: {0}")]
    KeyMaterial(#[from] CryptoError),
    #[error(transparent)]
    Field(#[from] PolicyError),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Read { .. } | StoreError::Write { .. } => ErrorKind::Io,
            StoreError::Parse(_) | StoreError::Serialize(_) => ErrorKind::Parse,
            StoreError::Validation(_) | StoreError::Conflict { .. } => ErrorKind::Validation,
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::KeyMaterial(_) | StoreError::Field(_) => ErrorKind::Crypto,
        }
    }

    fn not_found(kind: EntityKind, id: &str) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

struct State {
    document: Document,
    /// Present whenever `document.encryption_enabled` is set.
    cipher: Option<EnvelopeCipher>,
}

/// Shared, lock-guarded owner of the configuration document.
pub struct ConfigStore {
    path: PathBuf,
    keys: KeySource,
    state: RwLock<State>,
}

impl ConfigStore {
    /// Reads and parses `path`, migrating legacy fields and decrypting secrets
    /// when the document has encryption enabled.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>, keys: KeySource) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let bytes = fs::read(&path).map_err(|source| StoreError::Read {
            path: path.clone(),
            source,
        })?;
        let (document, cipher) = decode(&bytes, &keys)?;
        info!(
            tenants = document.tenants.len(),
            applications = document.applications.len(),
            encryption_enabled = document.encryption_enabled,
            "configuration loaded"
        );
        Ok(Self::with_state(path, keys, document, cipher))
    }

    /// Like [`ConfigStore::load`], but a missing file yields an empty document
    /// bound to `path`; it is created by the first mutation.
    pub fn open_or_default(path: impl AsRef<Path>, keys: KeySource) -> Result<Self, StoreError> {
        match Self::load(path.as_ref(), keys.clone()) {
            Err(StoreError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.as_ref().display(), "no configuration file yet, starting empty");
                Ok(Self::with_state(
                    path.as_ref().to_path_buf(),
                    keys,
                    Document::default(),
                    None,
                ))
            }
            other => other,
        }
    }

    /// Wraps an in-memory document without touching the filesystem.
    pub fn from_document(
        path: impl Into<PathBuf>,
        keys: KeySource,
        document: Document,
    ) -> Result<Self, StoreError> {
        let cipher = if document.encryption_enabled {
            Some(keys.build_cipher()?)
        } else {
            None
        };
        Ok(Self::with_state(path.into(), keys, document, cipher))
    }

    fn with_state(
        path: PathBuf,
        keys: KeySource,
        document: Document,
        cipher: Option<EnvelopeCipher>,
    ) -> Self {
        Self {
            path,
            keys,
            state: RwLock::new(State { document, cipher }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the current document to the backing file.
    pub fn save(&self) -> Result<(), StoreError> {
        let state = self.read();
        self.persist(&state)
    }

    /// A copy of the whole in-memory document, secrets in plaintext.
    pub fn snapshot(&self) -> Document {
        self.read().document.clone()
    }

    pub fn encryption_enabled(&self) -> bool {
        self.read().document.encryption_enabled
    }

    /// Turns at-rest encryption on or off and rewrites the file accordingly.
    pub fn set_encryption_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        let mut state = self.write();
        if state.document.encryption_enabled == enabled {
            return Ok(());
        }
        let cipher = if enabled {
            Some(self.keys.build_cipher()?)
        } else {
            None
        };
        let previous = std::mem::replace(&mut state.cipher, cipher);
        state.document.encryption_enabled = enabled;
        if let Err(err) = self.persist(&state) {
            state.document.encryption_enabled = !enabled;
            state.cipher = previous;
            return Err(err);
        }
        info!(enabled, "encryption setting changed");
        Ok(())
    }

    pub fn get_tenant(&self, id: &str) -> Result<Tenant, StoreError> {
        self.read()
            .document
            .tenant(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(EntityKind::Tenant, id))
    }

    pub fn get_tenant_by_hostname(&self, hostname: &str) -> Option<Tenant> {
        self.read()
            .document
            .tenants
            .iter()
            .find(|tenant| tenant.api_hostname == hostname)
            .cloned()
    }

    pub fn list_tenants(&self) -> Vec<Tenant> {
        self.read().document.tenants.clone()
    }

    pub fn get_application(&self, id: &str) -> Result<Application, StoreError> {
        self.read()
            .document
            .application(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(EntityKind::Application, id))
    }

    pub fn list_applications(&self) -> Vec<Application> {
        self.read().document.applications.clone()
    }

    pub fn list_enabled_applications(&self) -> Vec<Application> {
        self.filter_applications(|app| app.enabled)
    }

    pub fn list_applications_for_tenant(&self, tenant_id: &str) -> Vec<Application> {
        self.filter_applications(|app| app.belongs_to(tenant_id))
    }

    /// True once at least one application is enabled.
    pub fn is_configured(&self) -> bool {
        self.read().document.applications.iter().any(|app| app.enabled)
    }

    /// Adds a tenant, generating its id when blank. Returns the stored record.
    pub fn add_tenant(&self, mut tenant: Tenant) -> Result<Tenant, StoreError> {
        if tenant.id.trim().is_empty() {
            tenant.id = Uuid::new_v4().to_string();
        }
        tenant.validate()?;
        self.mutate(|document| {
            if document.tenant(&tenant.id).is_some() {
                return Err(StoreError::Conflict {
                    kind: EntityKind::Tenant,
                    id: tenant.id.clone(),
                });
            }
            document.tenants.push(tenant.clone());
            debug!(tenant_id = %tenant.id, "tenant added");
            Ok(tenant)
        })
    }

    /// Removes a tenant together with every application that references it.
    /// Returns the number of applications removed.
    pub fn delete_tenant(&self, id: &str) -> Result<usize, StoreError> {
        self.mutate(|document| {
            let index = document
                .tenants
                .iter()
                .position(|tenant| tenant.id == id)
                .ok_or_else(|| StoreError::not_found(EntityKind::Tenant, id))?;
            let before = document.applications.len();
            document.applications.retain(|app| !app.belongs_to(id));
            let removed = before - document.applications.len();
            document.tenants.remove(index);
            debug!(tenant_id = %id, applications_removed = removed, "tenant deleted");
            Ok(removed)
        })
    }

    /// Adds an application, generating its id when blank. Returns the stored record.
    pub fn add_application(&self, mut app: Application) -> Result<Application, StoreError> {
        if app.id.trim().is_empty() {
            app.id = Uuid::new_v4().to_string();
        }
        app.validate()?;
        self.mutate(|document| {
            document.check_tenant_reference(&app)?;
            if document.application(&app.id).is_some() {
                return Err(StoreError::Conflict {
                    kind: EntityKind::Application,
                    id: app.id.clone(),
                });
            }
            document.applications.push(app.clone());
            debug!(application_id = %app.id, kind = %app.application_type(), "application added");
            Ok(app)
        })
    }

    /// Replaces the application stored under `id`. The stored id is kept
    /// regardless of the id carried by `app`.
    pub fn update_application(&self, id: &str, mut app: Application) -> Result<Application, StoreError> {
        app.id = id.to_string();
        app.validate()?;
        self.mutate(|document| {
            let index = document
                .applications
                .iter()
                .position(|existing| existing.id == id)
                .ok_or_else(|| StoreError::not_found(EntityKind::Application, id))?;
            document.check_tenant_reference(&app)?;
            document.applications[index] = app.clone();
            debug!(application_id = %id, "application updated");
            Ok(app)
        })
    }

    /// Removes one application and returns it.
    pub fn delete_application(&self, id: &str) -> Result<Application, StoreError> {
        self.mutate(|document| {
            let index = document
                .applications
                .iter()
                .position(|app| app.id == id)
                .ok_or_else(|| StoreError::not_found(EntityKind::Application, id))?;
            let removed = document.applications.remove(index);
            debug!(application_id = %id, "application deleted");
            Ok(removed)
        })
    }

    fn filter_applications(&self, keep: impl Fn(&Application) -> bool) -> Vec<Application> {
        self.read()
            .document
            .applications
            .iter()
            .filter(|app| keep(app))
            .cloned()
            .collect()
    }

    /// Runs `change` under the write lock and persists the result. If either
    /// the change or the write fails, the document is restored, so memory and
    /// disk never disagree.
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut Document) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.write();
        let before = state.document.clone();
        let outcome = change(&mut state.document).and_then(|value| {
            self.persist(&state)?;
            Ok(value)
        });
        if outcome.is_err() {
            state.document = before;
        }
        outcome
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    fn persist(&self, state: &State) -> Result<(), StoreError> {
        let mut value = serde_yaml::to_value(&state.document).map_err(StoreError::Serialize)?;
        if state.document.encryption_enabled {
            let derived;
            let cipher = match &state.cipher {
                Some(cipher) => cipher,
                None => {
                    derived = self.keys.build_cipher()?;
                    &derived
                }
            };
            let sealed = policy::encrypt_document(&mut value, cipher)?;
            debug!(fields = sealed, "sensitive fields sealed");
        }
        let text = serde_yaml::to_string(&value).map_err(StoreError::Serialize)?;
        write_atomically(&self.path, text.as_bytes())?;
        info!(
            tenants = state.document.tenants.len(),
            applications = state.document.applications.len(),
            "configuration saved"
        );
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigStore")
            .field("path", &self.path)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

/// Parses document bytes into the typed model. Sensitive fields are decrypted
/// on the generic tree first, so the typed model only ever sees plaintext.
fn decode(bytes: &[u8], keys: &KeySource) -> Result<(Document, Option<EnvelopeCipher>), StoreError> {
    let mut value: Value = serde_yaml::from_slice(bytes).map_err(StoreError::Parse)?;
    if value.is_null() {
        return Ok((Document::default(), None));
    }

    let encryption_enabled = value
        .get(ENCRYPTION_FLAG)
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let cipher = if encryption_enabled {
        let cipher = keys.build_cipher()?;
        let opened = policy::decrypt_document(&mut value, &cipher)?;
        debug!(fields = opened, "sensitive fields opened");
        Some(cipher)
    } else {
        None
    };

    let mut document: Document = serde_yaml::from_value(value).map_err(StoreError::Parse)?;
    let migrated = document.migrate_legacy_fields();
    if migrated > 0 {
        info!(applications = migrated, "migrated legacy application type");
    }
    Ok((document, cipher))
}

/// Encrypts or decrypts every sensitive field of the document at `path` in
/// place, without typed validation, and records the matching
/// `encryption_enabled` flag. Returns the number of fields rewritten.
pub fn rewrite_file(path: &Path, cipher: &EnvelopeCipher, encrypt: bool) -> Result<usize, StoreError> {
    let bytes = fs::read(path).map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut value: Value = serde_yaml::from_slice(&bytes).map_err(StoreError::Parse)?;
    let changed = if encrypt {
        policy::encrypt_document(&mut value, cipher)?
    } else {
        policy::decrypt_document(&mut value, cipher)?
    };
    if let Value::Mapping(root) = &mut value {
        root.insert(Value::from(ENCRYPTION_FLAG), Value::Bool(encrypt));
    }
    let text = serde_yaml::to_string(&value).map_err(StoreError::Serialize)?;
    write_atomically(path, text.as_bytes())?;
    info!(path = %path.display(), fields = changed, encrypt, "configuration rewritten");
    Ok(changed)
}

/// Writes to a sibling temporary file, syncs it and renames it over `path`,
/// so an interrupted save leaves the previous file intact.
fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let write_error = |source: io::Error| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir).map_err(write_error)?;
    file.write_all(contents).map_err(write_error)?;
    file.as_file().sync_all().map_err(write_error)?;
    file.persist(path).map_err(|err| write_error(err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_file_loads_as_empty_document() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        fs::write(&path, "").expect("write");

        let store = ConfigStore::load(&path, KeySource::new(dir.path().join("key"))).expect("load");
        assert_eq!(store.snapshot(), Document::default());
    }

    #[test]
    fn error_kinds_follow_the_taxonomy() {
        let missing = StoreError::not_found(EntityKind::Tenant, "t1");
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert_eq!(missing.to_string(), "tenant with id 't1' not found");

        let invalid = StoreError::from(ValidationError::Missing { field: "name" });
        assert_eq!(invalid.kind(), ErrorKind::Validation);
        assert_eq!(invalid.to_string(), "invalid configuration: name is required");
    }

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        fs::write(&path, "old").expect("write");

        write_atomically(&path, b"new").expect("atomic write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "new");
        let leftovers = fs::read_dir(dir.path()).expect("read dir").count();
        assert_eq!(leftovers, 1, "temporary file must not be left behind");
    }

    #[test]
    fn write_into_missing_directory_fails_as_io() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("gone").join("config.yaml");
        let err = write_atomically(&path, b"data").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
