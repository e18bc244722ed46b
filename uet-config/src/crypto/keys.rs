//! Key material resolution. The cipher key is always derived with PBKDF2
//! from either an operator-supplied master key or a random blob kept in a
//! local key file; the derived key itself is never written anywhere.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use hmac::Hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

use super::cipher::EnvelopeCipher;
use super::{CryptoError, KEY_LEN};

pub const MASTER_KEY_ENV: &str = "UET_MASTER_KEY";
pub const KEY_FILE_ENV: &str = "UET_KEY_FILE";
pub const DEFAULT_KEY_FILE: &str = ".uet_key";

const KDF_SALT: &[u8] = b"uet-salt";
const KDF_ROUNDS: u32 = 100_000;
const RAW_KEY_LEN: usize = 32;

/// Derives a cipher key from arbitrary secret bytes.
pub fn derive_key(secret: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    pbkdf2_sha256(secret, KDF_SALT, KDF_ROUNDS)
}

fn pbkdf2_sha256(
    secret: &[u8],
    salt: &[u8],
    rounds: u32,
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let mut output = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2::<Hmac<Sha256>>(secret, salt, rounds, output.as_mut_slice())
        .map_err(|e| CryptoError::DerivationFailed(format!("{e}")))?;
    Ok(output)
}

/// Where key material comes from: an optional master key override, then the
/// key file, which is generated on first use.
#[derive(Clone)]
pub struct KeySource {
    master_key: Option<String>,
    key_file: PathBuf,
}

impl KeySource {
    pub fn new(key_file: impl Into<PathBuf>) -> Self {
        Self {
            master_key: None,
            key_file: key_file.into(),
        }
    }

    /// Sets the override. An empty value counts as absent.
    pub fn with_master_key(mut self, master_key: impl Into<String>) -> Self {
        let master_key = master_key.into();
        self.master_key = (!master_key.is_empty()).then_some(master_key);
        self
    }

    pub fn key_file(&self) -> &Path {
        &self.key_file
    }

    pub fn has_master_key(&self) -> bool {
        self.master_key.is_some()
    }

    /// Resolves the derived key: override first, then an existing key file,
    /// otherwise a freshly generated key file.
    pub fn resolve(&self) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
        if let Some(master_key) = &self.master_key {
            debug!("deriving key from master key override");
            return derive_key(master_key.as_bytes());
        }

        match fs::read(&self.key_file) {
            Ok(raw) => {
                let raw = Zeroizing::new(raw);
                debug!(key_file = %self.key_file.display(), "deriving key from key file");
                derive_key(&raw)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let mut raw = [0u8; RAW_KEY_LEN];
                OsRng.fill_bytes(&mut raw);
                let derived = write_key_file(&self.key_file, &raw).and_then(|()| {
                    warn!(key_file = %self.key_file.display(), "generated new key file");
                    derive_key(&raw)
                });
                raw.zeroize();
                derived
            }
            Err(source) => Err(CryptoError::KeyFile {
                path: self.key_file.clone(),
                source,
            }),
        }
    }

    pub fn build_cipher(&self) -> Result<EnvelopeCipher, CryptoError> {
        let key = self.resolve()?;
        EnvelopeCipher::from_key_bytes(key.as_slice())
    }
}

impl Default for KeySource {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_FILE)
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySource")
            .field("master_key", &self.master_key.as_ref().map(|_| "<redacted>"))
            .field("key_file", &self.key_file)
            .finish()
    }
}

fn write_key_file(path: &Path, raw: &[u8]) -> Result<(), CryptoError> {
    let key_file_error = |source: std::io::Error| CryptoError::KeyFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(key_file_error)?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(key_file_error)?;
    file.write_all(raw).map_err(key_file_error)?;
    file.sync_all().map_err(key_file_error)
}

#[cfg(test)]
mod tests {
    use super::{derive_key, pbkdf2_sha256, KeySource, RAW_KEY_LEN};
    use hex::ToHex;
    use tempfile::tempdir;

    #[test]
    fn pbkdf2_matches_rfc7914_vector() {
        let okm = pbkdf2_sha256(b"passwd", b"salt", 1).expect("derive");
        assert_eq!(
            okm.as_slice().encode_hex::<String>(),
            "55ac046e56e3089fec1691c22544b605f94185216dde0465e68b9d57c20dacbc"
        );
    }

    #[test]
    fn master_key_override_wins() {
        let dir = tempdir().expect("tempdir");
        let key_file = dir.path().join("uet.key");
        let source = KeySource::new(&key_file).with_master_key("override");

        let key = source.resolve().expect("resolve");
        assert_eq!(*key, *derive_key(b"override").expect("derive"));
        assert!(!key_file.exists(), "override must not touch the key file");
    }

    #[test]
    fn empty_master_key_is_ignored() {
        let dir = tempdir().expect("tempdir");
        let source = KeySource::new(dir.path().join("uet.key")).with_master_key("");
        assert!(!source.has_master_key());
    }

    #[test]
    fn generates_key_file_once_and_reuses_it() {
        let dir = tempdir().expect("tempdir");
        let key_file = dir.path().join("nested").join("uet.key");
        let source = KeySource::new(&key_file);

        let first = source.resolve().expect("first resolve");
        let raw = std::fs::read(&key_file).expect("key file written");
        assert_eq!(raw.len(), RAW_KEY_LEN);
        assert_ne!(raw.as_slice(), first.as_slice(), "raw blob is not the derived key");

        let second = source.resolve().expect("second resolve");
        assert_eq!(*first, *second);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&key_file).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn existing_key_file_is_derived_not_used_raw() {
        let dir = tempdir().expect("tempdir");
        let key_file = dir.path().join("uet.key");
        std::fs::write(&key_file, b"operator-provided-blob").expect("write");

        let key = KeySource::new(&key_file).resolve().expect("resolve");
        assert_eq!(*key, *derive_key(b"operator-provided-blob").expect("derive"));
    }

    #[test]
    fn unreadable_key_path_is_an_error() {
        let dir = tempdir().expect("tempdir");
        // A directory cannot be read as a key file.
        let err = KeySource::new(dir.path()).resolve().unwrap_err();
        assert!(format!("{err}").contains("key file"));
    }

    #[test]
    fn debug_output_hides_master_key() {
        let source = KeySource::new("uet.key").with_master_key("very-secret");
        assert!(!format!("{source:?}").contains("very-secret"));
    }
}
