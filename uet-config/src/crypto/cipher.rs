//! Authenticated encryption of individual string values.
//! Every call to `encrypt` draws a fresh random nonce, so the same plaintext
//! never produces the same envelope twice.

use std::fmt;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use zeroize::Zeroize;

use super::envelope::{Algorithm, Envelope};
use super::keys::derive_key;
use super::{CryptoError, KEY_LEN};

/// Holds one derived key and seals values into envelopes with it.
pub struct EnvelopeCipher {
    key: [u8; KEY_LEN],
    algorithm: Algorithm,
}

impl EnvelopeCipher {
    /// Builds a cipher from already-derived key bytes.
    pub fn from_key_bytes(key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_LEN] = key_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self {
            key,
            algorithm: Algorithm::default(),
        })
    }

    /// Derives the key from a passphrase exactly as a master-key override is derived.
    pub fn with_passphrase(passphrase: &str) -> Result<Self, CryptoError> {
        let key = derive_key(passphrase.as_bytes())?;
        Self::from_key_bytes(key.as_slice())
    }

    /// Selects the algorithm used for new envelopes. Decryption always follows
    /// the tag carried by the envelope itself.
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Encrypts `plaintext` into its envelope string. Empty input stays empty.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let (nonce, sealed) = match self.algorithm {
            Algorithm::Aes256Gcm => seal::<Aes256Gcm>(&self.key, plaintext.as_bytes())?,
            Algorithm::ChaCha20Poly1305 => {
                seal::<ChaCha20Poly1305>(&self.key, plaintext.as_bytes())?
            }
        };
        Ok(Envelope {
            algorithm: self.algorithm,
            nonce,
            sealed,
        }
        .to_string())
    }

    /// Decrypts an envelope. Values that are not envelopes are returned
    /// unchanged; malformed envelopes and failed authentication are errors.
    pub fn decrypt(&self, value: &str) -> Result<String, CryptoError> {
        let Some(envelope) = Envelope::parse(value)? else {
            return Ok(value.to_string());
        };
        let plaintext = match envelope.algorithm {
            Algorithm::Aes256Gcm => open::<Aes256Gcm>(&self.key, &envelope)?,
            Algorithm::ChaCha20Poly1305 => open::<ChaCha20Poly1305>(&self.key, &envelope)?,
        };
        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
    }
}

fn seal<C>(key: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError>
where
    C: Aead + AeadCore + KeyInit,
{
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    let nonce = C::generate_nonce(&mut OsRng);
    let sealed = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(format!("{e}")))?;
    Ok((nonce.to_vec(), sealed))
}

fn open<C>(key: &[u8], envelope: &Envelope) -> Result<Vec<u8>, CryptoError>
where
    C: Aead + AeadCore + KeyInit,
{
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    if envelope.nonce.len() != envelope.algorithm.nonce_len() {
        return Err(CryptoError::MalformedEnvelope(
            "nonce length mismatch".to_string(),
        ));
    }
    let nonce = GenericArray::from_slice(&envelope.nonce);
    cipher
        .decrypt(nonce, envelope.sealed.as_slice())
        .map_err(|e| CryptoError::DecryptionFailed(format!("{e}")))
}

impl fmt::Debug for EnvelopeCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeCipher")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl Drop for EnvelopeCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::EnvelopeCipher;
    use crate::crypto::{is_envelope, Algorithm, CryptoError};

    fn cipher(byte: u8) -> EnvelopeCipher {
        EnvelopeCipher::from_key_bytes(&[byte; 32]).expect("key should be valid")
    }

    #[test]
    fn encrypts_and_decrypts_round_trip() {
        let cipher = cipher(42);
        let envelope = cipher.encrypt("secret-token").expect("encryption should succeed");
        assert!(envelope.starts_with("ENC[AES256_GCM,"));
        assert!(!envelope.contains("secret-token"));
        assert_eq!(cipher.decrypt(&envelope).expect("decrypt"), "secret-token");
    }

    #[test]
    fn empty_plaintext_stays_empty() {
        assert_eq!(cipher(1).encrypt("").expect("encrypt"), "");
    }

    #[test]
    fn same_plaintext_gets_fresh_nonce() {
        let cipher = cipher(5);
        let first = cipher.encrypt("repeat-me").expect("encrypt");
        let second = cipher.encrypt("repeat-me").expect("encrypt");
        assert_ne!(first, second);
        assert_eq!(cipher.decrypt(&first).expect("decrypt"), "repeat-me");
        assert_eq!(cipher.decrypt(&second).expect("decrypt"), "repeat-me");
    }

    #[test]
    fn plaintext_passes_through_decrypt() {
        let cipher = cipher(9);
        assert_eq!(cipher.decrypt("not-encrypted").expect("decrypt"), "not-encrypted");
        assert_eq!(cipher.decrypt("").expect("decrypt"), "");
        assert_eq!(
            cipher.decrypt("ENC[my-legacy-password]").expect("decrypt"),
            "ENC[my-legacy-password]"
        );
    }

    #[test]
    fn envelope_shaped_plaintext_is_sealed_and_recovered() {
        let cipher = cipher(8);
        let envelope = cipher.encrypt("ENC[my-legacy-password]").expect("encrypt");
        assert!(is_envelope(&envelope));
        assert!(!envelope.contains("my-legacy-password"));
        assert_eq!(cipher.decrypt(&envelope).expect("decrypt"), "ENC[my-legacy-password]");
    }

    #[test]
    fn wrong_key_is_rejected() {
        let envelope = cipher(1).encrypt("payload").expect("encrypt");
        let err = cipher(2).decrypt(&envelope).unwrap_err();
        assert!(matches!(err, CryptoError::DecryptionFailed(_)));
        assert_eq!(cipher(1).decrypt(&envelope).expect("decrypt"), "payload");
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let cipher = cipher(7);
        let envelope = cipher.encrypt("payload").expect("encrypt");
        // Swap the first ciphertext character for a different base64 symbol.
        let start = envelope.rfind(',').expect("separator") + 1;
        let mut bytes = envelope.into_bytes();
        bytes[start] = if bytes[start] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).expect("ascii");
        assert!(cipher.decrypt(&tampered).is_err());
    }

    #[test]
    fn decrypts_by_envelope_tag_not_configured_algorithm() {
        let chacha = cipher(3).with_algorithm(Algorithm::ChaCha20Poly1305);
        let envelope = chacha.encrypt("cross-algorithm").expect("encrypt");
        assert!(envelope.starts_with("ENC[CHACHA20_POLY1305,"));
        assert!(is_envelope(&envelope));
        assert_eq!(cipher(3).decrypt(&envelope).expect("decrypt"), "cross-algorithm");
    }

    #[test]
    fn passphrase_derivation_is_stable() {
        let first = EnvelopeCipher::with_passphrase("pa55phrase").expect("derive");
        let second = EnvelopeCipher::with_passphrase("pa55phrase").expect("derive");
        let envelope = first.encrypt("payload").expect("encrypt");
        assert_eq!(second.decrypt(&envelope).expect("decrypt"), "payload");
    }

    #[test]
    fn rejects_bad_keys() {
        let err = EnvelopeCipher::from_key_bytes(&[1u8; 16]).unwrap_err();
        assert!(format!("{err}").contains("invalid key length"));
    }

    #[test]
    fn debug_output_hides_key() {
        let rendered = format!("{:?}", cipher(0xAB));
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains("171"));
    }
}
