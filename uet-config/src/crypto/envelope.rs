//! The at-rest representation of an encrypted value:
//! `ENC[<ALG>,<base64 nonce>,<base64 ciphertext+tag>]`.
//!
//! Parsing is total over arbitrary strings. A value that does not look like
//! an envelope is reported as `Ok(None)` rather than as an error, so callers
//! can treat it as plaintext.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};

use super::CryptoError;

pub const ENVELOPE_PREFIX: &str = "ENC[";
pub const ENVELOPE_SUFFIX: &str = "]";

const FIELD_SEPARATOR: char = ',';
const TAG_LEN: usize = 16;

/// Authenticated cipher named by an envelope's algorithm tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Algorithm {
    pub fn tag(self) -> &'static str {
        match self {
            Algorithm::Aes256Gcm => "AES256_GCM",
            Algorithm::ChaCha20Poly1305 => "CHACHA20_POLY1305",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "AES256_GCM" => Some(Algorithm::Aes256Gcm),
            "CHACHA20_POLY1305" => Some(Algorithm::ChaCha20Poly1305),
            _ => None,
        }
    }

    /// Both supported ciphers use 96-bit nonces.
    pub fn nonce_len(self) -> usize {
        12
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Returns true when `value` is a complete, well-formed envelope: a known
/// tag, three fields, valid base64 and plausible lengths. This is the
/// predicate that keeps field encryption idempotent, so a plaintext that
/// merely resembles an envelope still gets encrypted.
pub fn is_envelope(value: &str) -> bool {
    matches!(Envelope::parse(value), Ok(Some(_)))
}

/// Returns true when `value` starts like a tagged envelope (`ENC[` followed
/// by an upper-case tag and a comma) and ends with `]`. Values with this
/// shape are decrypted or rejected; anything else is plaintext.
pub fn looks_like_envelope(value: &str) -> bool {
    let Some(inner) = value
        .strip_prefix(ENVELOPE_PREFIX)
        .and_then(|rest| rest.strip_suffix(ENVELOPE_SUFFIX))
    else {
        return false;
    };
    let Some((tag, _)) = inner.split_once(FIELD_SEPARATOR) else {
        return false;
    };
    !tag.is_empty()
        && tag
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
}

/// A parsed envelope. `sealed` holds the ciphertext with the authentication
/// tag appended, exactly as the AEAD produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub algorithm: Algorithm,
    pub nonce: Vec<u8>,
    pub sealed: Vec<u8>,
}

impl Envelope {
    /// Parses `value`, returning `Ok(None)` if it is not an envelope at all and
    /// an error if it is shaped like one but cannot be used.
    pub fn parse(value: &str) -> Result<Option<Self>, CryptoError> {
        if !looks_like_envelope(value) {
            return Ok(None);
        }
        let inner = &value[ENVELOPE_PREFIX.len()..value.len() - ENVELOPE_SUFFIX.len()];
        let fields: Vec<&str> = inner.split(FIELD_SEPARATOR).collect();
        let [tag, nonce_b64, sealed_b64] = fields.as_slice() else {
            return Err(CryptoError::MalformedEnvelope(format!(
                "expected 3 fields, found {}",
                fields.len()
            )));
        };

        let algorithm = Algorithm::from_tag(tag)
            .ok_or_else(|| CryptoError::UnsupportedAlgorithm(tag.to_string()))?;
        let nonce = STANDARD
            .decode(nonce_b64.trim())
            .map_err(|e| CryptoError::Base64DecodeFailed(format!("nonce: {e}")))?;
        let sealed = STANDARD
            .decode(sealed_b64.trim())
            .map_err(|e| CryptoError::Base64DecodeFailed(format!("ciphertext: {e}")))?;

        if nonce.len() != algorithm.nonce_len() {
            return Err(CryptoError::MalformedEnvelope(format!(
                "nonce is {} bytes, {algorithm} needs {}",
                nonce.len(),
                algorithm.nonce_len()
            )));
        }
        if sealed.len() < TAG_LEN {
            return Err(CryptoError::MalformedEnvelope(
                "ciphertext shorter than authentication tag".to_string(),
            ));
        }

        Ok(Some(Self {
            algorithm,
            nonce,
            sealed,
        }))
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{ENVELOPE_PREFIX}{}{FIELD_SEPARATOR}{}{FIELD_SEPARATOR}{}{ENVELOPE_SUFFIX}",
            self.algorithm.tag(),
            STANDARD.encode(&self.nonce),
            STANDARD.encode(&self.sealed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{is_envelope, looks_like_envelope, Algorithm, Envelope};
    use crate::crypto::CryptoError;

    fn sample() -> Envelope {
        Envelope {
            algorithm: Algorithm::Aes256Gcm,
            nonce: vec![3u8; 12],
            sealed: vec![9u8; 24],
        }
    }

    #[test]
    fn formats_and_parses_canonical_form() {
        let text = sample().to_string();
        assert!(text.starts_with("ENC[AES256_GCM,"));
        assert!(text.ends_with(']'));
        let parsed = Envelope::parse(&text).expect("parse").expect("envelope");
        assert_eq!(parsed, sample());
    }

    #[test]
    fn plaintext_is_not_an_envelope() {
        for value in [
            "",
            "hunter2",
            "ENC[",
            "ENC[]",
            "ENC[unterminated",
            "[ENC]",
            "enc[x,y,z]",
            "ENC[my-legacy-password]",
            "ENC[lower,case,tag]",
        ] {
            assert!(!looks_like_envelope(value), "{value} should not look like an envelope");
            assert!(!is_envelope(value), "{value} should not be an envelope");
            assert!(Envelope::parse(value).expect("total").is_none());
        }
    }

    #[test]
    fn tagged_but_broken_values_are_not_envelopes() {
        for value in ["ENC[AES256_GCM,foo]", "ENC[AES256_GCM,!!,??]", "ENC[ROT13,AAAA,BBBB]"] {
            assert!(looks_like_envelope(value), "{value} should look like an envelope");
            assert!(!is_envelope(value), "{value} should not be an envelope");
            assert!(Envelope::parse(value).is_err());
        }
        assert!(is_envelope(&sample().to_string()));
    }

    #[test]
    fn rejects_wrong_field_count() {
        let err = Envelope::parse("ENC[AES256_GCM,AAAA]").unwrap_err();
        assert!(matches!(err, CryptoError::MalformedEnvelope(_)));
        let err = Envelope::parse("ENC[AES256_GCM,a,b,c]").unwrap_err();
        assert!(matches!(err, CryptoError::MalformedEnvelope(_)));
    }

    #[test]
    fn rejects_unknown_algorithm() {
        let err = Envelope::parse("ENC[ROT13,AAAA,BBBB]").unwrap_err();
        assert!(matches!(err, CryptoError::UnsupportedAlgorithm(tag) if tag == "ROT13"));
    }

    #[test]
    fn rejects_invalid_base64() {
        let err = Envelope::parse("ENC[AES256_GCM,not base64!,AAAA]").unwrap_err();
        assert!(matches!(err, CryptoError::Base64DecodeFailed(_)));
    }

    #[test]
    fn rejects_short_nonce() {
        let err = Envelope::parse("ENC[CHACHA20_POLY1305,AAAA,AAAAAAAAAAAAAAAAAAAAAA==]").unwrap_err();
        assert!(format!("{err}").contains("nonce"));
    }
}
