//! AES-256-GCM envelope sealing.
//!
//! Every call to [`seal`] draws a fresh 128-bit IV from the OS random
//! source. Nothing is derived from content or from a counter, so two
//! processes sealing under the same key never coordinate.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce, Tag};
use std::fmt;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::kdf::{DerivedKey, KEY_SIZE};

/// IV size for the envelope (128 bits = 16 bytes).
pub const IV_SIZE: usize = 16;

/// GCM authentication tag size (128 bits = 16 bytes).
pub const TAG_SIZE: usize = 16;

/// AES-256-GCM with a 16-byte IV instead of the usual 12.
type Aes256Gcm128 = AesGcm<Aes256, U16>;

/// A sealed payload: IV, ciphertext and detached authentication tag.
///
/// The fixed-size fields make a wrong-length IV or tag unrepresentable, so
/// length validation happens once, when an envelope is built from untrusted
/// columns or strings.
#[derive(Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Per-seal random IV.
    pub iv: [u8; IV_SIZE],
    /// Encrypted payload, same length as the plaintext.
    pub ciphertext: Vec<u8>,
    /// GCM tag over the ciphertext.
    pub auth_tag: [u8; TAG_SIZE],
}

impl Envelope {
    /// Build an envelope from three stored columns.
    ///
    /// Returns `MalformedEnvelope` if the IV or tag is not exactly 16 bytes.
    pub fn from_parts(iv: &[u8], ciphertext: Vec<u8>, auth_tag: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            iv: fixed::<IV_SIZE>("iv", iv)?,
            ciphertext,
            auth_tag: fixed::<TAG_SIZE>("auth tag", auth_tag)?,
        })
    }

    /// Encode as `hex(iv):hex(ciphertext):hex(authTag)`, lowercase.
    pub fn to_credential_string(&self) -> String {
        format!(
            "{}:{}:{}",
            hex::encode(self.iv),
            hex::encode(&self.ciphertext),
            hex::encode(self.auth_tag)
        )
    }

    /// Parse the colon-joined hex form.
    ///
    /// Exactly three lowercase-hex fields are accepted; anything else is a
    /// `MalformedEnvelope` and no cipher operation is attempted.
    pub fn from_credential_string(encoded: &str) -> Result<Self, CryptoError> {
        let fields: Vec<&str> = encoded.split(':').collect();
        if fields.len() != 3 {
            return Err(CryptoError::malformed(format!(
                "expected 3 fields, got {}",
                fields.len()
            )));
        }

        let iv = decode_hex("iv", fields[0])?;
        let ciphertext = decode_hex("ciphertext", fields[1])?;
        let auth_tag = decode_hex("auth tag", fields[2])?;
        Self::from_parts(&iv, ciphertext, &auth_tag)
    }
}

// Don't leak ciphertext in debug output
impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Envelope {{ ciphertext_len: {} }}", self.ciphertext.len())
    }
}

fn fixed<const N: usize>(field: &str, bytes: &[u8]) -> Result<[u8; N], CryptoError> {
    <[u8; N]>::try_from(bytes).map_err(|_| {
        CryptoError::malformed(format!("{} must be {} bytes, got {}", field, N, bytes.len()))
    })
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    if value.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(CryptoError::malformed(format!("{} is not lowercase hex", field)));
    }
    hex::decode(value).map_err(|_| CryptoError::malformed(format!("{} is not valid hex", field)))
}

fn cipher(key: &DerivedKey) -> Result<Aes256Gcm128, CryptoError> {
    Aes256Gcm128::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::InvalidKeyLength {
        expected: KEY_SIZE,
        actual: key.as_bytes().len(),
    })
}

/// Generate a random 16-byte IV.
fn generate_iv() -> Result<[u8; IV_SIZE], CryptoError> {
    let mut iv = [0u8; IV_SIZE];
    getrandom::getrandom(&mut iv).map_err(|e| CryptoError::Rng(e.to_string()))?;
    Ok(iv)
}

/// Encrypt `plaintext` under `key` with a fresh random IV.
pub fn seal(plaintext: &[u8], key: &DerivedKey) -> Result<Envelope, CryptoError> {
    let cipher = cipher(key)?;
    let iv = generate_iv()?;

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::<U16>::from_slice(&iv), b"", &mut buffer)
        .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;

    let mut auth_tag = [0u8; TAG_SIZE];
    auth_tag.copy_from_slice(&tag);

    Ok(Envelope {
        iv,
        ciphertext: buffer,
        auth_tag,
    })
}

/// Decrypt and authenticate an envelope.
///
/// Fails closed: on any tag mismatch the working buffer is zeroed and
/// `DecryptionFailed` is returned with no partial output. Tag comparison is
/// done by the AEAD implementation in constant time.
pub fn open(envelope: &Envelope, key: &DerivedKey) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = cipher(key)?;

    let mut buffer = Zeroizing::new(envelope.ciphertext.clone());
    cipher
        .decrypt_in_place_detached(
            Nonce::<U16>::from_slice(&envelope.iv),
            b"",
            buffer.as_mut_slice(),
            Tag::<U16>::from_slice(&envelope.auth_tag),
        )
        .map_err(|_| CryptoError::DecryptionFailed)?;

    Ok(buffer)
}
