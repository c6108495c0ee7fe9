//! End-to-end encryption of document payloads.
//!
//! The room secret travels out of band (the URL fragment) and never through
//! the relay. It is decoded from URL-safe base64, stretched with HKDF-SHA256
//! into an AES-256-GCM key, and every payload is sealed with a fresh random
//! nonce prepended to the ciphertext.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const MIN_SECRET_LEN: usize = 16;
const ROOM_SECRET_LEN: usize = 32;
const KEY_INFO: &[u8] = b"tandem room key v1";

/// Encryption errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid room key: {0}")]
    InvalidKey(String),
    #[error("Encryption failed")]
    Encrypt,
    #[error("Decryption failed: wrong key or corrupted payload")]
    Decrypt,
}

/// Symmetric key for one room.
#[derive(Clone)]
pub struct RoomKey {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RoomKey(..)")
    }
}

/// Derive a room key from the out-of-band secret.
pub fn import_key(secret: &str) -> Result<RoomKey, CryptoError> {
    let secret = secret.trim().trim_start_matches('#');
    let bytes = URL_SAFE_NO_PAD
        .decode(secret)
        .or_else(|_| URL_SAFE.decode(secret))
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    if bytes.len() < MIN_SECRET_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "secret is {} bytes, need at least {}",
            bytes.len(),
            MIN_SECRET_LEN
        )));
    }

    let hk = Hkdf::<Sha256>::new(None, &bytes);
    let mut okm = [0u8; 32];
    hk.expand(KEY_INFO, &mut okm)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let cipher =
        Aes256Gcm::new_from_slice(&okm).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(RoomKey { cipher })
}

/// Generate a fresh secret suitable for a URL fragment.
pub fn generate_room_key() -> String {
    let mut bytes = [0u8; ROOM_SECRET_LEN];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Seal a payload. Output is `nonce || ciphertext`.
pub fn encrypt(key: &RoomKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = key
        .cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a payload produced by [`encrypt`].
pub fn decrypt(key: &RoomKey, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if payload.len() < NONCE_LEN {
        return Err(CryptoError::Decrypt);
    }
    let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
    key.cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = import_key(&generate_room_key()).unwrap();
        let sealed = encrypt(&key, b"payload").unwrap();
        assert_ne!(sealed, b"payload".to_vec());
        assert_eq!(decrypt(&key, &sealed).unwrap(), b"payload".to_vec());
    }

    #[test]
    fn test_wrong_key_fails_distinctly() {
        let key = import_key(&generate_room_key()).unwrap();
        let other = import_key(&generate_room_key()).unwrap();
        let sealed = encrypt(&key, b"payload").unwrap();
        assert_eq!(decrypt(&other, &sealed), Err(CryptoError::Decrypt));
    }

    #[test]
    fn test_same_secret_same_key() {
        let secret = generate_room_key();
        let a = import_key(&secret).unwrap();
        let b = import_key(&format!("#{secret}")).unwrap();
        let sealed = encrypt(&a, b"shared").unwrap();
        assert_eq!(decrypt(&b, &sealed).unwrap(), b"shared".to_vec());
    }

    #[test]
    fn test_nonce_uniqueness() {
        let key = import_key(&generate_room_key()).unwrap();
        let first = encrypt(&key, b"test").unwrap();
        let second = encrypt(&key, b"test").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_invalid_secrets() {
        assert!(matches!(import_key("not base64 !!"), Err(CryptoError::InvalidKey(_))));
        assert!(matches!(import_key("c2hvcnQ"), Err(CryptoError::InvalidKey(_))));
        assert!(matches!(import_key(""), Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn test_truncated_payload() {
        let key = import_key(&generate_room_key()).unwrap();
        assert_eq!(decrypt(&key, b"short"), Err(CryptoError::Decrypt));
    }
}
