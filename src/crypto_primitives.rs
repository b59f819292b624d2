//! Shared HKDF/AEAD primitives used by the identity store (encrypting the
//! client-TLS bundle), the trust store (encrypting trust records), and the
//! secure channel codec (deriving and using per-session keys).

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

pub const GCM_NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum AeadError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("invalid blob: too short")]
    InvalidBlob,
}

/// Derive `out_len` bytes of key material via HKDF-SHA256.
pub fn hkdf_expand(ikm: &[u8], salt: &[u8], info: &[u8], out_len: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; out_len];
    hk.expand(info, &mut okm).expect("hkdf output length is valid for sha256");
    okm
}

/// Seal `plaintext` with a random 96-bit nonce, returning `nonce || ciphertext+tag`.
pub fn seal_with_random_nonce(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, AeadError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; GCM_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: plaintext, aad })
        .map_err(|_| AeadError::Encrypt)?;
    let mut out = Vec::with_capacity(GCM_NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`seal_with_random_nonce`].
pub fn open_with_embedded_nonce(key: &[u8; 32], blob: &[u8], aad: &[u8]) -> Result<Vec<u8>, AeadError> {
    if blob.len() < GCM_NONCE_LEN {
        return Err(AeadError::InvalidBlob);
    }
    let (nonce, ciphertext) = blob.split_at(GCM_NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| AeadError::Decrypt)
}

/// Seal with an explicit nonce (used for the counter-framed secure channel,
/// where the nonce is `prefix || counter` rather than random).
pub fn seal_with_nonce(key: &[u8; 32], nonce: &[u8; GCM_NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, AeadError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| AeadError::Encrypt)
}

pub fn open_with_nonce(key: &[u8; 32], nonce: &[u8; GCM_NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, AeadError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| AeadError::Decrypt)
}

pub fn b64_encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn b64_decode(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(value)
}
