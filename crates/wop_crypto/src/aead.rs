//! Authenticated encryption for message payloads.
//!
//! AES-256-GCM. Key size: 32 bytes. IV: 12 random bytes. Tag: 16 bytes.
//!
//! Ciphertext wire format:
//!   [ iv (12 bytes) | tag (16 bytes) | ciphertext ]

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Encrypt `plaintext` with a 32-byte key under a fresh random IV.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    let iv = Aes256Gcm::generate_nonce(&mut AeadOsRng);

    // aes-gcm appends the tag; the wire puts it between iv and ciphertext.
    let sealed = cipher
        .encrypt(&iv, plaintext)
        .map_err(|_| CryptoError::AeadEncrypt)?;
    let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    let mut out = Vec::with_capacity(IV_LEN + TAG_LEN + body.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(tag);
    out.extend_from_slice(body);
    Ok(out)
}

/// Decrypt wire-format bytes (iv || tag || ciphertext).
pub fn decrypt(key: &[u8; 32], data: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < IV_LEN + TAG_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let iv = Nonce::from_slice(&data[..IV_LEN]);
    let tag = &data[IV_LEN..IV_LEN + TAG_LEN];
    let body = &data[IV_LEN + TAG_LEN..];

    let mut sealed = Vec::with_capacity(body.len() + TAG_LEN);
    sealed.extend_from_slice(body);
    sealed.extend_from_slice(tag);

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(iv, sealed.as_slice())
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}
