//! QR payload codec
//!
//! A scanned QR code is either plain JSON (`{mode, udi?, sik?, key}`) or the
//! base64 encoding of `nonce(12) || ciphertext+tag`, sealed with
//! ChaCha20-Poly1305 under the `keyenc` key handed out by the backend on a
//! previous registration. There is no type tag: plaintext is tried first and
//! decryption only happens when that fails.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;

use crate::credentials::{CredentialKey, CredentialStore};
use crate::error::ErrorType;
use crate::section::QrPayload;

/// Nonce prefix length of an encrypted payload
pub const NONCE_LEN: usize = 12;

/// ChaCha20-Poly1305 key length
pub const KEY_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed QR payload: {0}")]
    BadPayload(String),

    #[error("No usable decryption key is stored")]
    MissingKey,

    #[error("QR payload failed authentication")]
    DecryptionFailed,
}

/// Parse plaintext QR JSON
pub fn parse_plaintext(text: &str) -> Result<QrPayload, serde_json::Error> {
    serde_json::from_str(text)
}

/// Decode scanned QR text.
///
/// `key_lookup` returns the stored base64 `keyenc`; it is only consulted once
/// the text is known to be an encrypted payload.
pub fn decode<K>(raw: &str, key_lookup: K) -> Result<QrPayload, DecodeError>
where
    K: FnOnce() -> Option<String>,
{
    match parse_plaintext(raw) {
        Ok(payload) => Ok(payload),
        Err(plain_err) => {
            tracing::debug!("QR text is not plaintext JSON ({}), trying decryption", plain_err);
            decrypt_payload(raw, key_lookup)
        }
    }
}

/// Decode a scan against the stored credentials.
///
/// A non-blank UDI from the QR is remembered as the `udi` credential; a blank
/// one is filled from it. Failing to store the UDI is logged, not returned.
pub fn decode_scanned(raw: &str, credentials: &dyn CredentialStore) -> Result<QrPayload, DecodeError> {
    let payload = decode(raw, || credentials.get_keyenc())?;

    if let Some(udi) = payload.udi.as_deref().filter(|_| !payload.udi_is_blank()) {
        if let Err(e) = credentials.set(CredentialKey::Udi, udi) {
            tracing::warn!("{}: {}", ErrorType::FailedStoringUdi, e);
        }
    }

    Ok(backfill_udi(payload, || credentials.get(CredentialKey::Udi)))
}

/// Replace a blank UDI with the stored one
pub fn backfill_udi<F>(mut payload: QrPayload, stored_udi: F) -> QrPayload
where
    F: FnOnce() -> String,
{
    if payload.udi_is_blank() {
        payload.udi = Some(stored_udi());
    }
    payload
}

fn decrypt_payload<K>(raw: &str, key_lookup: K) -> Result<QrPayload, DecodeError>
where
    K: FnOnce() -> Option<String>,
{
    let data = STANDARD
        .decode(raw.trim())
        .map_err(|e| DecodeError::BadPayload(format!("not base64: {e}")))?;

    if data.len() < NONCE_LEN {
        return Err(DecodeError::BadPayload(format!(
            "{} bytes is shorter than the nonce",
            data.len()
        )));
    }

    let key = key_lookup()
        .as_deref()
        .and_then(decode_key)
        .ok_or(DecodeError::MissingKey)?;

    let plaintext = open(&data, &key)?;
    let text = std::str::from_utf8(&plaintext)
        .map_err(|e| DecodeError::BadPayload(format!("decrypted payload is not UTF-8: {e}")))?;

    parse_plaintext(text).map_err(|e| DecodeError::BadPayload(format!("decrypted payload: {e}")))
}

/// Decode a base64 key. `None` unless it is exactly `KEY_LEN` bytes.
pub fn decode_key(encoded: &str) -> Option<[u8; KEY_LEN]> {
    let bytes = STANDARD.decode(encoded.trim()).ok()?;
    bytes.try_into().ok()
}

/// Encode a key for storage
pub fn encode_key(key: &[u8; KEY_LEN]) -> String {
    STANDARD.encode(key)
}

/// Generate a fresh random key
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Open `nonce || ciphertext+tag`
pub fn open(data: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>, DecodeError> {
    if data.len() < NONCE_LEN {
        return Err(DecodeError::BadPayload("missing nonce".to_string()));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);

    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| DecodeError::MissingKey)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| DecodeError::DecryptionFailed)
}

/// Seal `plaintext` under a random nonce, producing `nonce || ciphertext+tag`
pub fn seal(plaintext: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>, DecodeError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    seal_with_nonce(plaintext, key, &nonce)
}

/// Seal with a caller-chosen nonce. The nonce must never repeat under one key.
pub fn seal_with_nonce(
    plaintext: &[u8],
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
) -> Result<Vec<u8>, DecodeError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| DecodeError::MissingKey)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| DecodeError::DecryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Build the QR text for an encrypted payload
pub fn seal_to_text(json: &str, key: &[u8; KEY_LEN]) -> Result<String, DecodeError> {
    parse_plaintext(json).map_err(|e| DecodeError::BadPayload(e.to_string()))?;
    Ok(STANDARD.encode(seal(json.as_bytes(), key)?))
}
