//! Sealed blobs for user-held secrets.
//!
//! Ciphertext format: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! The envelope key is derived from `ENCRYPTION_MASTER_KEY` with
//! HKDF-SHA256, one subkey per purpose, so api-key blobs and infra
//! connection blobs never share a key.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{AppError, AppResult};

const NONCE_LEN: usize = 12;
const MIN_CIPHERTEXT_LEN: usize = NONCE_LEN + 16;

/// A 256-bit envelope key, zeroized on drop. Never exposed in Debug output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EnvelopeKey([u8; 32]);

impl std::fmt::Debug for EnvelopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeKey").field("bytes", &"[REDACTED]").finish()
    }
}

/// Derive the subkey for the given purpose from the process master key.
/// Returns `BackendUnavailable` when no master key is configured, so the
/// api-key feature degrades to "disabled" rather than panicking.
pub fn envelope_key(purpose: &str) -> AppResult<EnvelopeKey> {
    let master = crate::config::ENCRYPTION_MASTER_KEY
        .as_ref()
        .ok_or_else(|| {
            AppError::BackendUnavailable("ENCRYPTION_MASTER_KEY is not configured".into())
        })?;
    derive(master.as_bytes(), purpose)
}

fn derive(master: &[u8], purpose: &str) -> AppResult<EnvelopeKey> {
    let hk = Hkdf::<Sha256>::new(None, master);
    let mut okm = [0u8; 32];
    hk.expand(purpose.as_bytes(), &mut okm)
        .map_err(|_| AppError::Internal("hkdf expand failed".into()))?;
    Ok(EnvelopeKey(okm))
}

/// Seal plaintext with a fresh random nonce.
pub fn seal(key: &EnvelopeKey, plaintext: &[u8]) -> AppResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| AppError::Internal(format!("seal failed: {e}")))?;
    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(combined)
}

/// Open a blob produced by [`seal`]. Authentication failure (wrong key,
/// tampered blob) is an internal invariant violation, not caller input.
pub fn open(key: &EnvelopeKey, combined: &[u8]) -> AppResult<Vec<u8>> {
    if combined.len() < MIN_CIPHERTEXT_LEN {
        return Err(AppError::Internal("sealed blob too short".into()));
    }
    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| AppError::Internal(format!("open failed: {e}")))
}

/// Seal a `{provider → secret}` style string map as JSON.
pub fn seal_map(
    key: &EnvelopeKey,
    map: &std::collections::BTreeMap<String, String>,
) -> AppResult<Vec<u8>> {
    let plaintext = serde_json::to_vec(map)
        .map_err(|e| AppError::Internal(format!("serialize secret map: {e}")))?;
    seal(key, &plaintext)
}

/// Open a blob sealed by [`seal_map`].
pub fn open_map(
    key: &EnvelopeKey,
    blob: &[u8],
) -> AppResult<std::collections::BTreeMap<String, String>> {
    let plaintext = open(key, blob)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| AppError::Internal(format!("deserialize secret map: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn seal_open_round_trip() {
        let key = derive(b"test-master-key", "api-keys").unwrap();
        let blob = seal(&key, b"hello").unwrap();
        assert_ne!(blob, b"hello");
        assert_eq!(open(&key, &blob).unwrap(), b"hello");
    }

    #[test]
    fn distinct_purposes_derive_distinct_keys() {
        let a = derive(b"master", "api-keys").unwrap();
        let b = derive(b"master", "infra-connections").unwrap();
        let blob = seal(&a, b"secret").unwrap();
        assert!(open(&b, &blob).is_err());
    }

    #[test]
    fn tampered_blob_rejected() {
        let key = derive(b"master", "api-keys").unwrap();
        let mut blob = seal(&key, b"secret").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(open(&key, &blob).is_err());
    }

    #[test]
    fn short_blob_rejected() {
        let key = derive(b"master", "api-keys").unwrap();
        assert!(open(&key, &[0u8; 8]).is_err());
    }

    #[test]
    fn map_round_trip() {
        let key = derive(b"master", "api-keys").unwrap();
        let mut map = BTreeMap::new();
        map.insert("anthropic".to_string(), "sk-ant-xxx".to_string());
        map.insert("openai".to_string(), "sk-yyy".to_string());
        let blob = seal_map(&key, &map).unwrap();
        assert_eq!(open_map(&key, &blob).unwrap(), map);
    }
}
