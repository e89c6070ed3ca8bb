//! AEAD + randomness backend, passed explicitly to the keyring and chunk cipher.
//!
//! Only AES-256-GCM ships. The trait exists so tests can count calls or feed
//! deterministic randomness without touching global state.

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use rand::RngCore;

use crate::envelope::Algorithm;
use crate::error::{CryptoError, CryptoResult};
use crate::keys::SecretKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Detached AEAD output.
#[derive(Debug, Clone)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

pub trait CryptoProvider: Send + Sync {
    /// The single AEAD this provider implements.
    fn algorithm(&self) -> Algorithm;

    /// Fill `buf` from a CSPRNG.
    fn fill_random(&self, buf: &mut [u8]);

    fn seal(
        &self,
        key: &SecretKey,
        nonce: &[u8],
        plaintext: &[u8],
        aad: &[u8],
    ) -> CryptoResult<Sealed>;

    /// Verify `tag` and decrypt. Fails with [`CryptoError::Authentication`]
    /// without exposing any plaintext.
    fn open(
        &self,
        key: &SecretKey,
        nonce: &[u8],
        ciphertext: &[u8],
        tag: &[u8],
        aad: &[u8],
    ) -> CryptoResult<Vec<u8>>;
}

/// AES-256-GCM via the RustCrypto `aes-gcm` crate, randomness from the
/// thread-local CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct AesGcmProvider;

impl AesGcmProvider {
    pub fn new() -> Self {
        Self
    }
}

impl CryptoProvider for AesGcmProvider {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Aes256Gcm
    }

    fn fill_random(&self, buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf);
    }

    fn seal(
        &self,
        key: &SecretKey,
        nonce: &[u8],
        plaintext: &[u8],
        aad: &[u8],
    ) -> CryptoResult<Sealed> {
        if nonce.len() != NONCE_SIZE {
            return Err(CryptoError::contract(format!(
                "AES-GCM nonce must be {NONCE_SIZE} bytes, got {}",
                nonce.len()
            )));
        }

        let cipher = Aes256Gcm::new(key.as_bytes().into());
        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(nonce), aad, &mut buffer)
            .map_err(|_| CryptoError::contract("AES-GCM plaintext too large"))?;

        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(&tag);
        Ok(Sealed {
            ciphertext: buffer,
            tag: tag_bytes,
        })
    }

    fn open(
        &self,
        key: &SecretKey,
        nonce: &[u8],
        ciphertext: &[u8],
        tag: &[u8],
        aad: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        // Length problems here come from attacker-controlled input, so they
        // are reported as authentication failures rather than contract errors.
        if nonce.len() != NONCE_SIZE || tag.len() != TAG_SIZE {
            tracing::debug!(
                nonce_len = nonce.len(),
                tag_len = tag.len(),
                "rejecting AEAD input with wrong nonce/tag length"
            );
            return Err(CryptoError::Authentication);
        }

        let cipher = Aes256Gcm::new(key.as_bytes().into());
        let mut buffer = ciphertext.to_vec();
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                aad,
                &mut buffer,
                Tag::from_slice(tag),
            )
            .map_err(|_| CryptoError::Authentication)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SecretKey {
        SecretKey::from_bytes([7u8; 32])
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let p = AesGcmProvider::new();
        let nonce = [1u8; NONCE_SIZE];

        let sealed = p.seal(&key(), &nonce, b"payload", b"aad").unwrap();
        assert_eq!(sealed.ciphertext.len(), 7);

        let opened = p
            .open(&key(), &nonce, &sealed.ciphertext, &sealed.tag, b"aad")
            .unwrap();
        assert_eq!(opened, b"payload");
    }

    #[test]
    fn test_open_wrong_aad_fails() {
        let p = AesGcmProvider::new();
        let nonce = [1u8; NONCE_SIZE];
        let sealed = p.seal(&key(), &nonce, b"payload", b"aad-a").unwrap();

        let result = p.open(&key(), &nonce, &sealed.ciphertext, &sealed.tag, b"aad-b");
        assert!(matches!(result, Err(CryptoError::Authentication)));
    }

    #[test]
    fn test_open_tampered_tag_fails() {
        let p = AesGcmProvider::new();
        let nonce = [1u8; NONCE_SIZE];
        let mut sealed = p.seal(&key(), &nonce, b"payload", b"").unwrap();
        sealed.tag[0] ^= 0x01;

        let result = p.open(&key(), &nonce, &sealed.ciphertext, &sealed.tag, b"");
        assert!(matches!(result, Err(CryptoError::Authentication)));
    }

    #[test]
    fn test_seal_rejects_wrong_nonce_length() {
        let p = AesGcmProvider::new();
        let result = p.seal(&key(), &[0u8; 24], b"x", b"");
        assert!(matches!(result, Err(CryptoError::Contract(_))));
    }

    #[test]
    fn test_open_short_tag_is_authentication_error() {
        let p = AesGcmProvider::new();
        let result = p.open(&key(), &[0u8; NONCE_SIZE], b"x", &[0u8; 8], b"");
        assert!(matches!(result, Err(CryptoError::Authentication)));
    }

    #[test]
    fn test_fill_random_differs() {
        let p = AesGcmProvider::new();
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        p.fill_random(&mut a);
        p.fill_random(&mut b);
        assert_ne!(a, b);
    }
}
