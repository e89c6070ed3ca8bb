//! Key material type, key wrapping, and DEK derivation

use zeroize::Zeroize;

use crate::aad;
use crate::bytes::ct_eq;
use crate::envelope::EnvelopeKind;
use crate::error::{CryptoError, CryptoResult};
use crate::kdf;
use crate::provider::CryptoProvider;
use crate::seal::{open_envelope, seal_envelope};
use crate::KEY_SIZE;

/// HKDF-Extract salt for DEK derivation from an FMK.
pub const DEK_SALT: &[u8] = b"stormdrive:dek:salt:v1";

/// A 256-bit symmetric key (MAK, FoK, FMK, DEK or KEK). Zeroized on drop.
#[derive(Clone, Zeroize)]
pub struct SecretKey {
    bytes: [u8; KEY_SIZE],
}

impl SecretKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Copy a key out of a slice, rejecting anything that is not 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::contract(format!(
                "key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Fresh random key from the provider's CSPRNG.
    pub fn generate(provider: &dyn CryptoProvider) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        provider.fill_random(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        ct_eq(&self.bytes, &other.bytes)
    }
}

impl Eq for SecretKey {}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Wrap `raw_key` under `wrapping_key` as a `WRAPPED_KEY` envelope.
///
/// A fresh random nonce is used for every wrap.
pub fn wrap_key(
    provider: &dyn CryptoProvider,
    wrapping_key: &SecretKey,
    raw_key: &SecretKey,
    aad: &[u8],
) -> CryptoResult<Vec<u8>> {
    seal_envelope(
        provider,
        EnvelopeKind::WrappedKey,
        wrapping_key,
        raw_key.as_bytes(),
        aad,
        None,
    )
}

/// Unwrap a `WRAPPED_KEY` envelope produced by [`wrap_key`].
///
/// Wrong key, wrong AAD, wrong kind, wrong algorithm, and tampering all fail
/// with [`CryptoError::Authentication`].
pub fn unwrap_key(
    provider: &dyn CryptoProvider,
    wrapping_key: &SecretKey,
    envelope: &[u8],
    aad: &[u8],
) -> CryptoResult<SecretKey> {
    let mut plaintext = open_envelope(
        provider,
        EnvelopeKind::WrappedKey,
        wrapping_key,
        envelope,
        aad,
    )?;

    let key = SecretKey::from_slice(&plaintext).map_err(|_| {
        tracing::debug!(len = plaintext.len(), "unwrapped key has wrong size");
        CryptoError::Authentication
    });
    plaintext.zeroize();
    key
}

/// Derive the data encryption key for one file version.
///
/// `DEK = HKDF-Expand(HKDF-Extract(DEK_SALT, FMK), "SD:DEK|v1|file:<id>|version:<v>", 32)`
pub fn derive_dek(fmk: &SecretKey, file_id: &str, version: u32) -> CryptoResult<SecretKey> {
    let info = aad::dek_info(file_id, version)?;
    let prk = kdf::hkdf_extract(DEK_SALT, fmk.as_bytes());
    kdf::expand_key(&prk, info.as_bytes())
}
