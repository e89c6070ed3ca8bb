//! Key derivation: Argon2id for passwords, HKDF-SHA256 for everything else.
//!
//! ```text
//! KEK_unlock   = HKDF-Expand(HKDF-Extract(UNLOCK_SALT,   Argon2id(password, user_salt)), UNLOCK_INFO,   32)
//! KEK_recovery = HKDF-Expand(HKDF-Extract(RECOVERY_SALT, recovery_secret),               RECOVERY_INFO, 32)
//! ```

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use sdrive_core::config::CryptoConfig;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::SecretKey;
use crate::{KEY_SIZE, SALT_SIZE};

pub const UNLOCK_SALT: &[u8] = b"stormdrive:unlock:salt:v1";
pub const UNLOCK_INFO: &[u8] = b"stormdrive:unlock:kek:v1";
pub const RECOVERY_SALT: &[u8] = b"stormdrive:recovery:salt:v1";
pub const RECOVERY_INFO: &[u8] = b"stormdrive:recovery:kek:v1";

/// SHA-256 output length; HKDF-Expand produces at most 255 of these.
const HASH_LEN: usize = 32;

/// Argon2id parameters. Fixed configuration, never user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 1)
    pub parallelism: u32,
    /// Output length in bytes; must be 32
    pub output_len: usize,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 1,
            output_len: KEY_SIZE,
        }
    }
}

impl From<&CryptoConfig> for KdfParams {
    fn from(config: &CryptoConfig) -> Self {
        Self {
            mem_cost_kib: config.argon2_mem_cost_kib,
            time_cost: config.argon2_time_cost,
            parallelism: config.argon2_parallelism,
            output_len: KEY_SIZE,
        }
    }
}

impl KdfParams {
    /// Check the combination is one Argon2 accepts and yields a key.
    pub fn validate(&self) -> CryptoResult<Params> {
        if self.output_len != KEY_SIZE {
            return Err(CryptoError::Config(format!(
                "Argon2id output length must be {KEY_SIZE}, got {}",
                self.output_len
            )));
        }
        Params::new(
            self.mem_cost_kib,
            self.time_cost,
            self.parallelism,
            Some(self.output_len),
        )
        .map_err(|e| CryptoError::Config(format!("invalid Argon2id params: {e}")))
    }
}

/// Derive a 256-bit secret from a password and salt with Argon2id.
///
/// Deterministic in `(password, salt, params)`. CPU and memory heavy; async
/// callers should use [`derive_argon2_async`].
pub fn derive_argon2(
    password: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> CryptoResult<SecretKey> {
    argon2_raw(password.expose_secret().as_bytes(), salt, params)
}

fn argon2_raw(password: &[u8], salt: &[u8], params: &KdfParams) -> CryptoResult<SecretKey> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.validate()?);

    let mut out = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password, salt, &mut out)
        .map_err(|e| CryptoError::Config(format!("Argon2id KDF failed: {e}")))?;

    let key = SecretKey::from_bytes(out);
    out.zeroize();
    Ok(key)
}

/// [`derive_argon2`] on the blocking pool so other tasks keep running.
pub async fn derive_argon2_async(
    password: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> CryptoResult<SecretKey> {
    let password = Zeroizing::new(password.expose_secret().as_bytes().to_vec());
    let salt = salt.to_vec();
    let params = params.clone();

    tokio::task::spawn_blocking(move || argon2_raw(&password, &salt, &params))
        .await
        .map_err(|e| CryptoError::Config(format!("Argon2id worker failed: {e}")))?
}

/// HKDF pseudorandom key. Zeroized on drop.
pub struct Prk(Zeroizing<[u8; HASH_LEN]>);

impl Prk {
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for Prk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Prk([REDACTED])")
    }
}

/// HKDF-Extract(salt, ikm) = HMAC-SHA256(salt, ikm)
pub fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> Prk {
    let (mut prk, _) = Hkdf::<Sha256>::extract(Some(salt), ikm);
    let mut out = Zeroizing::new([0u8; HASH_LEN]);
    out.copy_from_slice(&prk);
    prk.as_mut_slice().zeroize();
    Prk(out)
}

/// HKDF-Expand(prk, info, length).
///
/// Output is built from 1-based blocks `T(i) = HMAC(prk, T(i-1) || info || i)`;
/// more than 255 blocks is a configuration error.
pub fn hkdf_expand(prk: &Prk, info: &[u8], length: usize) -> CryptoResult<Zeroizing<Vec<u8>>> {
    if length.div_ceil(HASH_LEN) > 255 {
        return Err(CryptoError::Config(format!(
            "HKDF output length {length} exceeds 255 blocks ({} bytes)",
            255 * HASH_LEN
        )));
    }

    let hkdf = Hkdf::<Sha256>::from_prk(prk.as_bytes())
        .map_err(|e| CryptoError::Config(format!("HKDF PRK rejected: {e}")))?;
    let mut okm = Zeroizing::new(vec![0u8; length]);
    hkdf.expand(info, &mut okm)
        .map_err(|e| CryptoError::Config(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// Extract-then-expand in one call.
pub fn hkdf_sha256(
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
    length: usize,
) -> CryptoResult<Zeroizing<Vec<u8>>> {
    hkdf_expand(&hkdf_extract(salt, ikm), info, length)
}

pub(crate) fn expand_key(prk: &Prk, info: &[u8]) -> CryptoResult<SecretKey> {
    let okm = hkdf_expand(prk, info, KEY_SIZE)?;
    SecretKey::from_slice(&okm)
}

/// Derive the password unlock KEK.
pub async fn derive_unlock_kek(
    password: &SecretString,
    user_salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> CryptoResult<SecretKey> {
    let client_secret = derive_argon2_async(password, user_salt, params).await?;
    expand_key(
        &hkdf_extract(UNLOCK_SALT, client_secret.as_bytes()),
        UNLOCK_INFO,
    )
}

/// Derive the recovery KEK from a high-entropy recovery secret.
///
/// No Argon2 here: the secret is 256 random bits, not a password.
pub fn derive_recovery_kek(recovery_secret: &[u8]) -> CryptoResult<SecretKey> {
    if recovery_secret.len() < SALT_SIZE {
        return Err(CryptoError::contract(format!(
            "recovery secret must be at least {SALT_SIZE} bytes, got {}",
            recovery_secret.len()
        )));
    }
    expand_key(&hkdf_extract(RECOVERY_SALT, recovery_secret), RECOVERY_INFO)
}
