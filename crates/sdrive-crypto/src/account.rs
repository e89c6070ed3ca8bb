//! Account bootstrap and MAK re-wrapping.
//!
//! A new account gets a random MAK, a random recovery secret, and a
//! keybundle holding the MAK wrapped twice: under the password KEK and
//! under the recovery KEK.

use secrecy::SecretString;
use tracing::info;

use sdrive_core::types::{Keybundle, KDF_VERSION};

use crate::aad;
use crate::error::CryptoResult;
use crate::kdf::{derive_unlock_kek, KdfParams};
use crate::keys::{wrap_key, SecretKey};
use crate::provider::CryptoProvider;
use crate::recovery::RecoverySecret;
use crate::SALT_SIZE;

/// Everything produced at account creation.
///
/// `bundle` goes to the backend. `recovery` is shown to the user once and
/// then dropped. `mak` can seed an unlocked keyring directly.
#[derive(Debug)]
pub struct NewAccount {
    pub bundle: Keybundle,
    pub recovery: RecoverySecret,
    pub mak: SecretKey,
}

/// Create the key material for a new account.
pub async fn create_account(
    provider: &dyn CryptoProvider,
    user_id: &str,
    password: &SecretString,
    params: &KdfParams,
) -> CryptoResult<NewAccount> {
    params.validate()?;
    // Fail on a bad user id before spending an Argon2 run
    aad::mak_aad(user_id)?;

    let mut user_salt = [0u8; SALT_SIZE];
    provider.fill_random(&mut user_salt);
    let mak = SecretKey::generate(provider);
    let recovery = RecoverySecret::generate(provider);

    let wrapped_mak_password =
        wrap_mak_for_password(provider, user_id, &user_salt, &mak, password, params).await?;
    let wrapped_mak_recovery = wrap_mak_for_recovery(provider, user_id, &mak, &recovery)?;

    info!(user_id, "created account key material");

    Ok(NewAccount {
        bundle: Keybundle {
            user_id: user_id.to_string(),
            user_salt,
            wrapped_mak_password,
            wrapped_mak_recovery,
            kdf_version: KDF_VERSION,
        },
        recovery,
        mak,
    })
}

/// Wrap the MAK under the KEK derived from `password` and `user_salt`.
pub async fn wrap_mak_for_password(
    provider: &dyn CryptoProvider,
    user_id: &str,
    user_salt: &[u8; SALT_SIZE],
    mak: &SecretKey,
    password: &SecretString,
    params: &KdfParams,
) -> CryptoResult<Vec<u8>> {
    let aad = aad::mak_aad(user_id)?;
    let kek = derive_unlock_kek(password, user_salt, params).await?;
    wrap_key(provider, &kek, mak, aad.as_bytes())
}

/// Wrap the MAK under the KEK derived from a recovery secret.
pub fn wrap_mak_for_recovery(
    provider: &dyn CryptoProvider,
    user_id: &str,
    mak: &SecretKey,
    recovery: &RecoverySecret,
) -> CryptoResult<Vec<u8>> {
    let aad = aad::mak_recovery_aad(user_id)?;
    let kek = recovery.kek()?;
    wrap_key(provider, &kek, mak, aad.as_bytes())
}

/// New keybundle with the MAK re-wrapped under `new_password`.
///
/// The user salt and the recovery wrap are carried over unchanged.
pub async fn rewrap_mak_password(
    provider: &dyn CryptoProvider,
    bundle: &Keybundle,
    mak: &SecretKey,
    new_password: &SecretString,
    params: &KdfParams,
) -> CryptoResult<Keybundle> {
    let wrapped_mak_password = wrap_mak_for_password(
        provider,
        &bundle.user_id,
        &bundle.user_salt,
        mak,
        new_password,
        params,
    )
    .await?;

    Ok(Keybundle {
        wrapped_mak_password,
        kdf_version: KDF_VERSION,
        ..bundle.clone()
    })
}

/// New keybundle with the MAK re-wrapped under a fresh recovery secret.
pub fn rewrap_mak_recovery(
    provider: &dyn CryptoProvider,
    bundle: &Keybundle,
    mak: &SecretKey,
) -> CryptoResult<(Keybundle, RecoverySecret)> {
    let recovery = RecoverySecret::generate(provider);
    let wrapped_mak_recovery = wrap_mak_for_recovery(provider, &bundle.user_id, mak, &recovery)?;
    Ok((
        Keybundle {
            wrapped_mak_recovery,
            ..bundle.clone()
        },
        recovery,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CryptoError;
    use crate::keys::unwrap_key;
    use crate::provider::AesGcmProvider;
    use crate::KEY_SIZE;

    fn fast_params() -> KdfParams {
        KdfParams {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
            output_len: KEY_SIZE,
        }
    }

    #[tokio::test]
    async fn test_create_account_wraps_mak_twice() {
        let p = AesGcmProvider::new();
        let password = SecretString::from("correct horse");
        let account = create_account(&p, "user-1", &password, &fast_params())
            .await
            .unwrap();

        assert_eq!(account.bundle.user_id, "user-1");
        assert_eq!(account.bundle.kdf_version, KDF_VERSION);
        assert_ne!(
            account.bundle.wrapped_mak_password,
            account.bundle.wrapped_mak_recovery
        );

        let kek = derive_unlock_kek(&password, &account.bundle.user_salt, &fast_params())
            .await
            .unwrap();
        let aad = aad::mak_aad("user-1").unwrap();
        let wrapped = &account.bundle.wrapped_mak_password;
        let mak = unwrap_key(&p, &kek, wrapped, aad.as_bytes()).unwrap();
        assert_eq!(mak.as_bytes(), account.mak.as_bytes());

        let rkek = account.recovery.kek().unwrap();
        let raad = aad::mak_recovery_aad("user-1").unwrap();
        let wrapped = &account.bundle.wrapped_mak_recovery;
        let mak = unwrap_key(&p, &rkek, wrapped, raad.as_bytes()).unwrap();
        assert_eq!(mak.as_bytes(), account.mak.as_bytes());
    }

    #[tokio::test]
    async fn test_password_and_recovery_wraps_are_not_interchangeable() {
        let p = AesGcmProvider::new();
        let account = create_account(&p, "u", &SecretString::from("pw"), &fast_params())
            .await
            .unwrap();

        // The recovery wrap must not open under the password-path AAD
        let rkek = account.recovery.kek().unwrap();
        let aad = aad::mak_aad("u").unwrap();
        let result = unwrap_key(&p, &rkek, &account.bundle.wrapped_mak_recovery, aad.as_bytes());
        assert!(matches!(result, Err(CryptoError::Authentication)));
    }

    #[tokio::test]
    async fn test_create_account_rejects_bad_user_id() {
        let p = AesGcmProvider::new();
        let result = create_account(&p, "a|b", &SecretString::from("pw"), &fast_params()).await;
        assert!(matches!(result, Err(CryptoError::Contract(_))));
    }

    #[tokio::test]
    async fn test_rewrap_password_keeps_salt_and_recovery() {
        let p = AesGcmProvider::new();
        let account = create_account(&p, "u", &SecretString::from("old"), &fast_params())
            .await
            .unwrap();

        let new_bundle = rewrap_mak_password(
            &p,
            &account.bundle,
            &account.mak,
            &SecretString::from("new"),
            &fast_params(),
        )
        .await
        .unwrap();

        assert_eq!(new_bundle.user_salt, account.bundle.user_salt);
        assert_eq!(new_bundle.wrapped_mak_recovery, account.bundle.wrapped_mak_recovery);
        assert_ne!(new_bundle.wrapped_mak_password, account.bundle.wrapped_mak_password);
    }

    #[tokio::test]
    async fn test_rewrap_recovery_replaces_secret() {
        let p = AesGcmProvider::new();
        let account = create_account(&p, "u", &SecretString::from("pw"), &fast_params())
            .await
            .unwrap();

        let (bundle, recovery) = rewrap_mak_recovery(&p, &account.bundle, &account.mak).unwrap();
        assert_ne!(recovery.as_bytes(), account.recovery.as_bytes());
        assert_eq!(bundle.wrapped_mak_password, account.bundle.wrapped_mak_password);

        let aad = aad::mak_recovery_aad("u").unwrap();
        let old = unwrap_key(
            &p,
            &account.recovery.kek().unwrap(),
            &bundle.wrapped_mak_recovery,
            aad.as_bytes(),
        );
        assert!(old.is_err());
    }
}
