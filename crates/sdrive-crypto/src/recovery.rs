//! Recovery secret and its BIP-39 mnemonic form
//!
//! At account creation a 256-bit recovery secret is generated and shown to
//! the user once as a 24-word BIP-39 mnemonic. It unwraps the recovery copy
//! of the MAK if the password is lost. The mnemonic is never stored
//! digitally; the user writes it down.

use bip39::Mnemonic;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::derive_recovery_kek;
use crate::keys::SecretKey;
use crate::provider::CryptoProvider;

/// Recovery secret length: 24 words = 256 bits of entropy.
pub const RECOVERY_SECRET_SIZE: usize = 32;

/// 256 random bits. Zeroized on drop.
#[derive(Clone, Zeroize)]
pub struct RecoverySecret {
    bytes: [u8; RECOVERY_SECRET_SIZE],
}

impl RecoverySecret {
    pub fn generate(provider: &dyn CryptoProvider) -> Self {
        let mut bytes = [0u8; RECOVERY_SECRET_SIZE];
        provider.fill_random(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; RECOVERY_SECRET_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; RECOVERY_SECRET_SIZE] {
        &self.bytes
    }

    /// Render as a 24-word mnemonic for display.
    pub fn to_mnemonic(&self) -> CryptoResult<Zeroizing<String>> {
        let mnemonic = Mnemonic::from_entropy(&self.bytes)
            .map_err(|e| CryptoError::contract(format!("BIP-39 encoding failed: {e}")))?;
        Ok(Zeroizing::new(mnemonic.to_string()))
    }

    /// Parse a mnemonic typed back by the user. The BIP-39 checksum is
    /// verified; extra whitespace and case are normalised.
    pub fn from_mnemonic(words: &str) -> CryptoResult<Self> {
        let normalized = Zeroizing::new(
            words
                .split_whitespace()
                .map(str::to_lowercase)
                .collect::<Vec<_>>()
                .join(" "),
        );
        let mnemonic: Mnemonic = normalized
            .parse()
            .map_err(|e| CryptoError::contract(format!("invalid recovery mnemonic: {e}")))?;

        let mut entropy = mnemonic.to_entropy();
        let result = if entropy.len() == RECOVERY_SECRET_SIZE {
            let mut bytes = [0u8; RECOVERY_SECRET_SIZE];
            bytes.copy_from_slice(&entropy);
            Ok(Self { bytes })
        } else {
            Err(CryptoError::contract(format!(
                "recovery mnemonic must have 24 words, got {}",
                mnemonic.word_count()
            )))
        };
        entropy.zeroize();
        result
    }

    /// The recovery KEK this secret derives.
    pub fn kek(&self) -> CryptoResult<SecretKey> {
        derive_recovery_kek(&self.bytes)
    }
}

impl Drop for RecoverySecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for RecoverySecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RecoverySecret([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::AesGcmProvider;

    #[test]
    fn test_generate_mnemonic() {
        let secret = RecoverySecret::generate(&AesGcmProvider::new());
        let words = secret.to_mnemonic().unwrap();

        let word_count = words.split_whitespace().count();
        assert_eq!(word_count, 24, "BIP-39 mnemonic must have 24 words");
        assert_ne!(secret.as_bytes(), &[0u8; 32], "secret must not be all zeros");
    }

    #[test]
    fn test_mnemonic_recovery_roundtrip() {
        let secret = RecoverySecret::generate(&AesGcmProvider::new());
        let words = secret.to_mnemonic().unwrap();

        let recovered = RecoverySecret::from_mnemonic(&words).unwrap();
        assert_eq!(
            secret.as_bytes(),
            recovered.as_bytes(),
            "recovered secret must match original"
        );
    }

    #[test]
    fn test_mnemonic_whitespace_and_case_tolerated() {
        let secret = RecoverySecret::from_bytes([7u8; 32]);
        let words = secret.to_mnemonic().unwrap();
        let messy = format!("  {}\n", words.to_uppercase().replace(' ', "   "));

        let recovered = RecoverySecret::from_mnemonic(&messy).unwrap();
        assert_eq!(recovered.as_bytes(), secret.as_bytes());
    }

    #[test]
    fn test_invalid_mnemonic() {
        let result = RecoverySecret::from_mnemonic("not a valid mnemonic at all");
        assert!(matches!(result, Err(CryptoError::Contract(_))));
    }

    #[test]
    fn test_short_mnemonic_rejected() {
        // Valid 12-word BIP-39 phrase (128-bit entropy)
        let twelve = Mnemonic::from_entropy(&[1u8; 16]).unwrap().to_string();
        assert!(matches!(
            RecoverySecret::from_mnemonic(&twelve),
            Err(CryptoError::Contract(_))
        ));
    }

    #[test]
    fn test_different_secrets_different_keks() {
        let p = AesGcmProvider::new();
        let kek1 = RecoverySecret::generate(&p).kek().unwrap();
        let kek2 = RecoverySecret::generate(&p).kek().unwrap();

        assert_ne!(
            kek1.as_bytes(),
            kek2.as_bytes(),
            "different secrets must produce different KEKs"
        );
    }
}
