//! AEAD over envelopes: the single path every wrap/unwrap and generic data
//! encrypt/decrypt goes through.

use tracing::debug;

use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::SecretKey;
use crate::provider::CryptoProvider;

/// Encrypt `plaintext` into an encoded envelope of the given kind.
///
/// `nonce` is generated fresh unless the caller supplies one; only
/// deterministic content paths should ever pass `Some`.
pub fn seal_envelope(
    provider: &dyn CryptoProvider,
    kind: EnvelopeKind,
    key: &SecretKey,
    plaintext: &[u8],
    aad: &[u8],
    nonce: Option<&[u8]>,
) -> CryptoResult<Vec<u8>> {
    let algorithm = provider.algorithm();
    let nonce = match nonce {
        Some(n) => n.to_vec(),
        None => {
            let mut n = vec![0u8; algorithm.nonce_len()];
            provider.fill_random(&mut n);
            n
        }
    };

    let sealed = provider.seal(key, &nonce, plaintext, aad)?;
    Envelope {
        kind,
        algorithm,
        nonce,
        tag: sealed.tag.to_vec(),
        ciphertext: sealed.ciphertext,
    }
    .encode()
    .map_err(|e| CryptoError::contract(e.to_string()))
}

/// Decode and decrypt an envelope, checking kind and algorithm first.
///
/// Every failure (structure, kind, algorithm, tag) is reported as
/// [`CryptoError::Authentication`]; the specific reason is logged at debug.
pub fn open_envelope(
    provider: &dyn CryptoProvider,
    expected_kind: EnvelopeKind,
    key: &SecretKey,
    envelope: &[u8],
    aad: &[u8],
) -> CryptoResult<Vec<u8>> {
    let env = Envelope::decode_expecting(envelope, expected_kind).map_err(|e| {
        debug!(reason = %e, "envelope rejected");
        CryptoError::Authentication
    })?;

    if env.algorithm != provider.algorithm() {
        debug!(
            envelope = env.algorithm.name(),
            provider = provider.algorithm().name(),
            "envelope algorithm mismatch"
        );
        return Err(CryptoError::Authentication);
    }

    provider.open(key, &env.nonce, &env.ciphertext, &env.tag, aad)
}

/// Encrypt arbitrary bytes into a `DATA` envelope with a random nonce.
pub fn seal_data(
    provider: &dyn CryptoProvider,
    key: &SecretKey,
    plaintext: &[u8],
    aad: &[u8],
) -> CryptoResult<Vec<u8>> {
    seal_envelope(provider, EnvelopeKind::Data, key, plaintext, aad, None)
}

/// Decrypt a `DATA` envelope produced by [`seal_data`].
pub fn open_data(
    provider: &dyn CryptoProvider,
    key: &SecretKey,
    envelope: &[u8],
    aad: &[u8],
) -> CryptoResult<Vec<u8>> {
    open_envelope(provider, EnvelopeKind::Data, key, envelope, aad)
}
