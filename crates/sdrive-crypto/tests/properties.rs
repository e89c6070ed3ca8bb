//! Property tests: AAD binding of key wraps, envelope rejection, and
//! independence of the decrypt pipeline from source fragmentation.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;

use sdrive_crypto::envelope::MAGIC;
use sdrive_crypto::{
    open_data, seal_data, unwrap_key, wrap_key, AesGcmProvider, ChunkCipher, CryptoError,
    DecryptPipeline, Envelope, EnvelopeError, SecretKey, StreamParams,
};

fn key_strategy() -> impl Strategy<Value = SecretKey> {
    any::<[u8; 32]>().prop_map(SecretKey::from_bytes)
}

proptest! {
    #[test]
    fn wrap_roundtrip_and_aad_bit_flip(
        wrapping in key_strategy(),
        raw in key_strategy(),
        aad in proptest::collection::vec(any::<u8>(), 1..64),
        flip_at in any::<prop::sample::Index>(),
        flip_bit in 0u8..8,
    ) {
        let p = AesGcmProvider::new();
        let wrapped = wrap_key(&p, &wrapping, &raw, &aad).unwrap();

        let unwrapped = unwrap_key(&p, &wrapping, &wrapped, &aad).unwrap();
        prop_assert_eq!(unwrapped.as_bytes(), raw.as_bytes());

        let mut tampered = aad.clone();
        tampered[flip_at.index(aad.len())] ^= 1 << flip_bit;
        prop_assert!(matches!(
            unwrap_key(&p, &wrapping, &wrapped, &tampered),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn data_envelope_roundtrip(
        key in key_strategy(),
        payload in proptest::collection::vec(any::<u8>(), 0..2048),
        aad in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        let p = AesGcmProvider::new();
        let env = seal_data(&p, &key, &payload, &aad).unwrap();
        prop_assert_eq!(open_data(&p, &key, &env, &aad).unwrap(), payload);
    }

    #[test]
    fn envelope_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
        let _ = Envelope::decode(&bytes);
    }

    #[test]
    fn corrupted_magic_always_rejected(
        key in key_strategy(),
        payload in proptest::collection::vec(any::<u8>(), 0..64),
        pos in 0usize..4,
        replacement in any::<u8>(),
    ) {
        prop_assume!(replacement != MAGIC[pos]);
        let p = AesGcmProvider::new();
        let mut env = seal_data(&p, &key, &payload, b"").unwrap();
        env[pos] = replacement;
        prop_assert_eq!(Envelope::decode(&env), Err(EnvelopeError::BadMagic));
        prop_assert!(open_data(&p, &key, &env, b"").is_err());
    }

    #[test]
    fn pipeline_ignores_fragmentation(
        file_size in 0usize..3000,
        chunk_size in 1u32..600,
        fragment in 1usize..700,
    ) {
        let provider = Arc::new(AesGcmProvider::new());
        let key = SecretKey::from_bytes([0x11; 32]);
        let params =
            StreamParams::new("prop-stream", chunk_size, file_size as u64, "text/plain").unwrap();
        let plain: Vec<u8> = (0..file_size).map(|i| (i % 253) as u8).collect();

        let ciphertext = ChunkCipher::new(provider.clone(), &key, params.clone())
            .unwrap()
            .encrypt_all(&plain)
            .unwrap();
        let pieces: Vec<io::Result<Bytes>> = ciphertext
            .chunks(fragment)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let source = futures::stream::iter(pieces);
        let pipeline = DecryptPipeline::new(provider, &key, params, source).unwrap();
        let decrypted = tokio_test::block_on(pipeline.collect()).unwrap();
        prop_assert_eq!(decrypted, plain);
    }
}
