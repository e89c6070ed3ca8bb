//! Per-chunk AES-256-GCM encryption with deterministic nonces
//!
//! Encrypted chunk package (binary, no envelope header):
//! ```text
//! [12 bytes: nonce][16 bytes: GCM tag][N bytes: ciphertext]
//! AAD = "SD:C1|v1|" || enc_stream_id || "|" || be32(index) || be32(chunk_size) || file_size || "|" || file_type
//! ```
//!
//! Nonces are derived from the content key, stream id and chunk index, so a
//! retried chunk re-encrypts to identical bytes while two indices of one
//! stream never share a nonce. The AAD binds each chunk to its stream,
//! position, and file shape, preventing reordering and cross-stream splicing.

use std::sync::Arc;

use zeroize::Zeroizing;

use crate::aad::chunk_aad;
use crate::bytes::u32_be;
use crate::error::{CryptoError, CryptoResult};
use crate::kdf::hkdf_sha256;
use crate::keys::SecretKey;
use crate::provider::CryptoProvider;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Bytes a package adds on top of its plaintext: nonce + tag.
pub const PACKAGE_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

const NONCE_BASE_INFO: &[u8] = b"SD:C1:nonceBase";
const NONCE_INFO: &[u8] = b"SD:C1:nonce";

/// Shape of one encrypted upload stream. Everything here is bound into each
/// chunk's AAD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub enc_stream_id: String,
    pub chunk_size: u32,
    pub file_size: u64,
    pub file_type: String,
}

impl StreamParams {
    pub fn new(
        enc_stream_id: impl Into<String>,
        chunk_size: u32,
        file_size: u64,
        file_type: impl Into<String>,
    ) -> CryptoResult<Self> {
        let params = Self {
            enc_stream_id: enc_stream_id.into(),
            chunk_size,
            file_size,
            file_type: file_type.into(),
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> CryptoResult<()> {
        if self.enc_stream_id.is_empty() || self.enc_stream_id.contains('|') {
            return Err(CryptoError::contract(format!(
                "invalid enc_stream_id: {:?}",
                self.enc_stream_id
            )));
        }
        if self.chunk_size == 0 {
            return Err(CryptoError::contract("chunk_size must be positive"));
        }
        if self.file_type.is_empty() {
            return Err(CryptoError::contract("file_type must not be empty"));
        }
        if self.file_size.div_ceil(self.chunk_size as u64) > u32::MAX as u64 {
            return Err(CryptoError::contract(format!(
                "file of {} bytes needs more than 2^32 chunks of {}",
                self.file_size, self.chunk_size
            )));
        }
        if self.ciphertext_len().is_none() {
            return Err(CryptoError::contract(format!(
                "ciphertext for a {}-byte file overflows u64",
                self.file_size
            )));
        }
        Ok(())
    }

    /// Length of the whole package stream, if it fits in a u64.
    fn ciphertext_len(&self) -> Option<u64> {
        let overhead = self.total_chunks() as u64 * PACKAGE_OVERHEAD as u64;
        self.file_size.checked_add(overhead)
    }

    /// `ceil(file_size / chunk_size)`; an empty file has no chunks.
    pub fn total_chunks(&self) -> u32 {
        self.file_size.div_ceil(self.chunk_size as u64) as u32
    }

    /// Plaintext length of chunk `index`: a full chunk, or the remainder for
    /// the last one.
    pub fn plaintext_len(&self, index: u32) -> CryptoResult<usize> {
        let total = self.total_chunks();
        if index >= total {
            return Err(CryptoError::contract(format!(
                "chunk index {index} out of range (stream has {total} chunks)"
            )));
        }
        let chunk_size = self.chunk_size as u64;
        let len = if index == total - 1 {
            self.file_size - chunk_size * (total as u64 - 1)
        } else {
            chunk_size
        };
        Ok(len as usize)
    }

    /// Encrypted package length of chunk `index`.
    pub fn package_len(&self, index: u32) -> CryptoResult<usize> {
        Ok(self.plaintext_len(index)? + PACKAGE_OVERHEAD)
    }

    /// Byte offset of chunk `index` in the concatenated package stream.
    ///
    /// `index == total_chunks()` gives the total ciphertext length.
    pub fn package_offset(&self, index: u32) -> CryptoResult<u64> {
        if index > self.total_chunks() {
            return Err(CryptoError::contract(format!(
                "chunk index {index} out of range (stream has {} chunks)",
                self.total_chunks()
            )));
        }
        if index == self.total_chunks() {
            return self
                .ciphertext_len()
                .ok_or_else(|| CryptoError::contract("ciphertext length overflows u64"));
        }
        (index as u64)
            .checked_mul(self.chunk_size as u64 + PACKAGE_OVERHEAD as u64)
            .ok_or_else(|| CryptoError::contract("package offset overflows u64"))
    }

    fn aad(&self, index: u32) -> CryptoResult<Vec<u8>> {
        chunk_aad(
            &self.enc_stream_id,
            index,
            self.chunk_size,
            self.file_size,
            &self.file_type,
        )
    }
}

/// `nonce_base = HKDF(ikm = key, salt = enc_stream_id, info = "SD:C1:nonceBase", 12)`
pub fn derive_nonce_base(key: &SecretKey, enc_stream_id: &str) -> CryptoResult<[u8; NONCE_SIZE]> {
    let okm = hkdf_sha256(
        key.as_bytes(),
        enc_stream_id.as_bytes(),
        NONCE_BASE_INFO,
        NONCE_SIZE,
    )?;
    let mut out = [0u8; NONCE_SIZE];
    out.copy_from_slice(&okm);
    Ok(out)
}

/// `nonce[i] = HKDF(ikm = nonce_base, salt = be32(i), info = "SD:C1:nonce", 12)`
pub fn derive_chunk_nonce(
    nonce_base: &[u8; NONCE_SIZE],
    chunk_index: u32,
) -> CryptoResult<[u8; NONCE_SIZE]> {
    let okm = hkdf_sha256(nonce_base, &u32_be(chunk_index), NONCE_INFO, NONCE_SIZE)?;
    let mut out = [0u8; NONCE_SIZE];
    out.copy_from_slice(&okm);
    Ok(out)
}

/// One encrypted chunk, split into its wire parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedChunk {
    pub index: u32,
    pub nonce: [u8; NONCE_SIZE],
    pub tag: [u8; TAG_SIZE],
    pub ciphertext: Vec<u8>,
}

impl EncryptedChunk {
    /// `nonce || tag || ciphertext`
    pub fn to_package(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKAGE_OVERHEAD + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Split a package into its parts. Only the minimum length is checked here;
    /// [`ChunkCipher::decrypt_chunk`] enforces the exact length for the index.
    pub fn from_package(index: u32, package: &[u8]) -> CryptoResult<Self> {
        if package.len() < PACKAGE_OVERHEAD {
            tracing::debug!(
                chunk_index = index,
                len = package.len(),
                "chunk package shorter than nonce + tag"
            );
            return Err(CryptoError::Authentication);
        }
        let (nonce, rest) = package.split_at(NONCE_SIZE);
        let (tag, ciphertext) = rest.split_at(TAG_SIZE);

        let mut n = [0u8; NONCE_SIZE];
        n.copy_from_slice(nonce);
        let mut t = [0u8; TAG_SIZE];
        t.copy_from_slice(tag);
        Ok(Self {
            index,
            nonce: n,
            tag: t,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Encrypts and decrypts the chunks of one stream under one content key.
///
/// Chunks are independent: different indices may be processed concurrently
/// on clones of the same cipher; callers reassemble by index.
#[derive(Clone)]
pub struct ChunkCipher {
    provider: Arc<dyn CryptoProvider>,
    key: SecretKey,
    params: StreamParams,
    nonce_base: Zeroizing<[u8; NONCE_SIZE]>,
}

impl std::fmt::Debug for ChunkCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCipher")
            .field("params", &self.params)
            .field("algorithm", &self.provider.algorithm())
            .finish_non_exhaustive()
    }
}

impl ChunkCipher {
    pub fn new(
        provider: Arc<dyn CryptoProvider>,
        key: &SecretKey,
        params: StreamParams,
    ) -> CryptoResult<Self> {
        params.validate()?;
        let nonce_base = Zeroizing::new(derive_nonce_base(key, &params.enc_stream_id)?);
        Ok(Self {
            provider,
            key: key.clone(),
            params,
            nonce_base,
        })
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn total_chunks(&self) -> u32 {
        self.params.total_chunks()
    }

    pub fn chunk_nonce(&self, index: u32) -> CryptoResult<[u8; NONCE_SIZE]> {
        derive_chunk_nonce(&self.nonce_base, index)
    }

    /// Encrypt chunk `index`. The plaintext must be exactly
    /// [`StreamParams::plaintext_len`] bytes.
    pub fn encrypt_chunk(&self, index: u32, plaintext: &[u8]) -> CryptoResult<EncryptedChunk> {
        let expected = self.params.plaintext_len(index)?;
        if plaintext.len() != expected {
            return Err(CryptoError::contract(format!(
                "chunk {index} must be {expected} bytes, got {}",
                plaintext.len()
            )));
        }

        let nonce = self.chunk_nonce(index)?;
        let aad = self.params.aad(index)?;
        let sealed = self.provider.seal(&self.key, &nonce, plaintext, &aad)?;

        Ok(EncryptedChunk {
            index,
            nonce,
            tag: sealed.tag,
            ciphertext: sealed.ciphertext,
        })
    }

    /// Verify and decrypt one `nonce || tag || ciphertext` package.
    pub fn decrypt_chunk(&self, index: u32, package: &[u8]) -> CryptoResult<Vec<u8>> {
        let expected = self.params.package_len(index)?;
        if package.len() != expected {
            tracing::debug!(
                chunk_index = index,
                len = package.len(),
                expected,
                "chunk package has wrong length"
            );
            return Err(CryptoError::Authentication);
        }

        let chunk = EncryptedChunk::from_package(index, package)?;
        let aad = self.params.aad(index)?;
        self.provider
            .open(&self.key, &chunk.nonce, &chunk.ciphertext, &chunk.tag, &aad)
            .inspect_err(|_| {
                tracing::debug!(
                    chunk_index = index,
                    stream = %self.params.enc_stream_id,
                    "chunk authentication failed"
                )
            })
    }

    /// Encrypt a whole buffer into the concatenated package stream.
    pub fn encrypt_all(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        if plaintext.len() as u64 != self.params.file_size {
            return Err(CryptoError::contract(format!(
                "buffer is {} bytes but stream declares {}",
                plaintext.len(),
                self.params.file_size
            )));
        }

        let total = self.total_chunks();
        let mut out = Vec::with_capacity(self.params.package_offset(total)? as usize);
        let chunk_size = self.params.chunk_size as usize;
        for (index, piece) in (0..total).zip(plaintext.chunks(chunk_size)) {
            out.extend_from_slice(&self.encrypt_chunk(index, piece)?.to_package());
        }
        Ok(out)
    }
}
