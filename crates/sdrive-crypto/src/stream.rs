//! Pull-based decryption of a chunk package stream (resumable download).
//!
//! The byte source may deliver arbitrary fragments. [`ExactReader`] buffers
//! them until a whole package for the current index is available, then the
//! chunk is verified and yielded before anything else is read. The first
//! error of any kind ends the pipeline.

use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tracing::debug;

use crate::aad;
use crate::chunk::{ChunkCipher, StreamParams};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{unwrap_key, SecretKey};
use crate::manifest::StreamManifest;
use crate::provider::CryptoProvider;

/// Most `collect` reserves before any chunk has authenticated.
const COLLECT_RESERVE_LIMIT: usize = 8 * 1024 * 1024;

/// Reads exact-length frames from a fragmented byte stream.
#[derive(Debug)]
pub struct ExactReader<S> {
    source: S,
    buf: BytesMut,
    exhausted: bool,
}

impl<S> ExactReader<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    pub fn new(source: S) -> Self {
        Self {
            source,
            buf: BytesMut::new(),
            exhausted: false,
        }
    }

    /// Next `n` bytes, or `None` if the source ended first. Bytes read before
    /// the end stay buffered.
    pub async fn read_exact(&mut self, n: usize) -> io::Result<Option<Bytes>> {
        while self.buf.len() < n {
            if self.exhausted {
                return Ok(None);
            }
            match self.source.next().await {
                Some(Ok(piece)) => self.buf.extend_from_slice(&piece),
                Some(Err(e)) => return Err(e),
                None => self.exhausted = true,
            }
        }
        Ok(Some(self.buf.split_to(n).freeze()))
    }

    /// Bytes received but not yet handed out.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// One verified plaintext chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedChunk {
    pub index: u32,
    pub plaintext: Vec<u8>,
}

/// Lazy, finite, non-restartable sequence of decrypted chunks.
///
/// To resume after a transport failure, build a fresh pipeline over a source
/// positioned at [`StreamParams::package_offset`] and call
/// [`DecryptPipeline::with_start_index`].
pub struct DecryptPipeline<S> {
    cipher: ChunkCipher,
    reader: ExactReader<S>,
    next_index: u32,
    finished: bool,
}

impl<S> std::fmt::Debug for DecryptPipeline<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptPipeline")
            .field("cipher", &self.cipher)
            .field("next_index", &self.next_index)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<S> DecryptPipeline<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    /// Pipeline over a content key the caller already holds.
    pub fn new(
        provider: Arc<dyn CryptoProvider>,
        key: &SecretKey,
        params: StreamParams,
        source: S,
    ) -> CryptoResult<Self> {
        Ok(Self {
            cipher: ChunkCipher::new(provider, key, params)?,
            reader: ExactReader::new(source),
            next_index: 0,
            finished: false,
        })
    }

    /// Unwrap a per-stream wrapped content key under `folder_key` once, then
    /// build the pipeline.
    pub fn from_wrapped(
        provider: Arc<dyn CryptoProvider>,
        params: StreamParams,
        wrapped_fk: &[u8],
        folder_id: Option<&str>,
        folder_key: &SecretKey,
        source: S,
    ) -> CryptoResult<Self> {
        let wrap_aad = aad::stream_key_aad(&params.enc_stream_id, folder_id)?;
        let content_key = unwrap_key(
            provider.as_ref(),
            folder_key,
            wrapped_fk,
            wrap_aad.as_bytes(),
        )?;
        Self::new(provider, &content_key, params, source)
    }

    /// Validate a stream manifest, unwrap its content key, and build the
    /// pipeline.
    pub fn from_manifest(
        provider: Arc<dyn CryptoProvider>,
        manifest: &StreamManifest,
        folder_key: &SecretKey,
        source: S,
    ) -> CryptoResult<Self> {
        let params = manifest.stream_params()?;
        let content_key = manifest.open_content_key(provider.as_ref(), folder_key)?;
        Self::new(provider, &content_key, params, source)
    }

    /// Start at chunk `index`; the source must begin at that chunk's package.
    pub fn with_start_index(mut self, index: u32) -> CryptoResult<Self> {
        let total = self.total_chunks();
        if index > total {
            return Err(CryptoError::contract(format!(
                "start index {index} past end of stream ({total} chunks)"
            )));
        }
        self.next_index = index;
        Ok(self)
    }

    pub fn params(&self) -> &StreamParams {
        self.cipher.params()
    }

    pub fn total_chunks(&self) -> u32 {
        self.cipher.total_chunks()
    }

    /// Index the next call to [`next_chunk`](Self::next_chunk) will yield.
    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    fn fail(&mut self, err: CryptoError) -> Option<CryptoResult<DecryptedChunk>> {
        self.finished = true;
        Some(Err(err))
    }

    /// Pull, verify, and return the next chunk. `None` once every chunk has
    /// been yielded or after the first error.
    pub async fn next_chunk(&mut self) -> Option<CryptoResult<DecryptedChunk>> {
        if self.finished {
            return None;
        }
        let index = self.next_index;
        if index >= self.total_chunks() {
            self.finished = true;
            debug!(
                stream = %self.params().enc_stream_id,
                chunks = self.total_chunks(),
                "decrypt pipeline finished"
            );
            return None;
        }

        let needed = match self.params().package_len(index) {
            Ok(len) => len,
            Err(e) => return self.fail(e),
        };
        let package = match self.reader.read_exact(needed).await {
            Ok(Some(package)) => package,
            Ok(None) => {
                let available = self.reader.buffered();
                debug!(chunk_index = index, needed, available, "byte source ended early");
                return self.fail(CryptoError::StreamEndedEarly {
                    chunk_index: index,
                    needed,
                    available,
                });
            }
            Err(e) => return self.fail(CryptoError::Source(e)),
        };

        match self.cipher.decrypt_chunk(index, &package) {
            Ok(plaintext) => {
                self.next_index += 1;
                Some(Ok(DecryptedChunk { index, plaintext }))
            }
            Err(e) => self.fail(e),
        }
    }

    /// Adapt into a `futures::Stream` of decrypted chunks.
    pub fn into_stream(self) -> impl Stream<Item = CryptoResult<DecryptedChunk>> {
        futures::stream::unfold(self, |mut pipeline| async move {
            let item = pipeline.next_chunk().await?;
            Some((item, pipeline))
        })
    }

    /// Decrypt every remaining chunk into one buffer.
    ///
    /// The declared file size is untrusted until chunks authenticate, so the
    /// up-front reservation is capped and the buffer grows as chunks arrive.
    pub async fn collect(mut self) -> CryptoResult<Vec<u8>> {
        let params = self.params();
        let start = (self.next_index as u64 * params.chunk_size as u64).min(params.file_size);
        let reserve = (params.file_size - start).min(COLLECT_RESERVE_LIMIT as u64);
        let mut out = Vec::with_capacity(reserve as usize);
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk?.plaintext);
        }
        Ok(out)
    }
}
