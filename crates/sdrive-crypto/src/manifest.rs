//! Stream manifest: the out-of-band metadata that travels with an encrypted
//! upload so any reader can rebuild the chunk AAD, nonce schedule, and
//! chunk-count arithmetic.
//!
//! ```json
//! {
//!   "c1": { "schema": 1, "enc_stream_id": "...", "aead": "AES-256-GCM",
//!           "chunk_size": 4194304, "file_size": 2500, "file_type": "image/png",
//!           "nonce_mode": "hkdf-deterministic", "aad_format": "...", "nonce_format": "..." },
//!   "wrapped_fk": { "schema": 1, "aead": "AES-256-GCM", "aad_format": "...",
//!                   "folder_id": "docs", "wrapped_fk": "<base64url envelope>" }
//! }
//! ```
//!
//! The stream's content key is wrapped under the folder key with
//! `SD:WrapFK|v1|<enc_stream_id>|<folder_id or none>`.

use serde::{Deserialize, Serialize};

use sdrive_core::b64;

use crate::aad::{self, AAD_SCHEMA_VERSION};
use crate::chunk::StreamParams;
use crate::envelope::Algorithm;
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{unwrap_key, wrap_key, SecretKey};
use crate::provider::CryptoProvider;

pub const NONCE_MODE: &str = "hkdf-deterministic";
pub const CHUNK_AAD_FORMAT: &str =
    "SD:C1|v1|enc_stream_id|chunk_index|chunk_size|file_size|file_type";
pub const NONCE_FORMAT: &str = "nonceBase=HKDF(FK,salt=enc_stream_id,info=SD:C1:nonceBase); \
     nonce_i=HKDF(nonceBase,salt=chunk_index,info=SD:C1:nonce)";
pub const WRAP_AAD_FORMAT: &str = "SD:WrapFK|v1|enc_stream_id|folder_id";

/// How the stream's chunks were encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStreamSection {
    pub schema: u32,
    pub enc_stream_id: String,
    pub aead: String,
    pub chunk_size: u32,
    pub file_size: u64,
    pub file_type: String,
    pub nonce_mode: String,
    pub aad_format: String,
    pub nonce_format: String,
}

/// The stream's content key, wrapped under a folder key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKeySection {
    pub schema: u32,
    pub aead: String,
    pub aad_format: String,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(with = "b64::serde_bytes")]
    pub wrapped_fk: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamManifest {
    pub c1: ChunkStreamSection,
    pub wrapped_fk: WrappedKeySection,
}

impl StreamManifest {
    /// Describe `params` and wrap `content_key` under `folder_key`.
    pub fn seal(
        provider: &dyn CryptoProvider,
        params: &StreamParams,
        folder_id: Option<&str>,
        folder_key: &SecretKey,
        content_key: &SecretKey,
    ) -> CryptoResult<Self> {
        params.validate()?;
        let aead = provider.algorithm().name().to_string();
        let wrap_aad = aad::stream_key_aad(&params.enc_stream_id, folder_id)?;
        let wrapped_fk = wrap_key(provider, folder_key, content_key, wrap_aad.as_bytes())?;

        Ok(Self {
            c1: ChunkStreamSection {
                schema: AAD_SCHEMA_VERSION,
                enc_stream_id: params.enc_stream_id.clone(),
                aead: aead.clone(),
                chunk_size: params.chunk_size,
                file_size: params.file_size,
                file_type: params.file_type.clone(),
                nonce_mode: NONCE_MODE.to_string(),
                aad_format: CHUNK_AAD_FORMAT.to_string(),
                nonce_format: NONCE_FORMAT.to_string(),
            },
            wrapped_fk: WrappedKeySection {
                schema: AAD_SCHEMA_VERSION,
                aead,
                aad_format: WRAP_AAD_FORMAT.to_string(),
                folder_id: folder_id.map(str::to_string),
                wrapped_fk,
            },
        })
    }

    /// Check the manifest describes a stream this build can decrypt and
    /// return its parameters.
    pub fn stream_params(&self) -> CryptoResult<StreamParams> {
        let c1 = &self.c1;
        if c1.schema != AAD_SCHEMA_VERSION || self.wrapped_fk.schema != AAD_SCHEMA_VERSION {
            return Err(CryptoError::contract(format!(
                "unsupported manifest schema {}/{}",
                c1.schema, self.wrapped_fk.schema
            )));
        }
        for aead in [&c1.aead, &self.wrapped_fk.aead] {
            if Algorithm::from_name(aead).is_none() {
                return Err(CryptoError::contract(format!("unsupported aead: {aead}")));
            }
        }
        if c1.nonce_mode != NONCE_MODE {
            return Err(CryptoError::contract(format!(
                "unsupported nonce_mode: {}",
                c1.nonce_mode
            )));
        }
        if self.wrapped_fk.wrapped_fk.is_empty() {
            return Err(CryptoError::contract("manifest has no wrapped key"));
        }
        StreamParams::new(
            c1.enc_stream_id.clone(),
            c1.chunk_size,
            c1.file_size,
            c1.file_type.clone(),
        )
    }

    /// Unwrap the stream's content key under `folder_key`.
    pub fn open_content_key(
        &self,
        provider: &dyn CryptoProvider,
        folder_key: &SecretKey,
    ) -> CryptoResult<SecretKey> {
        let params = self.stream_params()?;
        let aead = &self.wrapped_fk.aead;
        if Algorithm::from_name(aead) != Some(provider.algorithm()) {
            tracing::debug!(aead = %aead, "manifest aead does not match provider");
            return Err(CryptoError::Authentication);
        }
        let wrap_aad =
            aad::stream_key_aad(&params.enc_stream_id, self.wrapped_fk.folder_id.as_deref())?;
        unwrap_key(
            provider,
            folder_key,
            &self.wrapped_fk.wrapped_fk,
            wrap_aad.as_bytes(),
        )
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| CryptoError::contract(format!("manifest serialization: {e}")))
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(data: &[u8]) -> CryptoResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| CryptoError::contract(format!("manifest deserialization: {e}")))
    }
}
