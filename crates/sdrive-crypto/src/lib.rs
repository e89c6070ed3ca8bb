//! sdrive-crypto: zero-knowledge key hierarchy and streaming chunk encryption
//!
//! The storage backend only ever sees wrapped keys and ciphertext.
//!
//! Key hierarchy:
//! ```text
//! password ──Argon2id(user_salt)──HKDF──► unlock KEK ─┐
//! recovery secret ─────────────HKDF──► recovery KEK ──┤ unwrap
//!                                                     ▼
//!                         Master Account Key (MAK, 256-bit random)
//!                           └── root Folder Key (FoK)       AAD = SD:FoK|v1|user|folder|parent:null|kv
//!                                 └── child FoK ...         AAD = SD:FoK|v1|user|folder|parent|kv
//!                                       └── File Master Key AAD = SD:FMK|v1|user|file|folder|kv
//!                                             └── DEK = HKDF(FMK, "SD:DEK|v1|file|version"), never stored
//! ```
//!
//! Content is AES-256-GCM in fixed-size chunks. Nonces are derived, not
//! random, so a retried chunk re-encrypts to identical bytes:
//! ```text
//! nonce_base = HKDF(ikm=key, salt=enc_stream_id, info="SD:C1:nonceBase")
//! nonce[i]   = HKDF(ikm=nonce_base, salt=be32(i), info="SD:C1:nonce")
//! package[i] = nonce(12) || tag(16) || ciphertext
//! ```
//!
//! Every wrapped key is an `SDEN` envelope (see [`envelope`]).

pub mod aad;
pub mod account;
pub mod bytes;
pub mod chunk;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod keyring;
pub mod keys;
pub mod manifest;
pub mod provider;
pub mod recovery;
pub mod seal;
pub mod source;
pub mod stream;

pub use account::{create_account, NewAccount};
pub use chunk::{ChunkCipher, EncryptedChunk, StreamParams};
pub use envelope::{Algorithm, Envelope, EnvelopeError, EnvelopeKind};
pub use error::{CryptoError, CryptoResult};
pub use kdf::{derive_argon2, hkdf_expand, hkdf_extract, KdfParams};
pub use keyring::Keyring;
pub use keys::{derive_dek, unwrap_key, wrap_key, SecretKey};
pub use manifest::StreamManifest;
pub use provider::{AesGcmProvider, CryptoProvider};
pub use recovery::RecoverySecret;
pub use seal::{open_data, seal_data};
pub use source::{FolderSource, InMemoryFolders};
pub use stream::{DecryptPipeline, DecryptedChunk};

/// Size of every symmetric key in the hierarchy (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag (128-bit)
pub const TAG_SIZE: usize = 16;

/// Size of the per-account Argon2id salt
pub const SALT_SIZE: usize = 16;
