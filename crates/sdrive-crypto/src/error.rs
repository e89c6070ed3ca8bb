use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors surfaced by the key hierarchy and chunk cipher.
///
/// Authentication failures are deliberately opaque: a wrong key, a tampered
/// ciphertext, a mismatched AAD and a malformed envelope all produce
/// [`CryptoError::Authentication`].
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Caller broke an API precondition (key length, chunk length, metadata shape)
    #[error("contract violation: {0}")]
    Contract(String),

    #[error("keyring is not unlocked")]
    NotUnlocked,

    #[error("decryption/authentication failed")]
    Authentication,

    /// Unlock failed; wrong secret and corrupted bundle look the same
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("encrypted stream ended early at chunk {chunk_index}: needed {needed} bytes, got {available}")]
    StreamEndedEarly {
        chunk_index: u32,
        needed: usize,
        available: usize,
    },

    #[error("byte source error: {0}")]
    Source(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("folder hierarchy cycle detected at {0}")]
    FolderCycle(String),

    #[error("metadata lookup failed: {0}")]
    Metadata(#[source] anyhow::Error),
}

impl CryptoError {
    pub(crate) fn contract(msg: impl Into<String>) -> Self {
        Self::Contract(msg.into())
    }

    /// Transport errors are worth retrying from the same chunk index.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StreamEndedEarly { .. } | Self::Source(_))
    }
}
