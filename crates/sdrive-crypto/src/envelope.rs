//! Portable binary envelope for one sealed value (ciphertext or wrapped key).
//!
//! ```text
//! ┌──────────┬─────┬──────┬─────┬──────────┬────────┬───────┬─────┬────────────┐
//! │ "SDEN"   │ VER │ KIND │ ALG │ NONCE_LEN│ TAG_LEN│ NONCE │ TAG │ CIPHERTEXT │
//! │ 4 bytes  │  1  │  1   │  1  │    1     │   1    │   n   │  t  │  remaining │
//! └──────────┴─────┴──────┴─────┴──────────┴────────┴───────┴─────┴────────────┘
//! ```
//!
//! Decoding fails closed on any structural mismatch. The header is not part
//! of the AEAD input; kind and algorithm are re-checked by [`crate::seal`].

use thiserror::Error;

/// `"SDEN"`
pub const MAGIC: [u8; 4] = *b"SDEN";

/// Current envelope format version.
pub const VERSION: u8 = 0x01;

/// Fixed header length before the nonce.
pub const HEADER_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Data,
    WrappedKey,
}

impl EnvelopeKind {
    pub fn code(self) -> u8 {
        match self {
            EnvelopeKind::Data => 1,
            EnvelopeKind::WrappedKey => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(EnvelopeKind::Data),
            2 => Some(EnvelopeKind::WrappedKey),
            _ => None,
        }
    }
}

/// Supported AEAD algorithms. Exactly one today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// 256-bit key, 96-bit nonce, 128-bit tag
    Aes256Gcm,
}

impl Algorithm {
    pub fn code(self) -> u8 {
        match self {
            Algorithm::Aes256Gcm => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Algorithm::Aes256Gcm),
            _ => None,
        }
    }

    /// Name used in JSON metadata (`"AES-256-GCM"`).
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Aes256Gcm => "AES-256-GCM",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "AES-256-GCM" => Some(Algorithm::Aes256Gcm),
            _ => None,
        }
    }

    pub fn nonce_len(self) -> usize {
        match self {
            Algorithm::Aes256Gcm => crate::NONCE_SIZE,
        }
    }

    pub fn tag_len(self) -> usize {
        match self {
            Algorithm::Aes256Gcm => crate::TAG_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("bad envelope magic")]
    BadMagic,

    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    #[error("unsupported algorithm code: {0}")]
    UnsupportedAlgorithm(u8),

    #[error("unknown envelope kind: {0}")]
    UnknownKind(u8),

    #[error("envelope kind mismatch: expected {expected:?}, found {found:?}")]
    KindMismatch {
        expected: EnvelopeKind,
        found: EnvelopeKind,
    },

    #[error("truncated envelope: {len} bytes, header declares at least {needed}")]
    Truncated { len: usize, needed: usize },

    #[error("{field} too long for envelope: {len} bytes (max 255)")]
    FieldTooLong { field: &'static str, len: usize },
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub algorithm: Algorithm,
    pub nonce: Vec<u8>,
    pub tag: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let nonce_len = u8::try_from(self.nonce.len()).map_err(|_| EnvelopeError::FieldTooLong {
            field: "nonce",
            len: self.nonce.len(),
        })?;
        let tag_len = u8::try_from(self.tag.len()).map_err(|_| EnvelopeError::FieldTooLong {
            field: "tag",
            len: self.tag.len(),
        })?;

        let mut out = Vec::with_capacity(
            HEADER_LEN + self.nonce.len() + self.tag.len() + self.ciphertext.len(),
        );
        out.extend_from_slice(&MAGIC);
        out.push(VERSION);
        out.push(self.kind.code());
        out.push(self.algorithm.code());
        out.push(nonce_len);
        out.push(tag_len);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() < HEADER_LEN {
            return Err(EnvelopeError::Truncated {
                len: bytes.len(),
                needed: HEADER_LEN,
            });
        }
        if bytes[..4] != MAGIC {
            return Err(EnvelopeError::BadMagic);
        }
        if bytes[4] != VERSION {
            return Err(EnvelopeError::UnsupportedVersion(bytes[4]));
        }
        let kind = EnvelopeKind::from_code(bytes[5]).ok_or(EnvelopeError::UnknownKind(bytes[5]))?;
        let algorithm =
            Algorithm::from_code(bytes[6]).ok_or(EnvelopeError::UnsupportedAlgorithm(bytes[6]))?;

        let nonce_start = HEADER_LEN;
        let tag_start = nonce_start + bytes[7] as usize;
        let ct_start = tag_start + bytes[8] as usize;
        if bytes.len() < ct_start {
            return Err(EnvelopeError::Truncated {
                len: bytes.len(),
                needed: ct_start,
            });
        }

        Ok(Self {
            kind,
            algorithm,
            nonce: bytes[nonce_start..tag_start].to_vec(),
            tag: bytes[tag_start..ct_start].to_vec(),
            ciphertext: bytes[ct_start..].to_vec(),
        })
    }

    /// Decode and require a specific kind.
    pub fn decode_expecting(bytes: &[u8], expected: EnvelopeKind) -> Result<Self, EnvelopeError> {
        let env = Self::decode(bytes)?;
        if env.kind != expected {
            return Err(EnvelopeError::KindMismatch {
                expected,
                found: env.kind,
            });
        }
        Ok(env)
    }
}
