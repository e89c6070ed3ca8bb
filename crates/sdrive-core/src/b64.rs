//! base64url (RFC 4648 §5) helpers for wrapped keys and salts on the wire.
//!
//! Encoding never emits padding. Decoding accepts input with or without
//! trailing `=` because older clients padded their output.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;

use crate::error::{SdriveError, SdriveResult};

const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Encode bytes as unpadded base64url.
pub fn encode(data: &[u8]) -> String {
    URL_SAFE_LENIENT.encode(data)
}

/// Decode base64url, padded or not.
pub fn decode(s: &str) -> SdriveResult<Vec<u8>> {
    URL_SAFE_LENIENT
        .decode(s.trim())
        .map_err(|e| SdriveError::Encoding(format!("base64url decode: {e}")))
}

/// Serde adapter: `Vec<u8>` <-> base64url string.
///
/// ```ignore
/// #[serde(with = "sdrive_core::b64::serde_bytes")]
/// pub wrapped_fok: Vec<u8>,
/// ```
pub mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        super::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for the fixed-size 16-byte user salt.
pub mod serde_salt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(salt: &[u8; 16], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::encode(salt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = super::decode(&s).map_err(serde::de::Error::custom)?;
        <[u8; 16]>::try_from(bytes.as_slice()).map_err(|_| {
            serde::de::Error::custom(format!("user salt must be 16 bytes, got {}", bytes.len()))
        })
    }
}
