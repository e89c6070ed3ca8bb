//! Byte helpers shared by the AAD builder, chunk codec and key type.
//! Base64url lives in `sdrive_core::b64`.

use subtle::ConstantTimeEq;

/// Big-endian 4-byte encoding.
pub fn u32_be(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

/// Concatenate byte slices into one buffer.
pub fn concat(parts: &[&[u8]]) -> Vec<u8> {
    let total = parts.iter().map(|p| p.len()).sum();
    let mut out = Vec::with_capacity(total);
    for p in parts {
        out.extend_from_slice(p);
    }
    out
}

/// Constant-time equality. Length mismatch returns false immediately;
/// lengths are not secret here.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}
