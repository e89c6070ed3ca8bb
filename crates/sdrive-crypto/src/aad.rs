//! Associated-data builders binding every wrap and chunk encryption to the
//! identities it protects.
//!
//! All key-wrap AAD strings have the form `SD:<purpose>|v<schema>|<field>:<value>|...`.
//! Identifiers are rejected when empty or when they contain the `|`
//! separator, so two different field tuples can never render to the same
//! string.

use crate::bytes::{concat, u32_be};
use crate::error::{CryptoError, CryptoResult};

/// Schema version embedded in every AAD string.
pub const AAD_SCHEMA_VERSION: u32 = 1;

const PURPOSE_UNLOCK: &str = "unlock";
const PURPOSE_RECOVERY: &str = "recovery";

/// Sentinel for a root folder's missing parent.
const NULL_PARENT: &str = "null";

fn ident<'a>(field: &str, value: &'a str) -> CryptoResult<&'a str> {
    if value.is_empty() {
        return Err(CryptoError::contract(format!("AAD field {field} is empty")));
    }
    if value.contains('|') {
        return Err(CryptoError::contract(format!(
            "AAD field {field} contains the '|' separator"
        )));
    }
    Ok(value)
}

/// AAD for the password-wrapped MAK.
pub fn mak_aad(user_id: &str) -> CryptoResult<String> {
    Ok(format!(
        "SD:MAK|v{AAD_SCHEMA_VERSION}|user:{}|purpose:{PURPOSE_UNLOCK}",
        ident("user_id", user_id)?
    ))
}

/// AAD for the recovery-wrapped MAK.
pub fn mak_recovery_aad(user_id: &str) -> CryptoResult<String> {
    Ok(format!(
        "SD:MAK|v{AAD_SCHEMA_VERSION}|user:{}|purpose:{PURPOSE_RECOVERY}",
        ident("user_id", user_id)?
    ))
}

/// AAD for a folder key wrapped under its parent's key (or the MAK for root).
pub fn folder_aad(
    user_id: &str,
    folder_id: &str,
    parent_id: Option<&str>,
    key_version: u32,
) -> CryptoResult<String> {
    let parent = match parent_id {
        Some(p) => ident("parent_id", p)?,
        None => NULL_PARENT,
    };
    Ok(format!(
        "SD:FoK|v{AAD_SCHEMA_VERSION}|user:{}|folder:{}|parent:{parent}|kv:{key_version}",
        ident("user_id", user_id)?,
        ident("folder_id", folder_id)?,
    ))
}

/// AAD for a file master key wrapped under its folder's key.
pub fn file_aad(
    user_id: &str,
    file_id: &str,
    folder_id: &str,
    key_version: u32,
) -> CryptoResult<String> {
    Ok(format!(
        "SD:FMK|v{AAD_SCHEMA_VERSION}|user:{}|file:{}|folder:{}|kv:{key_version}",
        ident("user_id", user_id)?,
        ident("file_id", file_id)?,
        ident("folder_id", folder_id)?,
    ))
}

/// HKDF info string for a file version's DEK.
pub fn dek_info(file_id: &str, version: u32) -> CryptoResult<String> {
    Ok(format!(
        "SD:DEK|v{AAD_SCHEMA_VERSION}|file:{}|version:{version}",
        ident("file_id", file_id)?
    ))
}

/// AAD for an upload stream's content key wrapped under a folder key.
pub fn stream_key_aad(enc_stream_id: &str, folder_id: Option<&str>) -> CryptoResult<String> {
    let folder = match folder_id {
        Some(f) => ident("folder_id", f)?,
        None => "none",
    };
    Ok(format!(
        "SD:WrapFK|v{AAD_SCHEMA_VERSION}|{}|{folder}",
        ident("enc_stream_id", enc_stream_id)?
    ))
}

/// Per-chunk content AAD:
/// `"SD:C1|v1|" || stream_id || "|" || be32(index) || be32(chunk_size) || file_size || "|" || file_type`
pub fn chunk_aad(
    enc_stream_id: &str,
    chunk_index: u32,
    chunk_size: u32,
    file_size: u64,
    file_type: &str,
) -> CryptoResult<Vec<u8>> {
    let prefix = format!("SD:C1|v{AAD_SCHEMA_VERSION}|");
    let stream = ident("enc_stream_id", enc_stream_id)?;
    let size = file_size.to_string();
    Ok(concat(&[
        prefix.as_bytes(),
        stream.as_bytes(),
        b"|",
        &u32_be(chunk_index),
        &u32_be(chunk_size),
        size.as_bytes(),
        b"|",
        file_type.as_bytes(),
    ]))
}
