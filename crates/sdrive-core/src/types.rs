use serde::{Deserialize, Serialize};

use crate::b64;

/// Current keybundle KDF scheme (Argon2id -> HKDF-SHA256 unlock KEK).
pub const KDF_VERSION: u32 = 1;

/// Account-level key material as stored by the backend.
///
/// Both wrapped MAK fields hold an encoded envelope; on the wire they are
/// base64url strings inside JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keybundle {
    pub user_id: String,
    #[serde(with = "b64::serde_salt")]
    pub user_salt: [u8; 16],
    #[serde(with = "b64::serde_bytes")]
    pub wrapped_mak_password: Vec<u8>,
    #[serde(with = "b64::serde_bytes")]
    pub wrapped_mak_recovery: Vec<u8>,
    pub kdf_version: u32,
}

/// Per-folder key metadata returned by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderMeta {
    pub folder_id: String,
    /// `None` for the root folder, whose key is wrapped under the MAK
    pub parent_id: Option<String>,
    pub key_version: u32,
    #[serde(with = "b64::serde_bytes")]
    pub wrapped_fok: Vec<u8>,
}

impl FolderMeta {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Per-file key metadata returned by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_id: String,
    pub folder_id: String,
    pub key_version: u32,
    /// Latest content version; selects the DEK for downloads
    #[serde(default)]
    pub head_version: u32,
    #[serde(with = "b64::serde_bytes")]
    pub wrapped_fmk: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keybundle_json_uses_base64url() {
        let bundle = Keybundle {
            user_id: "user-1".into(),
            user_salt: [0xfb; 16],
            wrapped_mak_password: vec![0xff, 0xee],
            wrapped_mak_recovery: vec![1, 2, 3],
            kdf_version: KDF_VERSION,
        };

        let json = serde_json::to_string(&bundle).unwrap();
        assert!(json.contains("\"wrapped_mak_password\":\"_-4\""));
        assert!(!json.contains('='));

        let parsed: Keybundle = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, bundle);
    }

    #[test]
    fn test_keybundle_rejects_short_salt() {
        let json = r#"{"user_id":"u","user_salt":"AAAA","wrapped_mak_password":"","wrapped_mak_recovery":"","kdf_version":1}"#;
        assert!(serde_json::from_str::<Keybundle>(json).is_err());
    }

    #[test]
    fn test_folder_meta_root_has_null_parent() {
        let json = r#"{"folder_id":"root","parent_id":null,"key_version":1,"wrapped_fok":"AQID"}"#;
        let meta: FolderMeta = serde_json::from_str(json).unwrap();
        assert!(meta.is_root());
        assert_eq!(meta.wrapped_fok, vec![1, 2, 3]);
    }

    #[test]
    fn test_file_meta_head_version_defaults() {
        let json = r#"{"file_id":"f","folder_id":"root","key_version":2,"wrapped_fmk":""}"#;
        let meta: FileMeta = serde_json::from_str(json).unwrap();
        assert_eq!(meta.head_version, 0);
        assert_eq!(meta.key_version, 2);
    }
}
