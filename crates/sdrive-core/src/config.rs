use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level client configuration (loaded from sdrive.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SdriveConfig {
    pub crypto: CryptoConfig,
    pub log: LogConfig,
    pub storage: StorageConfig,
}

/// Client-side encryption parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 1)
    pub argon2_parallelism: u32,
    /// Plaintext bytes per content chunk (default: 4 MiB)
    pub chunk_size: u32,
    /// MIME type bound into chunk AAD when the caller has none
    pub default_file_type: String,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 1,
            chunk_size: 4 * 1024 * 1024,
            default_file_type: "application/octet-stream".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Local JSON stand-ins for the metadata service, used by the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Keybundle JSON file
    pub keybundle_path: PathBuf,
    /// Folder metadata JSON file (array of folder records)
    pub folders_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            keybundle_path: PathBuf::from("~/.local/share/sdrive/keybundle.json"),
            folders_path: PathBuf::from("~/.local/share/sdrive/folders.json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[crypto]
argon2_mem_cost_kib = 131072
argon2_time_cost = 4
argon2_parallelism = 2
chunk_size = 1048576
default_file_type = "text/plain"

[log]
level = "debug"
format = "json"

[storage]
keybundle_path = "/tmp/kb.json"
folders_path = "/tmp/folders.json"
"#;
        let config: SdriveConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.crypto.argon2_mem_cost_kib, 131072);
        assert_eq!(config.crypto.argon2_time_cost, 4);
        assert_eq!(config.crypto.argon2_parallelism, 2);
        assert_eq!(config.crypto.chunk_size, 1048576);
        assert_eq!(config.crypto.default_file_type, "text/plain");
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.format, "json");
        assert_eq!(config.storage.keybundle_path, PathBuf::from("/tmp/kb.json"));
    }

    #[test]
    fn test_parse_defaults() {
        let config: SdriveConfig = toml::from_str("").unwrap();

        assert_eq!(config.crypto.argon2_mem_cost_kib, 65536);
        assert_eq!(config.crypto.argon2_time_cost, 3);
        assert_eq!(config.crypto.argon2_parallelism, 1);
        assert_eq!(config.crypto.chunk_size, 4 * 1024 * 1024);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, "text");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[crypto]
chunk_size = 1024
"#;
        let config: SdriveConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.crypto.chunk_size, 1024);
        // Defaults
        assert_eq!(config.crypto.argon2_time_cost, 3);
        assert_eq!(config.log.format, "text");
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = SdriveConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: SdriveConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.crypto.chunk_size, parsed.crypto.chunk_size);
        assert_eq!(config.storage.folders_path, parsed.storage.folders_path);
    }
}
