//! Folder metadata lookup, the keyring's only view of the backend.
//!
//! The backend is untrusted for plaintext: it hands back wrapped keys and
//! parent links, and the keyring authenticates everything it returns.

use std::collections::HashMap;
use std::future::Future;
use std::sync::RwLock;

use anyhow::Context;
use sdrive_core::types::FolderMeta;

/// Source of per-folder metadata `{folder_id, parent_id, key_version, wrapped_fok}`.
pub trait FolderSource: Send + Sync {
    fn folder_meta(&self, folder_id: &str)
        -> impl Future<Output = anyhow::Result<FolderMeta>> + Send;
}

impl<T: FolderSource> FolderSource for std::sync::Arc<T> {
    fn folder_meta(
        &self,
        folder_id: &str,
    ) -> impl Future<Output = anyhow::Result<FolderMeta>> + Send {
        (**self).folder_meta(folder_id)
    }
}

/// Folder metadata held in memory, optionally persisted as a JSON array.
#[derive(Debug, Default)]
pub struct InMemoryFolders {
    folders: RwLock<HashMap<String, FolderMeta>>,
}

impl InMemoryFolders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a folder record.
    pub fn insert(&self, meta: FolderMeta) {
        let mut folders = self.folders.write().unwrap_or_else(|e| e.into_inner());
        folders.insert(meta.folder_id.clone(), meta);
    }

    pub fn get(&self, folder_id: &str) -> Option<FolderMeta> {
        let folders = self.folders.read().unwrap_or_else(|e| e.into_inner());
        folders.get(folder_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.folders.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn from_json(data: &[u8]) -> anyhow::Result<Self> {
        let list: Vec<FolderMeta> =
            serde_json::from_slice(data).context("parsing folder metadata")?;
        let store = Self::new();
        for meta in list {
            store.insert(meta);
        }
        Ok(store)
    }

    /// Serialize as a JSON array sorted by folder id.
    pub fn to_json(&self) -> anyhow::Result<Vec<u8>> {
        let folders = self.folders.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<&FolderMeta> = folders.values().collect();
        list.sort_by(|a, b| a.folder_id.cmp(&b.folder_id));
        serde_json::to_vec_pretty(&list).context("serializing folder metadata")
    }
}

impl FolderSource for InMemoryFolders {
    async fn folder_meta(&self, folder_id: &str) -> anyhow::Result<FolderMeta> {
        self.get(folder_id)
            .with_context(|| format!("folder not found: {folder_id}"))
    }
}
