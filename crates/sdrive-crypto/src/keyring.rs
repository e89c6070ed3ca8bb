//! In-memory key hierarchy: the MAK plus caches of unwrapped folder and file keys.
//!
//! The keyring is either Locked (no MAK, empty caches) or Unlocked. Every
//! lock and unlock bumps an epoch counter; a resolution captures the epoch
//! when it starts and re-checks it under the state mutex whenever it touches
//! the MAK or writes the cache. A `lock()` that lands while a resolution is
//! awaiting metadata therefore makes that resolution fail with
//! [`CryptoError::NotUnlocked`] and leaves nothing behind in the cache.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use secrecy::SecretString;
use tracing::{debug, info};
use zeroize::Zeroize;

use sdrive_core::types::{FileMeta, FolderMeta, Keybundle, KDF_VERSION};

use crate::aad;
use crate::account;
use crate::error::{CryptoError, CryptoResult};
use crate::kdf::{derive_unlock_kek, KdfParams};
use crate::keys::{self, unwrap_key, wrap_key, SecretKey};
use crate::provider::CryptoProvider;
use crate::recovery::RecoverySecret;
use crate::source::FolderSource;

/// Key version assigned to freshly created folder and file keys.
pub const INITIAL_KEY_VERSION: u32 = 1;

struct Session {
    user_id: String,
    mak: SecretKey,
}

#[derive(Default)]
struct KeyringState {
    session: Option<Session>,
    epoch: u64,
    folder_keys: HashMap<String, SecretKey>,
    file_keys: HashMap<String, SecretKey>,
}

impl KeyringState {
    /// The live session, provided no lock/unlock happened since `epoch`.
    fn session_at(&self, epoch: u64) -> CryptoResult<&Session> {
        match &self.session {
            Some(session) if self.epoch == epoch => Ok(session),
            _ => Err(CryptoError::NotUnlocked),
        }
    }

    fn wipe(&mut self) {
        for key in self.folder_keys.values_mut() {
            key.zeroize();
        }
        for key in self.file_keys.values_mut() {
            key.zeroize();
        }
        self.folder_keys.clear();
        self.file_keys.clear();
        if let Some(mut session) = self.session.take() {
            session.mak.zeroize();
        }
    }
}

/// Where a re-wrapped folder key will live.
#[derive(Debug, Clone, Copy)]
pub enum FolderParent<'a> {
    /// Root folder: wrapped under the MAK
    Root,
    /// Child folder: wrapped under the parent's folder key
    Folder { id: &'a str, key: &'a SecretKey },
}

pub struct Keyring {
    provider: Arc<dyn CryptoProvider>,
    kdf_params: KdfParams,
    state: Mutex<KeyringState>,
    /// Single-flight gates for folder resolution, keyed by folder id
    folder_gates: Mutex<HashMap<String, FolderGate>>,
}

#[derive(Default)]
struct FolderGate {
    lock: Arc<tokio::sync::Mutex<()>>,
    /// Ancestor gate the current holder is queued on
    waiting_on: Option<String>,
}

/// Follow holders' `waiting_on` links from `start`; true if they reach `target`.
fn wait_chain_reaches(gates: &HashMap<String, FolderGate>, start: &str, target: &str) -> bool {
    let mut next = Some(start);
    for _ in 0..=gates.len() {
        match next {
            Some(id) if id == target => return true,
            Some(id) => next = gates.get(id).and_then(|g| g.waiting_on.as_deref()),
            None => return false,
        }
    }
    false
}

/// A place in one folder's gate queue, then ownership of the gate. Dropping
/// it releases the gate and forgets it once nobody else is queued.
struct GateGuard<'a> {
    keyring: &'a Keyring,
    folder_id: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    held: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let was_held = self.held.take().is_some();
        let mut gates = self.keyring.gates();
        // Only the map and this guard still point at the lock
        if Arc::strong_count(&self.lock) == 2 {
            gates.remove(&self.folder_id);
        } else if was_held {
            if let Some(gate) = gates.get_mut(&self.folder_id) {
                gate.waiting_on = None;
            }
        }
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Keyring")
            .field("unlocked", &state.session.is_some())
            .field("epoch", &state.epoch)
            .field("cached_folders", &state.folder_keys.len())
            .field("cached_files", &state.file_keys.len())
            .finish()
    }
}

impl Keyring {
    pub fn new(provider: Arc<dyn CryptoProvider>, kdf_params: KdfParams) -> Self {
        Self {
            provider,
            kdf_params,
            state: Mutex::new(KeyringState::default()),
            folder_gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn CryptoProvider> {
        &self.provider
    }

    fn state(&self) -> std::sync::MutexGuard<'_, KeyringState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_unlocked(&self) -> bool {
        self.state().session.is_some()
    }

    pub fn user_id(&self) -> Option<String> {
        self.state().session.as_ref().map(|s| s.user_id.clone())
    }

    /// Current epoch and user id, or `NotUnlocked`.
    fn snapshot(&self) -> CryptoResult<(u64, String)> {
        let state = self.state();
        let epoch = state.epoch;
        let session = state.session_at(epoch)?;
        Ok((epoch, session.user_id.clone()))
    }

    fn check_epoch(&self, epoch: u64) -> CryptoResult<()> {
        self.state().session_at(epoch).map(|_| ())
    }

    fn install_session(&self, user_id: &str, mak: SecretKey) {
        let mut state = self.state();
        state.wipe();
        state.epoch += 1;
        state.session = Some(Session {
            user_id: user_id.to_string(),
            mak,
        });
    }

    /// Unlock with the account password.
    ///
    /// A wrong password and a corrupted bundle both report
    /// [`CryptoError::InvalidCredentials`].
    pub async fn unlock_with_password(
        &self,
        bundle: &Keybundle,
        password: &SecretString,
    ) -> CryptoResult<()> {
        check_kdf_version(bundle)?;
        let aad = aad::mak_aad(&bundle.user_id)?;
        let kek = derive_unlock_kek(password, &bundle.user_salt, &self.kdf_params).await?;

        let mak = unwrap_key(
            self.provider.as_ref(),
            &kek,
            &bundle.wrapped_mak_password,
            aad.as_bytes(),
        )
        .map_err(invalid_credentials)?;
        drop(kek);

        self.install_session(&bundle.user_id, mak);
        info!(user_id = %bundle.user_id, "keyring unlocked with password");
        Ok(())
    }

    /// Unlock with the recovery secret.
    pub async fn unlock_with_recovery_key(
        &self,
        bundle: &Keybundle,
        recovery: &RecoverySecret,
    ) -> CryptoResult<()> {
        check_kdf_version(bundle)?;
        let aad = aad::mak_recovery_aad(&bundle.user_id)?;
        let kek = recovery.kek()?;

        let mak = unwrap_key(
            self.provider.as_ref(),
            &kek,
            &bundle.wrapped_mak_recovery,
            aad.as_bytes(),
        )
        .map_err(invalid_credentials)?;
        drop(kek);

        self.install_session(&bundle.user_id, mak);
        info!(user_id = %bundle.user_id, "keyring unlocked with recovery key");
        Ok(())
    }

    /// Unlock with a MAK already in hand, e.g. straight after account creation.
    pub fn unlock_with_mak(&self, user_id: &str, mak: SecretKey) -> CryptoResult<()> {
        aad::mak_aad(user_id)?;
        self.install_session(user_id, mak);
        info!(user_id, "keyring unlocked with MAK");
        Ok(())
    }

    /// Wipe the MAK and every cached key. Idempotent.
    pub fn lock(&self) {
        let mut state = self.state();
        let was_unlocked = state.session.is_some();
        state.wipe();
        state.epoch += 1;
        drop(state);

        if was_unlocked {
            info!("keyring locked");
        }
    }

    pub fn cached_folder_key(&self, folder_id: &str) -> Option<SecretKey> {
        self.state().folder_keys.get(folder_id).cloned()
    }

    pub fn has_folder_key(&self, folder_id: &str) -> bool {
        self.state().folder_keys.contains_key(folder_id)
    }

    pub fn has_file_key(&self, file_id: &str) -> bool {
        self.state().file_keys.contains_key(file_id)
    }

    fn cached_folder_at(&self, epoch: u64, folder_id: &str) -> CryptoResult<Option<SecretKey>> {
        let state = self.state();
        state.session_at(epoch)?;
        Ok(state.folder_keys.get(folder_id).cloned())
    }

    /// Cache a folder key unless the epoch moved. An existing entry wins so
    /// concurrent resolvers all return the same key.
    fn store_folder_key(
        &self,
        epoch: u64,
        folder_id: &str,
        key: SecretKey,
    ) -> CryptoResult<SecretKey> {
        let mut state = self.state();
        state.session_at(epoch)?;
        Ok(state
            .folder_keys
            .entry(folder_id.to_string())
            .or_insert(key)
            .clone())
    }

    fn replace_folder_key(&self, epoch: u64, folder_id: &str, key: SecretKey) -> CryptoResult<()> {
        let mut state = self.state();
        state.session_at(epoch)?;
        if let Some(mut old) = state.folder_keys.insert(folder_id.to_string(), key) {
            old.zeroize();
        }
        Ok(())
    }

    fn replace_file_key(&self, epoch: u64, file_id: &str, key: SecretKey) -> CryptoResult<()> {
        let mut state = self.state();
        state.session_at(epoch)?;
        if let Some(mut old) = state.file_keys.insert(file_id.to_string(), key) {
            old.zeroize();
        }
        Ok(())
    }

    /// Run `f` with the MAK, provided the session from `epoch` is still live.
    fn with_mak<T>(
        &self,
        epoch: u64,
        f: impl FnOnce(&SecretKey) -> CryptoResult<T>,
    ) -> CryptoResult<T> {
        let state = self.state();
        let session = state.session_at(epoch)?;
        f(&session.mak)
    }

    fn gates(&self) -> std::sync::MutexGuard<'_, HashMap<String, FolderGate>> {
        self.folder_gates.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue on `folder_id`'s gate. `from` is the descendant whose gate the
    /// caller already holds; waiting is refused if the holders' wait chain
    /// already leads back to it.
    async fn enter_folder_gate(
        &self,
        folder_id: &str,
        from: Option<&str>,
    ) -> CryptoResult<GateGuard<'_>> {
        let lock = {
            let mut gates = self.gates();
            if let Some(child) = from {
                if wait_chain_reaches(&gates, folder_id, child) {
                    return Err(CryptoError::FolderCycle(folder_id.to_string()));
                }
                if let Some(gate) = gates.get_mut(child) {
                    gate.waiting_on = Some(folder_id.to_string());
                }
            }
            gates.entry(folder_id.to_string()).or_default().lock.clone()
        };

        let mut guard = GateGuard {
            keyring: self,
            folder_id: folder_id.to_string(),
            lock,
            held: None,
        };
        guard.held = Some(guard.lock.clone().lock_owned().await);

        if let Some(child) = from {
            if let Some(gate) = self.gates().get_mut(child) {
                gate.waiting_on = None;
            }
        }
        Ok(guard)
    }

    /// Resolve a folder key, walking up the parent chain as far as needed.
    ///
    /// Every folder on the walk is fetched and unwrapped under its own
    /// single-flight gate, so concurrent calls sharing an ancestor do that
    /// work once. Inconsistent metadata that loops back on itself fails with
    /// [`CryptoError::FolderCycle`].
    pub async fn resolve_folder_key<S: FolderSource + ?Sized>(
        &self,
        source: &S,
        folder_id: &str,
    ) -> CryptoResult<SecretKey> {
        let (epoch, user_id) = self.snapshot()?;
        if let Some(key) = self.cached_folder_at(epoch, folder_id)? {
            return Ok(key);
        }

        // Walk up until a cached ancestor or the root, holding each gate
        let mut chain: Vec<(FolderMeta, GateGuard<'_>)> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut anchor: Option<SecretKey> = None;
        let mut current = folder_id.to_string();
        loop {
            if !visited.insert(current.clone()) {
                return Err(CryptoError::FolderCycle(current));
            }
            let from = chain.last().map(|(meta, _)| meta.folder_id.as_str());
            let gate = self.enter_folder_gate(&current, from).await?;

            // Another resolver may have finished this folder while we queued
            if let Some(key) = self.cached_folder_at(epoch, &current)? {
                if chain.is_empty() {
                    debug!(folder_id, "folder key served from cache after wait");
                    return Ok(key);
                }
                anchor = Some(key);
                break;
            }

            let meta = source
                .folder_meta(&current)
                .await
                .map_err(CryptoError::Metadata)?;
            // Lock may have happened while we awaited the backend
            self.check_epoch(epoch)?;
            if meta.folder_id != current {
                return Err(CryptoError::Metadata(anyhow::anyhow!(
                    "metadata service returned folder {} for {current}",
                    meta.folder_id
                )));
            }

            let parent = meta.parent_id.clone();
            chain.push((meta, gate));
            match parent {
                Some(p) => current = p,
                None => break,
            }
        }

        // Unwrap top-down
        let depth = chain.len();
        let mut parent_key = anchor;
        for (meta, _gate) in chain.iter().rev() {
            let folder_aad = aad::folder_aad(
                &user_id,
                &meta.folder_id,
                meta.parent_id.as_deref(),
                meta.key_version,
            )?;
            let key = match (&parent_key, &meta.parent_id) {
                (Some(parent), Some(_)) => unwrap_key(
                    self.provider.as_ref(),
                    parent,
                    &meta.wrapped_fok,
                    folder_aad.as_bytes(),
                )?,
                (None, None) => self.with_mak(epoch, |mak| {
                    unwrap_key(
                        self.provider.as_ref(),
                        mak,
                        &meta.wrapped_fok,
                        folder_aad.as_bytes(),
                    )
                })?,
                _ => {
                    return Err(CryptoError::contract(format!(
                        "folder {} has no resolvable parent key",
                        meta.folder_id
                    )))
                }
            };
            parent_key = Some(self.store_folder_key(epoch, &meta.folder_id, key)?);
        }

        debug!(folder_id, depth, "resolved folder key");
        parent_key.ok_or_else(|| CryptoError::contract("empty folder chain"))
    }

    /// Unwrap a file's FMK under its (already resolved) folder key.
    pub fn resolve_file_key(
        &self,
        file: &FileMeta,
        folder_key: &SecretKey,
    ) -> CryptoResult<SecretKey> {
        let (epoch, user_id) = self.snapshot()?;
        {
            let state = self.state();
            if let Some(key) = state.file_keys.get(&file.file_id) {
                return Ok(key.clone());
            }
        }

        let file_aad = aad::file_aad(&user_id, &file.file_id, &file.folder_id, file.key_version)?;
        let fmk = unwrap_key(
            self.provider.as_ref(),
            folder_key,
            &file.wrapped_fmk,
            file_aad.as_bytes(),
        )?;

        let mut state = self.state();
        state.session_at(epoch)?;
        let fmk = state
            .file_keys
            .entry(file.file_id.clone())
            .or_insert(fmk)
            .clone();
        debug!(file_id = %file.file_id, key_version = file.key_version, "resolved file key");
        Ok(fmk)
    }

    /// Derive the DEK for one file version. Never cached.
    pub fn derive_dek(
        &self,
        file_id: &str,
        version: u32,
        fmk: &SecretKey,
    ) -> CryptoResult<SecretKey> {
        self.snapshot()?;
        keys::derive_dek(fmk, file_id, version)
    }

    /// Folder key, FMK and DEK in one call.
    pub async fn content_key<S: FolderSource + ?Sized>(
        &self,
        source: &S,
        file: &FileMeta,
        version: u32,
    ) -> CryptoResult<SecretKey> {
        let folder_key = self.resolve_folder_key(source, &file.folder_id).await?;
        let fmk = self.resolve_file_key(file, &folder_key)?;
        self.derive_dek(&file.file_id, version, &fmk)
    }

    /// Generate a root folder key wrapped under the MAK. The returned metadata
    /// is for the caller to persist.
    pub fn create_root_folder_key(&self, folder_id: &str) -> CryptoResult<FolderMeta> {
        let (epoch, user_id) = self.snapshot()?;
        let key = SecretKey::generate(self.provider.as_ref());
        let folder_aad = aad::folder_aad(&user_id, folder_id, None, INITIAL_KEY_VERSION)?;
        let wrapped_fok = self.with_mak(epoch, |mak| {
            wrap_key(self.provider.as_ref(), mak, &key, folder_aad.as_bytes())
        })?;
        self.replace_folder_key(epoch, folder_id, key)?;

        info!(folder_id, "created root folder key");
        Ok(FolderMeta {
            folder_id: folder_id.to_string(),
            parent_id: None,
            key_version: INITIAL_KEY_VERSION,
            wrapped_fok,
        })
    }

    /// Generate a folder key wrapped under its parent's key.
    pub fn create_child_folder_key(
        &self,
        folder_id: &str,
        parent_id: &str,
        parent_key: &SecretKey,
    ) -> CryptoResult<FolderMeta> {
        let (epoch, user_id) = self.snapshot()?;
        let key = SecretKey::generate(self.provider.as_ref());
        let folder_aad =
            aad::folder_aad(&user_id, folder_id, Some(parent_id), INITIAL_KEY_VERSION)?;
        let wrapped_fok = wrap_key(
            self.provider.as_ref(),
            parent_key,
            &key,
            folder_aad.as_bytes(),
        )?;
        self.replace_folder_key(epoch, folder_id, key)?;

        info!(folder_id, parent_id, "created folder key");
        Ok(FolderMeta {
            folder_id: folder_id.to_string(),
            parent_id: Some(parent_id.to_string()),
            key_version: INITIAL_KEY_VERSION,
            wrapped_fok,
        })
    }

    /// Generate a file master key wrapped under its folder's key.
    pub fn create_file_key(
        &self,
        file_id: &str,
        folder_id: &str,
        folder_key: &SecretKey,
    ) -> CryptoResult<FileMeta> {
        let (epoch, user_id) = self.snapshot()?;
        let fmk = SecretKey::generate(self.provider.as_ref());
        let file_aad = aad::file_aad(&user_id, file_id, folder_id, INITIAL_KEY_VERSION)?;
        let wrapped_fmk = wrap_key(self.provider.as_ref(), folder_key, &fmk, file_aad.as_bytes())?;
        self.replace_file_key(epoch, file_id, fmk)?;

        info!(file_id, folder_id, "created file key");
        Ok(FileMeta {
            file_id: file_id.to_string(),
            folder_id: folder_id.to_string(),
            key_version: INITIAL_KEY_VERSION,
            head_version: INITIAL_KEY_VERSION,
            wrapped_fmk,
        })
    }

    /// Re-wrap an existing folder key under a new parent and/or key version
    /// (folder move or rotation). The key itself is unchanged.
    pub fn rewrap_folder_key(
        &self,
        folder: &FolderMeta,
        folder_key: &SecretKey,
        new_parent: FolderParent<'_>,
        new_key_version: u32,
    ) -> CryptoResult<FolderMeta> {
        check_key_version(&folder.folder_id, folder.key_version, new_key_version)?;
        let (epoch, user_id) = self.snapshot()?;

        let (parent_id, wrapped_fok) = match new_parent {
            FolderParent::Root => {
                let folder_aad =
                    aad::folder_aad(&user_id, &folder.folder_id, None, new_key_version)?;
                let wrapped = self.with_mak(epoch, |mak| {
                    wrap_key(self.provider.as_ref(), mak, folder_key, folder_aad.as_bytes())
                })?;
                (None, wrapped)
            }
            FolderParent::Folder { id, key } => {
                let folder_aad =
                    aad::folder_aad(&user_id, &folder.folder_id, Some(id), new_key_version)?;
                let wrapped =
                    wrap_key(self.provider.as_ref(), key, folder_key, folder_aad.as_bytes())?;
                (Some(id.to_string()), wrapped)
            }
        };
        self.replace_folder_key(epoch, &folder.folder_id, folder_key.clone())?;

        info!(
            folder_id = %folder.folder_id,
            parent_id = parent_id.as_deref().unwrap_or("null"),
            key_version = new_key_version,
            "re-wrapped folder key"
        );
        Ok(FolderMeta {
            folder_id: folder.folder_id.clone(),
            parent_id,
            key_version: new_key_version,
            wrapped_fok,
        })
    }

    /// Re-wrap an existing FMK under a (possibly new) folder and key version.
    pub fn rewrap_file_key(
        &self,
        file: &FileMeta,
        fmk: &SecretKey,
        new_folder_id: &str,
        new_folder_key: &SecretKey,
        new_key_version: u32,
    ) -> CryptoResult<FileMeta> {
        check_key_version(&file.file_id, file.key_version, new_key_version)?;
        let (epoch, user_id) = self.snapshot()?;

        let file_aad = aad::file_aad(&user_id, &file.file_id, new_folder_id, new_key_version)?;
        let wrapped_fmk = wrap_key(
            self.provider.as_ref(),
            new_folder_key,
            fmk,
            file_aad.as_bytes(),
        )?;
        self.replace_file_key(epoch, &file.file_id, fmk.clone())?;

        info!(
            file_id = %file.file_id,
            folder_id = new_folder_id,
            key_version = new_key_version,
            "re-wrapped file key"
        );
        Ok(FileMeta {
            folder_id: new_folder_id.to_string(),
            key_version: new_key_version,
            wrapped_fmk,
            ..file.clone()
        })
    }

    /// Re-wrap the MAK under a new password. Returns the bundle to persist.
    pub async fn change_password(
        &self,
        bundle: &Keybundle,
        new_password: &SecretString,
    ) -> CryptoResult<Keybundle> {
        let (epoch, user_id) = self.snapshot()?;
        if user_id != bundle.user_id {
            return Err(CryptoError::contract(format!(
                "keybundle belongs to {}, keyring is unlocked for {user_id}",
                bundle.user_id
            )));
        }
        let mak = self.with_mak(epoch, |mak| Ok(mak.clone()))?;

        let updated = account::rewrap_mak_password(
            self.provider.as_ref(),
            bundle,
            &mak,
            new_password,
            &self.kdf_params,
        )
        .await?;
        self.check_epoch(epoch)?;

        info!(user_id = %bundle.user_id, "re-wrapped MAK under new password");
        Ok(updated)
    }

    /// Replace the recovery secret. Returns the bundle to persist and the new
    /// secret to show the user.
    pub fn reset_recovery_secret(
        &self,
        bundle: &Keybundle,
    ) -> CryptoResult<(Keybundle, RecoverySecret)> {
        let (epoch, user_id) = self.snapshot()?;
        if user_id != bundle.user_id {
            return Err(CryptoError::contract(format!(
                "keybundle belongs to {}, keyring is unlocked for {user_id}",
                bundle.user_id
            )));
        }
        let result = self.with_mak(epoch, |mak| {
            account::rewrap_mak_recovery(self.provider.as_ref(), bundle, mak)
        })?;
        info!(user_id = %bundle.user_id, "replaced recovery secret");
        Ok(result)
    }
}

fn check_kdf_version(bundle: &Keybundle) -> CryptoResult<()> {
    if bundle.kdf_version != KDF_VERSION {
        return Err(CryptoError::contract(format!(
            "unsupported keybundle kdf_version {} (expected {KDF_VERSION})",
            bundle.kdf_version
        )));
    }
    Ok(())
}

fn check_key_version(id: &str, current: u32, new: u32) -> CryptoResult<()> {
    if new < current {
        return Err(CryptoError::contract(format!(
            "key_version for {id} cannot go from {current} to {new}"
        )));
    }
    Ok(())
}

fn invalid_credentials(e: CryptoError) -> CryptoError {
    match e {
        CryptoError::Authentication => CryptoError::InvalidCredentials,
        other => other,
    }
}
