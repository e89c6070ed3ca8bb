//! End-to-end keyring scenarios: unlock, folder/file hierarchy, chunked
//! upload and download, lock races, and password change after recovery.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use secrecy::SecretString;
use tokio::sync::Notify;

use sdrive_core::types::FolderMeta;
use sdrive_crypto::provider::Sealed;
use sdrive_crypto::{
    create_account, AesGcmProvider, Algorithm, ChunkCipher, CryptoError, CryptoProvider,
    CryptoResult, DecryptPipeline, FolderSource, InMemoryFolders, KdfParams, Keyring,
    RecoverySecret, SecretKey, StreamManifest, StreamParams,
};

fn fast_params() -> KdfParams {
    KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
        output_len: 32,
    }
}

fn fragments(bytes: &[u8], size: usize) -> impl Stream<Item = io::Result<Bytes>> + Unpin {
    let pieces: Vec<io::Result<Bytes>> = bytes
        .chunks(size)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    futures::stream::iter(pieces)
}

fn file_bytes(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i.wrapping_mul(13) ^ (i >> 2)) as u8).collect()
}

/// AES-GCM provider that counts AEAD opens.
#[derive(Default)]
struct CountingProvider {
    inner: AesGcmProvider,
    opens: AtomicUsize,
}

impl CryptoProvider for CountingProvider {
    fn algorithm(&self) -> Algorithm {
        self.inner.algorithm()
    }

    fn fill_random(&self, buf: &mut [u8]) {
        self.inner.fill_random(buf)
    }

    fn seal(
        &self,
        key: &SecretKey,
        nonce: &[u8],
        plaintext: &[u8],
        aad: &[u8],
    ) -> CryptoResult<Sealed> {
        self.inner.seal(key, nonce, plaintext, aad)
    }

    fn open(
        &self,
        key: &SecretKey,
        nonce: &[u8],
        ciphertext: &[u8],
        tag: &[u8],
        aad: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open(key, nonce, ciphertext, tag, aad)
    }
}

/// Folder source that parks every lookup until released.
#[derive(Default)]
struct GatedFolders {
    inner: InMemoryFolders,
    entered: Notify,
    release: Notify,
}

impl FolderSource for GatedFolders {
    async fn folder_meta(&self, folder_id: &str) -> anyhow::Result<FolderMeta> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.folder_meta(folder_id).await
    }
}

/// Folder source that yields once per lookup and counts calls.
#[derive(Default)]
struct SlowFolders {
    inner: InMemoryFolders,
    calls: AtomicUsize,
}

impl FolderSource for SlowFolders {
    async fn folder_meta(&self, folder_id: &str) -> anyhow::Result<FolderMeta> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.inner.folder_meta(folder_id).await
    }
}

#[tokio::test]
async fn scenario_a_three_chunk_roundtrip() {
    let provider: Arc<dyn CryptoProvider> = Arc::new(AesGcmProvider::new());
    let password = SecretString::from("p");
    let account = create_account(provider.as_ref(), "alice", &password, &fast_params())
        .await
        .unwrap();

    let keyring = Keyring::new(provider.clone(), fast_params());
    keyring
        .unlock_with_password(&account.bundle, &password)
        .await
        .unwrap();

    // Root folder wrapped under the MAK, one file inside it
    let folders = InMemoryFolders::new();
    folders.insert(keyring.create_root_folder_key("root").unwrap());
    let root_key = keyring.cached_folder_key("root").unwrap();
    let file = keyring.create_file_key("report.bin", "root", &root_key).unwrap();

    // Upload: encrypt under the version-1 DEK
    let dek = keyring.content_key(&folders, &file, 1).await.unwrap();
    let params = StreamParams::new("upload-1", 1024, 2500, "application/pdf").unwrap();
    let original = file_bytes(2500);
    let ciphertext = ChunkCipher::new(provider.clone(), &dek, params.clone())
        .unwrap()
        .encrypt_all(&original)
        .unwrap();

    // Download in a fresh session: every key comes back from metadata
    keyring.lock();
    keyring
        .unlock_with_password(&account.bundle, &password)
        .await
        .unwrap();
    let dek = keyring.content_key(&folders, &file, 1).await.unwrap();

    let mut pipeline =
        DecryptPipeline::new(provider, &dek, params, fragments(&ciphertext, 97)).unwrap();
    assert_eq!(pipeline.total_chunks(), 3);

    let mut plaintext = Vec::new();
    let mut last_len = 0;
    while let Some(chunk) = pipeline.next_chunk().await {
        let chunk = chunk.unwrap();
        last_len = chunk.plaintext.len();
        plaintext.extend_from_slice(&chunk.plaintext);
    }
    assert_eq!(last_len, 452);
    assert_eq!(plaintext, original);
}

#[tokio::test]
async fn scenario_a_via_stream_manifest() {
    let provider: Arc<dyn CryptoProvider> = Arc::new(AesGcmProvider::new());
    let keyring = Keyring::new(provider.clone(), fast_params());
    keyring
        .unlock_with_mak("alice", SecretKey::generate(provider.as_ref()))
        .unwrap();
    keyring.create_root_folder_key("root").unwrap();
    let root_key = keyring.cached_folder_key("root").unwrap();

    let content_key = SecretKey::generate(provider.as_ref());
    let params = StreamParams::new("upload-2", 1024, 2500, "image/png").unwrap();
    let manifest =
        StreamManifest::seal(provider.as_ref(), &params, Some("root"), &root_key, &content_key)
            .unwrap();
    let original = file_bytes(2500);
    let ciphertext = ChunkCipher::new(provider.clone(), &content_key, params)
        .unwrap()
        .encrypt_all(&original)
        .unwrap();

    let manifest = StreamManifest::from_bytes(&manifest.to_bytes().unwrap()).unwrap();
    let plaintext =
        DecryptPipeline::from_manifest(provider, &manifest, &root_key, fragments(&ciphertext, 1000))
            .unwrap()
            .collect()
            .await
            .unwrap();
    assert_eq!(plaintext, original);
}

#[tokio::test]
async fn scenario_b_lock_during_resolution() {
    let provider: Arc<dyn CryptoProvider> = Arc::new(AesGcmProvider::new());
    let mak = SecretKey::generate(provider.as_ref());
    let keyring = Keyring::new(provider.clone(), fast_params());
    keyring.unlock_with_mak("bob", mak.clone()).unwrap();

    let source = GatedFolders::default();
    source
        .inner
        .insert(keyring.create_root_folder_key("root").unwrap());
    // Start from an empty cache so resolution has to hit the backend
    keyring.lock();
    keyring.unlock_with_mak("bob", mak).unwrap();
    assert!(!keyring.has_folder_key("root"));

    let resolve = keyring.resolve_folder_key(&source, "root");
    let interfere = async {
        source.entered.notified().await;
        keyring.lock();
        source.release.notify_one();
    };
    let (result, ()) = tokio::join!(resolve, interfere);

    assert!(matches!(result, Err(CryptoError::NotUnlocked)));
    assert!(!keyring.is_unlocked());
    assert!(!keyring.has_folder_key("root"));
    assert!(keyring.cached_folder_key("root").is_none());
}

#[tokio::test]
async fn scenario_b_relock_and_unlock_during_resolution() {
    let provider: Arc<dyn CryptoProvider> = Arc::new(AesGcmProvider::new());
    let mak = SecretKey::generate(provider.as_ref());
    let keyring = Keyring::new(provider.clone(), fast_params());
    keyring.unlock_with_mak("bob", mak.clone()).unwrap();

    let source = GatedFolders::default();
    source
        .inner
        .insert(keyring.create_root_folder_key("root").unwrap());
    keyring.lock();
    keyring.unlock_with_mak("bob", mak.clone()).unwrap();

    // A new session started while the old resolution was parked: the old
    // resolution must still fail rather than write into the new session.
    let resolve = keyring.resolve_folder_key(&source, "root");
    let interfere = async {
        source.entered.notified().await;
        keyring.lock();
        keyring.unlock_with_mak("bob", mak.clone()).unwrap();
        source.release.notify_one();
    };
    let (result, ()) = tokio::join!(resolve, interfere);

    assert!(matches!(result, Err(CryptoError::NotUnlocked)));
    assert!(keyring.is_unlocked());
    assert!(!keyring.has_folder_key("root"));
}

#[tokio::test]
async fn scenario_c_recovery_then_password_change() {
    let provider: Arc<dyn CryptoProvider> = Arc::new(AesGcmProvider::new());
    let old_password = SecretString::from("old-password");
    let new_password = SecretString::from("new-password");
    let account = create_account(provider.as_ref(), "carol", &old_password, &fast_params())
        .await
        .unwrap();

    // User lost the password and types the mnemonic back in
    let words = account.recovery.to_mnemonic().unwrap();
    let recovery = RecoverySecret::from_mnemonic(&words).unwrap();

    let keyring = Keyring::new(provider.clone(), fast_params());
    keyring
        .unlock_with_recovery_key(&account.bundle, &recovery)
        .await
        .unwrap();
    let new_bundle = keyring
        .change_password(&account.bundle, &new_password)
        .await
        .unwrap();
    assert_ne!(
        new_bundle.wrapped_mak_password,
        account.bundle.wrapped_mak_password
    );

    let fresh = Keyring::new(provider.clone(), fast_params());
    fresh
        .unlock_with_password(&new_bundle, &new_password)
        .await
        .unwrap();
    assert_eq!(fresh.user_id().as_deref(), Some("carol"));

    let stale = Keyring::new(provider.clone(), fast_params());
    let result = stale.unlock_with_password(&new_bundle, &old_password).await;
    assert!(matches!(result, Err(CryptoError::InvalidCredentials)));
    assert!(!stale.is_unlocked());

    // Recovery path is untouched by the password change
    let again = Keyring::new(provider, fast_params());
    again
        .unlock_with_recovery_key(&new_bundle, &recovery)
        .await
        .unwrap();
}

#[tokio::test]
async fn wrong_recovery_secret_is_invalid_credentials() {
    let provider: Arc<dyn CryptoProvider> = Arc::new(AesGcmProvider::new());
    let account = create_account(
        provider.as_ref(),
        "dave",
        &SecretString::from("pw"),
        &fast_params(),
    )
    .await
    .unwrap();

    let keyring = Keyring::new(provider.clone(), fast_params());
    let wrong = RecoverySecret::generate(provider.as_ref());
    let result = keyring
        .unlock_with_recovery_key(&account.bundle, &wrong)
        .await;
    assert!(matches!(result, Err(CryptoError::InvalidCredentials)));
}

#[tokio::test]
async fn sibling_folder_keys_are_not_interchangeable() {
    let provider: Arc<dyn CryptoProvider> = Arc::new(AesGcmProvider::new());
    let mak = SecretKey::generate(provider.as_ref());
    let keyring = Keyring::new(provider.clone(), fast_params());
    keyring.unlock_with_mak("erin", mak.clone()).unwrap();

    let root = keyring.create_root_folder_key("root").unwrap();
    let root_key = keyring.cached_folder_key("root").unwrap();
    let x = keyring.create_child_folder_key("x", "root", &root_key).unwrap();
    let y = keyring.create_child_folder_key("y", "root", &root_key).unwrap();

    // Present x's wrapped key as y's: same wrapping key, wrong AAD
    let folders = InMemoryFolders::new();
    folders.insert(root);
    folders.insert(FolderMeta {
        wrapped_fok: x.wrapped_fok.clone(),
        ..y
    });

    keyring.lock();
    keyring.unlock_with_mak("erin", mak).unwrap();

    let result = keyring.resolve_folder_key(&folders, "y").await;
    assert!(matches!(result, Err(CryptoError::Authentication)));
    assert!(!keyring.has_folder_key("y"));
    // The honest parent still resolved and was cached
    assert!(keyring.has_folder_key("root"));
}

#[tokio::test]
async fn concurrent_resolutions_share_one_unwrap() {
    let counting = Arc::new(CountingProvider::default());
    let provider: Arc<dyn CryptoProvider> = counting.clone();
    let mak = SecretKey::generate(provider.as_ref());
    let keyring = Keyring::new(provider.clone(), fast_params());
    keyring.unlock_with_mak("frank", mak.clone()).unwrap();

    let source = SlowFolders::default();
    source
        .inner
        .insert(keyring.create_root_folder_key("root").unwrap());
    let root_key = keyring.cached_folder_key("root").unwrap();
    source
        .inner
        .insert(keyring.create_child_folder_key("docs", "root", &root_key).unwrap());

    keyring.lock();
    keyring.unlock_with_mak("frank", mak).unwrap();
    let opens_before = counting.opens.load(Ordering::SeqCst);

    let (a, b) = tokio::join!(
        keyring.resolve_folder_key(&source, "docs"),
        keyring.resolve_folder_key(&source, "docs"),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.as_bytes(), b.as_bytes());
    // root + docs, once each
    assert_eq!(counting.opens.load(Ordering::SeqCst) - opens_before, 2);
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn siblings_share_one_ancestor_unwrap() {
    let counting = Arc::new(CountingProvider::default());
    let provider: Arc<dyn CryptoProvider> = counting.clone();
    let mak = SecretKey::generate(provider.as_ref());
    let keyring = Keyring::new(provider.clone(), fast_params());
    keyring.unlock_with_mak("grace", mak.clone()).unwrap();

    let source = SlowFolders::default();
    source
        .inner
        .insert(keyring.create_root_folder_key("root").unwrap());
    let root_key = keyring.cached_folder_key("root").unwrap();
    for id in ["x", "y"] {
        source
            .inner
            .insert(keyring.create_child_folder_key(id, "root", &root_key).unwrap());
    }

    keyring.lock();
    keyring.unlock_with_mak("grace", mak).unwrap();
    let opens_before = counting.opens.load(Ordering::SeqCst);

    let (x, y) = tokio::join!(
        keyring.resolve_folder_key(&source, "x"),
        keyring.resolve_folder_key(&source, "y"),
    );
    assert_ne!(x.unwrap().as_bytes(), y.unwrap().as_bytes());

    // root, x, y: each fetched and unwrapped once
    assert_eq!(counting.opens.load(Ordering::SeqCst) - opens_before, 3);
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    assert!(keyring.has_folder_key("root"));
}

#[tokio::test]
async fn concurrent_walks_into_a_parent_loop_fail_without_hanging() {
    let provider: Arc<dyn CryptoProvider> = Arc::new(AesGcmProvider::new());
    let keyring = Keyring::new(provider.clone(), fast_params());
    keyring
        .unlock_with_mak("heidi", SecretKey::generate(provider.as_ref()))
        .unwrap();

    // x names y as its parent and y names x
    let source = SlowFolders::default();
    for (id, parent) in [("x", "y"), ("y", "x")] {
        source.inner.insert(FolderMeta {
            folder_id: id.to_string(),
            parent_id: Some(parent.to_string()),
            key_version: 1,
            wrapped_fok: vec![0u8; 60],
        });
    }

    let (a, b) = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        tokio::join!(
            keyring.resolve_folder_key(&source, "x"),
            keyring.resolve_folder_key(&source, "y"),
        )
    })
    .await
    .expect("resolvers deadlocked");

    assert!(matches!(a, Err(CryptoError::FolderCycle(_))));
    assert!(matches!(b, Err(CryptoError::FolderCycle(_))));
    assert!(!keyring.has_folder_key("x"));
    assert!(!keyring.has_folder_key("y"));

    // Gates were released: a fresh walk reports the same loop
    assert!(matches!(
        keyring.resolve_folder_key(&source, "x").await,
        Err(CryptoError::FolderCycle(_))
    ));
}
