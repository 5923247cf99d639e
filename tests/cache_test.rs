// Fetch-intercept and install behaviour against a scripted in-process network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;

use wondergolf_cache::engine::request::{AssetRequest, MatchOptions};
use wondergolf_cache::engine::response::CachedResponse;
use wondergolf_cache::engine::store::CacheStorage;
use wondergolf_cache::source::traits::NetworkSource;
use wondergolf_cache::{CacheConfig, CacheError, LifecycleState, OfflineAssetCache};

const ORIGIN: &str = "http://origin.test/";

/// Serves fixed bodies by path; any other path fails as if offline.
struct ScriptedSource {
    files: HashMap<String, (u16, &'static str)>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedSource {
    fn new(files: &[(&str, u16, &'static str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(p, s, b)| (p.to_string(), (*s, *b)))
                .collect(),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkSource for ScriptedSource {
    async fn fetch(&self, request: &AssetRequest) -> anyhow::Result<CachedResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.files.get(request.url.path()) {
            Some((status, body)) => Ok(CachedResponse::new(
                *status,
                vec![("content-type".to_string(), "text/plain".to_string())],
                *body,
            )),
            None => Err(anyhow!("network unreachable")),
        }
    }
}

fn build(
    manifest: &[&str],
    source: Arc<ScriptedSource>,
    storage: Arc<CacheStorage>,
) -> OfflineAssetCache {
    let config = CacheConfig::new("AppStatic-v1", ORIGIN, manifest);
    OfflineAssetCache::new(config, storage, source).unwrap()
}

async fn active_cache(source: Arc<ScriptedSource>) -> (OfflineAssetCache, Arc<CacheStorage>) {
    let storage = Arc::new(CacheStorage::in_memory());
    let cache = build(&[], source, storage.clone());
    cache.install().await.unwrap();
    cache.activate().await.unwrap();
    (cache, storage)
}

async fn entry_count(storage: &CacheStorage) -> usize {
    storage.open("AppStatic-v1").await.unwrap().len()
}

#[tokio::test]
async fn test_install_stores_every_manifest_entry() {
    let source = Arc::new(ScriptedSource::new(&[
        ("/a.txt", 200, "A"),
        ("/b.txt", 200, "B"),
    ]));
    let storage = Arc::new(CacheStorage::in_memory());
    let cache = build(&["a.txt", "b.txt"], source.clone(), storage.clone());

    let report = cache.install().await.unwrap();
    assert_eq!(report.entries, 2);
    assert_eq!(report.cache_name, "AppStatic-v1");
    assert_eq!(entry_count(&storage).await, 2);
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn test_install_fails_on_unreachable_entry() {
    let source = Arc::new(ScriptedSource::new(&[("/a.txt", 200, "A")]));
    let storage = Arc::new(CacheStorage::in_memory());
    let cache = build(&["a.txt", "gone.txt"], source, storage.clone());

    let err = cache.install().await.unwrap_err();
    match err {
        CacheError::InstallFailed { cache_name, reason } => {
            assert_eq!(cache_name, "AppStatic-v1");
            assert!(reason.contains("gone.txt"), "reason: {}", reason);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(cache.state(), LifecycleState::InstallFailed);
    // The batch is written only when every fetch succeeded.
    assert_eq!(entry_count(&storage).await, 0);
}

#[tokio::test]
async fn test_install_fails_on_error_status() {
    let source = Arc::new(ScriptedSource::new(&[
        ("/a.txt", 200, "A"),
        ("/b.txt", 404, "not found"),
    ]));
    let storage = Arc::new(CacheStorage::in_memory());
    let cache = build(&["a.txt", "b.txt"], source, storage.clone());

    assert!(matches!(
        cache.install().await,
        Err(CacheError::InstallFailed { .. })
    ));
    assert_eq!(entry_count(&storage).await, 0);
}

#[tokio::test]
async fn test_duplicate_manifest_entries_stored_once() {
    let source = Arc::new(ScriptedSource::new(&[("/a.txt", 200, "A")]));
    let storage = Arc::new(CacheStorage::in_memory());
    let cache = build(&["a.txt", "a.txt"], source, storage.clone());

    assert_eq!(cache.install().await.unwrap().entries, 1);
    assert_eq!(entry_count(&storage).await, 1);
}

#[tokio::test]
async fn test_hit_never_touches_network() {
    let source = Arc::new(ScriptedSource::new(&[("/video.mp4", 200, "frames")]));
    let storage = Arc::new(CacheStorage::in_memory());
    let cache = build(&["video.mp4"], source.clone(), storage);
    cache.install().await.unwrap();
    cache.activate().await.unwrap();
    assert_eq!(source.calls(), 1);

    let req = cache.request_for("/video.mp4?t=5").unwrap();
    let resp = cache.handle_fetch(&req).await.unwrap();
    assert_eq!(resp.body, Bytes::from("frames"));
    assert_eq!(source.calls(), 1);

    let stats = cache.stats().await;
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 0);
}

#[tokio::test]
async fn test_miss_populates_store() {
    let source = Arc::new(ScriptedSource::new(&[("/c.txt", 200, "X")]));
    let (cache, storage) = active_cache(source.clone()).await;

    let req = cache.request_for("/c.txt").unwrap();
    let first = cache.handle_fetch(&req).await.unwrap();
    assert_eq!(first.body, Bytes::from("X"));
    assert_eq!(source.calls(), 1);

    let ns = storage.open("AppStatic-v1").await.unwrap();
    let stored = ns.match_request(&req, MatchOptions::default()).unwrap();
    assert_eq!(stored, first);

    let second = cache.handle_fetch(&req).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn test_query_variants_share_one_entry() {
    let source = Arc::new(ScriptedSource::new(&[("/video.mp4", 200, "frames")]));
    let (cache, storage) = active_cache(source.clone()).await;

    let first = cache
        .handle_fetch(&cache.request_for("/video.mp4?x=1").unwrap())
        .await
        .unwrap();
    let second = cache
        .handle_fetch(&cache.request_for("/video.mp4?x=2").unwrap())
        .await
        .unwrap();
    let bare = cache
        .handle_fetch(&cache.request_for("/video.mp4").unwrap())
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first, bare);
    assert_eq!(source.calls(), 1);
    assert_eq!(entry_count(&storage).await, 1);
}

#[tokio::test]
async fn test_error_status_is_cached_too() {
    let source = Arc::new(ScriptedSource::new(&[("/broken.txt", 500, "oops")]));
    let (cache, storage) = active_cache(source.clone()).await;

    let req = cache.request_for("/broken.txt").unwrap();
    let resp = cache.handle_fetch(&req).await.unwrap();
    assert_eq!(resp.status, 500);
    assert_eq!(entry_count(&storage).await, 1);

    cache.handle_fetch(&req).await.unwrap();
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn test_network_failure_propagates_and_store_unchanged() {
    let source = Arc::new(ScriptedSource::new(&[]));
    let (cache, storage) = active_cache(source.clone()).await;

    let req = cache.request_for("/missing.txt").unwrap();
    let err = cache.handle_fetch(&req).await.unwrap_err();
    assert!(err.is_network());
    assert!(err.to_string().contains("missing.txt"));
    assert_eq!(entry_count(&storage).await, 0);

    // No retry: the next request goes to the network again.
    assert!(cache.handle_fetch(&req).await.is_err());
    assert_eq!(source.calls(), 2);
    assert_eq!(cache.stats().await.network_failures, 2);
}

#[tokio::test]
async fn test_stored_and_returned_bodies_both_readable() {
    let body: &'static str = "0123456789abcdef";
    let source = Arc::new(ScriptedSource::new(&[("/d.bin", 200, body)]));
    let (cache, storage) = active_cache(source).await;

    let req = cache.request_for("/d.bin").unwrap();
    let returned = cache.handle_fetch(&req).await.unwrap();
    let returned_bytes = returned.body.to_vec();
    drop(returned);

    let ns = storage.open("AppStatic-v1").await.unwrap();
    let stored = ns.match_request(&req, MatchOptions::default()).unwrap();
    assert_eq!(returned_bytes, body.as_bytes());
    assert_eq!(&stored.body[..], body.as_bytes());
}

#[tokio::test]
async fn test_non_get_bypasses_store() {
    let source = Arc::new(ScriptedSource::new(&[("/score", 200, "ok")]));
    let (cache, storage) = active_cache(source.clone()).await;

    let url = cache.origin().join("score").unwrap();
    let post = AssetRequest::new(reqwest::Method::POST, url);
    cache.handle_fetch(&post).await.unwrap();
    cache.handle_fetch(&post).await.unwrap();

    assert_eq!(source.calls(), 2);
    assert_eq!(entry_count(&storage).await, 0);
}

#[tokio::test]
async fn test_concurrent_misses_both_fetch_without_dedupe() {
    let source = Arc::new(
        ScriptedSource::new(&[("/big.wasm", 200, "wasm")]).with_delay(Duration::from_millis(50)),
    );
    let (cache, storage) = active_cache(source.clone()).await;

    let req = cache.request_for("/big.wasm").unwrap();
    let results = join_all((0..2).map(|_| cache.handle_fetch(&req))).await;
    for r in results {
        assert_eq!(r.unwrap().body, Bytes::from("wasm"));
    }
    assert_eq!(source.calls(), 2);
    assert_eq!(entry_count(&storage).await, 1);
}

#[tokio::test]
async fn test_concurrent_misses_single_flight() {
    let source = Arc::new(
        ScriptedSource::new(&[("/big.wasm", 200, "wasm")]).with_delay(Duration::from_millis(50)),
    );
    let storage = Arc::new(CacheStorage::in_memory());
    let mut config = CacheConfig::new("AppStatic-v1", ORIGIN, &[]);
    config.dedupe_inflight = true;
    let cache = OfflineAssetCache::new(config, storage.clone(), source.clone()).unwrap();
    cache.install().await.unwrap();
    cache.activate().await.unwrap();

    let req = cache.request_for("/big.wasm").unwrap();
    let results = join_all((0..5).map(|_| cache.handle_fetch(&req))).await;
    for r in results {
        assert_eq!(r.unwrap().body, Bytes::from("wasm"));
    }
    assert_eq!(source.calls(), 1);
    assert_eq!(entry_count(&storage).await, 1);
}

#[tokio::test]
async fn test_single_flight_shares_failure() {
    let source = Arc::new(ScriptedSource::new(&[]).with_delay(Duration::from_millis(50)));
    let storage = Arc::new(CacheStorage::in_memory());
    let mut config = CacheConfig::new("AppStatic-v1", ORIGIN, &[]);
    config.dedupe_inflight = true;
    let cache = OfflineAssetCache::new(config, storage, source.clone()).unwrap();
    cache.install().await.unwrap();
    cache.activate().await.unwrap();

    let req = cache.request_for("/missing.txt").unwrap();
    let results = join_all((0..3).map(|_| cache.handle_fetch(&req))).await;
    assert!(results.iter().all(|r| matches!(r, Err(CacheError::Network { .. }))));
    assert_eq!(source.calls(), 1);

    // The failed flight is gone; a later miss fetches again.
    assert!(cache.handle_fetch(&req).await.is_err());
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn test_version_bump_isolates_and_prunes() {
    let source = Arc::new(ScriptedSource::new(&[("/a.txt", 200, "A")]));
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(CacheStorage::on_disk(dir.path()));

    let v1 = OfflineAssetCache::new(
        CacheConfig::new("AppStatic-v1", ORIGIN, &["a.txt"]),
        storage.clone(),
        source.clone(),
    )
    .unwrap();
    v1.install().await.unwrap();
    v1.activate().await.unwrap();

    let mut config = CacheConfig::new("AppStatic-v2", ORIGIN, &["a.txt"]);
    config.prune_stale_namespaces = true;
    let v2 = OfflineAssetCache::new(config, storage.clone(), source).unwrap();
    v2.install().await.unwrap();
    assert_eq!(
        storage.keys().await.unwrap(),
        vec!["AppStatic-v1".to_string(), "AppStatic-v2".to_string()]
    );

    v2.activate().await.unwrap();
    assert_eq!(storage.keys().await.unwrap(), vec!["AppStatic-v2".to_string()]);
    assert!(!dir.path().join("AppStatic-v1").exists());
}

#[tokio::test]
async fn test_disk_cache_serves_after_restart_while_offline() {
    let dir = tempfile::tempdir().unwrap();
    {
        let source = Arc::new(ScriptedSource::new(&[("/index.html", 200, "<html>")]));
        let storage = Arc::new(CacheStorage::on_disk(dir.path()));
        let cache = build(&["index.html"], source, storage);
        cache.install().await.unwrap();
    }

    // Same namespace, network gone.
    let offline = Arc::new(ScriptedSource::new(&[]));
    let storage = Arc::new(CacheStorage::on_disk(dir.path()));
    let cache = build(&["index.html"], offline.clone(), storage);
    let err = cache.install().await.unwrap_err();
    assert!(matches!(err, CacheError::InstallFailed { .. }));

    // A failed reinstall leaves the earlier entries in place.
    let ns = cache.storage().open("AppStatic-v1").await.unwrap();
    let hit = ns
        .match_request(
            &cache.request_for("index.html").unwrap(),
            MatchOptions::ignore_search(),
        )
        .unwrap();
    assert_eq!(hit.body, Bytes::from("<html>"));
    assert_eq!(offline.calls(), 1);
}
