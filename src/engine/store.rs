// Namespaced response store — durable key→response cache, in memory or on disk.
//
// On disk every namespace is a directory under the storage root, and every
// entry is one file named by the SHA-256 of its key:
//
//   [u32 BE metadata length][metadata JSON][body bytes]
//
// Entries are written to a temp file and renamed into place, so a reader
// never sees a half-written entry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use futures_util::future::join_all;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::request::{AssetRequest, CacheKey, MatchOptions};
use super::response::{CachedResponse, EntryMeta};
use crate::config::{STORE_ENTRY_EXT, STORE_TMP_EXT};
use crate::source::traits::NetworkSource;

/// Registry of named namespaces.
pub struct CacheStorage {
    root: Option<PathBuf>,
    namespaces: Mutex<HashMap<String, Arc<CacheNamespace>>>,
}

impl CacheStorage {
    pub fn in_memory() -> Self {
        Self {
            root: None,
            namespaces: Mutex::new(HashMap::new()),
        }
    }

    /// Storage whose namespaces live as directories under `root`.
    pub fn on_disk(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            namespaces: Mutex::new(HashMap::new()),
        }
    }

    /// Open (creating if needed) the namespace called `name`.
    pub async fn open(&self, name: &str) -> Result<Arc<CacheNamespace>> {
        validate_name(name)?;
        let mut map = self.namespaces.lock().await;
        if let Some(ns) = map.get(name) {
            return Ok(ns.clone());
        }

        let ns = match &self.root {
            Some(root) => CacheNamespace::load(name, root.join(name)).await?,
            None => CacheNamespace::new(name.to_string(), None),
        };
        let ns = Arc::new(ns);
        map.insert(name.to_string(), ns.clone());
        Ok(ns)
    }

    pub async fn has(&self, name: &str) -> Result<bool> {
        Ok(self.keys().await?.iter().any(|k| k == name))
    }

    /// Delete a namespace and every entry in it. Returns whether it existed.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        let mut map = self.namespaces.lock().await;
        let mut existed = map.remove(name).is_some();

        if let Some(root) = &self.root {
            let dir = root.join(name);
            match fs::remove_dir_all(&dir).await {
                Ok(()) => existed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("removing {}", dir.display()));
                }
            }
        }

        if existed {
            info!("cache namespace {} deleted", name);
        }
        Ok(existed)
    }

    /// Names of every namespace, sorted.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.namespaces.lock().await.keys().cloned().collect();

        if let Some(root) = &self.root {
            match fs::read_dir(root).await {
                Ok(mut dir) => {
                    while let Some(entry) = dir.next_entry().await? {
                        if !entry.file_type().await?.is_dir() {
                            continue;
                        }
                        if let Some(name) = entry.file_name().to_str() {
                            if !names.iter().any(|n| n == name) {
                                names.push(name.to_string());
                            }
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("listing {}", root.display()));
                }
            }
        }

        names.sort();
        Ok(names)
    }

    /// Look `request` up in every namespace, in name order.
    pub async fn match_all(
        &self,
        request: &AssetRequest,
        opts: MatchOptions,
    ) -> Result<Option<CachedResponse>> {
        for name in self.keys().await? {
            let ns = self.open(&name).await?;
            if let Some(resp) = ns.match_request(request, opts) {
                return Ok(Some(resp));
            }
        }
        Ok(None)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        bail!("invalid cache namespace name '{}'", name);
    }
    Ok(())
}

struct StoredEntry {
    response: CachedResponse,
    seq: u64,
}

/// One versioned key→response store.
pub struct CacheNamespace {
    name: String,
    dir: Option<PathBuf>,
    entries: RwLock<HashMap<CacheKey, StoredEntry>>,
    next_seq: AtomicU64,
}

impl CacheNamespace {
    fn new(name: String, dir: Option<PathBuf>) -> Self {
        Self {
            name,
            dir,
            entries: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Create `dir` if missing and index every entry already in it.
    async fn load(name: &str, dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let mut entries = HashMap::new();
        let mut max_seq = 0u64;
        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(file) = read_dir.next_entry().await? {
            let path = file.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(ext) if ext == STORE_TMP_EXT => {
                    debug!("removing stale temp file {}", path.display());
                    let _ = fs::remove_file(&path).await;
                }
                Some(ext) if ext == STORE_ENTRY_EXT => match read_entry_file(&path).await {
                    Ok((meta, body)) => {
                        max_seq = max_seq.max(meta.seq + 1);
                        let key = CacheKey {
                            method: meta.method,
                            url: meta.url,
                        };
                        let response = CachedResponse {
                            status: meta.status,
                            headers: meta.headers,
                            body,
                        };
                        entries.insert(
                            key,
                            StoredEntry {
                                response,
                                seq: meta.seq,
                            },
                        );
                    }
                    Err(e) => warn!("skipping unreadable cache entry {}: {:#}", path.display(), e),
                },
                _ => {}
            }
        }

        info!(
            "cache namespace {} opened at {} ({} entries)",
            name,
            dir.display(),
            entries.len()
        );

        let ns = Self::new(name.to_string(), Some(dir));
        *ns.entries.write() = entries;
        ns.next_seq.store(max_seq, Ordering::Relaxed);
        Ok(ns)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored keys in insertion order.
    pub fn keys(&self) -> Vec<CacheKey> {
        let entries = self.entries.read();
        let mut keyed: Vec<(u64, CacheKey)> =
            entries.iter().map(|(k, e)| (e.seq, k.clone())).collect();
        keyed.sort_by_key(|(seq, _)| *seq);
        keyed.into_iter().map(|(_, k)| k).collect()
    }

    /// The oldest stored response matching `request` under `opts`.
    pub fn match_request(
        &self,
        request: &AssetRequest,
        opts: MatchOptions,
    ) -> Option<CachedResponse> {
        let wanted = request.key();
        let entries = self.entries.read();

        if let Some(entry) = entries.get(&wanted) {
            if !opts.ignore_search {
                return Some(entry.response.clone());
            }
        }

        entries
            .iter()
            .filter(|(key, _)| key.matches(&wanted, opts))
            .min_by_key(|(_, entry)| entry.seq)
            .map(|(_, entry)| entry.response.clone())
    }

    /// Store `response` under `request`, replacing any previous entry for
    /// the same key. Only GET requests can be stored.
    pub async fn put(&self, request: &AssetRequest, response: CachedResponse) -> Result<()> {
        if !request.is_get() {
            bail!("cannot store {} {}: only GET is cacheable", request.method, request.url);
        }

        let key = request.key();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        if let Some(dir) = &self.dir {
            write_entry_file(dir, &key, &response, seq).await?;
        }

        debug!(
            "cache {} put {} ({} bytes, status {})",
            self.name,
            key,
            response.body.len(),
            response.status
        );
        self.entries.write().insert(key, StoredEntry { response, seq });
        Ok(())
    }

    /// Fetch every request and store the results as one batch.
    ///
    /// Nothing is written unless every fetch produced an OK response.
    /// Returns the number of distinct entries stored.
    pub async fn add_all(
        &self,
        source: &dyn NetworkSource,
        requests: &[AssetRequest],
    ) -> Result<usize> {
        let fetches = requests.iter().map(move |req| async move {
            let resp = source.fetch(req).await?;
            if !resp.is_ok() {
                return Err(anyhow!("{}: HTTP {}", req.url, resp.status));
            }
            Ok::<_, anyhow::Error>(resp)
        });
        let results = join_all(fetches).await;

        let mut responses = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for (req, result) in requests.iter().zip(results) {
            match result {
                Ok(resp) => responses.push((req, resp)),
                Err(e) => failures.push(format!("{:#}", e)),
            }
        }
        if !failures.is_empty() {
            bail!(
                "{} of {} requests failed: {}",
                failures.len(),
                requests.len(),
                failures.join("; ")
            );
        }

        for (req, resp) in responses {
            self.put(req, resp).await?;
        }
        let mut distinct: Vec<CacheKey> = requests.iter().map(AssetRequest::key).collect();
        distinct.sort_by(|a, b| a.url.cmp(&b.url).then_with(|| a.method.cmp(&b.method)));
        distinct.dedup();
        Ok(distinct.len())
    }

    /// Remove every entry matching `request`. Returns whether anything was removed.
    pub async fn delete(&self, request: &AssetRequest, opts: MatchOptions) -> Result<bool> {
        let wanted = request.key();
        let removed: Vec<CacheKey> = {
            let mut entries = self.entries.write();
            let doomed: Vec<CacheKey> = entries
                .keys()
                .filter(|key| key.matches(&wanted, opts))
                .cloned()
                .collect();
            for key in &doomed {
                entries.remove(key);
            }
            doomed
        };

        if let Some(dir) = &self.dir {
            for key in &removed {
                let path = entry_path(dir, key);
                if let Err(e) = fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(e).with_context(|| format!("removing {}", path.display()));
                    }
                }
            }
        }

        Ok(!removed.is_empty())
    }
}

fn entry_file_stem(key: &CacheKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.method.as_bytes());
    hasher.update(b" ");
    hasher.update(key.url.as_bytes());
    hex::encode(hasher.finalize())
}

fn entry_path(dir: &Path, key: &CacheKey) -> PathBuf {
    dir.join(format!("{}.{}", entry_file_stem(key), STORE_ENTRY_EXT))
}

async fn write_entry_file(
    dir: &Path,
    key: &CacheKey,
    response: &CachedResponse,
    seq: u64,
) -> Result<()> {
    let meta = serde_json::to_vec(&response.meta(&key.method, &key.url, seq))?;
    let meta_len = u32::try_from(meta.len()).context("entry metadata too large")?;

    let mut buf = Vec::with_capacity(4 + meta.len() + response.body.len());
    buf.extend_from_slice(&meta_len.to_be_bytes());
    buf.extend_from_slice(&meta);
    buf.extend_from_slice(&response.body);

    // Unique per write so concurrent puts of one key never share a temp file.
    let tmp = dir.join(format!("{}.{}.{}", entry_file_stem(key), seq, STORE_TMP_EXT));
    let dest = entry_path(dir, key);
    fs::write(&tmp, &buf)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    if let Err(e) = fs::rename(&tmp, &dest).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("renaming into {}", dest.display()));
    }
    Ok(())
}

async fn read_entry_file(path: &Path) -> Result<(EntryMeta, Bytes)> {
    let raw = fs::read(path).await?;
    if raw.len() < 4 {
        bail!("truncated header");
    }
    let meta_len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    let body_start = 4 + meta_len;
    if raw.len() < body_start {
        bail!("truncated metadata ({} < {})", raw.len(), body_start);
    }
    let meta: EntryMeta = serde_json::from_slice(&raw[4..body_start])?;
    let body = Bytes::from(raw).slice(body_start..);
    Ok((meta, body))
}
