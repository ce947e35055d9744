//! Memoization: at-most-one concurrent build per key, backed by a
//! pluggable persistent key/value store for cross-process caching.

use crate::error::{RuleError, StoreError};
use crate::hash::Hash;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// The persistent layer this crate expects the embedding application
/// to supply. A simple file-backed default ([`FileKvStore`]) is
/// provided so the crate is usable standalone; production users are
/// free to substitute a real database behind this trait.
pub trait PersistentStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
}

/// One file per key under a cache directory, written via
/// write-to-temp-then-atomic-rename so a crash never leaves a
/// half-written cache entry.
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are command hashes / query hashes: already filesystem-safe.
        self.dir.join(format!("{key}.json"))
    }
}

impl PersistentStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let dest = self.path_for(key);
        let tmp = self.dir.join(format!(".{key}.tmp"));
        std::fs::write(&tmp, value).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &dest).map_err(|source| StoreError::Io {
            path: dest,
            source,
        })
    }
}

type InFlight = Arc<OnceCell<Result<Hash, Arc<RuleError>>>>;

/// Guarantees at-most-one concurrent build per query key: the first
/// caller for a key inserts a fresh cell and drives the computation;
/// later callers for the same key await the same cell.
pub struct RuleRegistry<S: PersistentStore> {
    store: S,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

impl<S: PersistentStore> RuleRegistry<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `build` for `key` if no cached or in-flight result exists;
    /// otherwise return the cached or shared in-flight result.
    pub async fn resolve<F, Fut>(&self, key: &str, build: F) -> Result<Hash, RuleError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Hash, RuleError>>,
    {
        if let Some(bytes) = self.store.get(key)? {
            let s = String::from_utf8_lossy(&bytes).into_owned();
            return Ok(Hash::from_raw(s));
        }

        let cell = {
            let mut guard = self.in_flight.lock().unwrap();
            guard.entry(key.to_string()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };

        let result = cell
            .get_or_init(|| async {
                let outcome: Result<Hash, Arc<RuleError>> = async {
                    let hash = build().await?;
                    self.store.put(key, hash.as_str().as_bytes())?;
                    Ok(hash)
                }
                .await
                .map_err(Arc::new);
                outcome
            })
            .await;

        self.in_flight.lock().unwrap().remove(key);

        match result {
            Ok(hash) => Ok(hash.clone()),
            Err(e) => Err(StoreError::Kv(e.to_string()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn file_kv_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FileKvStore::new(dir.path());
        assert_eq!(kv.get("k").unwrap(), None);
        kv.put("k", b"v").unwrap();
        assert_eq!(kv.get("k").unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn resolve_caches_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RuleRegistry::new(FileKvStore::new(dir.path()));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let hash = registry
                .resolve("key1", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Hash::from_raw("h1".to_string()))
                })
                .await
                .unwrap();
            assert_eq!(hash, Hash::from_raw("h1".to_string()));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_resolve_runs_builder_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(RuleRegistry::new(FileKvStore::new(dir.path())));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .resolve("key2", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok(Hash::from_raw("h2".to_string()))
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
