//! Result-directory acquisition: consult the local store, then an
//! optional shared cache, then build; publish atomically and freeze.

use crate::error::StoreError;
use crate::hash::Hash;
use pier_platform::{make_immutable, make_mutable};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const COMPLETE_MARKER: &str = ".pier-complete";

#[derive(Debug, Serialize, Deserialize)]
struct CompletionMarker {
    version: u32,
}

/// Path of the published result directory for `hash` under `artifact_dir`.
pub fn result_dir(artifact_dir: &Path, hash: &Hash) -> PathBuf {
    artifact_dir.join(hash.as_str())
}

/// A result directory is only trustworthy if it carries the completion
/// marker written as the very last step of a successful build — a
/// directory left behind by a process killed mid-build has no marker
/// and must be treated as absent.
pub fn is_complete(dir: &Path) -> bool {
    dir.join(COMPLETE_MARKER).is_file()
}

fn write_completion_marker(dir: &Path) -> Result<(), StoreError> {
    let marker = dir.join(COMPLETE_MARKER);
    let json = serde_json::to_vec(&CompletionMarker { version: 1 }).map_err(|e| StoreError::Kv(e.to_string()))?;
    std::fs::write(&marker, json).map_err(|source| StoreError::Io {
        path: marker,
        source,
    })
}

/// Acquire the published result directory for `hash`, running `build`
/// only if neither the local store nor the shared cache already has a
/// complete copy. `build` receives a fresh temp directory and must
/// populate it completely before returning; it is then renamed
/// atomically into place and frozen.
pub async fn create_artifact<F, Fut>(
    artifact_dir: &Path,
    tmp_dir: &Path,
    shared_cache: Option<&Path>,
    hash: &Hash,
    build: F,
) -> Result<PathBuf, StoreError>
where
    F: FnOnce(PathBuf) -> Fut,
    Fut: std::future::Future<Output = Result<(), StoreError>>,
{
    let dest = result_dir(artifact_dir, hash);
    if is_complete(&dest) {
        debug!(hash = %hash, "cache hit");
        return Ok(dest);
    }
    if dest.exists() {
        warn!(hash = %hash, "incomplete result directory found, discarding");
        make_mutable(&dest)?;
        std::fs::remove_dir_all(&dest).map_err(|source| StoreError::Io {
            path: dest.clone(),
            source,
        })?;
    }

    if let Some(cache) = shared_cache {
        let cached = cache.join(hash.as_str());
        if is_complete(&cached) {
            info!(hash = %hash, "shared cache hit");
            copy_tree(&cached, &dest)?;
            return Ok(dest);
        }
    }

    std::fs::create_dir_all(tmp_dir).map_err(|source| StoreError::Io {
        path: tmp_dir.to_path_buf(),
        source,
    })?;
    let staging = tempfile::Builder::new()
        .prefix(&format!("{}-", hash.as_str()))
        .tempdir_in(tmp_dir)
        .map_err(|source| StoreError::Io {
            path: tmp_dir.to_path_buf(),
            source,
        })?;

    info!(hash = %hash, "building");
    build(staging.path().to_path_buf()).await?;
    write_completion_marker(staging.path())?;

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::rename(staging.path(), &dest).map_err(|source| StoreError::Io {
        path: dest.clone(),
        source,
    })?;
    // Drop without cleanup: the directory was already moved out from
    // under the TempDir guard.
    std::mem::forget(staging);

    make_immutable(&dest)?;
    info!(hash = %hash, "published");
    Ok(dest)
}

fn copy_tree(src: &Path, dest: &Path) -> Result<(), StoreError> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| StoreError::Kv(e.to_string()))?;
        let rel = entry.path().strip_prefix(src).unwrap();
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|source| StoreError::Io {
                path: target,
                source,
            })?;
        } else if entry.file_type().is_symlink() {
            let link = std::fs::read_link(entry.path()).map_err(|source| StoreError::Io {
                path: entry.path().to_path_buf(),
                source,
            })?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target).map_err(|source| StoreError::Io {
                path: target.clone(),
                source,
            })?;
            #[cfg(windows)]
            std::os::windows::fs::symlink_file(&link, &target).map_err(|source| StoreError::Io {
                path: target.clone(),
                source,
            })?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(|source| StoreError::Io {
                path: target,
                source,
            })?;
        }
    }
    Ok(())
}

/// Temporarily restore write permissions on a published result
/// directory. Only for callers performing intentional destructive
/// operations outside the memoizer (e.g. garbage collection).
pub fn unfreeze_artifact(dir: &Path) -> Result<(), StoreError> {
    make_mutable(dir).map_err(StoreError::from)
}
