//! Sandbox materialization: laying an artifact set out as symlinks in
//! a temp directory, and the shadow engine for recursive replication.

use crate::artifact::Artifact;
use crate::error::SandboxError;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Deduplicate an input set: if two artifacts share a source and one's
/// subpath is a prefix of the other's (i.e. one shadows a directory the
/// other lives under), drop the descendant.
///
/// Known limitation, preserved intentionally: paths are sorted as raw
/// strings, not by path component, so a sibling like `Picture.hs` can
/// sort between `Picture` and `Picture/Foo` and this comparison misses
/// the dedup. Fixing it would change which artifacts silently vanish
/// from existing sandboxes, so callers should not rely on perfect
/// coverage here.
pub fn dedup_artifacts(set: &BTreeSet<Artifact>) -> Vec<Artifact> {
    let mut sorted: Vec<&Artifact> = set.iter().collect();
    sorted.sort_by(|a, b| a.path_in().cmp(&b.path_in()));

    let mut result: Vec<Artifact> = Vec::with_capacity(sorted.len());
    for candidate in sorted {
        if let Some(last) = result.last() {
            if last.source() == candidate.source()
                && candidate.path_in().starts_with(last.path_in())
            {
                continue;
            }
        }
        result.push(candidate.clone());
    }
    result
}

/// Reject the materialization before it begins if any two inputs would
/// land at the same sandbox path.
pub fn check_all_distinct_paths(artifacts: &[Artifact]) -> Result<(), SandboxError> {
    let mut seen = BTreeSet::new();
    for a in artifacts {
        let p = a.path_in();
        if !seen.insert(p.clone()) {
            return Err(SandboxError::PathCollision(p));
        }
    }
    Ok(())
}

/// Materialize `inputs` into `sandbox` as symlinks pointing at their
/// real paths under `project_root`/`store_root`.
pub fn materialize_inputs(
    sandbox: &Path,
    project_root: &Path,
    store_root: &Path,
    inputs: &BTreeSet<Artifact>,
) -> Result<(), SandboxError> {
    let deduped = dedup_artifacts(inputs);
    check_all_distinct_paths(&deduped)?;

    for a in &deduped {
        if a.is_absolute_external() {
            // Referenced in place by its absolute path; nothing to link.
            continue;
        }
        let real = a.real_path(project_root, store_root);
        if !real.exists() {
            return Err(SandboxError::MissingSource(real));
        }
        let dest = sandbox.join(a.path_in());
        link_one(&dest, &real)?;
    }
    Ok(())
}

fn link_one(dest: &Path, real: &Path) -> Result<(), SandboxError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SandboxError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    if dest.symlink_metadata().is_ok() {
        // Already linked (e.g. shared prefix survived dedup); leave it.
        return Ok(());
    }
    debug!(dest = %dest.display(), real = %real.display(), "materializing input");
    symlink(real, dest)
}

#[cfg(unix)]
fn symlink(real: &Path, dest: &Path) -> Result<(), SandboxError> {
    std::os::unix::fs::symlink(real, dest).map_err(|source| SandboxError::Io {
        path: dest.to_path_buf(),
        source,
    })
}

#[cfg(windows)]
fn symlink(real: &Path, dest: &Path) -> Result<(), SandboxError> {
    let result = if real.is_dir() {
        junction::create(real, dest).map_err(std::io::Error::from)
    } else {
        std::os::windows::fs::symlink_file(real, dest)
    };
    result.map_err(|source| SandboxError::Io {
        path: dest.to_path_buf(),
        source,
    })
}

/// How many path components deep `p` sits (used to compute a relative
/// symlink target back up to the sandbox root).
fn depth(p: &Path) -> usize {
    p.components().count()
}

/// Replicate `artifact` at sandbox-relative path `dest` within
/// `sandbox`. Directories are recreated as real directories whose
/// children are recursively shadowed; files become symlinks whose
/// target is computed relative to `dest`'s parent, so the sandbox
/// remains relocatable.
pub fn link_shadow(
    sandbox: &Path,
    project_root: &Path,
    store_root: &Path,
    artifact: &Artifact,
    dest: &Path,
) -> Result<(), SandboxError> {
    if dest.is_absolute() {
        return Err(SandboxError::AbsoluteShadowDest(dest.to_path_buf()));
    }

    let real = artifact.real_path(project_root, store_root);
    if !real.exists() {
        return Err(SandboxError::MissingSource(real));
    }

    let abs_dest = sandbox.join(dest);
    if abs_dest.symlink_metadata().is_ok() {
        return Err(SandboxError::ShadowDestExists(dest.to_path_buf()));
    }

    if real.is_dir() {
        std::fs::create_dir_all(&abs_dest).map_err(|source| SandboxError::Io {
            path: abs_dest.clone(),
            source,
        })?;
        for entry in std::fs::read_dir(&real).map_err(|source| SandboxError::Io {
            path: real.clone(),
            source,
        })? {
            let entry = entry.map_err(|source| SandboxError::Io {
                path: real.clone(),
                source,
            })?;
            let name = entry.file_name();
            let child_artifact = artifact
                .extend(&name)
                .map_err(|_| SandboxError::PathCollision(dest.join(&name)))?;
            link_shadow(
                sandbox,
                project_root,
                store_root,
                &child_artifact,
                &dest.join(&name),
            )?;
        }
        Ok(())
    } else {
        let parent = dest.parent().unwrap_or_else(|| Path::new(""));
        let ascend = "../".repeat(depth(parent));
        let target = PathBuf::from(format!("{ascend}{}", artifact.path_in().display()));
        if let Some(p) = abs_dest.parent() {
            std::fs::create_dir_all(p).map_err(|source| SandboxError::Io {
                path: p.to_path_buf(),
                source,
            })?;
        }
        symlink(&target, &abs_dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Hash;

    fn built(hash: &str, sub: &str) -> Artifact {
        Artifact::built(Hash::from_raw(hash.to_string()), sub).unwrap()
    }

    #[test]
    fn dedup_drops_child_of_shadowed_dir() {
        let mut set = BTreeSet::new();
        set.insert(built("h1", "pkg"));
        set.insert(built("h1", "pkg/sub"));
        let result = dedup_artifacts(&set);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].subpath(), Path::new("pkg"));
    }

    #[test]
    fn dedup_keeps_distinct_sources() {
        let mut set = BTreeSet::new();
        set.insert(built("h1", "pkg"));
        set.insert(built("h2", "pkg/sub"));
        let result = dedup_artifacts(&set);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn distinct_paths_rejects_collision() {
        let a = built("h1", "x");
        let b = built("h2", "x");
        assert!(check_all_distinct_paths(&[a, b]).is_err());
    }

    #[test]
    fn distinct_paths_allows_unique() {
        let a = built("h1", "x");
        let b = built("h1", "y");
        assert!(check_all_distinct_paths(&[a, b]).is_ok());
    }

    #[test]
    #[cfg(unix)]
    fn materialize_creates_symlinks() {
        let project = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let sandbox = tempfile::tempdir().unwrap();

        std::fs::write(project.path().join("src.txt"), "data").unwrap();
        let a = Artifact::external("src.txt").unwrap();
        let mut set = BTreeSet::new();
        set.insert(a.clone());

        materialize_inputs(sandbox.path(), project.path(), store.path(), &set).unwrap();

        let link = sandbox.path().join(a.path_in());
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read_to_string(&link).unwrap(), "data");
    }

    #[test]
    #[cfg(unix)]
    fn shadow_file_uses_relative_target() {
        let project = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let sandbox = tempfile::tempdir().unwrap();

        std::fs::write(project.path().join("src.txt"), "data").unwrap();
        let a = Artifact::external("src.txt").unwrap();

        link_shadow(
            sandbox.path(),
            project.path(),
            store.path(),
            &a,
            Path::new("nested/dest.txt"),
        )
        .unwrap();

        let dest = sandbox.path().join("nested/dest.txt");
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "data");
        let target = std::fs::read_link(&dest).unwrap();
        assert!(target.starts_with(".."));
    }

    #[test]
    #[cfg(unix)]
    fn shadow_refuses_to_overwrite() {
        let project = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let sandbox = tempfile::tempdir().unwrap();

        std::fs::write(project.path().join("src.txt"), "data").unwrap();
        let a = Artifact::external("src.txt").unwrap();
        std::fs::write(sandbox.path().join("dest.txt"), "existing").unwrap();

        let err = link_shadow(
            sandbox.path(),
            project.path(),
            store.path(),
            &a,
            Path::new("dest.txt"),
        )
        .unwrap_err();
        assert!(matches!(err, SandboxError::ShadowDestExists(_)));
    }

    #[test]
    #[cfg(unix)]
    fn link_shadow_rejects_absolute_dest() {
        let project = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let sandbox = tempfile::tempdir().unwrap();

        std::fs::write(project.path().join("src.txt"), "data").unwrap();
        let a = Artifact::external("src.txt").unwrap();

        let err = link_shadow(
            sandbox.path(),
            project.path(),
            store.path(),
            &a,
            Path::new("/etc/passwd"),
        )
        .unwrap_err();
        assert!(matches!(err, SandboxError::AbsoluteShadowDest(_)));
    }
}
