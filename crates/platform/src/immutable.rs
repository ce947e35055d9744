//! Recursive permission freezing for published store trees.
//!
//! A "frozen" tree has its write bits cleared: regular files become
//! `0o444`, directories and executables `0o555`. On macOS, user-settable
//! BSD flags are also cleared so a later `chflags uchg` elsewhere can't
//! be mistaken for ours. On Windows the read-only file attribute stands
//! in for the missing permission bit.

use crate::error::ImmutableError;
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

/// Recursively clear write permissions under `path`.
///
/// A missing `path` is not an error — freezing an artifact that was
/// never materialized is a no-op, not a bug.
pub fn make_immutable(path: &Path) -> Result<(), ImmutableError> {
    if !path.exists() {
        return Ok(());
    }

    // Post-order: children lose their write bit before the parent
    // directory does, so intermediate failures don't strand a directory
    // we can no longer descend into.
    for entry in WalkDir::new(path).contents_first(true) {
        let entry = entry.map_err(|source| ImmutableError::WalkDir {
            path: path.to_path_buf(),
            source,
        })?;
        if let Err(e) = make_entry_immutable(entry.path()) {
            warn!(path = %entry.path().display(), error = %e, "failed to freeze entry");
        }
    }

    #[cfg(target_os = "macos")]
    clear_bsd_flags(path)?;

    Ok(())
}

/// Recursively restore write permissions under `path`.
pub fn make_mutable(path: &Path) -> Result<(), ImmutableError> {
    if !path.exists() {
        return Ok(());
    }

    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|source| ImmutableError::WalkDir {
            path: path.to_path_buf(),
            source,
        })?;
        if let Err(e) = make_entry_mutable(entry.path()) {
            warn!(path = %entry.path().display(), error = %e, "failed to unfreeze entry");
        }
    }

    Ok(())
}

#[cfg(unix)]
fn make_entry_immutable(path: &Path) -> Result<(), ImmutableError> {
    use std::os::unix::fs::PermissionsExt;

    let meta = std::fs::symlink_metadata(path).map_err(|source| ImmutableError::Metadata {
        path: path.to_path_buf(),
        source,
    })?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }

    let mode = meta.permissions().mode();
    let is_exec = mode & 0o111 != 0;
    let new_mode = if meta.is_dir() || is_exec { 0o555 } else { 0o444 };

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(new_mode)).map_err(|source| {
        ImmutableError::SetPermissions {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(unix)]
fn make_entry_mutable(path: &Path) -> Result<(), ImmutableError> {
    use std::os::unix::fs::PermissionsExt;

    let meta = std::fs::symlink_metadata(path).map_err(|source| ImmutableError::Metadata {
        path: path.to_path_buf(),
        source,
    })?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }

    let mode = meta.permissions().mode();
    let was_exec = mode & 0o111 != 0;
    let new_mode = if meta.is_dir() || was_exec { 0o755 } else { 0o644 };

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(new_mode)).map_err(|source| {
        ImmutableError::SetPermissions {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(target_os = "macos")]
fn clear_bsd_flags(path: &Path) -> Result<(), ImmutableError> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|source| ImmutableError::WalkDir {
            path: path.to_path_buf(),
            source,
        })?;
        let Ok(cpath) = CString::new(entry.path().as_os_str().as_bytes()) else {
            continue;
        };
        // chflags, not lchflags: the store never contains flagged symlinks
        // and chflags follows the same "act on the real target" behavior
        // as the permission calls above.
        unsafe {
            libc::chflags(cpath.as_ptr(), 0);
        }
    }
    Ok(())
}

#[cfg(windows)]
fn make_entry_immutable(path: &Path) -> Result<(), ImmutableError> {
    let meta = std::fs::symlink_metadata(path).map_err(|source| ImmutableError::Metadata {
        path: path.to_path_buf(),
        source,
    })?;
    let mut perms = meta.permissions();
    perms.set_readonly(true);
    std::fs::set_permissions(path, perms).map_err(|source| ImmutableError::SetPermissions {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(windows)]
fn make_entry_mutable(path: &Path) -> Result<(), ImmutableError> {
    let meta = std::fs::symlink_metadata(path).map_err(|source| ImmutableError::Metadata {
        path: path.to_path_buf(),
        source,
    })?;
    let mut perms = meta.permissions();
    perms.set_readonly(false);
    std::fs::set_permissions(path, perms).map_err(|source| ImmutableError::SetPermissions {
        path: path.to_path_buf(),
        source,
    })
}
