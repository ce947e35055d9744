//! Path expansion and platform-default directory resolution.

use crate::consts::APP_NAME;
use crate::error::PlatformError;
use std::env;
use std::path::{Path, PathBuf};

/// Expand a path, resolving `~` to the user's home directory.
pub fn expand_path<P: AsRef<Path>>(path: P) -> Result<PathBuf, PlatformError> {
    let path = path.as_ref();
    let path_str = path.to_string_lossy();

    if path_str.starts_with("~/") {
        let home = dirs::home_dir().ok_or(PlatformError::NoHomeDirectory)?;
        Ok(home.join(&path_str[2..]))
    } else if path_str == "~" {
        dirs::home_dir().ok_or(PlatformError::NoHomeDirectory)
    } else {
        Ok(path.to_path_buf())
    }
}

/// Expand a path relative to a base directory.
///
/// - `~` is expanded to the home directory regardless of `base`.
/// - Relative paths are resolved against `base` and normalized (`.`/`..`
///   collapsed without requiring the result to exist).
/// - Absolute paths (including `C:\...` on Windows) are returned as-is.
pub fn expand_path_with_base<P: AsRef<Path>, B: AsRef<Path>>(
    path: P,
    base: B,
) -> Result<PathBuf, PlatformError> {
    let path = path.as_ref();
    let path_str = path.to_string_lossy();

    if path_str.starts_with('~') {
        return expand_path(path);
    }

    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }

    #[cfg(windows)]
    if path_str.len() >= 2 && path_str.chars().nth(1) == Some(':') {
        return Ok(path.to_path_buf());
    }

    Ok(normalize_path(&base.as_ref().join(path)))
}

/// Resolve `.`/`..` components without requiring the path to exist.
fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();

    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                components.pop();
            }
            std::path::Component::CurDir => {}
            other => components.push(other),
        }
    }

    components.iter().collect()
}

/// The root directory under which a system-wide store may live.
pub fn root_dir() -> PathBuf {
    #[cfg(windows)]
    {
        let drive = env::var("SYSTEMDRIVE").unwrap_or_else(|_| "C:".to_string());
        PathBuf::from(format!("{drive}\\")).join(APP_NAME)
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/").join(APP_NAME)
    }
}

/// The current user's home directory, honoring `HOME`/`USERPROFILE` overrides.
pub fn home_dir() -> Option<PathBuf> {
    #[cfg(windows)]
    {
        env::var_os("USERPROFILE").map(PathBuf::from)
    }
    #[cfg(not(windows))]
    {
        env::var_os("HOME").map(PathBuf::from)
    }
}

/// Per-user data directory (`$XDG_DATA_HOME` / `%LOCALAPPDATA%`).
pub fn data_dir() -> Option<PathBuf> {
    #[cfg(windows)]
    {
        env::var_os("LOCALAPPDATA").map(|p| PathBuf::from(p).join(APP_NAME))
    }
    #[cfg(not(windows))]
    {
        if let Some(xdg) = env::var_os("XDG_DATA_HOME") {
            return Some(PathBuf::from(xdg).join(APP_NAME));
        }
        home_dir().map(|h| h.join(".local/share").join(APP_NAME))
    }
}

/// Per-user cache directory (`$XDG_CACHE_HOME` / `%LOCALAPPDATA%`).
pub fn cache_dir() -> Option<PathBuf> {
    #[cfg(windows)]
    {
        env::var_os("LOCALAPPDATA").map(|p| PathBuf::from(p).join(APP_NAME).join("cache"))
    }
    #[cfg(not(windows))]
    {
        if let Some(xdg) = env::var_os("XDG_CACHE_HOME") {
            return Some(PathBuf::from(xdg).join(APP_NAME));
        }
        home_dir().map(|h| h.join(".cache").join(APP_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_expand_tilde() {
        let home = dirs::home_dir().expect("no home directory");
        assert_eq!(expand_path("~/.config").unwrap(), home.join(".config"));
        assert_eq!(expand_path("~").unwrap(), home);
    }

    #[test]
    fn test_expand_absolute() {
        assert_eq!(expand_path("/etc/hosts").unwrap(), PathBuf::from("/etc/hosts"));
    }

    #[test]
    fn test_expand_with_base_relative() {
        let path = expand_path_with_base("./dotfiles/gitconfig", "/home/user/config").unwrap();
        assert_eq!(path, PathBuf::from("/home/user/config/dotfiles/gitconfig"));
    }

    #[test]
    fn test_expand_with_base_parent_dir() {
        let path = expand_path_with_base("../other/file", "/home/user/config").unwrap();
        assert_eq!(path, PathBuf::from("/home/user/other/file"));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path(Path::new("/foo/bar/../baz")),
            PathBuf::from("/foo/baz")
        );
        assert_eq!(
            normalize_path(Path::new("/foo/bar/../../baz")),
            PathBuf::from("/baz")
        );
    }

    #[test]
    #[serial]
    fn test_data_dir_respects_xdg() {
        temp_env::with_var("XDG_DATA_HOME", Some("/tmp/xdgdata"), || {
            assert_eq!(data_dir(), Some(PathBuf::from("/tmp/xdgdata/pier")));
        });
    }

    #[test]
    #[serial]
    fn test_cache_dir_respects_xdg() {
        temp_env::with_var("XDG_CACHE_HOME", Some("/tmp/xdgcache"), || {
            assert_eq!(cache_dir(), Some(PathBuf::from("/tmp/xdgcache/pier")));
        });
    }
}
