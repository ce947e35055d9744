//! Artifact values: a path relative to either the project root
//! (`External`) or a published store directory (`Built`).

use crate::error::ArtifactError;
use crate::hash::Hash;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Source {
    External,
    Built(Hash),
}

/// A value naming a file or directory by origin and relative subpath.
/// Artifacts are pure values: they describe filesystem state, they do
/// not own it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Artifact {
    source: Source,
    subpath: PathBuf,
}

fn validate_subpath(p: &Path) -> Result<PathBuf, ArtifactError> {
    if p.is_absolute() {
        return Err(ArtifactError::AbsoluteSubpath(p.to_path_buf()));
    }
    let normalized: PathBuf = p.components().collect();
    let s = normalized.as_os_str();
    if s.is_empty()
        || normalized == Path::new(".")
        || normalized.components().any(|c| c == std::path::Component::ParentDir)
    {
        return Err(ArtifactError::InvalidSubpath(p.to_path_buf()));
    }
    Ok(normalized)
}

impl Artifact {
    /// An artifact referring to a path outside the store, relative to
    /// the project root (or absolute, in which case it is used in
    /// place and never materialized into a sandbox).
    pub fn external(path: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        let path = path.as_ref();
        let subpath = if path.is_absolute() {
            path.to_path_buf()
        } else {
            validate_subpath(path)?
        };
        Ok(Self {
            source: Source::External,
            subpath,
        })
    }

    /// An artifact pointing into a published store directory.
    pub fn built(hash: Hash, subpath: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        Ok(Self {
            source: Source::Built(hash),
            subpath: validate_subpath(subpath.as_ref())?,
        })
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn subpath(&self) -> &Path {
        &self.subpath
    }

    pub fn is_external(&self) -> bool {
        matches!(self.source, Source::External)
    }

    pub fn is_absolute_external(&self) -> bool {
        self.is_external() && self.subpath.is_absolute()
    }

    /// Extend the subpath: `a /> "sub"`.
    pub fn extend(&self, sub: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        let sub = sub.as_ref();
        if sub.is_absolute() {
            return Err(ArtifactError::AbsoluteSubpath(sub.to_path_buf()));
        }
        Ok(Self {
            source: self.source.clone(),
            subpath: validate_subpath(&self.subpath.join(sub))?,
        })
    }

    /// Rewrite the subpath's extension.
    pub fn replace_extension(&self, ext: &str) -> Self {
        let mut subpath = self.subpath.clone();
        subpath.set_extension(ext);
        Self {
            source: self.source.clone(),
            subpath,
        }
    }

    /// Sandbox-relative path at which this artifact is materialized:
    /// `artifact/external/<p>` or `artifact/<hash>/<p>`.
    pub fn path_in(&self) -> PathBuf {
        match &self.source {
            Source::External => PathBuf::from("artifact/external").join(&self.subpath),
            Source::Built(h) => PathBuf::from("artifact").join(h.as_str()).join(&self.subpath),
        }
    }

    /// Project-root-relative real path: bare `<p>` for external
    /// artifacts, `artifact/<hash>/<p>` for built ones.
    pub fn real_path_in(&self) -> PathBuf {
        match &self.source {
            Source::External => self.subpath.clone(),
            Source::Built(h) => PathBuf::from("artifact").join(h.as_str()).join(&self.subpath),
        }
    }

    /// Absolute filesystem path, given the project root / store root.
    pub fn real_path(&self, project_root: &Path, store_root: &Path) -> PathBuf {
        match &self.source {
            Source::External if self.subpath.is_absolute() => self.subpath.clone(),
            Source::External => project_root.join(&self.subpath),
            Source::Built(h) => store_root.join("artifact").join(h.as_str()).join(&self.subpath),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_path_in() {
        let a = Artifact::external("src/main.rs").unwrap();
        assert_eq!(a.path_in(), PathBuf::from("artifact/external/src/main.rs"));
        assert_eq!(a.real_path_in(), PathBuf::from("src/main.rs"));
    }

    #[test]
    fn built_path_in() {
        let h = Hash::from_raw("abc123".to_string());
        let a = Artifact::built(h.clone(), "bin/tool").unwrap();
        assert_eq!(a.path_in(), PathBuf::from("artifact/abc123/bin/tool"));
        assert_eq!(a.real_path_in(), PathBuf::from("artifact/abc123/bin/tool"));
    }

    #[test]
    fn extend_rejects_absolute() {
        let a = Artifact::external("dir").unwrap();
        assert!(a.extend("/etc/passwd").is_err());
    }

    #[test]
    fn extend_matches_path_in_law() {
        // pathIn(a /> "sub") == pathIn(a) joined with "sub"
        let a = Artifact::external("dir").unwrap();
        let extended = a.extend("sub/file").unwrap();
        assert_eq!(extended.path_in(), a.path_in().join("sub/file"));
    }

    #[test]
    fn replace_extension_matches_law() {
        let h = Hash::from_raw("abc123".to_string());
        let a = Artifact::built(h, "out.o").unwrap();
        let renamed = a.replace_extension("so");
        assert_eq!(renamed.subpath(), Path::new("out.so"));
    }

    #[test]
    fn rejects_dotdot_and_empty() {
        assert!(Artifact::external("..").is_err());
        assert!(Artifact::external("a/../../b").is_err());
        assert!(Artifact::external("").is_err());
        assert!(Artifact::external(".").is_err());
    }

    #[test]
    fn absolute_external_allowed_and_flagged() {
        let a = Artifact::external("/opt/tool").unwrap();
        assert!(a.is_absolute_external());
        assert_eq!(a.real_path(Path::new("/proj"), Path::new("/proj/_pier")), PathBuf::from("/opt/tool"));
    }
}
