//! Engine configuration, injected explicitly rather than read from globals.

use std::path::PathBuf;

/// What to do with a command's sandbox temp directory after the build
/// finishes (successfully or not).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempPolicy {
    /// Delete the sandbox once outputs are moved into the store.
    Delete,
    /// Keep it under `_pier/tmp/` for post-mortem inspection.
    Keep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Only surface stderr on failure.
    Quiet,
    /// Surface program, cwd, exit code, and stderr on failure.
    Loud,
}

/// Engine configuration. Constructed explicitly by the embedding
/// application; the engine itself holds no ambient mutable state.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Project root; the store lives at `<root>/_pier`.
    pub root: PathBuf,
    /// Optional read-through L2 cache of published `<hash>` trees.
    pub shared_cache: Option<PathBuf>,
    pub handle_temps: TempPolicy,
    pub verbosity: Verbosity,
}

impl EngineConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            shared_cache: None,
            handle_temps: TempPolicy::Delete,
            verbosity: Verbosity::Loud,
        }
    }

    pub fn with_shared_cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.shared_cache = Some(path.into());
        self
    }

    pub fn with_handle_temps(mut self, policy: TempPolicy) -> Self {
        self.handle_temps = policy;
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn store_root(&self) -> PathBuf {
        self.root.join("_pier")
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.store_root().join("artifact")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.store_root().join("tmp")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.store_root().join("cache")
    }
}
