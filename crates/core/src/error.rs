//! Error types, one `thiserror` enum per module, composed into [`EngineError`].

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("subpath must not be absolute: {0}")]
    AbsoluteSubpath(PathBuf),

    #[error("subpath must not be empty, `.`, or contain `..`: {0}")]
    InvalidSubpath(PathBuf),

    #[error("io error reading artifact at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact at {path} is not valid UTF-8: {source}")]
    InvalidUtf8 {
        path: PathBuf,
        #[source]
        source: std::string::FromUtf8Error,
    },

    #[error("invalid glob pattern `{pattern}`: {source}")]
    GlobPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("error walking glob match under {path}: {source}")]
    Glob {
        path: PathBuf,
        #[source]
        source: glob::GlobError,
    },
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("output path must not be absolute: {0}")]
    AbsoluteOutput(PathBuf),

    #[error("output path must not be empty, `.`, or contain `..`: {0}")]
    InvalidOutput(PathBuf),

    #[error("cwd must not be absolute: {0}")]
    AbsoluteCwd(PathBuf),

    #[error("shadow destination must not be absolute: {0}")]
    AbsoluteShadowDest(PathBuf),

    #[error("shadow destination must not be empty, `.`, or contain `..`: {0}")]
    InvalidShadowDest(PathBuf),
}

#[derive(Debug, Error)]
pub enum HashError {
    #[error("failed to hash {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to walk {path}: {source}")]
    WalkDir {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("two inputs materialize to the same sandbox path: {0}")]
    PathCollision(PathBuf),

    #[error("input source does not exist: {0}")]
    MissingSource(PathBuf),

    #[error("io error materializing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("shadow destination already exists: {0}")]
    ShadowDestExists(PathBuf),

    #[error("shadow destination must not be absolute: {0}")]
    AbsoluteShadowDest(PathBuf),

    #[error(transparent)]
    Hash(#[from] HashError),
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` exited with status {code:?} (cwd {cwd}): {stderr}")]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        cwd: PathBuf,
        stderr: String,
    },

    #[error("declared output `{0}` was not produced by the command")]
    MissingOutput(PathBuf),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("io error during execution of {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error in store at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Immutable(#[from] pier_platform::ImmutableError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("key/value store error: {0}")]
    Kv(String),
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Crate-wide error type; every module error converts into this via `#[from]`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Hash(#[from] HashError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Platform(#[from] pier_platform::PlatformError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
