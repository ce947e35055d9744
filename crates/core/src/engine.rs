//! Top-level engine API: `run_command`, `write_artifact`, `call_artifact`.

use crate::artifact::{Artifact, Source};
use crate::command::{Command, CommandQ};
use crate::config::EngineConfig;
use crate::error::{ArtifactError, EngineError, RuleError, StoreError};
use crate::hash::{self, ContentHash, Hash};
use crate::rules::{FileKvStore, PersistentStore, RuleRegistry};
use crate::sandbox;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex as AsyncMutex;

/// A ready-to-use value-returning output: declared paths plus a pure
/// reconstructor from the resulting hash.
pub struct Output<T> {
    pub(crate) paths: Vec<PathBuf>,
    reconstruct: std::sync::Arc<dyn Fn(&Hash) -> T + Send + Sync>,
}

impl<T: 'static> Output<T> {
    pub fn new(
        path: impl Into<PathBuf>,
        reconstruct: impl Fn(&Hash) -> T + Send + Sync + 'static,
    ) -> Self {
        Self {
            paths: vec![path.into()],
            reconstruct: std::sync::Arc::new(reconstruct),
        }
    }

    /// Combine two outputs applicatively: concatenate declared paths,
    /// pair reconstructed results.
    pub fn zip<U: 'static>(self, other: Output<U>) -> Output<(T, U)> {
        let mut paths = self.paths;
        paths.extend(other.paths);
        let a = self.reconstruct;
        let b = other.reconstruct;
        Output {
            paths,
            reconstruct: std::sync::Arc::new(move |h| (a(h), b(h))),
        }
    }
}

/// Declare a single output path and get back the `Built` artifact at
/// that path once the command succeeds.
pub fn artifact_output(path: impl Into<PathBuf>) -> Output<Artifact> {
    let path = path.into();
    let p = path.clone();
    Output::new(path, move |h| Artifact::built(h.clone(), p.clone()).expect("validated at construction"))
}

/// Output descriptor for the always-available captured stdout file.
pub fn stdout_output() -> Output<Artifact> {
    artifact_output("_stdout")
}

/// The forward-declared build engine: one per project/store root.
pub struct Engine<S: PersistentStore = FileKvStore> {
    config: EngineConfig,
    registry: RuleRegistry<S>,
    external_cache: AsyncMutex<std::collections::HashMap<PathBuf, ContentHash>>,
}

impl Engine<FileKvStore> {
    pub fn new(config: EngineConfig) -> Self {
        let cache_dir = config.cache_dir();
        Self::with_store(config, FileKvStore::new(cache_dir))
    }
}

impl<S: PersistentStore> Engine<S> {
    pub fn with_store(config: EngineConfig, store: S) -> Self {
        Self {
            config,
            registry: RuleRegistry::new(store),
            external_cache: AsyncMutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn ensure_layout(&self) -> Result<(), EngineError> {
        std::fs::create_dir_all(self.config.artifact_dir()).map_err(|source| StoreError::Io {
            path: self.config.artifact_dir(),
            source,
        })?;
        let external_link = self.config.artifact_dir().join("external");
        if external_link.symlink_metadata().is_err() {
            // `external_link` sits at `<root>/_pier/artifact/external`, two
            // levels below `<root>`, so the relative target keeps the link
            // valid if the project directory is moved or copied.
            #[cfg(unix)]
            std::os::unix::fs::symlink("../..", &external_link).map_err(|source| StoreError::Io {
                path: external_link.clone(),
                source,
            })?;
            // NTFS junctions are inherently absolute-path reparse points,
            // so there is no relative form to use here.
            #[cfg(windows)]
            junction::create(&self.config.root, &external_link).map_err(|e| StoreError::Kv(e.to_string()))?;
        }
        Ok(())
    }

    /// Register `rel` (a project-root-relative path) as a dependency,
    /// returning its content hash from the external cache if already
    /// warmed, or hashing and caching it otherwise. This is the single
    /// point through which an `External` artifact becomes a tracked
    /// dependency: any later lookup of the same path during the same
    /// build sees the same cached hash.
    async fn register_external_dependency(&self, rel: &Path) -> Result<ContentHash, EngineError> {
        let mut cache = self.external_cache.lock().await;
        if let Some(h) = cache.get(rel) {
            return Ok(h.clone());
        }
        let real = self.config.root.join(rel);
        let h = hash::content_hash_path(&real)?;
        cache.insert(rel.to_path_buf(), h.clone());
        Ok(h)
    }

    /// Register `a` as a dependency if it is a non-absolute `External`
    /// artifact. `Built` artifacts are already content-addressed and
    /// need no separate tracking.
    async fn depend_on(&self, a: &Artifact) -> Result<(), EngineError> {
        if *a.source() == Source::External && !a.is_absolute_external() {
            self.register_external_dependency(a.subpath()).await?;
        }
        Ok(())
    }

    async fn external_hashes_for(&self, command: &Command) -> Result<Vec<(PathBuf, ContentHash)>, EngineError> {
        let mut out = Vec::new();
        for a in command.inputs() {
            if *a.source() != Source::External || a.is_absolute_external() {
                continue;
            }
            let rel = a.subpath().to_path_buf();
            let h = self.register_external_dependency(&rel).await?;
            out.push((rel, h));
        }
        Ok(out)
    }

    /// Read an artifact's contents as a UTF-8 string. `External`
    /// artifacts are registered as a dependency before reading.
    pub async fn read_artifact(&self, a: &Artifact) -> Result<String, EngineError> {
        let bytes = self.read_artifact_bytes(a).await?;
        let path = a.real_path(&self.config.root, &self.config.store_root());
        String::from_utf8(bytes)
            .map_err(|source| ArtifactError::InvalidUtf8 { path, source })
            .map_err(EngineError::from)
    }

    /// Read an artifact's raw bytes. `External` artifacts are
    /// registered as a dependency before reading.
    pub async fn read_artifact_bytes(&self, a: &Artifact) -> Result<Vec<u8>, EngineError> {
        self.depend_on(a).await?;
        let path = a.real_path(&self.config.root, &self.config.store_root());
        std::fs::read(&path)
            .map_err(|source| ArtifactError::Io { path, source })
            .map_err(EngineError::from)
    }

    /// Check whether an artifact exists on disk. `External` artifacts
    /// are registered as a dependency before the check.
    pub async fn does_artifact_exist(&self, a: &Artifact) -> Result<bool, EngineError> {
        self.depend_on(a).await?;
        let path = a.real_path(&self.config.root, &self.config.store_root());
        Ok(path.exists())
    }

    /// Expand a glob `pattern` rooted at directory artifact `dir`,
    /// returning matches as artifacts sharing `dir`'s source. `dir` is
    /// registered as a dependency before the glob runs.
    pub async fn match_artifact_glob(&self, dir: &Artifact, pattern: &str) -> Result<Vec<Artifact>, EngineError> {
        self.depend_on(dir).await?;
        let base = dir.real_path(&self.config.root, &self.config.store_root());
        let full_pattern = base.join(pattern);
        let full_pattern_str = full_pattern.to_string_lossy().into_owned();

        let paths = glob::glob(&full_pattern_str).map_err(|source| ArtifactError::GlobPattern {
            pattern: full_pattern_str.clone(),
            source,
        })?;

        let mut out = Vec::new();
        for entry in paths {
            let path = entry.map_err(|e| {
                let path = e.path().to_path_buf();
                ArtifactError::Glob { path, source: e }
            })?;
            let rel = path.strip_prefix(&base).unwrap_or(&path).to_path_buf();
            out.push(dir.extend(rel)?);
        }
        Ok(out)
    }

    /// Evaluate a `CommandQ`: return its memoized hash, building only
    /// on a cache miss.
    pub async fn run_command(&self, command: Command, outputs: &[PathBuf]) -> Result<Hash, EngineError> {
        self.ensure_layout().await?;
        let cmdq = CommandQ::new(command, outputs.iter())?;
        let external = self.external_hashes_for(&cmdq.command).await?;
        let key_hash = hash::command_hash(&cmdq, &external);
        let key = key_hash.as_str().to_string();

        let artifact_dir = self.config.artifact_dir();
        let tmp_root = self.config.tmp_dir();
        let shared_cache = self.config.shared_cache.clone();
        let project_root = self.config.root.clone();
        let store_root = self.config.store_root();
        let verbosity = self.config.verbosity;

        let hash = self
            .registry
            .resolve(&key, || async move {
                let outs = cmdq.outputs.clone();
                let command_progs = cmdq.command.progs().to_vec();
                let inputs = cmdq.command.inputs().clone();

                let dest = crate::store::create_artifact(
                    &artifact_dir,
                    &tmp_root,
                    shared_cache.as_deref(),
                    &key_hash,
                    move |sandbox: PathBuf| {
                        async move {
                            sandbox::materialize_inputs(&sandbox, &project_root, &store_root, &inputs)?;
                            for o in &outs {
                                if let Some(parent) = o.parent() {
                                    std::fs::create_dir_all(sandbox.join(parent)).map_err(|source| {
                                        StoreError::Io {
                                            path: sandbox.join(parent),
                                            source,
                                        }
                                    })?;
                                }
                            }
                            let stdout =
                                crate::exec::run_steps(&command_progs, &sandbox, &project_root, &store_root, verbosity)
                                    .await?;
                            std::fs::write(sandbox.join("_stdout"), &stdout).map_err(|source| StoreError::Io {
                                path: sandbox.join("_stdout"),
                                source,
                            })?;
                            crate::exec::check_outputs_exist(&sandbox, &outs)?;
                            Ok(())
                        }
                    },
                )
                .await
                .map_err(RuleError::from)?;
                let _ = dest;
                Ok(key_hash.clone())
            })
            .await?;

        Ok(hash)
    }

    /// Run a command and reconstruct its typed output.
    pub async fn run_command_output<T: 'static>(
        &self,
        command: Command,
        output: Output<T>,
    ) -> Result<T, EngineError> {
        let hash = self.run_command(command, &output.paths).await?;
        Ok((output.reconstruct)(&hash))
    }

    /// Run a command and return its captured stdout.
    pub async fn run_command_stdout(&self, command: Command) -> Result<Vec<u8>, EngineError> {
        let hash = self.run_command(command, &[PathBuf::from("_stdout")]).await?;
        let path = self.config.artifact_dir().join(hash.as_str()).join("_stdout");
        std::fs::read(&path).map_err(|source| StoreError::Io { path, source }.into())
    }

    /// Memoize `(path, contents) -> Artifact`, writing a single file
    /// into a fresh store directory keyed by the content hash.
    pub async fn write_artifact(&self, path: impl Into<PathBuf>, contents: &[u8]) -> Result<Artifact, EngineError> {
        self.ensure_layout().await?;
        let path = path.into();
        let key_hash = hash::write_artifact_hash(contents);
        let key = format!("write:{}", key_hash.as_str());

        let artifact_dir = self.config.artifact_dir();
        let tmp_root = self.config.tmp_dir();
        let contents = contents.to_vec();
        let path_clone = path.clone();
        let hash_for_build = key_hash.clone();

        self.registry
            .resolve(&key, || async move {
                let key_hash = hash_for_build;
                crate::store::create_artifact(&artifact_dir, &tmp_root, None, &key_hash, move |dir| {
                    let contents = contents.clone();
                    let path_clone = path_clone.clone();
                    async move {
                        if let Some(parent) = path_clone.parent() {
                            std::fs::create_dir_all(dir.join(parent)).map_err(|source| StoreError::Io {
                                path: dir.join(parent),
                                source,
                            })?;
                        }
                        std::fs::write(dir.join(&path_clone), &contents).map_err(|source| StoreError::Io {
                            path: dir.join(&path_clone),
                            source,
                        })
                    }
                })
                .await
                .map_err(RuleError::from)?;
                Ok(key_hash.clone())
            })
            .await?;

        Ok(Artifact::built(key_hash, path)?)
    }

    /// Execute `bin` outside the memoizer, one-shot, in a disposable
    /// sandbox populated with `inputs`.
    pub async fn call_artifact(&self, bin: &Artifact, inputs: &[Artifact]) -> Result<Vec<u8>, EngineError> {
        self.ensure_layout().await?;
        std::fs::create_dir_all(self.config.tmp_dir()).map_err(|source| StoreError::Io {
            path: self.config.tmp_dir(),
            source,
        })?;
        let sandbox = tempfile::tempdir_in(self.config.tmp_dir()).map_err(|source| StoreError::Io {
            path: self.config.tmp_dir(),
            source,
        })?;

        let mut all_inputs: std::collections::BTreeSet<Artifact> = inputs.iter().cloned().collect();
        all_inputs.insert(bin.clone());

        sandbox::materialize_inputs(
            sandbox.path(),
            &self.config.root,
            &self.config.store_root(),
            &all_inputs,
        )?;

        let progs = [crate::command::Prog::Call {
            callee: crate::command::Callee::Artifact(bin.clone()),
            args: Vec::new(),
            cwd: PathBuf::new(),
        }];
        let out = crate::exec::run_steps(
            &progs,
            sandbox.path(),
            &self.config.root,
            &self.config.store_root(),
            self.config.verbosity,
        )
        .await?;

        if self.config.handle_temps == crate::config::TempPolicy::Delete {
            drop(sandbox);
        } else {
            let _ = sandbox.into_path();
        }

        Ok(out)
    }
}

/// Construct an external artifact rooted at the project, validating
/// the subpath.
pub fn external(path: impl AsRef<Path>) -> Result<Artifact, EngineError> {
    Ok(Artifact::external(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command;

    fn engine(root: &Path) -> Engine<FileKvStore> {
        Engine::new(EngineConfig::new(root))
    }

    #[tokio::test]
    async fn write_artifact_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let eng = engine(root.path());
        let a = eng.write_artifact("hello.txt", b"hi").await.unwrap();
        let real = a.real_path(root.path(), &eng.config().store_root());
        assert_eq!(std::fs::read_to_string(real).unwrap(), "hi");
    }

    #[tokio::test]
    async fn write_artifact_is_stable_across_calls() {
        let root = tempfile::tempdir().unwrap();
        let eng = engine(root.path());
        let a1 = eng.write_artifact("hello.txt", b"hi").await.unwrap();
        let a2 = eng.write_artifact("hello.txt", b"hi").await.unwrap();
        assert_eq!(a1.source(), a2.source());
    }

    #[tokio::test]
    async fn run_command_output_echo_to_file() {
        let root = tempfile::tempdir().unwrap();
        let eng = engine(root.path());
        let cmd = command::prog("sh", ["-c", "echo ok > out.txt"]);
        let artifact = eng
            .run_command_output(cmd, artifact_output("out.txt"))
            .await
            .unwrap();
        let real = artifact.real_path(root.path(), &eng.config().store_root());
        assert_eq!(std::fs::read_to_string(real).unwrap(), "ok\n");
    }

    #[tokio::test]
    async fn run_command_stdout_captures_echo() {
        let root = tempfile::tempdir().unwrap();
        let eng = engine(root.path());
        let cmd = command::prog("echo", ["hello"]);
        let out = eng.run_command_stdout(cmd).await.unwrap();
        assert_eq!(out, b"hello\n");
    }

    #[tokio::test]
    async fn missing_output_fails_and_does_not_cache() {
        let root = tempfile::tempdir().unwrap();
        let eng = engine(root.path());
        let cmd = command::prog("true", Vec::<String>::new());
        let err = eng.run_command(cmd, &[PathBuf::from("never.txt")]).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn different_writes_produce_different_hashes() {
        let root = tempfile::tempdir().unwrap();
        let eng = engine(root.path());
        let a = eng.write_artifact("x", b"1").await.unwrap();
        let b = eng.write_artifact("x", b"2").await.unwrap();
        assert_ne!(a.source(), b.source());
    }

    #[tokio::test]
    async fn read_artifact_reads_external_contents() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("in.txt"), "hi there").unwrap();
        let eng = engine(root.path());
        let a = super::external("in.txt").unwrap();
        assert_eq!(eng.read_artifact(&a).await.unwrap(), "hi there");
    }

    #[tokio::test]
    async fn read_artifact_reads_built_contents() {
        let root = tempfile::tempdir().unwrap();
        let eng = engine(root.path());
        let a = eng.write_artifact("out.txt", b"built contents").await.unwrap();
        assert_eq!(eng.read_artifact(&a).await.unwrap(), "built contents");
    }

    #[tokio::test]
    async fn does_artifact_exist_reflects_filesystem() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("present.txt"), "x").unwrap();
        let eng = engine(root.path());
        let present = super::external("present.txt").unwrap();
        let missing = super::external("absent.txt").unwrap();
        assert!(eng.does_artifact_exist(&present).await.unwrap());
        assert!(!eng.does_artifact_exist(&missing).await.unwrap());
    }

    #[tokio::test]
    async fn match_artifact_glob_finds_matching_files() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("src")).unwrap();
        std::fs::write(root.path().join("src/a.rs"), "").unwrap();
        std::fs::write(root.path().join("src/b.rs"), "").unwrap();
        std::fs::write(root.path().join("src/c.txt"), "").unwrap();
        let eng = engine(root.path());
        let dir = super::external("src").unwrap();
        let matches = eng.match_artifact_glob(&dir, "*.rs").await.unwrap();
        assert_eq!(matches.len(), 2);
    }
}
