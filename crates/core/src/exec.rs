//! Sequential execution of a command's program steps within an already
//! materialized sandbox.

use crate::command::{Callee, Prog};
use crate::config::Verbosity;
use crate::error::{ExecError, SandboxError};
use std::path::{Path, PathBuf};
use tokio::process::Command as TokioCommand;
use tracing::{debug, error, info};

/// The minimal, hermetic process environment every step runs under.
const HERMETIC_PATH: &str = "/usr/bin:/bin";
const HERMETIC_LANG: &str = "en_US.UTF-8";

fn substitute_tmpdir(arg: &str, sandbox: &Path) -> String {
    arg.replace("${TMPDIR}", &sandbox.to_string_lossy())
}

fn resolve_callee(callee: &Callee, sandbox: &Path) -> String {
    match callee {
        Callee::Env(name) => name.clone(),
        Callee::Artifact(a) => sandbox.join(a.path_in()).to_string_lossy().into_owned(),
        Callee::Temp(p) => sandbox.join(p).to_string_lossy().into_owned(),
    }
}

/// Run a single `ProgCall`, returning its captured stdout bytes. On a
/// non-zero exit, logs at `Loud` with program/cwd/exit code/stderr, or
/// at below-`Loud` with stderr alone; the returned error always carries
/// the full detail for callers that want to match on it.
async fn run_call(
    callee: &Callee,
    args: &[String],
    cwd: &Path,
    sandbox: &Path,
    verbosity: Verbosity,
) -> Result<Vec<u8>, ExecError> {
    let program = resolve_callee(callee, sandbox);
    let resolved_args: Vec<String> = args.iter().map(|a| substitute_tmpdir(a, sandbox)).collect();
    let work_dir = sandbox.join(cwd);

    debug!(program = %program, args = ?resolved_args, cwd = %work_dir.display(), "running step");

    let output = TokioCommand::new(&program)
        .args(&resolved_args)
        .current_dir(&work_dir)
        .env_clear()
        .env("PATH", HERMETIC_PATH)
        .env("LANG", HERMETIC_LANG)
        .output()
        .await
        .map_err(|source| ExecError::Spawn {
            program: program.clone(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        match verbosity {
            Verbosity::Loud => {
                error!(program = %program, cwd = %work_dir.display(), code = ?output.status.code(), %stderr, "step failed");
            }
            Verbosity::Quiet => {
                error!(%stderr, "step failed");
            }
        }
        return Err(ExecError::NonZeroExit {
            program,
            code: output.status.code(),
            cwd: work_dir,
            stderr,
        });
    }

    Ok(output.stdout)
}

/// Execute every step of a program sequence within `sandbox`,
/// performing shadows and directory creation inline, and returning the
/// concatenated stdout of all `ProgCall` steps in order.
pub async fn run_steps(
    progs: &[Prog],
    sandbox: &Path,
    project_root: &Path,
    store_root: &Path,
    verbosity: Verbosity,
) -> Result<Vec<u8>, ExecError> {
    let mut stdout = Vec::new();

    for step in progs {
        match step {
            Prog::Call { callee, args, cwd } => {
                let bytes = run_call(callee, args, cwd, sandbox, verbosity).await?;
                stdout.extend_from_slice(&bytes);
            }
            Prog::Message(m) => {
                info!("{m}");
            }
            Prog::Shadow { artifact, dest } => {
                crate::sandbox::link_shadow(sandbox, project_root, store_root, artifact, dest)
                    .map_err(ExecError::from)?;
            }
            Prog::Mkdir(path) => {
                let target = sandbox.join(path);
                std::fs::create_dir_all(&target).map_err(|source| ExecError::Io {
                    path: target,
                    source,
                })?;
            }
        }
    }

    Ok(stdout)
}

/// Verify every declared output exists in the sandbox before it is
/// moved into the store.
pub fn check_outputs_exist(sandbox: &Path, outputs: &[PathBuf]) -> Result<(), ExecError> {
    for o in outputs {
        if !sandbox.join(o).exists() {
            return Err(ExecError::MissingOutput(o.clone()));
        }
    }
    Ok(())
}

impl From<SandboxError> for ExecError {
    fn from(e: SandboxError) -> Self {
        ExecError::Sandbox(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_echo_and_captures_stdout() {
        let sandbox = tempfile::tempdir().unwrap();
        let progs = vec![Prog::Call {
            callee: Callee::Env("echo".to_string()),
            args: vec!["hello".to_string()],
            cwd: PathBuf::new(),
        }];
        let out = run_steps(&progs, sandbox.path(), sandbox.path(), sandbox.path(), Verbosity::Loud)
            .await
            .unwrap();
        assert_eq!(out, b"hello\n");
    }

    #[tokio::test]
    async fn substitutes_tmpdir_token() {
        let sandbox = tempfile::tempdir().unwrap();
        let progs = vec![Prog::Call {
            callee: Callee::Env("sh".to_string()),
            args: vec!["-c".to_string(), "echo ${TMPDIR}".to_string()],
            cwd: PathBuf::new(),
        }];
        let out = run_steps(&progs, sandbox.path(), sandbox.path(), sandbox.path(), Verbosity::Loud)
            .await
            .unwrap();
        let out = String::from_utf8(out).unwrap();
        assert_eq!(out.trim(), sandbox.path().to_string_lossy());
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let sandbox = tempfile::tempdir().unwrap();
        let progs = vec![Prog::Call {
            callee: Callee::Env("sh".to_string()),
            args: vec!["-c".to_string(), "exit 3".to_string()],
            cwd: PathBuf::new(),
        }];
        let err = run_steps(&progs, sandbox.path(), sandbox.path(), sandbox.path(), Verbosity::Loud)
            .await
            .unwrap_err();
        match err {
            ExecError::NonZeroExit { code, .. } => assert_eq!(code, Some(3)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mkdir_step_creates_directory() {
        let sandbox = tempfile::tempdir().unwrap();
        let progs = vec![Prog::Mkdir(PathBuf::from("a/b/c"))];
        run_steps(&progs, sandbox.path(), sandbox.path(), sandbox.path(), Verbosity::Loud)
            .await
            .unwrap();
        assert!(sandbox.path().join("a/b/c").is_dir());
    }

    #[test]
    fn missing_output_detected() {
        let sandbox = tempfile::tempdir().unwrap();
        let err = check_outputs_exist(sandbox.path(), &[PathBuf::from("out.txt")]).unwrap_err();
        assert!(matches!(err, ExecError::MissingOutput(_)));
    }
}
