//! The composable `Command` value: an ordered sequence of program
//! steps plus an unordered set of input artifacts.

use crate::artifact::Artifact;
use crate::error::CommandError;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// What a `ProgCall` invokes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    /// Resolved via `PATH` at execution time.
    Env(String),
    /// An executable input artifact.
    Artifact(Artifact),
    /// A file produced by an earlier step in the same sandbox.
    Temp(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prog {
    Call {
        callee: Callee,
        args: Vec<String>,
        cwd: PathBuf,
    },
    Message(String),
    Shadow {
        artifact: Artifact,
        dest: PathBuf,
    },
    Mkdir(PathBuf),
}

/// An ordered sequence of program steps plus an unordered set of input
/// artifacts. Composes as a monoid: concatenate programs, union
/// inputs. The empty command is the identity element.
#[derive(Debug, Clone, Default)]
pub struct Command {
    pub(crate) progs: Vec<Prog>,
    pub(crate) inputs: BTreeSet<Artifact>,
}

impl Command {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn progs(&self) -> &[Prog] {
        &self.progs
    }

    pub fn inputs(&self) -> &BTreeSet<Artifact> {
        &self.inputs
    }

    /// Concatenate `other` after `self`: programs append, inputs union.
    pub fn then(mut self, other: Command) -> Self {
        self.progs.extend(other.progs);
        self.inputs.extend(other.inputs);
        self
    }
}

impl std::ops::Add for Command {
    type Output = Command;
    fn add(self, rhs: Command) -> Command {
        self.then(rhs)
    }
}

impl std::iter::Sum for Command {
    fn sum<I: Iterator<Item = Command>>(iter: I) -> Self {
        iter.fold(Command::empty(), Command::then)
    }
}

fn check_relative_cwd(cwd: &Path) -> Result<(), CommandError> {
    if cwd.is_absolute() {
        return Err(CommandError::AbsoluteCwd(cwd.to_path_buf()));
    }
    Ok(())
}

/// Validate a shadow destination the same way an output path is
/// validated: relative, normalized, not empty/`.`, no `..` component.
fn validate_shadow_dest(p: &Path) -> Result<PathBuf, CommandError> {
    if p.is_absolute() {
        return Err(CommandError::AbsoluteShadowDest(p.to_path_buf()));
    }
    let normalized: PathBuf = p.components().collect();
    let s = normalized.as_os_str();
    if s.is_empty()
        || normalized == Path::new(".")
        || normalized.components().any(|c| c == std::path::Component::ParentDir)
    {
        return Err(CommandError::InvalidShadowDest(p.to_path_buf()));
    }
    Ok(normalized)
}

/// Invoke a program resolved via `PATH`.
pub fn prog(bin: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Command {
    Command {
        progs: vec![Prog::Call {
            callee: Callee::Env(bin.into()),
            args: args.into_iter().map(Into::into).collect(),
            cwd: PathBuf::new(),
        }],
        inputs: BTreeSet::new(),
    }
}

/// Invoke an artifact as the executable; the artifact is automatically
/// registered as an input.
pub fn prog_a(bin: Artifact, args: impl IntoIterator<Item = impl Into<String>>) -> Command {
    let mut inputs = BTreeSet::new();
    inputs.insert(bin.clone());
    Command {
        progs: vec![Prog::Call {
            callee: Callee::Artifact(bin),
            args: args.into_iter().map(Into::into).collect(),
            cwd: PathBuf::new(),
        }],
        inputs,
    }
}

/// Invoke a file produced by an earlier step in the same sandbox.
pub fn prog_temp(path: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Command {
    Command {
        progs: vec![Prog::Call {
            callee: Callee::Temp(path.into()),
            args: args.into_iter().map(Into::into).collect(),
            cwd: PathBuf::new(),
        }],
        inputs: BTreeSet::new(),
    }
}

/// A user-visible status line; has no filesystem effect.
pub fn message(text: impl Into<String>) -> Command {
    Command {
        progs: vec![Prog::Message(text.into())],
        inputs: BTreeSet::new(),
    }
}

/// Replicate `artifact` at `dest` within the sandbox by symlinking.
/// The artifact is registered as an input. Rejects an absolute,
/// empty, `.`, or `..`-containing `dest`.
pub fn shadow(artifact: Artifact, dest: impl Into<PathBuf>) -> Result<Command, CommandError> {
    let dest = validate_shadow_dest(&dest.into())?;
    let mut inputs = BTreeSet::new();
    inputs.insert(artifact.clone());
    Ok(Command {
        progs: vec![Prog::Shadow { artifact, dest }],
        inputs,
    })
}

/// Ensure a directory exists within the sandbox before any step runs.
pub fn create_directory_a(path: impl Into<PathBuf>) -> Command {
    Command {
        progs: vec![Prog::Mkdir(path.into())],
        inputs: BTreeSet::new(),
    }
}

/// Register `a` as an input with no corresponding program step.
pub fn input(a: Artifact) -> Command {
    let mut inputs = BTreeSet::new();
    inputs.insert(a);
    Command {
        progs: Vec::new(),
        inputs,
    }
}

pub fn inputs(artifacts: impl IntoIterator<Item = Artifact>) -> Command {
    Command {
        progs: Vec::new(),
        inputs: artifacts.into_iter().collect(),
    }
}

pub fn input_list(artifacts: &[Artifact]) -> Command {
    inputs(artifacts.iter().cloned())
}

/// Rewrite the `cwd` of every `ProgCall` step in `c` to `path`, and
/// relocate every `Shadow` step's destination under `path`. `Message`
/// and `Mkdir` steps are unaffected. Rejects an absolute `path`.
pub fn with_cwd(path: impl AsRef<Path>, c: Command) -> Result<Command, CommandError> {
    let path = path.as_ref();
    check_relative_cwd(path)?;
    let progs = c
        .progs
        .into_iter()
        .map(|p| match p {
            Prog::Call { callee, args, .. } => Prog::Call {
                callee,
                args,
                cwd: path.to_path_buf(),
            },
            Prog::Shadow { artifact, dest } => Prog::Shadow {
                artifact,
                dest: path.join(dest),
            },
            other => other,
        })
        .collect();
    Ok(Command {
        progs,
        inputs: c.inputs,
    })
}

/// The memoization key: a command paired with its declared output
/// paths, both validated and normalized.
#[derive(Debug, Clone)]
pub struct CommandQ {
    pub command: Command,
    pub outputs: Vec<PathBuf>,
}

pub fn validate_output_path(p: &Path) -> Result<PathBuf, CommandError> {
    if p.is_absolute() {
        return Err(CommandError::AbsoluteOutput(p.to_path_buf()));
    }
    let normalized: PathBuf = p.components().collect();
    let s = normalized.as_os_str();
    if s.is_empty()
        || normalized == Path::new(".")
        || normalized.components().any(|c| c == std::path::Component::ParentDir)
    {
        return Err(CommandError::InvalidOutput(p.to_path_buf()));
    }
    Ok(normalized)
}

impl CommandQ {
    pub fn new(command: Command, outputs: impl IntoIterator<Item = impl AsRef<Path>>) -> Result<Self, CommandError> {
        let outputs = outputs
            .into_iter()
            .map(|p| validate_output_path(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { command, outputs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monoid_identity() {
        let c = prog("echo", ["hi"]);
        let combined = c.clone().then(Command::empty());
        assert_eq!(combined.progs.len(), c.progs.len());
    }

    #[test]
    fn monoid_associative_concat() {
        let a = message("a");
        let b = message("b");
        let c = message("c");
        let left = a.clone().then(b.clone()).then(c.clone());
        let right = a.then(b.then(c));
        assert_eq!(left.progs, right.progs);
    }

    #[test]
    fn inputs_union_is_order_independent() {
        let x = Artifact::external("x").unwrap();
        let y = Artifact::external("y").unwrap();
        let a = input(x.clone()).then(input(y.clone()));
        let b = input(y).then(input(x));
        assert_eq!(a.inputs, b.inputs);
    }

    #[test]
    fn with_cwd_rejects_absolute() {
        let c = prog("echo", ["hi"]);
        assert!(with_cwd("/abs", c).is_err());
    }

    #[test]
    fn with_cwd_rewrites_calls_not_messages() {
        let c = prog("echo", ["hi"]).then(message("status"));
        let c = with_cwd("sub/dir", c).unwrap();
        match &c.progs[0] {
            Prog::Call { cwd, .. } => assert_eq!(cwd, Path::new("sub/dir")),
            _ => panic!("expected call"),
        }
        assert!(matches!(c.progs[1], Prog::Message(_)));
    }

    #[test]
    fn with_cwd_relocates_shadow_dest() {
        let a = Artifact::external("x").unwrap();
        let c = shadow(a, "dest.txt").unwrap();
        let c = with_cwd("sub/dir", c).unwrap();
        match &c.progs[0] {
            Prog::Shadow { dest, .. } => assert_eq!(dest, Path::new("sub/dir/dest.txt")),
            _ => panic!("expected shadow"),
        }
    }

    #[test]
    fn shadow_rejects_absolute_dest() {
        let a = Artifact::external("x").unwrap();
        assert!(shadow(a, "/abs").is_err());
    }

    #[test]
    fn shadow_rejects_invalid_dest() {
        let a = Artifact::external("x").unwrap();
        assert!(shadow(a.clone(), "").is_err());
        assert!(shadow(a.clone(), ".").is_err());
        assert!(shadow(a, "foo/../bar").is_err());
    }

    #[test]
    fn output_path_validation() {
        assert!(validate_output_path(Path::new("")).is_err());
        assert!(validate_output_path(Path::new(".")).is_err());
        assert!(validate_output_path(Path::new("./")).is_err());
        assert!(validate_output_path(Path::new("foo/../bar")).is_err());
        assert!(validate_output_path(Path::new("/abs")).is_err());
        assert!(validate_output_path(Path::new("ok/path")).is_ok());
    }
}
