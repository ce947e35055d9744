//! pier-core: a forward-declared, content-addressed build engine.
//!
//! Callers build [`command::Command`] values describing a sandboxed,
//! hermetic program invocation, declare the output paths they expect,
//! and hand both to [`Engine::run_command`]. The engine hashes the
//! command, checks its store for a matching published result, and
//! only executes the command on a miss — after which the result is
//! frozen and addressed by that hash forever.

pub mod artifact;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub mod hash;
pub mod rules;
pub mod sandbox;
pub mod store;

pub use artifact::Artifact;
pub use command::{
    Callee, Command, CommandQ, Prog, create_directory_a, input, input_list, inputs, message, prog,
    prog_a, prog_temp, shadow, with_cwd,
};
pub use config::{EngineConfig, TempPolicy, Verbosity};
pub use engine::{Engine, Output, artifact_output, external, stdout_output};
pub use error::{EngineError, Result};
pub use hash::{ContentHash, Hash};
pub use rules::{FileKvStore, PersistentStore, RuleRegistry};
