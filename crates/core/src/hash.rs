//! Canonical hashing: command identity and external-file content hashes.
//!
//! Command hashes are computed from a hand-rolled deterministic byte
//! encoding rather than through `serde_json`, because a plain `HashMap`
//! serializes in insertion order, not sort order — and the encoding
//! here must be stable independent of any serde backend's formatting
//! choices.

use crate::command::{Callee, Command, CommandQ, Prog};
use crate::error::HashError;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Opaque, URL-safe-base64-without-padding digest used as a store
/// directory name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Hash(String);

impl Hash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Construct from an already-encoded string (store directory names,
    /// round-tripped values). Does not re-hash.
    pub fn from_raw(s: String) -> Self {
        Self(s)
    }

    fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(URL_SAFE_NO_PAD.encode(digest))
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Full-length content hash of a file or directory tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn hash_bytes(data: &[u8]) -> ContentHash {
    ContentHash(hex::encode(Sha256::digest(data)))
}

pub fn hash_file(path: &Path) -> Result<ContentHash, HashError> {
    let file = File::open(path).map_err(|source| HashError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).map_err(|source| HashError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// Content hash of a directory tree: sorted `"F:<rel>:<hash>"` /
/// `"D:<rel>"` / `"L:<rel>:<target>"` entries, joined with `\n` and
/// hashed as a whole.
pub fn hash_directory(path: &Path) -> Result<ContentHash, HashError> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.map_err(|source| HashError::WalkDir {
            path: path.to_path_buf(),
            source,
        })?;
        let rel = entry.path().strip_prefix(path).unwrap_or(entry.path());
        if rel.as_os_str().is_empty() {
            continue;
        }
        let rel = rel.to_string_lossy();
        let meta = entry.path().symlink_metadata().map_err(|source| HashError::Io {
            path: entry.path().to_path_buf(),
            source,
        })?;
        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(entry.path()).map_err(|source| HashError::Io {
                path: entry.path().to_path_buf(),
                source,
            })?;
            entries.push(format!("L:{rel}:{}", target.to_string_lossy()));
        } else if meta.is_dir() {
            entries.push(format!("D:{rel}"));
        } else {
            let h = hash_file(entry.path())?;
            entries.push(format!("F:{rel}:{}", h.as_str()));
        }
    }
    entries.sort();
    Ok(hash_bytes(entries.join("\n").as_bytes()))
}

/// Content hash of whatever sits at `path` — a file hashes its bytes,
/// a directory hashes its tree per [`hash_directory`].
pub fn content_hash_path(path: &Path) -> Result<ContentHash, HashError> {
    let meta = std::fs::metadata(path).map_err(|source| HashError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if meta.is_dir() {
        hash_directory(path)
    } else {
        hash_file(path)
    }
}

// --- canonical command-hash encoding --------------------------------------

struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn tag(&mut self, t: u8) -> &mut Self {
        self.buf.push(t);
        self
    }

    fn str(&mut self, s: &str) -> &mut Self {
        self.buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    fn path(&mut self, p: &Path) -> &mut Self {
        self.str(&p.to_string_lossy())
    }

    fn len(&mut self, n: usize) -> &mut Self {
        self.buf.extend_from_slice(&(n as u32).to_be_bytes());
        self
    }
}

fn encode_callee(e: &mut Encoder, c: &Callee) {
    match c {
        Callee::Env(s) => {
            e.tag(0).str(s);
        }
        Callee::Artifact(a) => {
            e.tag(1);
            encode_artifact(e, a);
        }
        Callee::Temp(p) => {
            e.tag(2).path(p);
        }
    }
}

fn encode_artifact(e: &mut Encoder, a: &crate::artifact::Artifact) {
    match a.source() {
        crate::artifact::Source::External => {
            e.tag(0);
        }
        crate::artifact::Source::Built(h) => {
            e.tag(1).str(h.as_str());
        }
    }
    e.path(a.subpath());
}

fn encode_prog(e: &mut Encoder, p: &Prog) {
    match p {
        Prog::Call { callee, args, cwd } => {
            e.tag(0);
            encode_callee(e, callee);
            e.len(args.len());
            for a in args {
                e.str(a);
            }
            e.path(cwd);
        }
        Prog::Message(m) => {
            e.tag(1).str(m);
        }
        Prog::Shadow { artifact, dest } => {
            e.tag(2);
            encode_artifact(e, artifact);
            e.path(dest);
        }
        Prog::Mkdir(p) => {
            e.tag(3).path(p);
        }
    }
}

fn encode_command(e: &mut Encoder, c: &Command) {
    e.len(c.progs().len());
    for p in c.progs() {
        encode_prog(e, p);
    }
    // Inputs are a BTreeSet: already in a canonical, sorted order.
    e.len(c.inputs().len());
    for a in c.inputs() {
        encode_artifact(e, a);
    }
}

/// Compute the identity hash of a `CommandQ`, folding in the content
/// hashes of any relative `External` inputs so that changes to those
/// files invalidate the memoized result. `external_hashes` must cover
/// every relative-path `External` artifact referenced by `cmdq.command`;
/// callers are expected to have resolved and sorted them by path.
pub fn command_hash(cmdq: &CommandQ, external_hashes: &[(PathBuf, ContentHash)]) -> Hash {
    let mut e = Encoder::new();
    e.str("commandHash");
    encode_command(&mut e, &cmdq.command);
    e.len(cmdq.outputs.len());
    for o in &cmdq.outputs {
        e.path(o);
    }
    let mut sorted: Vec<_> = external_hashes.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    e.len(sorted.len());
    for (p, h) in &sorted {
        e.path(p);
        e.str(h.as_str());
    }
    Hash::of_bytes(&e.buf)
}

/// `writeArtifact` hashes `"writeArtifact: " ++ contents`.
pub fn write_artifact_hash(contents: &[u8]) -> Hash {
    let mut buf = b"writeArtifact: ".to_vec();
    buf.extend_from_slice(contents);
    Hash::of_bytes(&buf)
}
