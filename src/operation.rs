// Copyright 2023-2024 the Tectonic Project
// Licensed under the MIT License

//! Build operation identities and cache entries.
//!
//! The key concepts are as follows:
//!
//! - An **operation** is one invocation of a user build function: the
//!   top-level build itself, a `build_file` call that produces exactly one
//!   output file, or a `subbuild` call that produces an in-memory value.
//! - An [`OpId`] uniquely identifies an operation: its kind, the
//!   caller-supplied function name, a digest of its encoded arguments, an
//!   optional version integer, and (for file operations) the output path.
//! - A [`CacheEntry`] is the persisted record of one successful operation:
//!   the ordered file-system facts it observed, the ordered child operations
//!   it invoked, and what it produced.
//!
//! Identities come in two forms. Runtime forms intern their strings into
//! [`string_interner`] symbols and are `Copy`, which keeps the engine's many
//! maps cheap; persisted forms expand the symbols back into owned strings so
//! they can be serialized. Each build session owns its own interner, so
//! symbols never leak across sessions.

use digest::Digest;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};
use string_interner::{DefaultSymbol, StringInterner};
use tectonic_errors::prelude::*;

use crate::digest::{digest_of_bytes, DigestComputer, DigestData};
use crate::errors::{tagged, BuildErrorKind};
use crate::fact::FileFact;
use crate::recorder::Frame;

/// Lock a mutex, ignoring poisoning.
///
/// A panic inside a build function can poison any of the engine's internal
/// locks; the state they guard stays structurally sound (every update is a
/// single insert or removal), so continuing beats propagating panics into
/// unrelated build threads.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) type Sym = DefaultSymbol;

/// A thread-safe string interner for the paths and names of one session.
#[derive(Debug, Default)]
pub(crate) struct PathPool {
    strings: Mutex<StringInterner>,
}

impl PathPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, s: impl AsRef<str>) -> Sym {
        lock(&self.strings).get_or_intern(s)
    }

    /// Resolution should never fail unless an implementation bug mixes up
    /// symbols from different sessions. So, to not have to drag Results
    /// around in a bunch of APIs where they won't be actionable, we go ahead
    /// and unwrap here.
    pub fn resolve(&self, sym: Sym) -> String {
        lock(&self.strings).resolve(sym).unwrap().to_owned()
    }
}

/// Which of the three operation shapes an identity refers to.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum OpKind {
    /// The synthetic top-level operation of a whole build.
    Build,

    /// An operation producing exactly one output file.
    BuildFile,

    /// An operation producing an in-memory value.
    Subbuild,
}

/// The unique identifier of a build operation, as managed during runtime.
/// String values are interned into symbols.
///
/// See also [`PersistOpId`], in which interned symbols have been expanded
/// into owned strings. That type can be serialized and deserialized, whereas
/// this type implements [`Copy`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct OpId {
    pub kind: OpKind,
    pub name: Sym,
    pub args: DigestData,
    pub version: Option<u32>,
    pub output: Option<Sym>,
}

impl OpId {
    pub fn as_persist(&self, pool: &PathPool) -> PersistOpId {
        PersistOpId {
            kind: self.kind,
            name: pool.resolve(self.name),
            args: self.args,
            version: self.version,
            output: self.output.map(|o| pool.resolve(o)),
        }
    }

    /// A human-readable description for error messages and status reports.
    pub fn describe(&self, pool: &PathPool) -> String {
        let name = pool.resolve(self.name);

        match (self.kind, self.output) {
            (OpKind::Build, _) => format!("build `{}`", name),
            (OpKind::BuildFile, Some(o)) => {
                format!("build_file `{}` for `{}`", name, pool.resolve(o))
            }
            (OpKind::BuildFile, None) => format!("build_file `{}`", name),
            (OpKind::Subbuild, _) => format!("subbuild `{}`", name),
        }
    }
}

/// The unique identifier of a build operation, as serialized to persistent
/// storage.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct PersistOpId {
    pub kind: OpKind,
    pub name: String,
    pub args: DigestData,
    pub version: Option<u32>,
    pub output: Option<String>,
}

impl PersistOpId {
    pub(crate) fn as_runtime(&self, pool: &PathPool) -> OpId {
        OpId {
            kind: self.kind,
            name: pool.intern(&self.name),
            args: self.args,
            version: self.version,
            output: self.output.as_deref().map(|o| pool.intern(o)),
        }
    }
}

/// Digest the arguments of an operation into the stable component of its
/// identity.
///
/// Arguments must be representable as a deterministic byte sequence; ones
/// that are not are a programming error at call time, not at commit.
pub(crate) fn args_digest<A: Serialize>(args: &A) -> Result<DigestData> {
    match bincode::serialize(args) {
        Ok(data) => Ok(digest_of_bytes(data)),
        Err(e) => Err(tagged(
            BuildErrorKind::Programming,
            format!("build arguments have no stable byte encoding: {}", e),
        )),
    }
}

/// What a completed operation produced.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Product {
    /// The encoded return value of a subbuild or top-level build.
    Value(Vec<u8>),

    /// The content digest of a file operation's output.
    File(DigestData),
}

impl Product {
    /// The digest under which parents record this operation's result.
    pub(crate) fn result_digest(&self) -> DigestData {
        match self {
            Product::Value(data) => digest_of_bytes(data),
            Product::File(d) => *d,
        }
    }
}

/// A parent operation's record of one child invocation: the child's identity
/// and the digest of the result the parent observed.
#[derive(Clone, Debug)]
pub(crate) struct ChildRef {
    pub op: OpId,
    pub result: DigestData,
}

/// The record of one successful operation, runtime form.
#[derive(Clone, Debug)]
pub(crate) struct CacheEntry {
    pub op: OpId,
    pub facts: Vec<FileFact>,
    pub children: Vec<ChildRef>,
    pub product: Product,
    pub build_id: u64,
}

impl CacheEntry {
    pub fn as_persist(&self, pool: &PathPool) -> PersistCacheEntry {
        PersistCacheEntry {
            op: self.op.as_persist(pool),
            facts: self.facts.clone(),
            children: self
                .children
                .iter()
                .map(|c| PersistChildRef {
                    op: c.op.as_persist(pool),
                    result: c.result,
                })
                .collect(),
            product: self.product.clone(),
            build_id: self.build_id,
        }
    }
}

/// See [`ChildRef`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PersistChildRef {
    pub op: PersistOpId,
    pub result: DigestData,
}

/// The record of one successful operation, persisted form.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PersistCacheEntry {
    pub op: PersistOpId,
    pub facts: Vec<FileFact>,
    pub children: Vec<PersistChildRef>,
    pub product: Product,
    pub build_id: u64,
}

impl PersistCacheEntry {
    pub(crate) fn as_runtime(&self, pool: &PathPool) -> CacheEntry {
        CacheEntry {
            op: self.op.as_runtime(pool),
            facts: self.facts.clone(),
            children: self
                .children
                .iter()
                .map(|c| ChildRef {
                    op: c.op.as_runtime(pool),
                    result: c.result,
                })
                .collect(),
            product: self.product.clone(),
            build_id: self.build_id,
        }
    }
}

/// A helper for creating build output files that are streamed to disk.
///
/// This type calculates the cryptographic digest as the data are written, so
/// that the finished file can be cached without re-reading it. It also uses
/// a temporary file with an atomic rename upon completion so that
/// partially-created outputs are never observed at the declared path.
#[derive(Debug)]
pub struct OpOutputStream {
    path: PathBuf,
    file: tempfile::NamedTempFile,
    dc: DigestComputer,
    size: u64,
    frame: Arc<Frame>,
}

impl OpOutputStream {
    pub(crate) fn new(path: String, frame: Arc<Frame>) -> Result<Self> {
        let path = PathBuf::from(path);

        let file = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                atry!(
                    fs::create_dir_all(dir);
                    ["failed to create directory tree `{}`", dir.display()]
                );

                atry!(
                    tempfile::NamedTempFile::new_in(dir);
                    ["failed to create a temporary file in `{}`", dir.display()]
                )
            }

            _ => {
                atry!(
                    tempfile::NamedTempFile::new_in(".");
                    ["failed to create a temporary file"]
                )
            }
        };

        let dc = DigestComputer::new();

        Ok(OpOutputStream {
            path,
            file,
            dc,
            size: 0,
            frame,
        })
    }

    /// Close the stream, atomically moving the temporary file to the
    /// operation's output path and reporting the content digest to the
    /// enclosing operation.
    ///
    /// This consumes the object. It uses standard Rust drop semantics to
    /// close the output file, and so cannot detect any I/O errors that occur
    /// as the file is closed.
    pub fn close(mut self) -> Result<DigestData> {
        atry!(
            self.flush();
            ["failed to flush file `{}`", self.path.display()]
        );

        let path = self.path;

        atry!(
            self.file.persist(&path);
            ["failed to persist temporary file to `{}`", path.display()]
        );

        let digest = self.dc.finalize();
        self.frame.set_known_output(digest, self.size);
        Ok(digest)
    }

    /// Get a displayable form of the path of this file.
    pub fn display_path(&self) -> std::path::Display {
        self.path.display()
    }
}

impl io::Write for OpOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // If the actual write to disk is short, make sure our digest honors
        // that.
        let size = self.file.write(buf)?;
        self.dc.write(&buf[..size])?;
        self.size += size as u64;
        Ok(size)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.dc.flush()?;
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_persist_forms() {
        let pool = PathPool::new();

        let op = OpId {
            kind: OpKind::BuildFile,
            name: pool.intern("gzip_one"),
            args: args_digest(&"/in/a.txt").unwrap(),
            version: Some(2),
            output: Some(pool.intern("/out/a.txt.gz")),
        };

        let p = op.as_persist(&pool);
        assert!(p.name == "gzip_one");
        assert!(p.output.as_deref() == Some("/out/a.txt.gz"));
        assert!(p.as_runtime(&pool) == op);

        let other = PathPool::new();
        let op2 = p.as_runtime(&other);
        assert!(op2.as_persist(&other) == p);
    }

    #[test]
    fn args_digests_are_stable_and_distinct() {
        let d1 = args_digest(&("/in/a.txt", 7u32)).unwrap();
        let d2 = args_digest(&("/in/a.txt", 7u32)).unwrap();
        let d3 = args_digest(&("/in/a.txt", 8u32)).unwrap();
        assert!(d1 == d2);
        assert!(d1 != d3);
    }

    #[test]
    fn unencodable_args_are_a_programming_error() {
        use crate::errors::{error_kind, BuildErrorKind};
        use serde::ser::Error as _;

        struct Opaque;

        impl Serialize for Opaque {
            fn serialize<S: serde::Serializer>(
                &self,
                _s: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                Err(S::Error::custom("not today"))
            }
        }

        let err = args_digest(&Opaque).unwrap_err();
        assert!(error_kind(&err) == BuildErrorKind::Programming);
    }
}
