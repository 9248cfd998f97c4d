// Copyright 2023-2024 the Tectonic Project
// Licensed under the MIT License

//! Raw file-system probing.
//!
//! [`FsProbe`] is the engine's only window onto the underlying file system,
//! and every operation on it is read-only and idempotent. The session
//! overlay (see the `vfs` module) translates build-function queries into
//! probe calls; the probe itself knows nothing about builds.
//!
//! The real implementation keeps a digest cache keyed by path so that
//! fingerprinting the same file repeatedly within one build does not re-read
//! it. The (mtime, size) pair stored there is a hint only: the cache never
//! outlives a build, so a file whose content changes without touching its
//! mtime is still caught by the next build's fresh hashing.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::ErrorKind,
    path::Path,
    sync::Mutex,
    time::SystemTime,
};
use tectonic_errors::{anyhow::Context, prelude::*};

use crate::digest::{digest_of_bytes, digest_of_file, DigestData};
use crate::operation::lock;

/// What kind of node, if any, sits at a path.
///
/// Symlinks are reported as themselves (lstat semantics); the engine decides
/// whether and how to chase them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// A regular file (or, for our purposes, anything readable that is
    /// neither a directory nor a symlink).
    File,

    /// A directory.
    Dir,

    /// A symbolic link; the value is its target string, unresolved.
    Symlink(String),

    /// Nothing at all.
    Missing,
}

/// Read-only primitive file-system operations.
///
/// Two implementations exist: [`RealFs`] for actual builds and [`MemoryFs`]
/// for tests that want a file system they can freely mutate between builds.
pub trait FsProbe: Send + Sync {
    /// Called at the start of each build session.
    ///
    /// The real implementation drops its digest cache here, so that an
    /// (mtime, size) hint recorded in one build can never mask a content
    /// change from a later one.
    fn begin_build(&self) {}

    /// Probe the node type at a path without following symlinks.
    fn stat(&self, path: &str) -> Result<NodeKind>;

    /// List the names of a directory's children, lexicographically sorted.
    fn list_dir(&self, path: &str) -> Result<Vec<String>>;

    /// Read a file's contents.
    fn read_bytes(&self, path: &str) -> Result<Vec<u8>>;

    /// Compute the content digest of a file.
    fn fingerprint(&self, path: &str) -> Result<DigestData>;

    /// Read the target string of a symbolic link.
    fn read_link(&self, path: &str) -> Result<String>;

    /// Report whether a previously fingerprinted path still looks unchanged.
    ///
    /// Used by the concurrent-mutation check at operation-seal time. `true`
    /// means "no divergence detected", which is also the answer for paths
    /// this probe has no record of.
    fn hint_unchanged(&self, path: &str) -> bool {
        let _ = path;
        true
    }

    /// Note the digest of a file whose contents the caller just read or
    /// wrote, so that a subsequent [`Self::fingerprint`] call need not
    /// re-read it. Best-effort; implementations may ignore it.
    fn note_known(&self, path: &str, digest: DigestData, size: u64) {
        let _ = (path, digest, size);
    }
}

// Helper for caching file digests based on mtimes.

#[derive(Clone, Copy, Debug)]
struct FileDigestEntry {
    digest: DigestData,
    mtime: SystemTime,
    size: u64,
}

impl FileDigestEntry {
    fn create(p: impl AsRef<Path>) -> Result<FileDigestEntry> {
        let p = p.as_ref();
        let md = fs::metadata(p)?;
        let mtime = md.modified()?;
        let (size, digest) = digest_of_file(p)?;

        Ok(FileDigestEntry {
            digest,
            mtime,
            size,
        })
    }

    /// Make sure that the information associated with this instance is fresh.
    /// If the mtime and size of the file at the specified path are the same as
    /// what's been saved, assume that the file is unchanged and we don't need
    /// to update the digest. Otherwise, recalculate the digest.
    fn freshen(&mut self, p: impl AsRef<Path>) -> Result<()> {
        let p = p.as_ref();
        let md = fs::metadata(p)?;
        let mtime = md.modified()?;

        if mtime != self.mtime || md.len() != self.size {
            let (new_size, new_digest) = digest_of_file(p)?;
            self.mtime = mtime;
            self.size = new_size;
            self.digest = new_digest;
        }

        Ok(())
    }

    /// Create an entry for a file whose digest the caller is sure of: one
    /// that was just written and closed. The expected size is compared to
    /// the one on disk to detect any funny business in the interim.
    fn create_for_known(
        p: impl AsRef<Path>,
        digest: DigestData,
        size: u64,
    ) -> Result<FileDigestEntry> {
        let p = p.as_ref();
        let md = fs::metadata(p)?;
        let mtime = md.modified()?;
        let actual_size = md.len();

        ensure!(
            actual_size == size,
            "expected file size of {} but found {}",
            size,
            actual_size
        );

        Ok(FileDigestEntry {
            digest,
            mtime,
            size,
        })
    }
}

/// The standard probe, backed by `std::fs`.
#[derive(Debug, Default)]
pub struct RealFs {
    digests: Mutex<HashMap<String, FileDigestEntry>>,
}

impl RealFs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FsProbe for RealFs {
    fn begin_build(&self) {
        lock(&self.digests).clear();
    }

    fn stat(&self, path: &str) -> Result<NodeKind> {
        let md = match fs::symlink_metadata(path) {
            Ok(md) => md,
            Err(ref e) if e.kind() == ErrorKind::NotFound => return Ok(NodeKind::Missing),
            Err(e) => return Err(e).context(format!("failed to probe path `{}`", path)),
        };

        let ft = md.file_type();

        if ft.is_symlink() {
            Ok(NodeKind::Symlink(self.read_link(path)?))
        } else if ft.is_dir() {
            Ok(NodeKind::Dir)
        } else {
            Ok(NodeKind::File)
        }
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let entries = atry!(
            fs::read_dir(path);
            ["failed to read directory `{}`", path]
        );

        let mut names = Vec::new();

        for entry in entries {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }

        names.sort();
        Ok(names)
    }

    fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        Ok(atry!(
            fs::read(path);
            ["failed to read file `{}`", path]
        ))
    }

    fn fingerprint(&self, path: &str) -> Result<DigestData> {
        let cached = lock(&self.digests).get(path).copied();

        let fentry = match cached {
            Some(mut fentry) => {
                atry!(
                    fentry.freshen(path);
                    ["failed to re-probe file `{}`", path]
                );
                fentry
            }

            None => {
                atry!(
                    FileDigestEntry::create(path);
                    ["failed to fingerprint file `{}`", path]
                )
            }
        };

        lock(&self.digests).insert(path.to_owned(), fentry);
        Ok(fentry.digest)
    }

    fn read_link(&self, path: &str) -> Result<String> {
        let target = atry!(
            fs::read_link(path);
            ["failed to read symlink `{}`", path]
        );
        Ok(target.to_string_lossy().into_owned())
    }

    fn hint_unchanged(&self, path: &str) -> bool {
        let entry = match lock(&self.digests).get(path).copied() {
            Some(e) => e,
            None => return true,
        };

        match fs::metadata(path) {
            Ok(md) => match md.modified() {
                Ok(mtime) => mtime == entry.mtime && md.len() == entry.size,
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    fn note_known(&self, path: &str, digest: DigestData, size: u64) {
        // If the size no longer matches, something else is already mutating
        // the file; leave the cache empty so the next fingerprint re-reads.
        if let Ok(fentry) = FileDigestEntry::create_for_known(path, digest, size) {
            lock(&self.digests).insert(path.to_owned(), fentry);
        }
    }
}

/// An in-memory probe for tests.
///
/// Paths are plain strings; parent directories spring into existence as
/// files are added.
#[derive(Debug, Default)]
pub struct MemoryFs {
    nodes: Mutex<BTreeMap<String, MemNode>>,
}

#[derive(Clone, Debug)]
enum MemNode {
    File(Vec<u8>),
    Dir,
    Symlink(String),
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a file, creating parent directories as needed.
    pub fn add_file(&self, path: impl AsRef<str>, contents: impl AsRef<[u8]>) {
        let path = path.as_ref();
        let mut nodes = lock(&self.nodes);
        add_parents(&mut nodes, path);
        nodes.insert(path.to_owned(), MemNode::File(contents.as_ref().to_owned()));
    }

    /// Create a directory (and its parents).
    pub fn add_dir(&self, path: impl AsRef<str>) {
        let path = path.as_ref();
        let mut nodes = lock(&self.nodes);
        add_parents(&mut nodes, path);
        nodes.insert(path.to_owned(), MemNode::Dir);
    }

    /// Create a symlink with the given target string.
    pub fn add_symlink(&self, path: impl AsRef<str>, target: impl AsRef<str>) {
        let path = path.as_ref();
        let mut nodes = lock(&self.nodes);
        add_parents(&mut nodes, path);
        nodes.insert(path.to_owned(), MemNode::Symlink(target.as_ref().to_owned()));
    }

    /// Remove a node, if present.
    pub fn remove(&self, path: impl AsRef<str>) {
        lock(&self.nodes).remove(path.as_ref());
    }
}

fn add_parents(nodes: &mut BTreeMap<String, MemNode>, path: &str) {
    let mut p = path;

    while let Some(idx) = p.rfind('/') {
        p = &p[..idx];

        if p.is_empty() {
            break;
        }

        nodes.entry(p.to_owned()).or_insert(MemNode::Dir);
    }
}

impl FsProbe for MemoryFs {
    fn stat(&self, path: &str) -> Result<NodeKind> {
        Ok(match lock(&self.nodes).get(path) {
            Some(MemNode::File(_)) => NodeKind::File,
            Some(MemNode::Dir) => NodeKind::Dir,
            Some(MemNode::Symlink(t)) => NodeKind::Symlink(t.clone()),
            None => NodeKind::Missing,
        })
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let nodes = lock(&self.nodes);

        ensure!(
            matches!(nodes.get(path), Some(MemNode::Dir)),
            "failed to read directory `{}`",
            path
        );

        let prefix = if path == "/" {
            "/".to_owned()
        } else {
            format!("{}/", path)
        };

        let mut names = Vec::new();

        for key in nodes.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    names.push(rest.to_owned());
                }
            }
        }

        Ok(names)
    }

    fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        match lock(&self.nodes).get(path) {
            Some(MemNode::File(data)) => Ok(data.clone()),
            _ => bail!("failed to read file `{}`", path),
        }
    }

    fn fingerprint(&self, path: &str) -> Result<DigestData> {
        Ok(digest_of_bytes(self.read_bytes(path)?))
    }

    fn read_link(&self, path: &str) -> Result<String> {
        match lock(&self.nodes).get(path) {
            Some(MemNode::Symlink(t)) => Ok(t.clone()),
            _ => bail!("failed to read symlink `{}`", path),
        }
    }
}
