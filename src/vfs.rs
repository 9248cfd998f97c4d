// Copyright 2023-2024 the Tectonic Project
// Licensed under the MIT License

//! The virtualized file-system view of one build session.
//!
//! Every build begins as if all of the previous build's outputs had been
//! deleted. In practice those files stay on disk so that unchanged outputs
//! can survive untouched, so the session view has to lie a little: prior
//! outputs are *hidden* until their producing operation either validates
//! against the cache (resurrecting the file as carryover) or re-runs and
//! rewrites it. The overlay tracks three sets of output paths:
//!
//! - `pending`, declared by a file operation that is currently executing;
//! - `committed`, produced by an operation that completed this session;
//! - `consumed`, carryover from the prior build that proved still valid.
//!
//! A query for a prior output in none of these sets reports "missing", and
//! directory listings exclude such names. Everything else resolves straight
//! to the probe. Pending names are also excluded from listings so that a
//! listing taken while a sibling operation is mid-write does not capture a
//! half-written file.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};
use tectonic_errors::prelude::*;

use crate::digest::DigestData;
use crate::errors::{tagged, BuildErrorKind};
use crate::operation::{lock, OpId, PathPool, Sym};
use crate::probe::{FsProbe, NodeKind};

/// Lexically normalize a path: collapse `//`, `.` and `..` segments.
///
/// This is the identity under which output paths and overlay lookups
/// compare; there is no attempt to resolve symlink or relative/absolute
/// aliasing.
pub(crate) fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for seg in path.split('/') {
        match seg {
            "" | "." => {}

            ".." => {
                match parts.last() {
                    Some(&"..") | None => {
                        if !absolute {
                            parts.push("..");
                        }
                    }

                    Some(_) => {
                        parts.pop();
                    }
                }
            }

            s => parts.push(s),
        }
    }

    let joined = parts.join("/");

    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_owned()
    } else {
        joined
    }
}

/// Join a (normalized) directory path and a child name.
pub(crate) fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else if dir == "." {
        name.to_owned()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// The directory containing a (normalized) path.
pub(crate) fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_owned(),
        Some(i) => path[..i].to_owned(),
        None => ".".to_owned(),
    }
}

/// Resolve a symlink target string relative to the link's directory.
pub(crate) fn resolve_link(link: &str, target: &str) -> String {
    if target.starts_with('/') {
        normalize(target)
    } else {
        normalize(&format!("{}/{}", parent_of(link), target))
    }
}

#[derive(Debug, Default)]
struct Overlay {
    pending: HashMap<Sym, OpId>,
    committed: HashMap<Sym, OpId>,
    consumed: HashSet<Sym>,
}

/// The session overlay over an [`FsProbe`].
pub(crate) struct VirtualFs {
    probe: Arc<dyn FsProbe>,
    pool: Arc<PathPool>,
    prior_outputs: HashSet<Sym>,
    overlay: Mutex<Overlay>,
}

impl VirtualFs {
    pub fn new(probe: Arc<dyn FsProbe>, pool: Arc<PathPool>, prior_outputs: HashSet<Sym>) -> Self {
        VirtualFs {
            probe,
            pool,
            prior_outputs,
            overlay: Mutex::new(Overlay::default()),
        }
    }

    /// Is this path a prior-build output still scheduled for deletion?
    fn hidden(&self, sym: Sym) -> bool {
        if !self.prior_outputs.contains(&sym) {
            return false;
        }

        let ov = lock(&self.overlay);
        !ov.consumed.contains(&sym) && !ov.committed.contains_key(&sym) && !ov.pending.contains_key(&sym)
    }

    /// Probe the node type at a path, through the session view.
    pub fn view_stat(&self, path: &str) -> Result<NodeKind> {
        if self.hidden(self.pool.intern(path)) {
            return Ok(NodeKind::Missing);
        }

        self.probe.stat(path)
    }

    /// List a directory through the session view: sorted, with hidden
    /// carryover and in-flight outputs removed.
    pub fn view_list(&self, path: &str) -> Result<Vec<String>> {
        let names = self.probe.list_dir(path)?;
        let ov = lock(&self.overlay);

        Ok(names
            .into_iter()
            .filter(|name| {
                let sym = self.pool.intern(join(path, name));

                if ov.pending.contains_key(&sym) {
                    return false;
                }

                !self.prior_outputs.contains(&sym)
                    || ov.consumed.contains(&sym)
                    || ov.committed.contains_key(&sym)
            })
            .collect())
    }

    /// Read a file's contents through the session view.
    pub fn view_read(&self, path: &str) -> Result<Vec<u8>> {
        ensure!(
            !self.hidden(self.pool.intern(path)),
            "file `{}` is not present in the build view",
            path
        );

        self.probe.read_bytes(path)
    }

    /// Fingerprint a file through the session view.
    pub fn view_fingerprint(&self, path: &str) -> Result<DigestData> {
        ensure!(
            !self.hidden(self.pool.intern(path)),
            "file `{}` is not present in the build view",
            path
        );

        self.probe.fingerprint(path)
    }

    /// Declare that an executing file operation owns an output path.
    ///
    /// Each path belongs to at most one operation per session; a second
    /// claimant is a programming error. Re-claiming by the same operation
    /// (on a retry) is fine.
    pub fn claim_output(&self, sym: Sym, op: OpId) -> Result<()> {
        let mut ov = lock(&self.overlay);

        let owner = ov.pending.get(&sym).or_else(|| ov.committed.get(&sym));

        if let Some(&owner) = owner {
            if owner != op {
                return Err(tagged(
                    BuildErrorKind::Programming,
                    format!(
                        "output path `{}` is claimed by both {} and {}",
                        self.pool.resolve(sym),
                        owner.describe(&self.pool),
                        op.describe(&self.pool)
                    ),
                ));
            }
        }

        ov.pending.insert(sym, op);
        Ok(())
    }

    /// Move an output from pending to committed: it now exists on disk in
    /// its final form and becomes visible to the rest of the session.
    pub fn finish_output(&self, sym: Sym) {
        let mut ov = lock(&self.overlay);

        if let Some(op) = ov.pending.remove(&sym) {
            ov.committed.insert(sym, op);
        }
    }

    /// Release a pending claim after a failed execution attempt.
    pub fn release_output(&self, sym: Sym, op: OpId) {
        let mut ov = lock(&self.overlay);

        if ov.pending.get(&sym) == Some(&op) {
            ov.pending.remove(&sym);
        }
    }

    /// Resurrect a prior-build output whose producing entry validated.
    pub fn consume(&self, sym: Sym) {
        lock(&self.overlay).consumed.insert(sym);
    }

    /// The paths actually written by operations this session.
    pub fn committed_outputs(&self) -> HashSet<Sym> {
        lock(&self.overlay).committed.keys().copied().collect()
    }
}
