// Copyright 2023-2024 the Tectonic Project
// Licensed under the MIT License

//! The build engine.
//!
//! [`Engine`] (or the free functions [`build`], [`build_versioned`] and
//! [`clean`]) is the embedder's entry point. A top-level build loads the
//! prior snapshot, opens a session, and runs the user's function under a
//! synthetic top-level operation; the [`Builder`] handle passed to that
//! function is how it reads the (virtualized) file system and invokes nested
//! `build_file` and `subbuild` operations.
//!
//! Every operation goes through the same control flow: check for a result
//! already computed this session, then try to validate the prior build's
//! cache entry by replaying its recorded observations, and only then
//! actually run the function. A per-operation slot mutex makes this
//! single-flight; the slot's state machine is `UNVISITED → (validating |
//! running) → DONE | FAILED`, where the intermediate states are represented
//! by the slot lock being held.
//!
//! On success the engine deletes orphaned outputs of the previous build and
//! commits a new snapshot; on failure it restores the file system from the
//! rollback journal and leaves the cache untouched. The engine owns no
//! thread pool: [`Builder`] is `Clone + Send + Sync`, and any parallelism
//! comes from the embedder dispatching independent operations on its own
//! threads.

use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fs,
    io::ErrorKind,
    path::Path,
    sync::{Arc, Mutex},
};
use tectonic_errors::prelude::*;
use tectonic_status_base::{tt_warning, NoopStatusBackend, StatusBackend};

use crate::digest::{digest_of_bytes, DigestData};
use crate::errors::{error_kind, tagged, BuildErrorKind};
use crate::fact::{FileFact, NodeFact};
use crate::journal::RollbackJournal;
use crate::operation::{
    args_digest, lock, CacheEntry, OpId, OpKind, OpOutputStream, PathPool, Product, Sym,
};
use crate::probe::{FsProbe, NodeKind, RealFs};
use crate::recorder::Frame;
use crate::store::{CacheStore, FileStore, Snapshot};
use crate::vfs::{join, normalize, resolve_link, VirtualFs};

/// How many symlinks a single lookup will chase before giving up.
const MAX_LINK_DEPTH: usize = 16;

type SharedStatus = Arc<Mutex<Box<dyn StatusBackend + Send>>>;

/// The result of a completed operation, as observed by its callers.
#[derive(Clone, Debug)]
pub(crate) enum OpOutcome {
    Value(Arc<[u8]>),
    File(DigestData),
}

impl OpOutcome {
    pub fn of_product(product: &Product) -> Self {
        match product {
            Product::Value(data) => OpOutcome::Value(Arc::from(&data[..])),
            Product::File(d) => OpOutcome::File(*d),
        }
    }

    pub fn result_digest(&self) -> DigestData {
        match self {
            OpOutcome::Value(data) => digest_of_bytes(&data[..]),
            OpOutcome::File(d) => *d,
        }
    }
}

/// Terminal states of an operation within a session. While a thread is
/// validating or running the operation it holds the slot's mutex, so other
/// callers of the same operation block and then observe the terminal state.
#[derive(Debug)]
pub(crate) enum SlotState {
    Unvisited,
    Done(OpOutcome),
    Failed(String),
}

#[derive(Debug)]
pub(crate) struct OpSlot {
    pub state: Mutex<SlotState>,
}

impl OpSlot {
    fn new() -> Self {
        OpSlot {
            state: Mutex::new(SlotState::Unvisited),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SessionState {
    slots: HashMap<OpId, Arc<OpSlot>>,
    entries: HashMap<OpId, CacheEntry>,
    known_bad: HashSet<OpId>,
}

/// The runtime state of one top-level build.
pub(crate) struct Session {
    pub build_id: u64,
    pub probe: Arc<dyn FsProbe>,
    pub pool: Arc<PathPool>,
    pub vfs: VirtualFs,
    pub prior_entries: HashMap<OpId, CacheEntry>,
    pub journal: RollbackJournal,
    pub status: SharedStatus,
    pub state: Mutex<SessionState>,
}

impl Session {
    pub(crate) fn slot(&self, op: OpId) -> Arc<OpSlot> {
        lock(&self.state)
            .slots
            .entry(op)
            .or_insert_with(|| Arc::new(OpSlot::new()))
            .clone()
    }

    pub(crate) fn insert_entry(&self, entry: CacheEntry) {
        lock(&self.state).entries.insert(entry.op, entry);
    }

    pub(crate) fn mark_bad(&self, op: OpId) {
        lock(&self.state).known_bad.insert(op);
    }

    pub(crate) fn is_bad(&self, op: OpId) -> bool {
        lock(&self.state).known_bad.contains(&op)
    }

    fn take_entries(&self) -> HashMap<OpId, CacheEntry> {
        std::mem::take(&mut lock(&self.state).entries)
    }

    /// The seal-time concurrent-mutation check: every content observation
    /// made by the frame must still look untouched.
    pub(crate) fn seal_check(&self, frame: &Frame) -> Result<()> {
        for path in frame.contents_paths() {
            if !self.probe.hint_unchanged(&path) {
                return Err(tagged(
                    BuildErrorKind::ConcurrentMutation,
                    format!("file `{}` changed while the build was using it", path),
                ));
            }
        }

        Ok(())
    }
}

/// The handle a build function uses to talk to the engine.
///
/// Cloning is cheap, and a clone may be moved onto another thread to run
/// independent sub-operations in parallel; the engine serializes what must
/// be serialized.
#[derive(Clone)]
pub struct Builder {
    session: Arc<Session>,
    frame: Option<Arc<Frame>>,
}

impl Builder {
    fn record_fact(&self, fact: FileFact) {
        if let Some(frame) = &self.frame {
            frame.record_fact(fact);
        }
    }

    fn note_child(&self, op: OpId, outcome: &OpOutcome) {
        if let Some(frame) = &self.frame {
            frame.record_child(op, outcome.result_digest());
        }
    }

    fn poison_frame(&self) {
        if let Some(frame) = &self.frame {
            frame.poison();
        }
    }

    fn active_frame(&self) -> Result<&Arc<Frame>> {
        match &self.frame {
            Some(f) => Ok(f),
            None => Err(tagged(
                BuildErrorKind::Programming,
                "no build operation is active".to_owned(),
            )),
        }
    }

    /// The single-flight core: return the operation's result for this
    /// session, validating or executing as needed.
    fn run_cached(&self, op: OpId, exec: &dyn Fn(&Builder) -> Result<Product>) -> Result<OpOutcome> {
        if let Some(frame) = &self.frame {
            if frame.in_chain(op) {
                return Err(tagged(
                    BuildErrorKind::Programming,
                    format!(
                        "dependency cycle: {} is already executing in this call chain",
                        op.describe(&self.session.pool)
                    ),
                ));
            }
        }

        let slot = self.session.slot(op);
        let mut guard = lock(&slot.state);

        match &*guard {
            SlotState::Done(o) => {
                let o = o.clone();
                drop(guard);
                self.note_child(op, &o);
                return Ok(o);
            }

            SlotState::Failed(msg) => {
                let e = tagged(
                    BuildErrorKind::UserFunction,
                    format!(
                        "{} failed earlier in this build: {}",
                        op.describe(&self.session.pool),
                        msg
                    ),
                );
                drop(guard);
                self.poison_frame();
                return Err(e);
            }

            SlotState::Unvisited => {}
        }

        // Not yet seen this session; try to validate the prior build's
        // entry. The top-level operation is exempt: it is the driver that
        // re-issues every nested call (and carries any new versions), so it
        // executes on every build and only its children are skippable.

        if op.kind != OpKind::Build {
            if let Some(outcome) = self.session.try_validate(op) {
                *guard = SlotState::Done(outcome.clone());
                drop(guard);
                self.note_child(op, &outcome);
                return Ok(outcome);
            }
        }

        // Cache miss: actually run the function, allowing one retry if a
        // tracked file is detected changing underneath it.

        let mut attempt = 0;

        let outcome = loop {
            attempt += 1;

            let frame = Frame::new(op, self.frame.clone());
            let child = Builder {
                session: self.session.clone(),
                frame: Some(frame.clone()),
            };

            let result = exec(&child).and_then(|product| {
                self.session.seal_check(&frame)?;
                Ok(product)
            });

            match result {
                Ok(product) => {
                    let (entry, poisoned) = frame.seal(product, self.session.build_id);
                    let outcome = OpOutcome::of_product(&entry.product);

                    if !poisoned {
                        self.session.insert_entry(entry);
                    }

                    break outcome;
                }

                Err(e) => {
                    if error_kind(&e) == BuildErrorKind::ConcurrentMutation && attempt == 1 {
                        let mut status = lock(&self.session.status);
                        tt_warning!(
                            status.as_mut(),
                            "retrying {}", op.describe(&self.session.pool);
                            e
                        );
                        continue;
                    }

                    *guard = SlotState::Failed(format!("{}", e));
                    drop(guard);
                    self.poison_frame();
                    return Err(e.context(format!("{} failed", op.describe(&self.session.pool))));
                }
            }
        };

        *guard = SlotState::Done(outcome.clone());
        drop(guard);
        self.note_child(op, &outcome);
        Ok(outcome)
    }

    fn value_op<T: Serialize + DeserializeOwned>(
        &self,
        name: &str,
        version: Option<u32>,
        args: &impl Serialize,
        f: &dyn Fn(&Builder) -> Result<T>,
    ) -> Result<T> {
        let op = OpId {
            kind: OpKind::Subbuild,
            name: self.session.pool.intern(name),
            args: args_digest(args)?,
            version,
            output: None,
        };

        self.run_value_op(op, f)
    }

    pub(crate) fn run_value_op<T: Serialize + DeserializeOwned>(
        &self,
        op: OpId,
        f: &dyn Fn(&Builder) -> Result<T>,
    ) -> Result<T> {
        let exec = |child: &Builder| -> Result<Product> {
            let value = f(child)?;

            match bincode::serialize(&value) {
                Ok(data) => Ok(Product::Value(data)),
                Err(e) => Err(tagged(
                    BuildErrorKind::Programming,
                    format!(
                        "{} returned a value with no stable byte encoding: {}",
                        op.describe(&self.session.pool),
                        e
                    ),
                )),
            }
        };

        match self.run_cached(op, &exec)? {
            OpOutcome::Value(data) => match bincode::deserialize(&data[..]) {
                Ok(value) => Ok(value),
                Err(e) => Err(tagged(
                    BuildErrorKind::Programming,
                    format!(
                        "cached value for {} could not be decoded; bump the operation's \
                         version if its value type changed: {}",
                        op.describe(&self.session.pool),
                        e
                    ),
                )),
            },

            OpOutcome::File(_) => bail!(
                "internal error: {} yielded a file product",
                op.describe(&self.session.pool)
            ),
        }
    }

    fn file_op(
        &self,
        name: &str,
        version: Option<u32>,
        path: &str,
        args: &impl Serialize,
        f: &dyn Fn(&Builder) -> Result<()>,
        compare: Option<&dyn Fn(&Path, &Path) -> Result<bool>>,
    ) -> Result<DigestData> {
        let path = normalize(path);
        let out_sym = self.session.pool.intern(&path);

        let op = OpId {
            kind: OpKind::BuildFile,
            name: self.session.pool.intern(name),
            args: args_digest(args)?,
            version,
            output: Some(out_sym),
        };

        let session = &self.session;

        let exec = |child: &Builder| -> Result<Product> {
            session.vfs.claim_output(out_sym, op)?;

            let run = || -> Result<DigestData> {
                session.journal.prepare(&path)?;

                let dir = crate::vfs::parent_of(&path);
                if dir != "/" && dir != "." {
                    atry!(
                        fs::create_dir_all(&dir);
                        ["failed to create directory tree `{}`", dir]
                    );
                }

                f(child)?;

                // The function must have left exactly one file at the
                // declared path, however it chose to write it.

                match session.probe.stat(&path)? {
                    NodeKind::File => {}
                    _ => {
                        return Err(tagged(
                            BuildErrorKind::Programming,
                            format!(
                                "{} did not produce its declared output",
                                op.describe(&session.pool)
                            ),
                        ))
                    }
                }

                let frame = child.active_frame()?;

                let mut digest = match frame.known_output() {
                    Some((digest, size)) => {
                        session.probe.note_known(&path, digest, size);
                        digest
                    }
                    None => session.probe.fingerprint(&path)?,
                };

                // The comparison hook: if the fresh output is equivalent to
                // the one it displaced, put the original back so dependents
                // keep observing the old bytes (and the old fingerprint).

                if let Some(cmp) = compare {
                    if let Some(staged) = session.journal.staged_original(&path) {
                        let equivalent = atry!(
                            cmp(&staged, Path::new(&path));
                            ["output comparison for {} failed", op.describe(&session.pool)]
                        );

                        if equivalent {
                            session.journal.settle_restore(&path)?;

                            // Hash the restored bytes directly: the probe's
                            // (mtime, size) hint may not distinguish the
                            // restored original from the discarded rewrite.
                            let (size, restored) =
                                crate::digest::digest_of_file(Path::new(&path))?;
                            session.probe.note_known(&path, restored, size);
                            digest = restored;
                        }
                    }
                }

                Ok(digest)
            };

            match run() {
                Ok(digest) => {
                    session.vfs.finish_output(out_sym);
                    Ok(Product::File(digest))
                }

                Err(e) => {
                    session.vfs.release_output(out_sym, op);
                    Err(e)
                }
            }
        };

        match self.run_cached(op, &exec)? {
            OpOutcome::File(digest) => Ok(digest),
            OpOutcome::Value(_) => bail!(
                "internal error: {} yielded a value product",
                op.describe(&self.session.pool)
            ),
        }
    }

    /// Run a nested operation that produces exactly one output file at
    /// `path`, memoized on `name`, the encoded `args`, and everything the
    /// function observes. Returns the output's content fingerprint.
    pub fn build_file<A, F>(
        &self,
        name: impl AsRef<str>,
        path: impl AsRef<str>,
        args: A,
        f: F,
    ) -> Result<DigestData>
    where
        A: Serialize,
        F: Fn(&Builder) -> Result<()>,
    {
        self.file_op(name.as_ref(), None, path.as_ref(), &args, &f, None)
    }

    /// Like [`Self::build_file`], with an explicit version folded into the
    /// operation's identity. Bump the version to invalidate every cached
    /// result of this operation.
    pub fn build_file_versioned<A, F>(
        &self,
        name: impl AsRef<str>,
        version: u32,
        path: impl AsRef<str>,
        args: A,
        f: F,
    ) -> Result<DigestData>
    where
        A: Serialize,
        F: Fn(&Builder) -> Result<()>,
    {
        self.file_op(name.as_ref(), Some(version), path.as_ref(), &args, &f, None)
    }

    /// Like [`Self::build_file`], but when the operation re-executes over a
    /// prior output, `compare` decides whether the fresh file is equivalent
    /// to the old one. If it is, the old bytes are restored in place and
    /// dependents observe no change.
    ///
    /// The comparator must be pure, total, and symmetric: it is handed the
    /// paths of the prior file and the fresh file, and its answer must
    /// depend only on their contents.
    pub fn build_file_with_comparison<A, F, C>(
        &self,
        name: impl AsRef<str>,
        path: impl AsRef<str>,
        args: A,
        f: F,
        compare: C,
    ) -> Result<DigestData>
    where
        A: Serialize,
        F: Fn(&Builder) -> Result<()>,
        C: Fn(&Path, &Path) -> Result<bool>,
    {
        self.file_op(name.as_ref(), None, path.as_ref(), &args, &f, Some(&compare))
    }

    /// Run a nested operation that produces an in-memory value, memoized
    /// like [`Self::build_file`]. The value is serialized into the cache,
    /// so it must have a stable byte encoding.
    pub fn subbuild<A, T, F>(&self, name: impl AsRef<str>, args: A, f: F) -> Result<T>
    where
        A: Serialize,
        T: Serialize + DeserializeOwned,
        F: Fn(&Builder) -> Result<T>,
    {
        self.value_op(name.as_ref(), None, &args, &f)
    }

    /// Like [`Self::subbuild`], with an explicit version folded into the
    /// operation's identity.
    pub fn subbuild_versioned<A, T, F>(
        &self,
        name: impl AsRef<str>,
        version: u32,
        args: A,
        f: F,
    ) -> Result<T>
    where
        A: Serialize,
        T: Serialize + DeserializeOwned,
        F: Fn(&Builder) -> Result<T>,
    {
        self.value_op(name.as_ref(), Some(version), &args, &f)
    }

    /// Resolve a path through the session view, following symlinks and
    /// recording a fact for every step taken.
    fn stat_following(&self, path: &str) -> Result<(String, NodeKind)> {
        let mut p = normalize(path);

        for _ in 0..MAX_LINK_DEPTH {
            let kind = atry!(
                self.session.vfs.view_stat(&p).map_err(|e| e.context(BuildErrorKind::Fs));
                ["failed to probe `{}`", p]
            );

            self.record_fact(FileFact::TypeIs {
                path: p.clone(),
                node: NodeFact::of(&kind),
            });

            match kind {
                NodeKind::Symlink(target) => {
                    self.record_fact(FileFact::LinkTarget {
                        path: p.clone(),
                        target: target.clone(),
                    });
                    p = resolve_link(&p, &target);
                }

                other => return Ok((p, other)),
            }
        }

        Err(tagged(
            BuildErrorKind::Fs,
            format!("too many levels of symbolic links at `{}`", path),
        ))
    }

    /// Does anything exist at this path? Records a type pin.
    pub fn exists(&self, path: impl AsRef<str>) -> Result<bool> {
        Ok(self.stat_following(path.as_ref())?.1 != NodeKind::Missing)
    }

    /// Is there a regular file at this path? Records a type pin.
    pub fn is_file(&self, path: impl AsRef<str>) -> Result<bool> {
        Ok(self.stat_following(path.as_ref())?.1 == NodeKind::File)
    }

    /// Is there a directory at this path? Records a type pin.
    pub fn is_dir(&self, path: impl AsRef<str>) -> Result<bool> {
        Ok(self.stat_following(path.as_ref())?.1 == NodeKind::Dir)
    }

    /// List a directory's children in lexicographic order, recording the
    /// full child set.
    pub fn list_dir(&self, path: impl AsRef<str>) -> Result<Vec<String>> {
        let (p, kind) = self.stat_following(path.as_ref())?;

        if kind != NodeKind::Dir {
            return Err(tagged(
                BuildErrorKind::Fs,
                format!("`{}` is not a directory", p),
            ));
        }

        let children = atry!(
            self.session.vfs.view_list(&p).map_err(|e| e.context(BuildErrorKind::Fs));
            ["failed to list `{}`", p]
        );

        self.record_fact(FileFact::Listing {
            path: p,
            children: children.clone(),
        });

        Ok(children)
    }

    /// Read a file's bytes, recording its content fingerprint.
    pub fn read_binary(&self, path: impl AsRef<str>) -> Result<Vec<u8>> {
        let (p, kind) = self.stat_following(path.as_ref())?;

        match kind {
            NodeKind::File => {}
            NodeKind::Missing => {
                return Err(tagged(
                    BuildErrorKind::Fs,
                    format!("`{}` does not exist", p),
                ))
            }
            _ => {
                return Err(tagged(
                    BuildErrorKind::Fs,
                    format!("`{}` is not a regular file", p),
                ))
            }
        }

        let bytes = atry!(
            self.session.vfs.view_read(&p).map_err(|e| e.context(BuildErrorKind::Fs));
            ["failed to read `{}`", p]
        );

        let digest = digest_of_bytes(&bytes);
        self.session.probe.note_known(&p, digest, bytes.len() as u64);
        self.record_fact(FileFact::Contents { path: p, digest });
        Ok(bytes)
    }

    /// Read a file as UTF-8 text, recording its content fingerprint.
    pub fn read_text(&self, path: impl AsRef<str>) -> Result<String> {
        let bytes = self.read_binary(path.as_ref())?;

        String::from_utf8(bytes).map_err(|e| {
            tagged(
                BuildErrorKind::Fs,
                format!("`{}` is not valid UTF-8: {}", path.as_ref(), e),
            )
        })
    }

    /// Record a file's content fingerprint without returning its contents.
    ///
    /// For functions that shell out to external tools which will read the
    /// file themselves. The path must be a file visible in the session view;
    /// declaring a read of anything else is a programming error, since the
    /// external tool would observe state the engine is not tracking.
    pub fn declare_read(&self, path: impl AsRef<str>) -> Result<()> {
        let (p, kind) = self.stat_following(path.as_ref())?;

        if kind != NodeKind::File {
            return Err(tagged(
                BuildErrorKind::Programming,
                format!(
                    "declared a read of `{}`, which is not a file in the build's view",
                    p
                ),
            ));
        }

        let digest = atry!(
            self.session.vfs.view_fingerprint(&p).map_err(|e| e.context(BuildErrorKind::Fs));
            ["failed to fingerprint `{}`", p]
        );

        self.record_fact(FileFact::Contents { path: p, digest });
        Ok(())
    }

    /// Lazily walk a directory tree through the session view.
    ///
    /// Each yielded tuple's directory listing is recorded at the moment it
    /// is yielded. The sequence is finite and not restartable; walking a
    /// tree the function is itself mutating gives unspecified (but
    /// cache-safe) results.
    pub fn walk(&self, root: impl AsRef<str>) -> Walk<'_> {
        let mut queue = VecDeque::new();
        queue.push_back(normalize(root.as_ref()));
        Walk {
            builder: self,
            queue,
        }
    }

    /// The output path of the enclosing `build_file` operation.
    pub fn output_path(&self) -> Result<String> {
        let frame = self.active_frame()?;
        let op = frame.op();

        match (op.kind, op.output) {
            (OpKind::BuildFile, Some(out)) => Ok(self.session.pool.resolve(out)),
            _ => Err(tagged(
                BuildErrorKind::Programming,
                format!(
                    "{} has no output path; only build_file operations do",
                    op.describe(&self.session.pool)
                ),
            )),
        }
    }

    /// Open a digest-computing stream that will atomically become the
    /// enclosing `build_file` operation's output when closed.
    ///
    /// Writes are permitted only within a `build_file` operation and only
    /// to its declared output path, so this is the only write surface the
    /// engine offers; asking for it anywhere else is a programming error.
    pub fn output_stream(&self) -> Result<OpOutputStream> {
        let path = self.output_path()?;
        let frame = self.active_frame()?;
        OpOutputStream::new(path, frame.clone())
    }
}

/// One step of a [`Builder::walk`]: a directory, its child directories, and
/// its child files (symlinks are reported among the files).
#[derive(Clone, Debug)]
pub struct WalkEntry {
    pub dir: String,
    pub subdirs: Vec<String>,
    pub files: Vec<String>,
}

/// The lazy iterator returned by [`Builder::walk`].
pub struct Walk<'a> {
    builder: &'a Builder,
    queue: VecDeque<String>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = Result<WalkEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let dir = self.queue.pop_front()?;

            let (p, kind) = match self.builder.stat_following(&dir) {
                Ok(t) => t,
                Err(e) => return Some(Err(e)),
            };

            // Only the root can turn out not to be a directory; its type
            // pin was recorded just above, so a later appearance will be
            // noticed.
            if kind != NodeKind::Dir {
                continue;
            }

            let children = match self.builder.session.vfs.view_list(&p) {
                Ok(c) => c,
                Err(e) => return Some(Err(e.context(BuildErrorKind::Fs))),
            };

            self.builder.record_fact(FileFact::Listing {
                path: p.clone(),
                children: children.clone(),
            });

            let mut subdirs = Vec::new();
            let mut files = Vec::new();

            for name in children {
                let child = join(&p, &name);

                match self.builder.session.vfs.view_stat(&child) {
                    Ok(NodeKind::Dir) => {
                        self.queue.push_back(child);
                        subdirs.push(name);
                    }
                    Ok(NodeKind::Missing) => {}
                    Ok(_) => files.push(name),
                    Err(e) => return Some(Err(e.context(BuildErrorKind::Fs))),
                }
            }

            return Some(Ok(WalkEntry {
                dir: p,
                subdirs,
                files,
            }));
        }
    }
}

/// An incremental build engine bound to one cache location.
pub struct Engine {
    store: Box<dyn CacheStore>,
    probe: Arc<dyn FsProbe>,
    status: SharedStatus,
}

impl Engine {
    /// Create an engine using the standard snapshot-file store at
    /// `cache_path` and the real file system.
    pub fn new(cache_path: impl AsRef<Path>) -> Self {
        Engine::with_store(Box::new(FileStore::new(cache_path)))
    }

    /// Create an engine over a custom cache store.
    pub fn with_store(store: Box<dyn CacheStore>) -> Self {
        Engine {
            store,
            probe: Arc::new(RealFs::new()),
            status: Arc::new(Mutex::new(
                Box::new(NoopStatusBackend::default()) as Box<dyn StatusBackend + Send>
            )),
        }
    }

    /// Replace the file-system probe (e.g. with a [`crate::MemoryFs`] in
    /// tests).
    pub fn probe(mut self, probe: Arc<dyn FsProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Replace the status backend that warnings and notes are reported to.
    pub fn status(mut self, status: Box<dyn StatusBackend + Send>) -> Self {
        self.status = Arc::new(Mutex::new(status));
        self
    }

    /// Run a top-level build operation.
    ///
    /// Presents the illusion of a clean-slate rebuild. The top-level
    /// function itself executes on every build; the nested operations it
    /// issues only actually run where the recorded observations of the
    /// previous build no longer hold.
    pub fn build<A, T, F>(&mut self, name: impl AsRef<str>, args: A, f: F) -> Result<T>
    where
        A: Serialize,
        T: Serialize + DeserializeOwned,
        F: Fn(&Builder) -> Result<T>,
    {
        self.run_top(name.as_ref(), None, &args, &f)
    }

    /// Like [`Self::build`], with an explicit version folded into the
    /// top-level operation's identity.
    pub fn build_versioned<A, T, F>(
        &mut self,
        name: impl AsRef<str>,
        version: u32,
        args: A,
        f: F,
    ) -> Result<T>
    where
        A: Serialize,
        T: Serialize + DeserializeOwned,
        F: Fn(&Builder) -> Result<T>,
    {
        self.run_top(name.as_ref(), Some(version), &args, &f)
    }

    fn run_top<T: Serialize + DeserializeOwned>(
        &mut self,
        name: &str,
        version: Option<u32>,
        args: &impl Serialize,
        f: &dyn Fn(&Builder) -> Result<T>,
    ) -> Result<T> {
        self.probe.begin_build();

        let prior = {
            let mut status = lock(&self.status);
            atry!(
                self.store.load(status.as_mut());
                ["failed to load the build cache"]
            )
        };

        let build_id = prior.build_id + 1;
        let pool = Arc::new(PathPool::new());

        let mut prior_entries = HashMap::new();

        for pe in &prior.entries {
            let entry = pe.as_runtime(&pool);
            prior_entries.insert(entry.op, entry);
        }

        let prior_outputs: HashSet<Sym> = prior.outputs.iter().map(|p| pool.intern(p)).collect();

        // Resolve the top-level identity before touching anything on disk,
        // so unencodable arguments fail without leaving a staging area.
        let top_op = OpId {
            kind: OpKind::Build,
            name: pool.intern(name),
            args: args_digest(args)?,
            version,
            output: None,
        };

        self.store.begin(build_id)?;

        let journal = match RollbackJournal::create(self.store.staging_dir(), build_id) {
            Ok(j) => j,
            Err(e) => {
                let _ = self.store.discard();
                return Err(e);
            }
        };

        let session = Arc::new(Session {
            build_id,
            probe: self.probe.clone(),
            pool: pool.clone(),
            vfs: VirtualFs::new(self.probe.clone(), pool.clone(), prior_outputs.clone()),
            prior_entries,
            journal,
            status: self.status.clone(),
            state: Mutex::new(SessionState::default()),
        });

        let entry_builder = Builder {
            session: session.clone(),
            frame: None,
        };

        match entry_builder.run_value_op(top_op, f) {
            Ok(value) => {
                // Garbage-collect: keep only the entries reachable from the
                // top-level operation. If the top entry itself could not be
                // cached (a caught child failure poisoned it), keep every
                // entry of the session instead; the next build starts from
                // the top but can still reuse the subtrees.

                let mut all_entries = session.take_entries();
                let mut kept: Vec<CacheEntry> = Vec::new();

                if all_entries.contains_key(&top_op) {
                    let mut stack = vec![top_op];

                    while let Some(op) = stack.pop() {
                        if let Some(entry) = all_entries.remove(&op) {
                            stack.extend(entry.children.iter().map(|c| c.op));
                            kept.push(entry);
                        }
                    }
                } else {
                    kept = all_entries.into_values().collect();
                }

                kept.sort_by_key(|e| e.op.name);

                // The build's output set: the outputs of every surviving
                // file entry, plus anything physically written this session.
                // Prior outputs not in the set are orphans and are deleted.

                let mut outputs: HashSet<Sym> = session.vfs.committed_outputs();

                for entry in &kept {
                    if let (OpKind::BuildFile, Some(out)) = (entry.op.kind, entry.op.output) {
                        outputs.insert(out);
                    }
                }

                {
                    let mut status = lock(&self.status);

                    for &orphan in prior_outputs.difference(&outputs) {
                        let p = pool.resolve(orphan);

                        match fs::remove_file(&p) {
                            Ok(_) => {}
                            Err(ref e) if e.kind() == ErrorKind::NotFound => {}
                            Err(e) => {
                                tt_warning!(status.as_mut(), "failed to delete orphaned output `{}`", p; e.into());
                            }
                        }
                    }
                }

                let mut out_paths: Vec<String> =
                    outputs.iter().map(|&s| pool.resolve(s)).collect();
                out_paths.sort();

                let snapshot = Snapshot {
                    build_id,
                    complete: true,
                    entries: kept.iter().map(|e| e.as_persist(&pool)).collect(),
                    outputs: out_paths,
                };

                atry!(
                    self.store.commit(&snapshot);
                    ["failed to commit the build cache"]
                );

                Ok(value)
            }

            Err(e) => {
                {
                    let mut status = lock(&self.status);

                    if let Err(re) = session.journal.rollback(status.as_mut()) {
                        tt_warning!(status.as_mut(), "rollback after the failed build was itself incomplete"; re);
                    }
                }

                if let Err(de) = self.store.discard() {
                    let mut status = lock(&self.status);
                    tt_warning!(status.as_mut(), "failed to clean up the staging area"; de);
                }

                Err(e)
            }
        }
    }

    /// Remove every output of the last build and clear the cache.
    ///
    /// Running it twice has the same effect as once.
    pub fn clean(&mut self) -> Result<()> {
        let prior = {
            let mut status = lock(&self.status);
            atry!(
                self.store.load(status.as_mut());
                ["failed to load the build cache"]
            )
        };

        if prior.entries.is_empty() && prior.outputs.is_empty() {
            return Ok(());
        }

        {
            let mut status = lock(&self.status);

            for p in &prior.outputs {
                match fs::remove_file(p) {
                    Ok(_) => {}
                    Err(ref e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        tt_warning!(status.as_mut(), "failed to delete output `{}`", p; e.into());
                    }
                }
            }
        }

        let snapshot = Snapshot {
            build_id: prior.build_id + 1,
            complete: true,
            entries: Vec::new(),
            outputs: Vec::new(),
        };

        atry!(
            self.store.commit(&snapshot);
            ["failed to commit the cleared build cache"]
        );

        Ok(())
    }
}

/// Run a top-level build against the cache at `cache_path`. See
/// [`Engine::build`].
pub fn build<A, T, F>(
    cache_path: impl AsRef<Path>,
    name: impl AsRef<str>,
    args: A,
    f: F,
) -> Result<T>
where
    A: Serialize,
    T: Serialize + DeserializeOwned,
    F: Fn(&Builder) -> Result<T>,
{
    Engine::new(cache_path).build(name, args, f)
}

/// Run a versioned top-level build against the cache at `cache_path`. See
/// [`Engine::build_versioned`].
pub fn build_versioned<A, T, F>(
    cache_path: impl AsRef<Path>,
    name: impl AsRef<str>,
    version: u32,
    args: A,
    f: F,
) -> Result<T>
where
    A: Serialize,
    T: Serialize + DeserializeOwned,
    F: Fn(&Builder) -> Result<T>,
{
    Engine::new(cache_path).build_versioned(name, version, args, f)
}

/// Remove every output of the last build at `cache_path` and clear its
/// cache. See [`Engine::clean`].
pub fn clean(cache_path: impl AsRef<Path>) -> Result<()> {
    Engine::new(cache_path).clean()
}
