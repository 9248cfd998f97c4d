// Copyright 2023-2024 the Tectonic Project
// Licensed under the MIT License

//! Persistence of build state across runs.
//!
//! The cache backing is a single snapshot file at a caller-supplied path,
//! holding every cache entry that survived the last successful build plus
//! the list of output paths that build produced. Commits replace the file
//! atomically (write-to-temp-then-rename), so a partially written snapshot
//! can never be loaded; anything unreadable, incomplete, or of an unknown
//! format version is reported to the status backend and treated as an empty
//! cache rather than misinterpreted.
//!
//! A session staging area (for the rollback journal and displaced originals)
//! lives alongside the snapshot file and is removed on commit or discard.
//! Loading runs the crash-recovery pass over any staging area left behind by
//! a dead process.

use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};
use tectonic_errors::{anyhow::Context, prelude::*};
use tectonic_status_base::{tt_note, tt_warning, StatusBackend};

use crate::journal;
use crate::operation::PersistCacheEntry;

const MAGIC: u64 = 0x6669_6c65_626c_6400; // "filebld\0"
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize)]
struct Header {
    magic: u64,
    format: u32,
}

/// The persisted union of everything the most recent completed build
/// produced.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Snapshot {
    /// Monotonically increasing id of the build that committed this
    /// snapshot; zero means "no build has ever committed".
    pub build_id: u64,

    /// The completion marker. Atomic replacement means a loadable snapshot
    /// was always fully written, but the marker stays as a cheap
    /// belt-and-suspenders check on the decoded value.
    pub complete: bool,

    /// All cache entries surviving from the build.
    pub entries: Vec<PersistCacheEntry>,

    /// Every output path the build produced, so a later build can delete
    /// the ones it orphans.
    pub outputs: Vec<String>,
}

impl Snapshot {
    pub(crate) fn empty() -> Self {
        Snapshot {
            build_id: 0,
            complete: true,
            entries: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

/// A handle on persistent cache storage.
///
/// The store is read at session start, untouched while the build runs, and
/// mutated only by the final `commit` (or left alone by `discard`).
pub trait CacheStore: Send {
    /// Load the last committed snapshot, or an empty one. Runs the
    /// crash-recovery pass over any abandoned staging area first reporting
    /// to `status`; corruption degrades to an empty cache with a warning.
    fn load(&mut self, status: &mut dyn StatusBackend) -> Result<Snapshot>;

    /// Open a writable session: create the staging area. Fails if one
    /// already exists, which indicates another live build on this cache.
    fn begin(&mut self, build_id: u64) -> Result<()>;

    /// Atomically replace the snapshot and clear the staging area.
    fn commit(&mut self, snapshot: &Snapshot) -> Result<()>;

    /// Abandon the session: clear the staging area, leave the snapshot.
    fn discard(&mut self) -> Result<()>;

    /// Where this store keeps the current session's staging area.
    fn staging_dir(&self) -> PathBuf;
}

/// The standard snapshot-file store.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        FileStore {
            path: path.as_ref().to_owned(),
        }
    }
}

impl CacheStore for FileStore {
    fn load(&mut self, status: &mut dyn StatusBackend) -> Result<Snapshot> {
        let snapshot = match fs::File::open(&self.path) {
            Ok(mut f) => {
                let header: Option<Header> = match bincode::deserialize_from(&mut f) {
                    Ok(h) => Some(h),
                    Err(e) => {
                        tt_warning!(status, "corrupt cache header in `{}`; starting from an empty cache", self.path.display(); e.into());
                        None
                    }
                };

                match header {
                    Some(h) if h.magic != MAGIC => {
                        tt_warning!(
                            status,
                            "`{}` is not a build cache; starting from an empty cache",
                            self.path.display()
                        );
                        Snapshot::empty()
                    }

                    Some(h) if h.format != FORMAT_VERSION => {
                        tt_note!(
                            status,
                            "cache `{}` uses unsupported format {}; starting from an empty cache",
                            self.path.display(),
                            h.format
                        );
                        Snapshot::empty()
                    }

                    Some(_) => match bincode::deserialize_from::<_, Snapshot>(&mut f) {
                        Ok(s) if s.complete => s,

                        Ok(_) => {
                            tt_warning!(
                                status,
                                "cache `{}` lacks its completion marker; starting from an empty cache",
                                self.path.display()
                            );
                            Snapshot::empty()
                        }

                        Err(e) => {
                            tt_warning!(status, "corrupt cache data in `{}`; starting from an empty cache", self.path.display(); e.into());
                            Snapshot::empty()
                        }
                    },

                    None => Snapshot::empty(),
                }
            }

            Err(ref e) if e.kind() == ErrorKind::NotFound => Snapshot::empty(),

            Err(e) => {
                return Err(e).context(format!("failed to open cache `{}`", self.path.display()))
            }
        };

        // With the committed build id in hand we can tell a crashed session's
        // staging area from a committed one's, and recover accordingly.

        let staging = self.staging_dir();

        if staging.symlink_metadata().is_ok() {
            atry!(
                journal::recover(&staging, snapshot.build_id, status);
                ["failed to recover from the unfinished build described by `{}`", staging.display()]
            );
        }

        Ok(snapshot)
    }

    fn begin(&mut self, _build_id: u64) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                atry!(
                    fs::create_dir_all(dir);
                    ["failed to create directory tree `{}`", dir.display()]
                );
            }
        }

        let staging = self.staging_dir();

        match fs::create_dir(&staging) {
            Ok(_) => Ok(()),

            Err(ref e) if e.kind() == ErrorKind::AlreadyExists => {
                bail!(
                    "staging directory `{}` already exists - is another build using this cache? \
                     if not, remove the directory and try again",
                    staging.display()
                );
            }

            Err(e) => {
                Err(e).context(format!("failed to create directory `{}`", staging.display()))
            }
        }
    }

    fn commit(&mut self, snapshot: &Snapshot) -> Result<()> {
        let dir = match self.path.parent() {
            Some(d) if !d.as_os_str().is_empty() => d,
            _ => Path::new("."),
        };

        let mut tmp = atry!(
            tempfile::NamedTempFile::new_in(dir);
            ["failed to create a temporary file in `{}`", dir.display()]
        );

        atry!(
            bincode::serialize_into(
                &mut tmp,
                &Header {
                    magic: MAGIC,
                    format: FORMAT_VERSION,
                }
            );
            ["failed to serialize the cache header"]
        );

        atry!(
            bincode::serialize_into(&mut tmp, snapshot);
            ["failed to serialize the cache snapshot"]
        );

        atry!(
            tmp.flush();
            ["failed to flush the cache snapshot"]
        );

        atry!(
            tmp.persist(&self.path);
            ["failed to persist the cache snapshot to `{}`", self.path.display()]
        );

        self.discard()
    }

    fn discard(&mut self) -> Result<()> {
        match fs::remove_dir_all(self.staging_dir()) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(format!(
                "failed to remove staging directory `{}`",
                self.staging_dir().display()
            )),
        }
    }

    fn staging_dir(&self) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(".staging");
        PathBuf::from(os)
    }
}
