// Copyright 2023-2024 the Tectonic Project
// Licensed under the MIT License

//! The rollback journal.
//!
//! Before a file operation's first write to its output path, any file
//! already sitting there is moved into the session staging area; the
//! displacement is recorded in an append-only log that is flushed and synced
//! record by record. If the top-level build fails, every recorded
//! displacement is undone: staged originals move back, and outputs with no
//! original are deleted. If the process dies mid-build, the log survives on
//! disk and a recovery pass replays it on the next startup, before any new
//! work begins.
//!
//! A journal whose build id is not newer than the committed snapshot's is
//! stale: the build it describes committed successfully and only the cleanup
//! of the staging area was interrupted. Stale journals are discarded, not
//! restored.

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};
use tectonic_errors::{anyhow::Context, prelude::*};
use tectonic_status_base::{tt_note, tt_warning, StatusBackend};

use crate::digest::digest_of_bytes;
use crate::operation::lock;

const JOURNAL_NAME: &str = "journal.bin";

#[derive(Debug, Deserialize, Serialize)]
enum JournalRecord {
    /// Written once, first, identifying the session.
    Begin { build_id: u64 },

    /// An original file was moved from `path` to `staged` (a name within
    /// the staging area).
    Displaced { path: String, staged: String },

    /// An output path had no original; rollback deletes it.
    Fresh { path: String },

    /// The path was restored in place mid-build (comparison hook) and is no
    /// longer in rollback scope.
    Settled { path: String },
}

#[derive(Clone, Debug)]
enum Displacement {
    Staged(String),
    Fresh,
}

#[derive(Debug)]
struct JournalInner {
    log: fs::File,
    map: HashMap<String, Displacement>,
}

/// The rollback journal of one build session.
#[derive(Debug)]
pub(crate) struct RollbackJournal {
    staging: PathBuf,
    inner: Mutex<JournalInner>,
}

impl RollbackJournal {
    /// Open a journal inside an (already created) staging directory.
    pub fn create(staging: PathBuf, build_id: u64) -> Result<Self> {
        let log_path = staging.join(JOURNAL_NAME);

        let log = atry!(
            fs::OpenOptions::new().create(true).append(true).open(&log_path);
            ["failed to create journal `{}`", log_path.display()]
        );

        let journal = RollbackJournal {
            staging,
            inner: Mutex::new(JournalInner {
                log,
                map: HashMap::new(),
            }),
        };

        {
            let mut inner = lock(&journal.inner);
            append(&mut inner, &JournalRecord::Begin { build_id })?;
        }

        Ok(journal)
    }

    /// Make an output path safe to write: stage away whatever is there and
    /// record how to put things back. Idempotent per path.
    pub fn prepare(&self, path: &str) -> Result<()> {
        let mut inner = lock(&self.inner);

        if inner.map.contains_key(path) {
            return Ok(());
        }

        match fs::symlink_metadata(path) {
            Ok(_) => {
                let staged = format!("{:x}", digest_of_bytes(path));
                let staged_path = self.staging.join(&staged);

                atry!(
                    move_file(Path::new(path), &staged_path);
                    ["failed to stage `{}` into `{}`", path, staged_path.display()]
                );

                append(
                    &mut inner,
                    &JournalRecord::Displaced {
                        path: path.to_owned(),
                        staged: staged.clone(),
                    },
                )?;
                inner.map.insert(path.to_owned(), Displacement::Staged(staged));
            }

            Err(ref e) if e.kind() == ErrorKind::NotFound => {
                append(
                    &mut inner,
                    &JournalRecord::Fresh {
                        path: path.to_owned(),
                    },
                )?;
                inner.map.insert(path.to_owned(), Displacement::Fresh);
            }

            Err(e) => {
                return Err(e).context(format!("failed to probe output path `{}`", path));
            }
        }

        Ok(())
    }

    /// The staged location of the original displaced from `path`, if one
    /// existed.
    pub fn staged_original(&self, path: &str) -> Option<PathBuf> {
        match lock(&self.inner).map.get(path) {
            Some(Displacement::Staged(name)) => Some(self.staging.join(name)),
            _ => None,
        }
    }

    /// Put the staged original back in place and drop the path from
    /// rollback scope. Used by the comparison hook when a rewritten output
    /// turned out equivalent to its predecessor.
    pub fn settle_restore(&self, path: &str) -> Result<()> {
        let mut inner = lock(&self.inner);

        let name = match inner.map.get(path) {
            Some(Displacement::Staged(name)) => name.clone(),
            _ => bail!("no staged original to restore for `{}`", path),
        };

        match fs::remove_file(path) {
            Ok(_) => {}
            Err(ref e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e).context(format!("failed to remove `{}`", path)),
        }

        atry!(
            move_file(&self.staging.join(&name), Path::new(path));
            ["failed to restore original of `{}`", path]
        );

        append(
            &mut inner,
            &JournalRecord::Settled {
                path: path.to_owned(),
            },
        )?;
        inner.map.remove(path);
        Ok(())
    }

    /// Undo every recorded displacement.
    pub fn rollback(&self, status: &mut dyn StatusBackend) -> Result<()> {
        let map = std::mem::take(&mut lock(&self.inner).map);
        restore_map(&self.staging, map, status)
    }
}

fn append(inner: &mut JournalInner, rec: &JournalRecord) -> Result<()> {
    atry!(
        bincode::serialize_into(&mut inner.log, rec);
        ["failed to write a journal record"]
    );
    inner.log.flush()?;
    inner.log.sync_data()?;
    Ok(())
}

/// Move a file, falling back to copy-and-delete when a plain rename fails
/// (the staging area may live on a different filesystem than the outputs).
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }

    fs::copy(from, to)?;
    fs::remove_file(from)?;
    Ok(())
}

fn restore_map(
    staging: &Path,
    map: HashMap<String, Displacement>,
    status: &mut dyn StatusBackend,
) -> Result<()> {
    let mut n_failures = 0;

    for (path, disp) in map {
        match fs::remove_file(&path) {
            Ok(_) => {}
            Err(ref e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tt_warning!(status, "failed to remove output `{}` during rollback", path; e.into());
                n_failures += 1;
                continue;
            }
        }

        if let Displacement::Staged(name) = disp {
            if let Err(e) = move_file(&staging.join(&name), Path::new(&path)) {
                tt_warning!(status, "failed to restore original `{}` during rollback", path; e);
                n_failures += 1;
            }
        }
    }

    ensure!(
        n_failures == 0,
        "{} file(s) could not be restored during rollback",
        n_failures
    );

    Ok(())
}

/// The startup recovery pass.
///
/// Replays a leftover journal in `staging` (if any) and removes the staging
/// area. `committed_build_id` is the build id of the loaded snapshot; it
/// distinguishes a crashed build (journal id newer: roll it back) from a
/// committed one whose cleanup was interrupted (journal stale: discard).
pub(crate) fn recover(
    staging: &Path,
    committed_build_id: u64,
    status: &mut dyn StatusBackend,
) -> Result<()> {
    let log_path = staging.join(JOURNAL_NAME);

    let mut f = match fs::File::open(&log_path) {
        Ok(f) => f,
        Err(ref e) if e.kind() == ErrorKind::NotFound => {
            // A staging directory with no journal: nothing was displaced.
            atry!(
                fs::remove_dir_all(staging);
                ["failed to remove staging directory `{}`", staging.display()]
            );
            return Ok(());
        }
        Err(e) => {
            return Err(e).context(format!("failed to open journal `{}`", log_path.display()))
        }
    };

    let mut build_id = 0;
    let mut map = HashMap::new();

    loop {
        match bincode::deserialize_from::<_, JournalRecord>(&mut f) {
            Ok(JournalRecord::Begin { build_id: id }) => build_id = id,

            Ok(JournalRecord::Displaced { path, staged }) => {
                map.insert(path, Displacement::Staged(staged));
            }

            Ok(JournalRecord::Fresh { path }) => {
                map.insert(path, Displacement::Fresh);
            }

            Ok(JournalRecord::Settled { path }) => {
                map.remove(&path);
            }

            Err(e) => {
                match *e {
                    bincode::ErrorKind::Io(ref ioe) if ioe.kind() == ErrorKind::UnexpectedEof => {}
                    _ => {
                        // A torn final record; everything before it was
                        // synced, so restore what we have.
                        tt_warning!(
                            status,
                            "journal `{}` ends with a truncated record", log_path.display()
                        );
                    }
                }
                break;
            }
        }
    }

    drop(f);

    if build_id > committed_build_id {
        tt_note!(
            status,
            "rolling back an unfinished build (id {})",
            build_id
        );
        restore_map(staging, map, status)?;
    }

    atry!(
        fs::remove_dir_all(staging);
        ["failed to remove staging directory `{}`", staging.display()]
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tectonic_status_base::NoopStatusBackend;

    fn setup() -> (tempfile::TempDir, PathBuf, String) {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        fs::create_dir(&staging).unwrap();
        let out = dir.path().join("out.txt").to_str().unwrap().to_owned();
        (dir, staging, out)
    }

    #[test]
    fn displaced_originals_come_back_on_rollback() {
        let (_dir, staging, out) = setup();
        fs::write(&out, b"old").unwrap();

        let journal = RollbackJournal::create(staging, 1).unwrap();
        journal.prepare(&out).unwrap();
        journal.prepare(&out).unwrap();

        assert!(fs::metadata(&out).is_err());
        fs::write(&out, b"new").unwrap();

        journal.rollback(&mut NoopStatusBackend::default()).unwrap();
        assert!(fs::read(&out).unwrap() == b"old");
    }

    #[test]
    fn fresh_outputs_are_deleted_on_rollback() {
        let (_dir, staging, out) = setup();

        let journal = RollbackJournal::create(staging, 1).unwrap();
        journal.prepare(&out).unwrap();
        assert!(journal.staged_original(&out).is_none());

        fs::write(&out, b"new").unwrap();
        journal.rollback(&mut NoopStatusBackend::default()).unwrap();
        assert!(fs::metadata(&out).is_err());
    }

    #[test]
    fn settle_restores_in_place_and_leaves_rollback_scope() {
        let (_dir, staging, out) = setup();
        fs::write(&out, b"old").unwrap();

        let journal = RollbackJournal::create(staging, 1).unwrap();
        journal.prepare(&out).unwrap();
        fs::write(&out, b"new but equivalent").unwrap();

        assert!(journal.staged_original(&out).is_some());
        journal.settle_restore(&out).unwrap();
        assert!(fs::read(&out).unwrap() == b"old");

        // Rolling back afterwards must not clobber the restored file.
        journal.rollback(&mut NoopStatusBackend::default()).unwrap();
        assert!(fs::read(&out).unwrap() == b"old");
    }

    #[test]
    fn recovery_replays_an_abandoned_journal() {
        let (_dir, staging, out) = setup();
        fs::write(&out, b"old").unwrap();

        {
            let journal = RollbackJournal::create(staging.clone(), 5).unwrap();
            journal.prepare(&out).unwrap();
            fs::write(&out, b"half-written").unwrap();
            // Dropped without rollback or cleanup: simulates a crash.
        }

        recover(&staging, 4, &mut NoopStatusBackend::default()).unwrap();
        assert!(fs::read(&out).unwrap() == b"old");
        assert!(fs::metadata(&staging).is_err());
    }

    #[test]
    fn stale_journals_are_discarded_not_restored() {
        let (_dir, staging, out) = setup();
        fs::write(&out, b"old").unwrap();

        {
            let journal = RollbackJournal::create(staging.clone(), 5).unwrap();
            journal.prepare(&out).unwrap();
            fs::write(&out, b"committed output").unwrap();
        }

        // The snapshot already records build 5: the journal is stale.
        recover(&staging, 5, &mut NoopStatusBackend::default()).unwrap();
        assert!(fs::read(&out).unwrap() == b"committed output");
        assert!(fs::metadata(&staging).is_err());
    }
}
