// Copyright 2023-2024 the Tectonic Project
// Licensed under the MIT License

//! An incremental build cache engine.
//!
//! This crate executes user-supplied build functions that derive outputs
//! (in-memory values or persisted files) from a file system, and memoizes
//! them so that re-running a build re-executes only the operations whose
//! observed inputs have changed. Callers see the illusion of a clean-slate
//! rebuild: each build behaves as if all prior outputs had been deleted and
//! every function were invoked from scratch, while in practice unchanged
//! outputs survive untouched on disk.
//!
//! The key concepts are as follows:
//!
//! - A **build operation** is one invocation of a user function: the
//!   top-level [`build`] itself, a [`Builder::build_file`] producing exactly
//!   one output file, or a [`Builder::subbuild`] producing a value.
//! - Every file-system read a function performs through its [`Builder`]
//!   handle is recorded as a replayable **fact**; together with the child
//!   operations it invoked, these make up the operation's cache entry.
//! - The top-level function runs on every build; it is the driver that
//!   re-issues the nested calls. A nested operation whose recorded facts
//!   all still hold is not re-run; its recorded result (and, for file
//!   operations, its on-disk output) is reused as **carryover**. Outputs
//!   whose producing operation is never reached are **orphans**, deleted
//!   when the build commits.
//! - If the top-level function fails, a rollback journal restores every
//!   displaced or freshly written output, so on-disk state and cache match
//!   the previous successful build. The journal is durable: a build killed
//!   mid-flight is rolled back by a recovery pass on the next startup.
//!
//! The engine is synchronous and owns no thread pool, but it is reentrant
//! and thread-safe: [`Builder`] handles are `Clone + Send + Sync`, distinct
//! operations may run on as many threads as the embedder cares to dispatch,
//! and concurrent invocations of the *same* operation are collapsed into a
//! single execution.

mod digest;
mod engine;
mod errors;
mod fact;
mod journal;
mod operation;
mod probe;
mod recorder;
mod store;
mod validate;
mod vfs;

pub use tectonic_errors::{Error, Result};

pub use crate::digest::{digest_of_bytes, DigestComputer, DigestData};
pub use crate::engine::{build, build_versioned, clean, Builder, Engine, Walk, WalkEntry};
pub use crate::errors::{error_kind, BuildErrorKind};
pub use crate::fact::{FileFact, NodeFact};
pub use crate::operation::{
    OpKind, OpOutputStream, PersistCacheEntry, PersistChildRef, PersistOpId, Product,
};
pub use crate::probe::{FsProbe, MemoryFs, NodeKind, RealFs};
pub use crate::store::{CacheStore, FileStore, Snapshot};
