// Copyright 2023-2024 the Tectonic Project
// Licensed under the MIT License

//! Error kinds.
//!
//! The engine's public API surfaces anyhow-style errors, but a handful of
//! failure classes need to be distinguished by control flow: a corrupt cache
//! degrades to a full rebuild, a concurrently mutated input earns one retry,
//! and rule violations by build functions should be reported as such rather
//! than as engine bugs. The kind is attached to the error chain and can be
//! recovered with [`error_kind`].

use tectonic_errors::prelude::*;
use thiserror::Error as ThisError;

/// The broad classification of a build failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ThisError)]
pub enum BuildErrorKind {
    /// A build function violated an engine rule: wrote outside a `build_file`
    /// operation, failed to produce its declared output, formed a dependency
    /// cycle, collided with another operation's output path, or passed or
    /// returned a value with no stable byte encoding.
    #[error("a build function violated an engine rule")]
    Programming,

    /// A build function returned an error of its own.
    #[error("a build function failed")]
    UserFunction,

    /// An unexpected file-system failure during a tracked read.
    #[error("a tracked file-system operation failed")]
    Fs,

    /// The persisted cache snapshot is inconsistent. This kind is reported to
    /// the status backend rather than raised; the store recovers by treating
    /// the cache as empty.
    #[error("the cache snapshot is corrupt")]
    CacheCorruption,

    /// A tracked path changed between observation and use. The affected
    /// operation is retried once before this surfaces.
    #[error("a tracked file changed while the build was using it")]
    ConcurrentMutation,
}

/// Create an error carrying a typed kind plus a human-readable message.
pub(crate) fn tagged(kind: BuildErrorKind, msg: String) -> Error {
    Error::new(kind).context(msg)
}

/// Recover the kind attached to an error chain.
///
/// Errors raised by user build functions generally carry no kind; those
/// classify as [`BuildErrorKind::UserFunction`].
pub fn error_kind(err: &Error) -> BuildErrorKind {
    err.downcast_ref::<BuildErrorKind>()
        .copied()
        .unwrap_or(BuildErrorKind::UserFunction)
}
