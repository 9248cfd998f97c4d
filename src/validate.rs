// Copyright 2023-2024 the Tectonic Project
// Licensed under the MIT License

//! Cache entry validation.
//!
//! A candidate entry is reusable when its recorded observations, replayed in
//! order against the current session view, all still hold. Replay works
//! bottom-up: child references are checked first (through the per-operation
//! slots, so a valid subtree is adopted exactly once however many parents
//! share it), then the entry's facts, short-circuiting at the first
//! divergence. Adopting a file operation's entry resurrects its on-disk
//! output as carryover.
//!
//! A child whose entry does not validate simply invalidates its parent: the
//! engine cannot re-invoke a closure it no longer holds, so the parent
//! re-executes and re-invokes the child naturally, still single-flight.
//! Operations found invalid are remembered so that shared subtrees are not
//! replayed repeatedly.

use std::sync::TryLockError;

use crate::engine::{OpOutcome, Session, SlotState};
use crate::fact::{FileFact, NodeFact};
use crate::operation::{CacheEntry, ChildRef, OpId, OpKind, Product};
use crate::probe::NodeKind;

impl Session {
    /// Try to satisfy an operation from the prior build's cache entry.
    ///
    /// The caller holds the operation's slot lock. On success the entry has
    /// been adopted into the session and the outcome is returned; on failure
    /// the operation is marked known-bad and must be executed.
    pub(crate) fn try_validate(&self, op: OpId) -> Option<OpOutcome> {
        if self.is_bad(op) {
            return None;
        }

        let entry = self.prior_entries.get(&op)?.clone();

        if self.validate_entry(&entry) {
            Some(self.adopt(entry))
        } else {
            self.mark_bad(op);
            None
        }
    }

    /// Install a validated entry: record it in the new build state and, for
    /// file operations, resurrect the output file as carryover.
    fn adopt(&self, entry: CacheEntry) -> OpOutcome {
        let outcome = OpOutcome::of_product(&entry.product);

        if let (OpKind::BuildFile, Some(out)) = (entry.op.kind, entry.op.output) {
            self.vfs.consume(out);
        }

        self.insert_entry(entry);
        outcome
    }

    fn validate_entry(&self, entry: &CacheEntry) -> bool {
        // A file operation's output must still exist on disk with the
        // recorded fingerprint; the user may have tampered with it.

        if let Product::File(expected) = entry.product {
            let out = match entry.op.output {
                Some(out) => out,
                None => return false,
            };

            let path = self.pool.resolve(out);

            match self.probe.fingerprint(&path) {
                Ok(actual) if actual == expected => {}
                _ => return false,
            }
        }

        for child in &entry.children {
            if !self.validate_child(child) {
                return false;
            }
        }

        for fact in &entry.facts {
            if !self.replay_fact(fact) {
                return false;
            }
        }

        true
    }

    /// Check that a recorded child invocation would come out the same way
    /// today, adopting the child's entry if this is the first time the
    /// session reaches it.
    fn validate_child(&self, child: &ChildRef) -> bool {
        let slot = self.slot(child.op);

        let mut guard = match slot.state.try_lock() {
            Ok(g) => g,

            // Another thread is validating or running this operation right
            // now. Waiting here could invert the usual parent-to-child lock
            // order against a stale dependency edge, so give up on reuse:
            // the parent re-runs and, if it still needs the child, blocks on
            // the slot in the ordinary way.
            Err(TryLockError::WouldBlock) => return false,

            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };

        match &*guard {
            SlotState::Done(outcome) => outcome.result_digest() == child.result,

            SlotState::Failed(_) => false,

            SlotState::Unvisited => {
                if self.is_bad(child.op) {
                    return false;
                }

                let entry = match self.prior_entries.get(&child.op) {
                    Some(e) => e.clone(),
                    None => {
                        self.mark_bad(child.op);
                        return false;
                    }
                };

                if self.validate_entry(&entry) {
                    let outcome = self.adopt(entry);
                    *guard = SlotState::Done(outcome.clone());
                    outcome.result_digest() == child.result
                } else {
                    self.mark_bad(child.op);
                    false
                }
            }
        }
    }

    /// Re-check one recorded observation against the current session view.
    fn replay_fact(&self, fact: &FileFact) -> bool {
        match fact {
            FileFact::TypeIs { path, node } => match self.vfs.view_stat(path) {
                Ok(kind) => NodeFact::of(&kind) == *node,
                Err(_) => false,
            },

            FileFact::Contents { path, digest } => match self.vfs.view_fingerprint(path) {
                Ok(actual) => actual == *digest,
                Err(_) => false,
            },

            FileFact::Listing { path, children } => match self.vfs.view_list(path) {
                Ok(actual) => actual == *children,
                Err(_) => false,
            },

            FileFact::LinkTarget { path, target } => match self.vfs.view_stat(path) {
                Ok(NodeKind::Symlink(actual)) => actual == *target,
                _ => false,
            },
        }
    }
}
