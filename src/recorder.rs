// Copyright 2023-2024 the Tectonic Project
// Licensed under the MIT License

//! Per-operation dependency recording.
//!
//! While a build function runs, everything it observes and every child
//! operation it invokes lands in a [`Frame`]. Frames link to the frame of
//! the invoking operation, forming the in-flight call chain; a completed
//! frame is sealed into a cache entry candidate.
//!
//! Ordering is load-bearing: validation replays the recorded probes in the
//! same order they happened, because an earlier probe's answer may control
//! whether a later probe happens at all.

use std::{
    mem,
    sync::{Arc, Mutex},
};

use crate::digest::DigestData;
use crate::fact::FileFact;
use crate::operation::{lock, CacheEntry, ChildRef, OpId, Product};

#[derive(Debug, Default)]
struct FrameData {
    facts: Vec<FileFact>,
    children: Vec<ChildRef>,
    known_output: Option<(DigestData, u64)>,
    poisoned: bool,
}

/// The recording frame of one in-flight operation.
#[derive(Debug)]
pub(crate) struct Frame {
    op: OpId,
    parent: Option<Arc<Frame>>,
    data: Mutex<FrameData>,
}

impl Frame {
    pub fn new(op: OpId, parent: Option<Arc<Frame>>) -> Arc<Frame> {
        Arc::new(Frame {
            op,
            parent,
            data: Mutex::new(FrameData::default()),
        })
    }

    pub fn op(&self) -> OpId {
        self.op
    }

    pub fn record_fact(&self, fact: FileFact) {
        lock(&self.data).facts.push(fact);
    }

    pub fn record_child(&self, op: OpId, result: DigestData) {
        lock(&self.data).children.push(ChildRef { op, result });
    }

    /// Mark this frame as uncacheable.
    ///
    /// A parent that observes a child failure may catch the error and carry
    /// on, but its own entry can no longer be trusted: the failed child left
    /// no record to validate against.
    pub fn poison(&self) {
        lock(&self.data).poisoned = true;
    }

    /// Report the digest and size of an output file written through an
    /// [`crate::OpOutputStream`], so sealing need not re-read it.
    pub fn set_known_output(&self, digest: DigestData, size: u64) {
        lock(&self.data).known_output = Some((digest, size));
    }

    pub fn known_output(&self) -> Option<(DigestData, u64)> {
        lock(&self.data).known_output
    }

    /// Test whether `op` is already executing somewhere in this frame's
    /// call chain, which would make invoking it again a dependency cycle.
    pub fn in_chain(&self, op: OpId) -> bool {
        if self.op == op {
            return true;
        }

        let mut cursor = self.parent.clone();

        while let Some(f) = cursor {
            if f.op == op {
                return true;
            }

            cursor = f.parent.clone();
        }

        false
    }

    /// The paths of every content observation made so far, for the
    /// seal-time concurrent-mutation check.
    pub fn contents_paths(&self) -> Vec<String> {
        lock(&self.data)
            .facts
            .iter()
            .filter_map(|f| match f {
                FileFact::Contents { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    /// Seal the frame into a cache entry candidate, draining its records.
    ///
    /// Returns the entry and whether the frame was poisoned; a poisoned
    /// entry must not be stored.
    pub fn seal(&self, product: Product, build_id: u64) -> (CacheEntry, bool) {
        let data = mem::take(&mut *lock(&self.data));

        (
            CacheEntry {
                op: self.op,
                facts: data.facts,
                children: data.children,
                product,
                build_id,
            },
            data.poisoned,
        )
    }
}
