// Copyright 2023-2024 the Tectonic Project
// Licensed under the MIT License

//! Replayable file-system observations.
//!
//! Every read a build function performs is distilled into a [`FileFact`]: a
//! claim about a path that the validator can re-check on a later build
//! without re-running the function. The set of fact shapes is closed; if a
//! query cannot be expressed as one of these, it cannot be tracked and must
//! not be offered to build functions.

use serde::{Deserialize, Serialize};

use crate::digest::DigestData;
use crate::probe::NodeKind;

/// The node type pinned by a [`FileFact::TypeIs`] observation.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum NodeFact {
    File,
    Dir,
    Symlink,
    Missing,
}

impl NodeFact {
    pub(crate) fn of(kind: &NodeKind) -> Self {
        match kind {
            NodeKind::File => NodeFact::File,
            NodeKind::Dir => NodeFact::Dir,
            NodeKind::Symlink(_) => NodeFact::Symlink,
            NodeKind::Missing => NodeFact::Missing,
        }
    }
}

/// One recorded observation about a path.
///
/// Facts are recorded in program order and replayed in the same order during
/// validation, because an earlier probe's answer may control whether a later
/// probe happens at all. Note that a missing file is pinned explicitly as
/// `TypeIs(Missing)`; a [`FileFact::Contents`] fact on a path that no longer
/// holds a file is a validation failure, not a tautology.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum FileFact {
    /// The path holds (or does not hold) a node of the given type.
    TypeIs { path: String, node: NodeFact },

    /// The path holds a file with the given content digest.
    Contents { path: String, digest: DigestData },

    /// The path holds a directory with exactly these children, in
    /// lexicographic order. Comparing under a fixed order keeps
    /// FS-reported ordering variations from causing spurious invalidation.
    Listing { path: String, children: Vec<String> },

    /// The path is a symlink with this exact target string.
    LinkTarget { path: String, target: String },
}

impl FileFact {
    /// The path this fact is about.
    pub fn path(&self) -> &str {
        match self {
            FileFact::TypeIs { path, .. } => path,
            FileFact::Contents { path, .. } => path,
            FileFact::Listing { path, .. } => path,
            FileFact::LinkTarget { path, .. } => path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::digest_of_bytes;

    #[test]
    fn facts_round_trip_through_bincode() {
        let facts = vec![
            FileFact::TypeIs {
                path: "/in/a".into(),
                node: NodeFact::Missing,
            },
            FileFact::Contents {
                path: "/in/b".into(),
                digest: digest_of_bytes(b"b"),
            },
            FileFact::Listing {
                path: "/in".into(),
                children: vec!["a".into(), "b".into()],
            },
            FileFact::LinkTarget {
                path: "/in/l".into(),
                target: "b".into(),
            },
        ];

        let data = bincode::serialize(&facts).unwrap();
        let back: Vec<FileFact> = bincode::deserialize(&data).unwrap();
        assert!(back == facts);
        assert!(back[1].path() == "/in/b");
    }
}
