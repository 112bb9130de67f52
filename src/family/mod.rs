//! Visual-similarity families: which files are revisions of the same artwork,
//! and which one of them is authoritative.

pub mod manual;
pub mod parent;
pub mod resolver;

use std::fmt;
use thiserror::Error;

use crate::db::{ContentHash, FamilyId, StoreError};

pub use parent::{choose, decide, fold_best, ParentDecision, ParentReason};
pub use resolver::{on_new_file_similar, FamilyResolver, MAX_ATTEMPTS};

#[derive(Error, Debug)]
pub enum FamilyError {
    #[error("Family resolution failed: {0}")]
    Store(#[from] StoreError),

    /// The engine was about to commit a state that breaks family invariants.
    #[error("Family invariant violated: {0}")]
    Invariant(String),

    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Outcome of resolving one new file against its similar files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing similar is stored; no mutation.
    NoCandidates,
    /// None of the similar files had a family; one was created for all of them.
    Created {
        family: FamilyId,
        parent: ContentHash,
        children: Vec<ContentHash>,
    },
    /// The new file joined an existing family as a child.
    Attached { family: FamilyId },
    /// The new file replaced the family's parent, which became a child.
    Promoted {
        family: FamilyId,
        previous_parent: ContentHash,
    },
    /// Several families were folded into one.
    Merged {
        family: FamilyId,
        parent: ContentHash,
        removed: Vec<FamilyId>,
        members: usize,
    },
    /// The new file already sits in the only family among its similar files.
    AlreadyPlaced { family: FamilyId },
}

impl Resolution {
    /// The family the new file ended up in, if any.
    pub fn family(&self) -> Option<FamilyId> {
        match self {
            Resolution::NoCandidates => None,
            Resolution::Created { family, .. }
            | Resolution::Attached { family }
            | Resolution::Promoted { family, .. }
            | Resolution::Merged { family, .. }
            | Resolution::AlreadyPlaced { family } => Some(*family),
        }
    }

    /// Whether the resolution wrote anything.
    pub fn changed(&self) -> bool {
        !matches!(self, Resolution::NoCandidates | Resolution::AlreadyPlaced { .. })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::NoCandidates => write!(f, "no similar files"),
            Resolution::Created {
                family,
                parent,
                children,
            } => write!(
                f,
                "created family {} with parent {} and {} children",
                family,
                parent.short(),
                children.len()
            ),
            Resolution::Attached { family } => write!(f, "attached to family {}", family),
            Resolution::Promoted {
                family,
                previous_parent,
            } => write!(
                f,
                "promoted to parent of family {} (was {})",
                family,
                previous_parent.short()
            ),
            Resolution::Merged {
                family,
                parent,
                removed,
                members,
            } => write!(
                f,
                "merged into family {} with parent {} ({} members, {} families removed)",
                family,
                parent.short(),
                members,
                removed.len()
            ),
            Resolution::AlreadyPlaced { family } => write!(f, "already in family {}", family),
        }
    }
}
