//! Message tags used by the distributor.
//!
//! With distinct tags every phase gets its own tag, so a forward batch and a
//! reverse batch may be in flight at the same time without cross-matching.

use crate::algs::communicator::CommTag;

/// Base tag of all distributor traffic.
pub const DEFAULT_TAG: CommTag = CommTag::new(0x0D00);

/// A communication phase of the distributor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Length exchange while building a plan from sends.
    ComputeReceives,
    /// Payload of a forward exchange.
    ForwardPosts,
    /// Payload of a reverse exchange.
    ReversePosts,
    /// `(id, rank)` requests while building a plan from receives.
    CreateFromRecvs,
}

impl Phase {
    fn offset(self) -> u16 {
        match self {
            Phase::ComputeReceives => 1,
            Phase::ForwardPosts => 2,
            Phase::ReversePosts => 3,
            Phase::CreateFromRecvs => 4,
        }
    }
}

/// Tag for `phase`; everything shares [`DEFAULT_TAG`] when tags are not distinct.
pub fn tag_for(phase: Phase, use_distinct_tags: bool) -> CommTag {
    if use_distinct_tags {
        DEFAULT_TAG.offset(phase.offset())
    } else {
        DEFAULT_TAG
    }
}
