//! DistributorError: unified error type for mesh-distributor public APIs.
//!
//! Three families share this enum: configuration errors (rejected before any
//! communication), consistency errors (fatal; the offending indices are listed
//! up to the print threshold), and misuse errors (precondition violations by
//! the caller).

use std::fmt::{Display, Write};

use thiserror::Error;

use crate::algs::communicator::CommError;

/// One peer whose discovered receive count disagreed with the length it sent.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LengthMismatch {
    pub peer: usize,
    pub discovered: u64,
    pub received: u64,
}

impl Display for LengthMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(peer {}: discovered {}, received {})",
            self.peer, self.discovered, self.received
        )
    }
}

/// Unified error type for distributor operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DistributorError {
    /// Ready sends without a barrier cannot guarantee a posted receive.
    #[error(
        "send type \"Rsend\" requires the barrier between receives and sends; \
         ready sends need their receives already posted, and only a barrier guarantees that"
    )]
    ReadyWithoutBarrier,
    /// A send type name that is not one of the recognized values.
    #[error("unrecognized send type `{0}`; expected one of Isend, Rsend, Send, Ssend")]
    UnknownSendType(String),
    /// A configuration value that could not be parsed.
    #[error("invalid value `{value}` for option `{key}`")]
    InvalidOption { key: String, value: String },

    /// Export process ids outside `[0, num_procs)`.
    #[error(
        "Proc {rank}: {num_bad} process id(s) outside [0, {num_procs}) as (index, id): {}",
        bounded_pairs(.offending, *.num_bad)
    )]
    InvalidProcessIds {
        rank: usize,
        num_procs: usize,
        num_bad: usize,
        offending: Vec<(usize, usize)>,
    },
    /// Some other process rejected its process ids; raised everywhere so no rank hangs.
    #[error("process id validation failed on rank(s) {ranks:?}")]
    RemoteInvalidProcessIds { ranks: Vec<usize> },
    /// Discovery and the length exchange disagree.
    #[error(
        "Proc {rank}: {num_mismatches} receive length(s) disagree with discovery: {}",
        bounded(.mismatches, *.num_mismatches)
    )]
    LengthMismatch {
        rank: usize,
        num_mismatches: usize,
        mismatches: Vec<LengthMismatch>,
    },
    /// `remote_proc_ids` must be grouped by process in non-decreasing order.
    #[error(
        "remote process ids must be non-decreasing; entry {index} ({proc_id}) follows {previous}"
    )]
    UnsortedRemoteProcessIds {
        index: usize,
        proc_id: usize,
        previous: usize,
    },
    /// The self-message is sized differently on the send and receive side.
    #[error("self message sends {send} item(s) but expects to receive {recv}")]
    SelfLengthMismatch { send: usize, recv: usize },
    /// A payload buffer is smaller than the plan requires.
    #[error("{what} buffer too small: need {needed} element(s), got {got}")]
    BufferTooSmall {
        what: &'static str,
        needed: usize,
        got: usize,
    },
    /// A per-item packet count array has the wrong length.
    #[error("{what} has {got} entries, the plan expects {expected}")]
    PacketCountLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    /// A received message has an unexpected size.
    #[error("message from rank {peer}: {detail}")]
    MessageSize { peer: usize, detail: String },
    /// A structural invariant of a plan or tracker does not hold.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// `do_waits` without a matching `do_posts`.
    #[error("do_waits called without a matching do_posts")]
    WaitWithoutPost,
    /// `do_posts` while an earlier batch is still in flight.
    #[error("do_posts called while a previous batch is in flight; call do_waits first")]
    PostWhilePending,
    /// The plan was never built.
    #[error("the distributor plan is not initialized; call a create_from_* method first")]
    NotInitialized,
    /// Posted and waited with payload element types of different sizes.
    #[error("posted {posted}-byte elements but waited with {waited}-byte elements")]
    ElementSizeMismatch { posted: usize, waited: usize },

    /// Transport failure.
    #[error("communication error: {0}")]
    Comm(#[from] CommError),
}

/// Render the first entries of `items`, noting how many of `total` were cut.
fn bounded<T: Display>(items: &[T], total: usize) -> String {
    let mut out = String::from("[");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{item}");
    }
    if total > items.len() {
        let _ = write!(out, ", ... ({} more)", total - items.len());
    }
    out.push(']');
    out
}

fn bounded_pairs(items: &[(usize, usize)], total: usize) -> String {
    let rendered: Vec<String> = items.iter().map(|(i, p)| format!("({i}, {p})")).collect();
    bounded(&rendered, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_ids_message_is_bounded() {
        let err = DistributorError::LengthMismatch {
            rank: 2,
            num_mismatches: 3,
            mismatches: vec![LengthMismatch {
                peer: 1,
                discovered: 4,
                received: 5,
            }],
        };
        let msg = err.to_string();
        assert!(msg.contains("peer 1: discovered 4, received 5"), "{msg}");
        assert!(msg.contains("(2 more)"), "{msg}");
    }
}
