//! Communication plan: who sends how much to whom.
//!
//! A plan is built once from per-item destination process ids and then drives
//! any number of exchanges. Plans are immutable once built and are shared
//! behind an [`Arc`]; the reverse plan is derived on first request and cached
//! in the forward plan.

use std::fmt;
use std::sync::Arc;

use itertools::Itertools;
use once_cell::sync::OnceCell;

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{WireCount, cast_slice};
use crate::debug_invariants::DebugInvariants;
use crate::distributor::params::DistributorParams;
use crate::distributor::tags::{Phase, tag_for};
use crate::distributor_error::{DistributorError, LengthMismatch};

/// How a plan came to be.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum HowInitialized {
    #[default]
    Unknown,
    FromSends,
    FromSendsAndRecvs,
    FromRecvs,
    Reverse,
}

impl HowInitialized {
    pub fn as_str(self) -> &'static str {
        match self {
            HowInitialized::Unknown => "Not initialized yet",
            HowInitialized::FromSends => "By create_from_sends",
            HowInitialized::FromSendsAndRecvs => "By create_from_sends_and_recvs",
            HowInitialized::FromRecvs => "By create_from_recvs",
            HowInitialized::Reverse => "By create_reverse_distributor",
        }
    }
}

impl fmt::Display for HowInitialized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peer lists, message lengths and buffer offsets of one exchange pattern.
///
/// Lengths and offsets count items, not bytes; the exchange engine scales
/// them by the number of packets per item and the element size.
#[derive(Clone, Debug)]
pub struct DistributorPlan {
    rank: usize,
    num_procs: usize,
    params: DistributorParams,
    how_initialized: HowInitialized,

    send_message_to_self: bool,
    num_sends: usize,
    procs_to: Vec<usize>,
    lengths_to: Vec<usize>,
    starts_to: Vec<usize>,
    indices_to: Option<Vec<usize>>,
    max_send_length: usize,
    num_exports: usize,

    num_receives: usize,
    procs_from: Vec<usize>,
    lengths_from: Vec<usize>,
    starts_from: Vec<usize>,
    total_receive_length: usize,

    reverse: OnceCell<Arc<DistributorPlan>>,
}

/// Exports grouped by destination, before any communication.
struct Grouping {
    procs_to: Vec<usize>,
    lengths_to: Vec<usize>,
    starts_to: Vec<usize>,
    indices_to: Option<Vec<usize>>,
}

impl DistributorPlan {
    /// An uninitialized plan for the group of `comm`. `params` are checked
    /// when the plan is built.
    pub fn new<C: Communicator + ?Sized>(comm: &C, params: DistributorParams) -> Self {
        Self {
            rank: comm.rank(),
            num_procs: comm.size(),
            params,
            how_initialized: HowInitialized::Unknown,
            send_message_to_self: false,
            num_sends: 0,
            procs_to: Vec::new(),
            lengths_to: Vec::new(),
            starts_to: Vec::new(),
            indices_to: None,
            max_send_length: 0,
            num_exports: 0,
            num_receives: 0,
            procs_from: Vec::new(),
            lengths_from: Vec::new(),
            starts_from: Vec::new(),
            total_receive_length: 0,
            reverse: OnceCell::new(),
        }
    }

    /// Build the plan from the destination of every export item and discover
    /// the matching receives. Collective over `comm`.
    ///
    /// `None` entries are discarded: they are neither sent nor counted.
    /// Returns the number of items this process will receive.
    /// Invalid parameters are rejected before any communication.
    pub fn create_from_sends<C: Communicator + ?Sized>(
        &mut self,
        comm: &C,
        export_proc_ids: &[Option<usize>],
    ) -> Result<usize, DistributorError> {
        self.params.validate()?;
        self.reset(comm);
        dist_debug!(self.params, self.rank, "create_from_sends",
            "num_exports={}", export_proc_ids.len());

        // Agree on bad ids before anything else so no process waits on one
        // that has already bailed out.
        let offending = self.out_of_range(export_proc_ids.iter().enumerate().filter_map(
            |(i, p)| p.map(|p| (i, p)),
        ));
        let flag = u64::from(offending.is_some());
        let flags = comm.all_to_all_counts(&vec![flag; self.num_procs])?;
        if let Some(err) = offending {
            return Err(err);
        }
        let bad_ranks: Vec<usize> = (0..self.num_procs).filter(|&p| flags[p] != 0).collect();
        if !bad_ranks.is_empty() {
            return Err(DistributorError::RemoteInvalidProcessIds { ranks: bad_ranks });
        }

        self.apply_grouping(group_exports(export_proc_ids, self.num_procs));
        self.num_exports = export_proc_ids.len();
        self.compute_receives(comm)?;
        self.how_initialized = HowInitialized::FromSends;

        dist_debug!(self.params, self.rank, "create_from_sends",
            "done: num_sends={}, num_receives={}, total_receive_length={}",
            self.num_sends, self.num_receives, self.total_receive_length);
        crate::debug_invariants!(self.validate_invariants(), "create_from_sends");
        Ok(self.total_receive_length)
    }

    /// Build the plan when each process already knows both where its exports
    /// go and where each incoming item comes from. No communication.
    ///
    /// `remote_proc_ids[k]` is the source process of incoming item `k`; the
    /// entries must be grouped by process in non-decreasing order. The caller
    /// guarantees that the send and receive sides agree across processes.
    pub fn create_from_sends_and_recvs<C: Communicator + ?Sized>(
        &mut self,
        comm: &C,
        export_proc_ids: &[Option<usize>],
        remote_proc_ids: &[usize],
    ) -> Result<(), DistributorError> {
        self.params.validate()?;
        self.reset(comm);
        dist_debug!(self.params, self.rank, "create_from_sends_and_recvs",
            "num_exports={}, num_remotes={}", export_proc_ids.len(), remote_proc_ids.len());

        let exports = export_proc_ids
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.map(|p| (i, p)));
        if let Some(err) = self.out_of_range(exports) {
            return Err(err);
        }
        if let Some(err) = self.out_of_range(remote_proc_ids.iter().copied().enumerate()) {
            return Err(err);
        }
        if let Some(index) = (1..remote_proc_ids.len())
            .find(|&i| remote_proc_ids[i] < remote_proc_ids[i - 1])
        {
            return Err(DistributorError::UnsortedRemoteProcessIds {
                index,
                proc_id: remote_proc_ids[index],
                previous: remote_proc_ids[index - 1],
            });
        }

        self.apply_grouping(group_exports(export_proc_ids, self.num_procs));
        self.num_exports = export_proc_ids.len();

        for (proc, run) in &remote_proc_ids.iter().chunk_by(|&&p| p) {
            self.procs_from.push(proc);
            self.lengths_from.push(run.count());
        }
        let self_recv = self
            .procs_from
            .iter()
            .position(|&p| p == self.rank)
            .map_or(0, |j| self.lengths_from[j]);
        let self_send = self
            .procs_to
            .iter()
            .position(|&p| p == self.rank)
            .map_or(0, |g| self.lengths_to[g]);
        if self_send != self_recv {
            return Err(DistributorError::SelfLengthMismatch {
                send: self_send,
                recv: self_recv,
            });
        }
        self.finish_receives();
        self.how_initialized = HowInitialized::FromSendsAndRecvs;

        crate::debug_invariants!(self.validate_invariants(), "create_from_sends_and_recvs");
        Ok(())
    }

    /// The plan with send and receive roles swapped. Computed on first call
    /// and shared by every later call; no communication.
    pub fn reverse_plan(&self) -> Arc<DistributorPlan> {
        Arc::clone(self.reverse.get_or_init(|| Arc::new(self.build_reverse())))
    }

    /// Original export index for each position of the packed send buffer.
    ///
    /// Entry `k` of the imports of a reverse exchange carries the item that
    /// was exported from `export_order()[k]`.
    pub fn export_order(&self) -> Vec<usize> {
        match &self.indices_to {
            Some(indices) => indices.clone(),
            None => self
                .starts_to
                .iter()
                .zip(&self.lengths_to)
                .flat_map(|(&start, &len)| start..start + len)
                .collect(),
        }
    }

    /// Export item indices of send block `g`, in packing order.
    pub(crate) fn block_items(&self, g: usize) -> BlockItems<'_> {
        let start = self.starts_to[g];
        let len = self.lengths_to[g];
        match &self.indices_to {
            Some(indices) => BlockItems::Indexed(indices[start..start + len].iter()),
            None => BlockItems::Range(start..start + len),
        }
    }

    /// Tag of this plan's payload messages.
    pub fn posts_tag(&self) -> CommTag {
        let phase = if self.how_initialized == HowInitialized::Reverse {
            Phase::ReversePosts
        } else {
            Phase::ForwardPosts
        };
        tag_for(phase, self.params.use_distinct_tags)
    }

    /// A copy of this plan with different parameters and no cached reverse.
    pub fn with_params(&self, params: DistributorParams) -> Result<Self, DistributorError> {
        params.validate()?;
        let mut plan = self.clone();
        plan.params = params;
        plan.reverse = OnceCell::new();
        Ok(plan)
    }

    /// Re-label a reversed request plan as built from receives.
    pub(crate) fn into_from_recvs(mut self) -> Self {
        self.how_initialized = HowInitialized::FromRecvs;
        self.reverse = OnceCell::new();
        self
    }

    pub fn rank(&self) -> usize {
        self.rank
    }
    pub fn num_procs(&self) -> usize {
        self.num_procs
    }
    pub fn params(&self) -> &DistributorParams {
        &self.params
    }
    pub fn how_initialized(&self) -> HowInitialized {
        self.how_initialized
    }
    pub fn is_initialized(&self) -> bool {
        self.how_initialized != HowInitialized::Unknown
    }
    pub fn send_message_to_self(&self) -> bool {
        self.send_message_to_self
    }
    /// Number of processes this one sends to, excluding itself.
    pub fn num_sends(&self) -> usize {
        self.num_sends
    }
    pub fn procs_to(&self) -> &[usize] {
        &self.procs_to
    }
    pub fn lengths_to(&self) -> &[usize] {
        &self.lengths_to
    }
    pub fn starts_to(&self) -> &[usize] {
        &self.starts_to
    }
    /// Packing permutation, `None` when exports are already grouped.
    pub fn indices_to(&self) -> Option<&[usize]> {
        self.indices_to.as_deref()
    }
    /// Largest send to a process other than this one.
    pub fn max_send_length(&self) -> usize {
        self.max_send_length
    }
    /// Length of the export sequence the plan was built from.
    pub fn num_exports(&self) -> usize {
        self.num_exports
    }
    pub fn total_send_length(&self) -> usize {
        self.lengths_to.iter().sum()
    }
    /// Number of processes this one receives from, excluding itself.
    pub fn num_receives(&self) -> usize {
        self.num_receives
    }
    pub fn procs_from(&self) -> &[usize] {
        &self.procs_from
    }
    pub fn lengths_from(&self) -> &[usize] {
        &self.lengths_from
    }
    pub fn starts_from(&self) -> &[usize] {
        &self.starts_from
    }
    pub fn total_receive_length(&self) -> usize {
        self.total_receive_length
    }

    fn reset<C: Communicator + ?Sized>(&mut self, comm: &C) {
        *self = Self::new(comm, self.params.clone());
    }

    /// Collect the `(index, id)` pairs outside `[0, num_procs)`, bounded by
    /// the print threshold.
    fn out_of_range<I>(&self, ids: I) -> Option<DistributorError>
    where
        I: Iterator<Item = (usize, usize)>,
    {
        let mut offending = Vec::new();
        let mut num_bad = 0;
        for (i, p) in ids.filter(|&(_, p)| p >= self.num_procs) {
            if offending.len() < self.params.print_threshold {
                offending.push((i, p));
            }
            num_bad += 1;
        }
        (num_bad > 0).then(|| DistributorError::InvalidProcessIds {
            rank: self.rank,
            num_procs: self.num_procs,
            num_bad,
            offending,
        })
    }

    fn apply_grouping(&mut self, grouping: Grouping) {
        let Grouping {
            procs_to,
            lengths_to,
            starts_to,
            indices_to,
        } = grouping;
        self.send_message_to_self = procs_to.contains(&self.rank);
        self.num_sends = procs_to.len() - usize::from(self.send_message_to_self);
        self.max_send_length = procs_to
            .iter()
            .zip(&lengths_to)
            .filter(|&(&p, _)| p != self.rank)
            .map(|(_, &len)| len)
            .max()
            .unwrap_or(0);
        self.procs_to = procs_to;
        self.lengths_to = lengths_to;
        self.starts_to = starts_to;
        self.indices_to = indices_to;
    }

    /// Discover who sends to this process and how much.
    ///
    /// An all-to-all of per-peer item counts gives the receive side; the
    /// senders then confirm every length point-to-point, and the receivers
    /// check the two agree.
    fn compute_receives<C: Communicator + ?Sized>(
        &mut self,
        comm: &C,
    ) -> Result<(), DistributorError> {
        let me = self.rank;
        let mut counts = vec![0u64; self.num_procs];
        for (&p, &len) in self.procs_to.iter().zip(&self.lengths_to) {
            counts[p] = len as u64;
        }
        let discovered = comm.all_to_all_counts(&counts)?;

        let tag = tag_for(Phase::ComputeReceives, self.params.use_distinct_tags);
        let width = std::mem::size_of::<WireCount>();
        let mut recvs = Vec::new();
        for peer in (0..self.num_procs).filter(|&p| p != me && discovered[p] > 0) {
            let mut buf = vec![0u8; width];
            recvs.push((peer, comm.irecv(peer, tag.as_u16(), &mut buf)));
        }
        let mut sends = Vec::with_capacity(self.num_sends);
        for (&peer, &len) in self.procs_to.iter().zip(&self.lengths_to) {
            if peer != me {
                let wire = [WireCount::new(len as u64)];
                sends.push(comm.isend(peer, tag.as_u16(), cast_slice(&wire)));
            }
        }

        // drain everything before reporting
        let mut mismatches = Vec::new();
        let mut num_mismatches = 0;
        let mut maybe_err = None;
        for (peer, h) in recvs {
            match h.wait() {
                Some(data) if data.len() == width => {
                    let received = WireCount::decode(&data).get();
                    if received != discovered[peer] {
                        if mismatches.len() < self.params.print_threshold {
                            mismatches.push(LengthMismatch {
                                peer,
                                discovered: discovered[peer],
                                received,
                            });
                        }
                        num_mismatches += 1;
                    }
                }
                Some(data) if maybe_err.is_none() => {
                    maybe_err = Some(DistributorError::MessageSize {
                        peer,
                        detail: format!("expected {width} bytes for a length, got {}", data.len()),
                    });
                }
                None if maybe_err.is_none() => {
                    maybe_err = Some(DistributorError::MessageSize {
                        peer,
                        detail: "length message never arrived".into(),
                    });
                }
                _ => {}
            }
        }
        for s in sends {
            let _ = s.wait();
        }
        if let Some(err) = maybe_err {
            return Err(err);
        }
        if num_mismatches > 0 {
            return Err(DistributorError::LengthMismatch {
                rank: me,
                num_mismatches,
                mismatches,
            });
        }

        for (p, &n) in discovered.iter().enumerate() {
            if n > 0 {
                self.procs_from.push(p);
                self.lengths_from.push(n as usize);
            }
        }
        self.finish_receives();
        Ok(())
    }

    /// Derive the receive-side counters from `procs_from` / `lengths_from`.
    fn finish_receives(&mut self) {
        self.num_receives = self.procs_from.iter().filter(|&&p| p != self.rank).count();
        self.starts_from = prefix_offsets(&self.lengths_from);
        self.total_receive_length = self.lengths_from.iter().sum();
    }

    fn build_reverse(&self) -> DistributorPlan {
        let max_send_length = self
            .procs_from
            .iter()
            .zip(&self.lengths_from)
            .filter(|&(&p, _)| p != self.rank)
            .map(|(_, &len)| len)
            .max()
            .unwrap_or(0);
        DistributorPlan {
            rank: self.rank,
            num_procs: self.num_procs,
            params: self.params.clone(),
            how_initialized: HowInitialized::Reverse,
            send_message_to_self: self.send_message_to_self,
            num_sends: self.num_receives,
            procs_to: self.procs_from.clone(),
            lengths_to: self.lengths_from.clone(),
            starts_to: self.starts_from.clone(),
            indices_to: None,
            max_send_length,
            num_exports: self.total_receive_length,
            num_receives: self.num_sends,
            procs_from: self.procs_to.clone(),
            lengths_from: self.lengths_to.clone(),
            // imports of the reverse land in packed send-buffer order
            starts_from: prefix_offsets(&self.lengths_to),
            total_receive_length: self.total_send_length(),
            reverse: OnceCell::new(),
        }
    }
}

/// Items of one send block.
pub(crate) enum BlockItems<'a> {
    Range(std::ops::Range<usize>),
    Indexed(std::slice::Iter<'a, usize>),
}

impl Iterator for BlockItems<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        match self {
            BlockItems::Range(r) => r.next(),
            BlockItems::Indexed(it) => it.next().copied(),
        }
    }
}

/// Exclusive prefix sums.
pub(crate) fn prefix_offsets(lengths: &[usize]) -> Vec<usize> {
    lengths
        .iter()
        .scan(0usize, |acc, &len| {
            let start = *acc;
            *acc += len;
            Some(start)
        })
        .collect()
}

/// Group exports by destination in first-seen order.
///
/// Exports count as contiguous unless some item goes to a process that
/// already has items and differs from the entry right before it. Ids must
/// already be range-checked.
fn group_exports(export_proc_ids: &[Option<usize>], num_procs: usize) -> Grouping {
    let mut counts = vec![0usize; num_procs];
    let mut first_index = vec![0usize; num_procs];
    let mut procs_to = Vec::new();
    let mut contiguous = true;
    for (i, &id) in export_proc_ids.iter().enumerate() {
        let Some(p) = id else { continue };
        if counts[p] == 0 {
            procs_to.push(p);
            first_index[p] = i;
        } else if export_proc_ids[i - 1] != id {
            contiguous = false;
        }
        counts[p] += 1;
    }
    let lengths_to: Vec<usize> = procs_to.iter().map(|&p| counts[p]).collect();

    if contiguous {
        let starts_to = procs_to.iter().map(|&p| first_index[p]).collect();
        return Grouping {
            procs_to,
            lengths_to,
            starts_to,
            indices_to: None,
        };
    }

    let starts_to = prefix_offsets(&lengths_to);
    let mut cursor = vec![0usize; num_procs];
    for (&p, &start) in procs_to.iter().zip(&starts_to) {
        cursor[p] = start;
    }
    let mut indices_to = vec![0usize; lengths_to.iter().sum()];
    for (i, &id) in export_proc_ids.iter().enumerate() {
        if let Some(p) = id {
            indices_to[cursor[p]] = i;
            cursor[p] += 1;
        }
    }
    Grouping {
        procs_to,
        lengths_to,
        starts_to,
        indices_to: Some(indices_to),
    }
}

impl DebugInvariants for DistributorPlan {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "DistributorPlan");
    }

    fn validate_invariants(&self) -> Result<(), DistributorError> {
        let fail = |msg: String| Err(DistributorError::InvariantViolation(msg));
        if self.procs_to.len() != self.lengths_to.len()
            || self.procs_to.len() != self.starts_to.len()
        {
            return fail("procs_to, lengths_to and starts_to differ in length".into());
        }
        if self.procs_from.len() != self.lengths_from.len()
            || self.procs_from.len() != self.starts_from.len()
        {
            return fail("procs_from, lengths_from and starts_from differ in length".into());
        }
        let has_self = self.procs_to.contains(&self.rank);
        if has_self != self.send_message_to_self {
            return fail(format!(
                "send_message_to_self={} but procs_to {} rank {}",
                self.send_message_to_self,
                if has_self { "contains" } else { "lacks" },
                self.rank
            ));
        }
        if self.num_sends + usize::from(has_self) != self.procs_to.len() {
            return fail(format!(
                "num_sends={} does not match {} destination(s)",
                self.num_sends,
                self.procs_to.len()
            ));
        }
        let self_from = usize::from(self.procs_from.contains(&self.rank));
        if self.num_receives + self_from != self.procs_from.len() {
            return fail(format!(
                "num_receives={} does not match {} source(s)",
                self.num_receives,
                self.procs_from.len()
            ));
        }
        if self.lengths_from.iter().sum::<usize>() != self.total_receive_length {
            return fail("total_receive_length is not the sum of lengths_from".into());
        }
        // reversed plans receive in forward first-seen order
        if !matches!(
            self.how_initialized,
            HowInitialized::Reverse | HowInitialized::FromRecvs
        ) && self.procs_from.windows(2).any(|w| w[0] >= w[1])
        {
            return fail(format!("procs_from not strictly ascending: {:?}", self.procs_from));
        }
        let mut seen = vec![false; self.num_procs];
        for &p in &self.procs_to {
            if p >= self.num_procs || std::mem::replace(&mut seen[p], true) {
                return fail(format!("procs_to has an invalid or repeated rank {p}"));
            }
        }
        if let Some(indices) = &self.indices_to {
            if indices.len() != self.total_send_length() {
                return fail(format!(
                    "indices_to has {} entries for {} exported item(s)",
                    indices.len(),
                    self.total_send_length()
                ));
            }
            if indices.iter().any(|&i| i >= self.num_exports) {
                return fail("indices_to points past the export sequence".into());
            }
        } else if self
            .starts_to
            .iter()
            .zip(&self.lengths_to)
            .any(|(&s, &l)| s + l > self.num_exports)
        {
            return fail("a send block runs past the export sequence".into());
        }
        Ok(())
    }
}
