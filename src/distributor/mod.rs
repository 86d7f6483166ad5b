//! Irregular point-to-point redistribution of data across a process group.
//!
//! A [`Distributor`] builds a [`DistributorPlan`] once, from the destination
//! process of every item, and then moves any number of payloads along it. The
//! same plan run backwards (the *reverse* plan) returns data to where it came
//! from.
//!
//! ```
//! use mesh_distributor::algs::communicator::NoComm;
//! use mesh_distributor::distributor::Distributor;
//!
//! let comm = NoComm;
//! let mut dist = Distributor::new(&comm);
//! let n = dist.create_from_sends(&[Some(0), None, Some(0)]).unwrap();
//! let mut imports = vec![0.0f64; n];
//! dist.do_posts_and_waits(&[1.0, 2.0, 3.0], 1, &mut imports).unwrap();
//! assert_eq!(imports, [1.0, 3.0]);
//! ```

/// Debug-mode log line, prefixed with the process rank and the method.
macro_rules! dist_debug {
    ($params:expr, $rank:expr, $method:literal, $($arg:tt)*) => {
        if $params.debug {
            log::debug!(
                "Proc {}: Distributor::{}: {}",
                $rank,
                $method,
                format_args!($($arg)*)
            );
        }
    };
}

pub mod actor;
pub mod describe;
pub mod params;
pub mod plan;
pub mod tags;

use std::fmt;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::algs::communicator::Communicator;
use crate::algs::wire::WireIdRank;
use crate::distributor_error::DistributorError;

pub use actor::{DistributorActor, PacketLayout};
pub use describe::Verbosity;
pub use params::{DistributorParams, SendType};
pub use plan::{DistributorPlan, HowInitialized};

/// Plan plus exchange engine over one communicator.
///
/// The reverse distributor is created on first use of a reverse operation
/// and shares the plan's cached reverse plan.
pub struct Distributor<'c, C: Communicator> {
    comm: &'c C,
    plan: Arc<DistributorPlan>,
    actor: DistributorActor<C>,
    reverse: Option<Box<Distributor<'c, C>>>,
}

impl<'c, C: Communicator> Distributor<'c, C> {
    /// A distributor with default parameters and no plan yet.
    pub fn new(comm: &'c C) -> Self {
        Self::from_plan(comm, Arc::new(DistributorPlan::new(comm, DistributorParams::default())))
    }

    /// A distributor with `params`, rejected before any communication if
    /// the combination is invalid.
    pub fn with_params(comm: &'c C, params: DistributorParams) -> Result<Self, DistributorError> {
        params.validate()?;
        Ok(Self::from_plan(comm, Arc::new(DistributorPlan::new(comm, params))))
    }

    fn from_plan(comm: &'c C, plan: Arc<DistributorPlan>) -> Self {
        Self {
            comm,
            plan,
            actor: DistributorActor::new(),
            reverse: None,
        }
    }

    /// Replace the parameters. An existing plan keeps its peers and lengths;
    /// the reverse distributor is rebuilt on next use.
    pub fn set_params(&mut self, params: DistributorParams) -> Result<(), DistributorError> {
        self.plan = Arc::new(self.plan.with_params(params)?);
        self.reverse = None;
        Ok(())
    }

    pub fn params(&self) -> &DistributorParams {
        self.plan.params()
    }

    pub fn plan(&self) -> &Arc<DistributorPlan> {
        &self.plan
    }

    pub fn comm(&self) -> &'c C {
        self.comm
    }

    /// See [`DistributorPlan::create_from_sends`]. Collective.
    pub fn create_from_sends(
        &mut self,
        export_proc_ids: &[Option<usize>],
    ) -> Result<usize, DistributorError> {
        let mut plan = DistributorPlan::new(self.comm, self.params().clone());
        let n = plan.create_from_sends(self.comm, export_proc_ids)?;
        self.install(plan);
        Ok(n)
    }

    /// See [`DistributorPlan::create_from_sends_and_recvs`]. Not collective.
    pub fn create_from_sends_and_recvs(
        &mut self,
        export_proc_ids: &[Option<usize>],
        remote_proc_ids: &[usize],
    ) -> Result<(), DistributorError> {
        let mut plan = DistributorPlan::new(self.comm, self.params().clone());
        plan.create_from_sends_and_recvs(self.comm, export_proc_ids, remote_proc_ids)?;
        self.install(plan);
        Ok(())
    }

    /// Build the plan from the ids this process wants to receive and the
    /// process that owns each of them. Collective.
    ///
    /// Every owner learns which of its ids were requested and by whom: the
    /// result holds, per export of the new plan, the requested id and the
    /// requesting process. Imports of the new plan arrive grouped by owner,
    /// owners in the order they first appear in `remote_proc_ids`.
    pub fn create_from_recvs(
        &mut self,
        remote_ids: &[u64],
        remote_proc_ids: &[Option<usize>],
    ) -> Result<(Vec<u64>, Vec<usize>), DistributorError> {
        if remote_ids.len() != remote_proc_ids.len() {
            return Err(DistributorError::PacketCountLength {
                what: "remote_proc_ids",
                expected: remote_ids.len(),
                got: remote_proc_ids.len(),
            });
        }
        let params = self.params().clone();
        let mut request = DistributorPlan::new(self.comm, params.clone());
        let num_requests = request.create_from_sends(self.comm, remote_proc_ids)?;

        let me = self.comm.rank();
        let wanted: Vec<WireIdRank> = remote_ids.iter().map(|&id| WireIdRank::new(id, me)).collect();
        let mut received = vec![WireIdRank::zeroed(); num_requests];
        let tag = tags::tag_for(tags::Phase::CreateFromRecvs, params.use_distinct_tags);
        let mut actor = DistributorActor::<C>::new();
        actor.do_posts(
            self.comm,
            &request,
            tag,
            &wanted,
            PacketLayout::Constant(1),
            PacketLayout::Constant(1),
        )?;
        actor.do_waits(&mut received)?;

        let plan = request.reverse_plan().as_ref().clone().into_from_recvs();
        dist_debug!(params, me, "create_from_recvs",
            "{} id(s) requested from me, {} requested by me",
            received.len(), plan.total_receive_length());
        self.install(plan);
        Ok(received.iter().map(|w| (w.id(), w.rank())).unzip())
    }

    fn install(&mut self, plan: DistributorPlan) {
        self.plan = Arc::new(plan);
        self.reverse = None;
    }

    /// Original export index for each position of the packed send buffer.
    pub fn export_order(&self) -> Vec<usize> {
        self.plan.export_order()
    }

    pub fn total_receive_length(&self) -> usize {
        self.plan.total_receive_length()
    }

    /// Bytes sent to other processes by the last forward batch.
    pub fn last_round_bytes_send(&self) -> usize {
        self.actor.last_round_bytes_send()
    }

    /// Bytes received from other processes by the last forward batch.
    pub fn last_round_bytes_recv(&self) -> usize {
        self.actor.last_round_bytes_recv()
    }

    /// Post a forward exchange of `num_packets` packets per item.
    pub fn do_posts<T: Pod>(&mut self, exports: &[T], num_packets: usize) -> Result<(), DistributorError> {
        let layout = PacketLayout::Constant(num_packets);
        self.post(exports, layout, layout)
    }

    /// Post a forward exchange with a variable number of packets per item.
    pub fn do_posts_variable<T: Pod>(
        &mut self,
        exports: &[T],
        export_packets_per_item: &[usize],
        import_packets_per_item: &[usize],
    ) -> Result<(), DistributorError> {
        self.post(
            exports,
            PacketLayout::Variable(export_packets_per_item),
            PacketLayout::Variable(import_packets_per_item),
        )
    }

    /// Complete the forward exchange posted last.
    pub fn do_waits<T: Pod>(&mut self, imports: &mut [T]) -> Result<(), DistributorError> {
        self.actor.do_waits(imports)
    }

    pub fn do_posts_and_waits<T: Pod>(
        &mut self,
        exports: &[T],
        num_packets: usize,
        imports: &mut [T],
    ) -> Result<(), DistributorError> {
        self.do_posts(exports, num_packets)?;
        self.do_waits(imports)
    }

    pub fn do_posts_and_waits_variable<T: Pod>(
        &mut self,
        exports: &[T],
        export_packets_per_item: &[usize],
        imports: &mut [T],
        import_packets_per_item: &[usize],
    ) -> Result<(), DistributorError> {
        self.do_posts_variable(exports, export_packets_per_item, import_packets_per_item)?;
        self.do_waits(imports)
    }

    /// Post an exchange along the reverse plan: `exports` are laid out like
    /// the forward imports, and the imports land in packed send-buffer order
    /// (see [`export_order`](Self::export_order)).
    pub fn do_reverse_posts<T: Pod>(
        &mut self,
        exports: &[T],
        num_packets: usize,
    ) -> Result<(), DistributorError> {
        self.reverse_distributor()?.do_posts(exports, num_packets)
    }

    pub fn do_reverse_posts_variable<T: Pod>(
        &mut self,
        exports: &[T],
        export_packets_per_item: &[usize],
        import_packets_per_item: &[usize],
    ) -> Result<(), DistributorError> {
        self.reverse_distributor()?
            .do_posts_variable(exports, export_packets_per_item, import_packets_per_item)
    }

    pub fn do_reverse_waits<T: Pod>(&mut self, imports: &mut [T]) -> Result<(), DistributorError> {
        match self.reverse.as_mut() {
            Some(reverse) => reverse.do_waits(imports),
            None => Err(DistributorError::WaitWithoutPost),
        }
    }

    pub fn do_reverse_posts_and_waits<T: Pod>(
        &mut self,
        exports: &[T],
        num_packets: usize,
        imports: &mut [T],
    ) -> Result<(), DistributorError> {
        self.do_reverse_posts(exports, num_packets)?;
        self.do_reverse_waits(imports)
    }

    pub fn do_reverse_posts_and_waits_variable<T: Pod>(
        &mut self,
        exports: &[T],
        export_packets_per_item: &[usize],
        imports: &mut [T],
        import_packets_per_item: &[usize],
    ) -> Result<(), DistributorError> {
        self.do_reverse_posts_variable(exports, export_packets_per_item, import_packets_per_item)?;
        self.do_reverse_waits(imports)
    }

    /// Bytes sent by the last reverse batch, 0 if none ran.
    pub fn last_reverse_round_bytes_send(&self) -> usize {
        self.reverse.as_ref().map_or(0, |r| r.last_round_bytes_send())
    }

    /// Bytes received by the last reverse batch, 0 if none ran.
    pub fn last_reverse_round_bytes_recv(&self) -> usize {
        self.reverse.as_ref().map_or(0, |r| r.last_round_bytes_recv())
    }

    /// Multi-line description of this process's plan and traffic.
    pub fn describe(&self, verbosity: Verbosity) -> String {
        let mut out = self.plan.describe(verbosity);
        if verbosity >= Verbosity::Medium {
            out.push_str(&format!(
                "    lastRoundBytesSend: {}\n    lastRoundBytesRecv: {}\n",
                self.last_round_bytes_send(),
                self.last_round_bytes_recv()
            ));
        }
        out
    }

    fn post<T: Pod>(
        &mut self,
        exports: &[T],
        export_layout: PacketLayout<'_>,
        import_layout: PacketLayout<'_>,
    ) -> Result<(), DistributorError> {
        let tag = self.plan.posts_tag();
        self.actor
            .do_posts(self.comm, &self.plan, tag, exports, export_layout, import_layout)
    }

    fn reverse_distributor(&mut self) -> Result<&mut Distributor<'c, C>, DistributorError> {
        if !self.plan.is_initialized() {
            return Err(DistributorError::NotInitialized);
        }
        let comm = self.comm;
        let plan = &self.plan;
        let reverse = self
            .reverse
            .get_or_insert_with(|| Box::new(Distributor::from_plan(comm, plan.reverse_plan())));
        Ok(reverse.as_mut())
    }
}

impl<C: Communicator> fmt::Display for Distributor<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.plan.as_ref(), f)
    }
}

impl<C: Communicator> fmt::Debug for Distributor<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Distributor")
            .field("plan", &self.plan)
            .field("pending", &self.actor.has_pending())
            .field("has_reverse", &self.reverse.is_some())
            .finish()
    }
}
