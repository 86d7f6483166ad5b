//! Exchange engine: executes one plan's message batch.
//!
//! Receives are always posted first, then an optional barrier, then the sends
//! in the plan's send mode. The self message never touches the transport; it
//! is packed at post time and copied into the imports at wait time.

use std::mem::size_of;

use bytemuck::Pod;

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{cast_slice, cast_slice_mut, expect_exact_len};
use crate::distributor::params::SendType;
use crate::distributor::plan::DistributorPlan;
use crate::distributor_error::DistributorError;

/// Packets per item on one side of an exchange.
#[derive(Copy, Clone, Debug)]
pub enum PacketLayout<'a> {
    /// Every item carries the same number of packets.
    Constant(usize),
    /// Packets of each item, one entry per item.
    Variable(&'a [usize]),
}

impl PacketLayout<'_> {
    /// Packet offset of every item plus the total, or an error if a
    /// variable layout does not cover `num_items`.
    fn offsets(&self, num_items: usize, what: &'static str) -> Result<Offsets, DistributorError> {
        match *self {
            PacketLayout::Constant(n) => Ok(Offsets::Strided(n)),
            PacketLayout::Variable(counts) => {
                if counts.len() != num_items {
                    return Err(DistributorError::PacketCountLength {
                        what,
                        expected: num_items,
                        got: counts.len(),
                    });
                }
                let mut starts = Vec::with_capacity(counts.len() + 1);
                let mut acc = 0usize;
                starts.push(0);
                for &c in counts {
                    acc += c;
                    starts.push(acc);
                }
                Ok(Offsets::Explicit(starts))
            }
        }
    }
}

enum Offsets {
    Strided(usize),
    Explicit(Vec<usize>),
}

impl Offsets {
    /// Packet range of item `i`.
    fn item(&self, i: usize) -> std::ops::Range<usize> {
        match self {
            Offsets::Strided(n) => i * n..(i + 1) * n,
            Offsets::Explicit(starts) => starts[i]..starts[i + 1],
        }
    }

    /// Packet range of items `first..first + len`.
    fn span(&self, first: usize, len: usize) -> std::ops::Range<usize> {
        match self {
            Offsets::Strided(n) => first * n..(first + len) * n,
            Offsets::Explicit(starts) => starts[first]..starts[first + len],
        }
    }

    fn total(&self, num_items: usize) -> usize {
        self.span(0, num_items).end
    }
}

struct PendingRecv<H> {
    peer: usize,
    handle: H,
    byte_offset: usize,
    byte_len: usize,
}

/// Owns the handles of the batch currently in flight.
pub struct DistributorActor<C: Communicator> {
    recvs: Vec<PendingRecv<C::RecvHandle>>,
    sends: Vec<C::SendHandle>,
    self_copy: Option<(usize, Vec<u8>)>,
    expected_import_bytes: usize,
    elem_size: usize,
    posted: bool,
    last_round_bytes_send: usize,
    last_round_bytes_recv: usize,
}

impl<C: Communicator> Default for DistributorActor<C> {
    fn default() -> Self {
        Self {
            recvs: Vec::new(),
            sends: Vec::new(),
            self_copy: None,
            expected_import_bytes: 0,
            elem_size: 0,
            posted: false,
            last_round_bytes_send: 0,
            last_round_bytes_recv: 0,
        }
    }
}

impl<C: Communicator> DistributorActor<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` between `do_posts` and the matching `do_waits`.
    pub fn has_pending(&self) -> bool {
        self.posted
    }

    /// Bytes this process sent to other processes in the last round.
    pub fn last_round_bytes_send(&self) -> usize {
        self.last_round_bytes_send
    }

    /// Bytes this process received from other processes in the last round.
    pub fn last_round_bytes_recv(&self) -> usize {
        self.last_round_bytes_recv
    }

    /// Post receives, then (after the optional barrier) sends, for one batch.
    ///
    /// `exports` is laid out by original export item, `export_layout` packets
    /// per item; the imports that `do_waits` fills are laid out by
    /// `import_layout` in `procs_from` order.
    pub fn do_posts<T: Pod>(
        &mut self,
        comm: &C,
        plan: &DistributorPlan,
        tag: CommTag,
        exports: &[T],
        export_layout: PacketLayout<'_>,
        import_layout: PacketLayout<'_>,
    ) -> Result<(), DistributorError> {
        if self.posted {
            return Err(DistributorError::PostWhilePending);
        }
        if !plan.is_initialized() {
            return Err(DistributorError::NotInitialized);
        }
        let me = plan.rank();
        let elem = size_of::<T>();
        let export_offsets = export_layout.offsets(plan.num_exports(), "export packet counts")?;
        let import_offsets =
            import_layout.offsets(plan.total_receive_length(), "import packet counts")?;
        let needed = export_offsets.total(plan.num_exports());
        if exports.len() < needed {
            return Err(DistributorError::BufferTooSmall {
                what: "exports",
                needed,
                got: exports.len(),
            });
        }

        // the self block must agree on both sides before anything is posted
        let self_send = plan
            .procs_to()
            .iter()
            .position(|&p| p == me)
            .map(|g| pack_block(plan, g, exports, &export_offsets));
        let self_recv = plan
            .procs_from()
            .iter()
            .zip(plan.starts_from())
            .zip(plan.lengths_from())
            .find(|&((&p, _), _)| p == me)
            .map(|((_, &start), &len)| import_offsets.span(start, len));
        let self_copy = match (self_send, self_recv) {
            (Some(payload), Some(packets)) => {
                expect_exact_len(payload.len(), packets.len() * elem)
                    .map_err(|detail| DistributorError::MessageSize { peer: me, detail })?;
                Some((packets.start * elem, payload))
            }
            _ => None,
        };

        // 1) receives, in procs_from order
        let mut recvs = Vec::with_capacity(plan.num_receives());
        let mut bytes_recv = 0;
        for ((&peer, &start), &len) in plan
            .procs_from()
            .iter()
            .zip(plan.starts_from())
            .zip(plan.lengths_from())
        {
            if peer == me {
                continue;
            }
            let packets = import_offsets.span(start, len);
            let byte_offset = packets.start * elem;
            let byte_len = packets.len() * elem;
            if byte_len == 0 {
                continue;
            }
            let mut buf = vec![0u8; byte_len];
            let handle = comm.irecv(peer, tag.as_u16(), &mut buf);
            recvs.push(PendingRecv {
                peer,
                handle,
                byte_offset,
                byte_len,
            });
            bytes_recv += byte_len;
        }
        let expected_import_bytes =
            import_offsets.total(plan.total_receive_length()) * elem;

        // 2) barrier
        let params = plan.params();
        if params.barrier_between_recv_send() {
            comm.barrier()?;
        }

        // 3) sends, starting after my own rank and wrapping around
        let mut order: Vec<usize> = (0..plan.procs_to().len()).collect();
        order.sort_unstable_by_key(|&g| plan.procs_to()[g]);
        let split = order.partition_point(|&g| plan.procs_to()[g] <= me);
        order.rotate_left(split);

        let mut sends = Vec::with_capacity(plan.num_sends());
        let mut bytes_send = 0;
        for g in order {
            let peer = plan.procs_to()[g];
            if peer == me {
                continue;
            }
            let payload = pack_block(plan, g, exports, &export_offsets);
            if payload.is_empty() {
                continue;
            }
            bytes_send += payload.len();
            let sent = match params.send_type {
                SendType::Immediate => {
                    sends.push(comm.isend(peer, tag.as_u16(), &payload));
                    Ok(())
                }
                SendType::Standard => comm.send(peer, tag.as_u16(), &payload),
                SendType::Ready => comm.ready_send(peer, tag.as_u16(), &payload),
                SendType::Synchronous => comm.synchronous_send(peer, tag.as_u16(), &payload),
            };
            if let Err(err) = sent {
                // the receives already posted for this batch are abandoned
                for s in sends {
                    let _ = s.wait();
                }
                return Err(err.into());
            }
        }

        dist_debug!(params, me, "do_posts",
            "posted {} receive(s) and {} send(s) on tag {:#06x}",
            recvs.len(), plan.num_sends(), tag.as_u16());

        self.recvs = recvs;
        self.sends = sends;
        self.self_copy = self_copy;
        self.expected_import_bytes = expected_import_bytes;
        self.elem_size = elem;
        self.posted = true;
        self.last_round_bytes_send = bytes_send;
        self.last_round_bytes_recv = bytes_recv;
        Ok(())
    }

    /// Complete the batch: wait for every receive and send, check message
    /// sizes, and place received blocks (and the self message) into `imports`.
    pub fn do_waits<T: Pod>(&mut self, imports: &mut [T]) -> Result<(), DistributorError> {
        if !self.posted {
            return Err(DistributorError::WaitWithoutPost);
        }
        if size_of::<T>() != self.elem_size {
            return Err(DistributorError::ElementSizeMismatch {
                posted: self.elem_size,
                waited: size_of::<T>(),
            });
        }
        let bytes = cast_slice_mut(imports);
        if bytes.len() < self.expected_import_bytes {
            return Err(DistributorError::BufferTooSmall {
                what: "imports",
                needed: self.expected_import_bytes / self.elem_size.max(1),
                got: bytes.len() / self.elem_size.max(1),
            });
        }
        self.posted = false;

        // drain every handle, then report the first problem
        let mut maybe_err = None;
        for recv in std::mem::take(&mut self.recvs) {
            let PendingRecv {
                peer,
                handle,
                byte_offset,
                byte_len,
            } = recv;
            match handle.wait() {
                Some(data) => match expect_exact_len(data.len(), byte_len) {
                    Ok(()) => bytes[byte_offset..byte_offset + byte_len].copy_from_slice(&data),
                    Err(detail) if maybe_err.is_none() => {
                        maybe_err = Some(DistributorError::MessageSize { peer, detail });
                    }
                    Err(_) => {}
                },
                None if maybe_err.is_none() => {
                    maybe_err = Some(DistributorError::MessageSize {
                        peer,
                        detail: "message never arrived".into(),
                    });
                }
                None => {}
            }
        }
        for s in std::mem::take(&mut self.sends) {
            let _ = s.wait();
        }
        if let Some((offset, data)) = self.self_copy.take() {
            bytes[offset..offset + data.len()].copy_from_slice(&data);
        }
        match maybe_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Bytes of send block `g`, items in packing order.
fn pack_block<T: Pod>(
    plan: &DistributorPlan,
    g: usize,
    exports: &[T],
    offsets: &Offsets,
) -> Vec<u8> {
    if plan.indices_to().is_none() {
        let span = offsets.span(plan.starts_to()[g], plan.lengths_to()[g]);
        return cast_slice(&exports[span]).to_vec();
    }
    let mut out = Vec::new();
    for item in plan.block_items(g) {
        out.extend_from_slice(cast_slice(&exports[offsets.item(item)]));
    }
    out
}
