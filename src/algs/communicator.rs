//! Thin façade over intra-process (thread group) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! All handles are **waitable**; the distributor calls `.wait()` before it
//! trusts that a receive buffer is ready.
//!
//! The trait is deliberately narrow: non-blocking send/receive, the blocking
//! send flavours, a barrier and an all-to-all of one `u64` count per peer.
//! The collectives have default implementations built from point-to-point
//! messages, so a new transport only has to supply `isend`/`irecv`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::algs::wire::{WireCount, cast_slice};

/// Typed message tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommTag(pub u16);

impl CommTag {
    #[inline]
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
    /// Tag `delta` steps after this one.
    #[inline]
    pub const fn offset(self, delta: u16) -> Self {
        Self(self.0.wrapping_add(delta))
    }
}

/// Tags at or above this value are reserved for the default collectives.
pub const RESERVED_TAG_FLOOR: u16 = 0xFF00;
const BARRIER_TAG: CommTag = CommTag::new(RESERVED_TAG_FLOOR);
const ALL_TO_ALL_TAG: CommTag = CommTag::new(RESERVED_TAG_FLOOR + 1);

/// Transport-level failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommError {
    /// A ready send found no matching receive posted on the peer.
    #[error("ready send to rank {peer} (tag {tag:#06x}) found no posted receive")]
    ReadySendUnmatched { peer: usize, tag: u16 },
    /// A receive completed without delivering a message.
    #[error("receive from rank {peer} (tag {tag:#06x}) completed without data")]
    MissingMessage { peer: usize, tag: u16 },
    /// A collective received a payload of the wrong size.
    #[error("collective `{op}` expected {expected} bytes from rank {peer}, got {got}")]
    CollectiveSize {
        op: &'static str,
        peer: usize,
        expected: usize,
        got: usize,
    },
    /// A collective was called with one entry per peer missing or extra.
    #[error("collective `{op}` needs one entry per process ({expected}), got {got}")]
    CollectiveLength {
        op: &'static str,
        expected: usize,
        got: usize,
    },
    /// Backend initialization failed.
    #[error("communicator initialization failed: {0}")]
    Init(String),
}

/// Non-blocking communication interface (minimal by design).
pub trait Communicator {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Rank of this process in the group.
    fn rank(&self) -> usize;
    /// Number of processes in the group.
    fn size(&self) -> usize;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive of at most `buf.len()` bytes. The data is returned by
    /// [`Wait::wait`] on the handle.
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// Blocking standard-mode send.
    fn send(&self, peer: usize, tag: u16, buf: &[u8]) -> Result<(), CommError> {
        let _ = self.isend(peer, tag, buf).wait();
        Ok(())
    }

    /// Blocking ready-mode send. Only valid when the matching receive has
    /// already been posted on `peer`.
    fn ready_send(&self, peer: usize, tag: u16, buf: &[u8]) -> Result<(), CommError> {
        self.send(peer, tag, buf)
    }

    /// Blocking synchronous-mode send: returns once the receive has matched.
    fn synchronous_send(&self, peer: usize, tag: u16, buf: &[u8]) -> Result<(), CommError> {
        self.send(peer, tag, buf)
    }

    /// Block until every process in the group has entered the barrier.
    fn barrier(&self) -> Result<(), CommError> {
        let zeros = vec![0u64; self.size()];
        all_to_all_p2p(self, BARRIER_TAG, "barrier", &zeros).map(|_| ())
    }

    /// Send `counts[p]` to every process `p`; return the count each process
    /// sent to this one.
    fn all_to_all_counts(&self, counts: &[u64]) -> Result<Vec<u64>, CommError> {
        all_to_all_p2p(self, ALL_TO_ALL_TAG, "all_to_all_counts", counts)
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// All-to-all of one count per peer, built from `isend`/`irecv`.
///
/// Every receive is posted before any send, and every handle is drained
/// before returning, even on error.
pub fn all_to_all_p2p<C>(
    comm: &C,
    tag: CommTag,
    op: &'static str,
    counts: &[u64],
) -> Result<Vec<u64>, CommError>
where
    C: Communicator + ?Sized,
{
    let me = comm.rank();
    let n = comm.size();
    if counts.len() != n {
        return Err(CommError::CollectiveLength {
            op,
            expected: n,
            got: counts.len(),
        });
    }
    let mut out = vec![0u64; n];
    out[me] = counts[me];

    let width = std::mem::size_of::<WireCount>();
    let mut recvs = Vec::with_capacity(n.saturating_sub(1));
    for peer in (0..n).filter(|&p| p != me) {
        let mut buf = vec![0u8; width];
        recvs.push((peer, comm.irecv(peer, tag.as_u16(), &mut buf)));
    }
    let mut sends = Vec::with_capacity(n.saturating_sub(1));
    for peer in (0..n).filter(|&p| p != me) {
        let wire = [WireCount::new(counts[peer])];
        sends.push(comm.isend(peer, tag.as_u16(), cast_slice(&wire)));
    }

    let mut maybe_err = None;
    for (peer, h) in recvs {
        match h.wait() {
            Some(data) if data.len() == width => {
                out[peer] = WireCount::decode(&data).get();
            }
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(CommError::CollectiveSize {
                    op,
                    peer,
                    expected: width,
                    got: data.len(),
                });
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(CommError::MissingMessage {
                    peer,
                    tag: tag.as_u16(),
                });
            }
            _ => {}
        }
    }
    for s in sends {
        let _ = s.wait();
    }
    match maybe_err {
        Some(err) => Err(err),
        None => Ok(out),
    }
}

/// Compile-time no-op comm for pure serial use: a group of one.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) -> Self::SendHandle {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) -> Self::RecvHandle {}
}

// --- LocalComm: intra-process / one thread per rank ---

type Key = (usize, usize, u16); // (src, dst, tag)
type Slot = u64;

/// An unmatched message and, for synchronous sends, the slot to acknowledge.
struct Parked {
    data: Bytes,
    ack: Option<Slot>,
}

#[derive(Default)]
struct Mailbox {
    /// Messages that arrived before a receive was posted, FIFO per key.
    unexpected: HashMap<Key, VecDeque<Parked>>,
    /// Receives posted before their message arrived, FIFO per key.
    posted: HashMap<Key, VecDeque<Slot>>,
    /// Matched messages waiting to be collected by `wait`.
    delivered: HashMap<Slot, Bytes>,
    /// Synchronous sends whose message has been matched.
    acked: HashSet<Slot>,
    next_slot: Slot,
}

impl Mailbox {
    fn slot(&mut self) -> Slot {
        self.next_slot += 1;
        self.next_slot
    }
}

struct Shared {
    size: usize,
    mailbox: Mutex<Mailbox>,
    changed: Condvar,
    transport_calls: AtomicUsize,
}

/// In-process communicator: one handle per simulated rank, all sharing one
/// mailbox. Matching follows MPI's non-overtaking rule per `(src, dst, tag)`.
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("size", &self.shared.size)
            .finish()
    }
}

impl LocalComm {
    /// Create a group of `size` communicators, one per rank.
    pub fn group(size: usize) -> Vec<LocalComm> {
        let shared = Arc::new(Shared {
            size,
            mailbox: Mutex::new(Mailbox::default()),
            changed: Condvar::new(),
            transport_calls: AtomicUsize::new(0),
        });
        (0..size)
            .map(|rank| LocalComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// Number of point-to-point operations posted by any rank of the group.
    pub fn transport_calls(&self) -> usize {
        self.shared.transport_calls.load(Ordering::Relaxed)
    }

    /// Deliver `buf` to a posted receive, or park it. Returns the slot to
    /// wait on when `want_ack` is set and the message was parked.
    fn deposit(&self, peer: usize, tag: u16, buf: &[u8], want_ack: bool) -> Option<Slot> {
        self.shared.transport_calls.fetch_add(1, Ordering::Relaxed);
        let key = (self.rank, peer, tag);
        let data = Bytes::copy_from_slice(buf);
        let mut mb = self.shared.mailbox.lock();
        let matched = mb.posted.get_mut(&key).and_then(|q| q.pop_front());
        let pending_ack = match matched {
            Some(slot) => {
                mb.delivered.insert(slot, data);
                None
            }
            None => {
                let ack = want_ack.then(|| mb.slot());
                mb.unexpected
                    .entry(key)
                    .or_default()
                    .push_back(Parked { data, ack });
                ack
            }
        };
        drop(mb);
        self.shared.changed.notify_all();
        pending_ack
    }
}

/// Receive handle of [`LocalComm`]. Yields the whole message, never
/// truncated to the posted buffer.
pub struct LocalHandle {
    shared: Arc<Shared>,
    slot: Slot,
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let mut mb = self.shared.mailbox.lock();
        loop {
            if let Some(bytes) = mb.delivered.remove(&self.slot) {
                return Some(bytes.to_vec());
            }
            self.shared.changed.wait(&mut mb);
        }
    }
}

impl Communicator for LocalComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        self.deposit(peer, tag, buf, false);
    }

    fn irecv(&self, peer: usize, tag: u16, _buf: &mut [u8]) -> Self::RecvHandle {
        self.shared.transport_calls.fetch_add(1, Ordering::Relaxed);
        let key = (peer, self.rank, tag);
        let mut mb = self.shared.mailbox.lock();
        let slot = mb.slot();
        let parked = mb.unexpected.get_mut(&key).and_then(|q| q.pop_front());
        match parked {
            Some(Parked { data, ack }) => {
                mb.delivered.insert(slot, data);
                if let Some(ack) = ack {
                    mb.acked.insert(ack);
                    drop(mb);
                    self.shared.changed.notify_all();
                }
            }
            None => mb.posted.entry(key).or_default().push_back(slot),
        }
        LocalHandle {
            shared: Arc::clone(&self.shared),
            slot,
        }
    }

    fn ready_send(&self, peer: usize, tag: u16, buf: &[u8]) -> Result<(), CommError> {
        let key = (self.rank, peer, tag);
        let has_receiver = {
            let mb = self.shared.mailbox.lock();
            mb.posted.get(&key).is_some_and(|q| !q.is_empty())
        };
        if !has_receiver {
            return Err(CommError::ReadySendUnmatched { peer, tag });
        }
        self.deposit(peer, tag, buf, false);
        Ok(())
    }

    fn synchronous_send(&self, peer: usize, tag: u16, buf: &[u8]) -> Result<(), CommError> {
        if let Some(ack) = self.deposit(peer, tag, buf, true) {
            let mut mb = self.shared.mailbox.lock();
            while !mb.acked.remove(&ack) {
                self.shared.changed.wait(&mut mb);
            }
        }
        Ok(())
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::{CommError, Communicator, Wait};
    use mpi::datatype::Equivalence;
    use mpi::environment::Universe;
    use mpi::request::{Request, StaticScope};
    use mpi::topology::{Communicator as _, SimpleCommunicator};
    use mpi::traits::{CommunicatorCollectives, Destination, Source};

    /// World communicator of an initialized MPI environment.
    pub struct MpiComm {
        pub world: SimpleCommunicator,
        pub rank: usize,
        size: usize,
        // dropped after `world`; finalizes MPI
        _universe: Universe,
    }

    impl MpiComm {
        pub fn new() -> Result<Self, CommError> {
            let universe = mpi::initialize()
                .ok_or_else(|| CommError::Init("MPI was already initialized".into()))?;
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Ok(Self {
                world,
                rank,
                size,
                _universe: universe,
            })
        }
    }

    /// Leak `data` for the lifetime of a request; reclaimed in `finish`.
    fn leak(data: Box<[u8]>) -> *mut [u8] {
        Box::into_raw(data)
    }

    pub struct MpiSendHandle {
        req: Option<Request<'static, [u8], StaticScope>>,
        buf: *mut [u8],
    }

    impl MpiSendHandle {
        fn finish(&mut self) {
            if let Some(req) = self.req.take() {
                req.wait();
                // SAFETY: `buf` came from `leak` and the request that borrowed it has completed.
                drop(unsafe { Box::from_raw(self.buf) });
            }
        }
    }

    impl Wait for MpiSendHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            self.finish();
            None
        }
    }

    impl Drop for MpiSendHandle {
        fn drop(&mut self) {
            self.finish();
        }
    }

    pub struct MpiRecvHandle {
        req: Option<Request<'static, [u8], StaticScope>>,
        buf: *mut [u8],
    }

    impl MpiRecvHandle {
        fn finish(&mut self) -> Option<Vec<u8>> {
            let req = self.req.take()?;
            let status = req.wait();
            let got = status.count(u8::equivalent_datatype()).max(0) as usize;
            // SAFETY: `buf` came from `leak` and the request that borrowed it has completed.
            let mut data = unsafe { Box::from_raw(self.buf) }.into_vec();
            data.truncate(got);
            Some(data)
        }
    }

    impl Wait for MpiRecvHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            self.finish()
        }
    }

    impl Drop for MpiRecvHandle {
        fn drop(&mut self) {
            let _ = self.finish();
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSendHandle {
            let raw = leak(buf.to_vec().into_boxed_slice());
            // SAFETY: the allocation outlives the request; see `finish`.
            let data: &'static [u8] = unsafe { &*raw };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, data, tag as i32);
            MpiSendHandle {
                req: Some(req),
                buf: raw,
            }
        }

        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MpiRecvHandle {
            let raw = leak(vec![0u8; buf.len()].into_boxed_slice());
            // SAFETY: the allocation outlives the request; see `finish`.
            let data: &'static mut [u8] = unsafe { &mut *raw };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(StaticScope, data, tag as i32);
            MpiRecvHandle {
                req: Some(req),
                buf: raw,
            }
        }

        fn send(&self, peer: usize, tag: u16, buf: &[u8]) -> Result<(), CommError> {
            self.world
                .process_at_rank(peer as i32)
                .send_with_tag(buf, tag as i32);
            Ok(())
        }

        fn ready_send(&self, peer: usize, tag: u16, buf: &[u8]) -> Result<(), CommError> {
            self.world
                .process_at_rank(peer as i32)
                .ready_send_with_tag(buf, tag as i32);
            Ok(())
        }

        fn synchronous_send(&self, peer: usize, tag: u16, buf: &[u8]) -> Result<(), CommError> {
            self.world
                .process_at_rank(peer as i32)
                .synchronous_send_with_tag(buf, tag as i32);
            Ok(())
        }

        fn barrier(&self) -> Result<(), CommError> {
            self.world.barrier();
            Ok(())
        }

        fn all_to_all_counts(&self, counts: &[u64]) -> Result<Vec<u64>, CommError> {
            if counts.len() != self.size {
                return Err(CommError::CollectiveLength {
                    op: "all_to_all_counts",
                    expected: self.size,
                    got: counts.len(),
                });
            }
            let mut out = vec![0u64; self.size];
            self.world.all_to_all_into(counts, &mut out[..]);
            Ok(out)
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::{MpiComm, MpiRecvHandle, MpiSendHandle};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_roundtrip_two_ranks() {
        let comms = LocalComm::group(2);
        let (c0, c1) = (&comms[0], &comms[1]);

        // Post the receive on "rank 1" before rank 0 sends.
        let mut recv_buf = [0u8; 4];
        let h = c1.irecv(0, 7, &mut recv_buf);
        c0.isend(1, 7, &[1, 2, 3, 4]).wait();

        let data = h.wait().expect("Expected to receive data from rank 0");
        recv_buf.copy_from_slice(&data);
        assert_eq!(&recv_buf, &[1, 2, 3, 4]);
    }

    #[test]
    fn send_before_receive_is_parked() {
        let comms = LocalComm::group(2);
        comms[0].isend(1, 3, b"abc");
        let mut buf = [0u8; 3];
        let got = comms[1].irecv(0, 3, &mut buf).wait().unwrap();
        assert_eq!(got, b"abc");
        assert_eq!(comms[0].transport_calls(), 2);
    }

    #[test]
    fn ready_send_requires_posted_receive() {
        let comms = LocalComm::group(2);
        let err = comms[0].ready_send(1, 11, &[9]).unwrap_err();
        assert_eq!(err, CommError::ReadySendUnmatched { peer: 1, tag: 11 });

        let mut buf = [0u8; 1];
        let h = comms[1].irecv(0, 11, &mut buf);
        comms[0].ready_send(1, 11, &[9]).unwrap();
        assert_eq!(h.wait().unwrap(), vec![9]);
    }

    #[test]
    fn no_comm_collectives_stay_local() {
        let comm = NoComm;
        assert_eq!(comm.all_to_all_counts(&[5]).unwrap(), vec![5]);
        comm.barrier().unwrap();
        assert!(matches!(
            comm.all_to_all_counts(&[1, 2]),
            Err(CommError::CollectiveLength { expected: 1, got: 2, .. })
        ));
    }

    #[test]
    fn comm_tag_offsets() {
        let t = CommTag::new(0x0D00);
        assert_eq!(t.offset(3).as_u16(), 0x0D03);
        assert_eq!(CommTag::new(u16::MAX).offset(1).as_u16(), 0);
    }
}
