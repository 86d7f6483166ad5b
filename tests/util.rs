#![allow(dead_code)]
use mesh_distributor::algs::communicator::{CommError, Communicator, LocalComm};

/// Run `f` once per rank of a fresh in-process group, one thread per rank,
/// and collect the results in rank order.
pub fn run_ranks<R, F>(size: usize, f: F) -> Vec<R>
where
    F: Fn(LocalComm) -> R + Sync,
    R: Send,
{
    let comms = LocalComm::group(size);
    std::thread::scope(|s| {
        let f = &f;
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| s.spawn(move || f(comm)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

/// Payload value encoding the exporting rank and the export index.
pub fn tag_item(rank: usize, index: usize) -> u64 {
    ((rank as u64) << 32) | index as u64
}

pub fn untag_item(v: u64) -> (usize, usize) {
    ((v >> 32) as usize, (v & 0xFFFF_FFFF) as usize)
}

/// Deterministic scattered destinations, with every fifth item discarded.
pub fn scattered_dests(rank: usize, size: usize, n: usize) -> Vec<Option<usize>> {
    (0..n)
        .map(|i| (i % 5 != 4).then_some((rank * 7 + i * 3) % size))
        .collect()
}

/// Assert vec is a permutation of another vec (order-agnostic).
pub fn assert_permutation<T: Ord + Copy + std::fmt::Debug>(got: &[T], want: &[T]) {
    let mut a = got.to_vec();
    a.sort_unstable();
    let mut b = want.to_vec();
    b.sort_unstable();
    assert_eq!(a, b, "not a permutation\n got={:?}\nwant={:?}", got, want);
}

/// A communicator whose all-to-all over-reports what `from` sends to
/// `to` by one, so discovery and the length exchange disagree.
pub struct SkewedComm {
    pub inner: LocalComm,
    pub from: usize,
    pub to: usize,
}

impl Communicator for SkewedComm {
    type SendHandle = <LocalComm as Communicator>::SendHandle;
    type RecvHandle = <LocalComm as Communicator>::RecvHandle;

    fn rank(&self) -> usize {
        self.inner.rank()
    }
    fn size(&self) -> usize {
        self.inner.size()
    }
    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        self.inner.isend(peer, tag, buf)
    }
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle {
        self.inner.irecv(peer, tag, buf)
    }
    fn all_to_all_counts(&self, counts: &[u64]) -> Result<Vec<u64>, CommError> {
        let mut out = self.inner.all_to_all_counts(counts)?;
        if self.rank() == self.to && out[self.from] > 0 {
            out[self.from] += 1;
        }
        Ok(out)
    }
}
