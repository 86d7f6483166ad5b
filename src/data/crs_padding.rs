//! Per-row padding tracker for merging foreign column ids into a sparse graph.
//!
//! While a target graph receives rows from a source (same, permuted, and
//! imported rows), [`CrsPadding`] remembers, per target row, the sorted set of
//! incoming column ids that the target row does not already hold. The caller
//! later asks how many extra entries each row needs.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::AddAssign;

use itertools::{EitherOrBoth, Itertools};

use crate::debug_invariants::DebugInvariants;
use crate::distributor::params::DEFAULT_PRINT_THRESHOLD;
use crate::distributor_error::DistributorError;

/// Rows at least this long are sorted in parallel with the `rayon` feature.
#[cfg(feature = "rayon")]
const PAR_SORT_THRESHOLD: usize = 4096;

/// Which kind of source row an update came from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MergePhase {
    /// Row with the same local index on source and target.
    Same,
    /// Row moved to a different local index on this process.
    Permute,
    /// Row received from another process.
    Import,
}

impl fmt::Display for MergePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MergePhase::Same => "same",
            MergePhase::Permute => "permute",
            MergePhase::Import => "import",
        })
    }
}

/// Duplicates found by one or more updates.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DupCounts {
    /// Entries removed from target lists by deduplication.
    pub tgt: usize,
    /// Entries removed from source lists by deduplication.
    pub src: usize,
    /// Entries present in both the target and the source list.
    pub union: usize,
}

impl AddAssign for DupCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.tgt += rhs.tgt;
        self.src += rhs.src;
        self.union += rhs.union;
    }
}

/// Answer for one target row.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PaddingResult {
    /// Number of source ids the row must make room for.
    pub num_in_src_not_in_tgt: usize,
    /// Whether any update touched the row.
    pub found: bool,
}

/// Accumulates, per target row, the foreign column ids not yet in that row.
///
/// Each stored list is sorted and free of duplicates, and holds no id that
/// was in the target row at the last update of that row.
#[derive(Clone, Debug)]
pub struct CrsPadding<L, G> {
    my_rank: usize,
    verbose: bool,
    print_threshold: usize,
    entries: BTreeMap<L, Vec<G>>,
    scratch: Vec<G>,
}

impl<L, G> CrsPadding<L, G>
where
    L: Ord + Copy + fmt::Debug,
    G: Ord + Copy + fmt::Debug + Send,
{
    /// An empty tracker for process `my_rank`.
    pub fn new(my_rank: usize) -> Self {
        Self {
            my_rank,
            verbose: false,
            print_threshold: DEFAULT_PRINT_THRESHOLD,
            entries: BTreeMap::new(),
            scratch: Vec::new(),
        }
    }

    /// Trace every update through `log`.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Max number of rows (and ids per row) shown by `Display`.
    pub fn with_print_threshold(mut self, threshold: usize) -> Self {
        self.print_threshold = threshold;
        self
    }

    /// Merge a row that keeps its local index.
    pub fn update_same(
        &mut self,
        target_local_row: L,
        tgt_ids: &mut Vec<G>,
        tgt_is_unique: bool,
        src_ids: &mut Vec<G>,
        src_is_unique: bool,
    ) -> DupCounts {
        self.update(
            MergePhase::Same,
            None,
            target_local_row,
            tgt_ids,
            tgt_is_unique,
            src_ids,
            src_is_unique,
        )
    }

    /// Merge a permuted row; `which` is its index in the permutation lists.
    pub fn update_permute(
        &mut self,
        which: usize,
        target_local_row: L,
        tgt_ids: &mut Vec<G>,
        tgt_is_unique: bool,
        src_ids: &mut Vec<G>,
        src_is_unique: bool,
    ) -> DupCounts {
        self.update(
            MergePhase::Permute,
            Some(which),
            target_local_row,
            tgt_ids,
            tgt_is_unique,
            src_ids,
            src_is_unique,
        )
    }

    /// Merge an imported row; `which` is its index in the import list.
    pub fn update_import(
        &mut self,
        which: usize,
        target_local_row: L,
        tgt_ids: &mut Vec<G>,
        tgt_is_unique: bool,
        src_ids: &mut Vec<G>,
        src_is_unique: bool,
    ) -> DupCounts {
        self.update(
            MergePhase::Import,
            Some(which),
            target_local_row,
            tgt_ids,
            tgt_is_unique,
            src_ids,
            src_is_unique,
        )
    }

    /// Sort (and unless flagged unique, deduplicate) both id lists in place,
    /// then fold the source ids missing from the target into the row's state.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        phase: MergePhase,
        which: Option<usize>,
        target_local_row: L,
        tgt_ids: &mut Vec<G>,
        tgt_is_unique: bool,
        src_ids: &mut Vec<G>,
        src_is_unique: bool,
    ) -> DupCounts {
        let tgt_dups = sort_and_dedup(tgt_ids, tgt_is_unique);
        let src_dups = sort_and_dedup(src_ids, src_is_unique);
        let in_common = count_in_common(tgt_ids, src_ids);
        if self.verbose {
            log::trace!(
                "Proc {}: CrsPadding::update: phase={phase}, which={which:?}, row={target_local_row:?}, \
                 num_tgt={}, num_src={}, tgt_dups={tgt_dups}, src_dups={src_dups}, in_common={in_common}",
                self.my_rank,
                tgt_ids.len(),
                src_ids.len(),
            );
        }
        self.merge_with_current_state(target_local_row, tgt_ids, src_ids);
        DupCounts {
            tgt: tgt_dups,
            src: src_dups,
            union: in_common,
        }
    }

    /// How many ids row `target_local_row` must make room for.
    pub fn get_result(&self, target_local_row: L) -> PaddingResult {
        match self.entries.get(&target_local_row) {
            Some(ids) => PaddingResult {
                num_in_src_not_in_tgt: ids.len(),
                found: true,
            },
            None => PaddingResult::default(),
        }
    }

    /// Rows touched so far.
    pub fn num_rows(&self) -> usize {
        self.entries.len()
    }

    /// Rows and their pending ids, in row order.
    pub fn iter(&self) -> impl Iterator<Item = (&L, &[G])> + '_ {
        self.entries.iter().map(|(row, ids)| (row, ids.as_slice()))
    }

    /// Finish tracking and hand over the per-row ids.
    pub fn into_increments(self) -> BTreeMap<L, Vec<G>> {
        self.entries
    }

    /// `tgt` and `src` are sorted and unique.
    fn merge_with_current_state(&mut self, row: L, tgt: &[G], src: &[G]) {
        let prev = self.entries.entry(row).or_default();
        if prev.is_empty() {
            prev.extend(difference(src, tgt));
            return;
        }
        // (src ∪ prev) \ tgt, staged in the scratch buffer
        self.scratch.clear();
        self.scratch.extend(
            src.iter()
                .merge_join_by(prev.iter(), |a, b| a.cmp(b))
                .map(|e| match e {
                    EitherOrBoth::Both(a, _) | EitherOrBoth::Left(a) | EitherOrBoth::Right(a) => *a,
                }),
        );
        prev.clear();
        prev.extend(difference(&self.scratch, tgt));
    }
}

impl<L, G> fmt::Display for CrsPadding<L, G>
where
    L: fmt::Display,
    G: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let limit = self.print_threshold;
        write!(f, "Proc {}: entries: [", self.my_rank)?;
        for (k, (row, ids)) in self.entries.iter().enumerate() {
            if k >= limit {
                f.write_str(", ...")?;
                break;
            }
            if k > 0 {
                f.write_str(", ")?;
            }
            write!(f, "({row}, [")?;
            for (i, id) in ids.iter().take(limit).enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{id}")?;
            }
            if ids.len() > limit {
                f.write_str(", ...")?;
            }
            f.write_str("])")?;
        }
        f.write_str("]")
    }
}

impl<L, G> DebugInvariants for CrsPadding<L, G>
where
    L: Ord + Copy + fmt::Debug,
    G: Ord + Copy + fmt::Debug,
{
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "CrsPadding");
    }

    fn validate_invariants(&self) -> Result<(), DistributorError> {
        for (row, ids) in &self.entries {
            if let Some(w) = ids.windows(2).find(|w| w[0] >= w[1]) {
                return Err(DistributorError::InvariantViolation(format!(
                    "row {row:?}: ids not strictly ascending at {:?}, {:?}",
                    w[0], w[1]
                )));
            }
        }
        Ok(())
    }
}

/// Sort `ids`, drop duplicates unless `is_unique`, and return how many went.
fn sort_and_dedup<G: Ord + Copy + Send>(ids: &mut Vec<G>, is_unique: bool) -> usize {
    #[cfg(feature = "rayon")]
    {
        use rayon::slice::ParallelSliceMut;
        if ids.len() >= PAR_SORT_THRESHOLD {
            ids.par_sort_unstable();
        } else {
            ids.sort_unstable();
        }
    }
    #[cfg(not(feature = "rayon"))]
    ids.sort_unstable();

    if is_unique {
        return 0;
    }
    let before = ids.len();
    ids.dedup();
    before - ids.len()
}

/// Entries of sorted, unique `a` that also appear in sorted, unique `b`.
fn count_in_common<G: Ord>(a: &[G], b: &[G]) -> usize {
    let (mut i, mut j, mut n) = (0, 0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                n += 1;
                i += 1;
                j += 1;
            }
        }
    }
    n
}

/// Sorted `a \ b` for sorted, unique inputs.
fn difference<'a, G: Ord + Copy>(a: &'a [G], b: &'a [G]) -> impl Iterator<Item = G> + 'a {
    a.iter()
        .merge_join_by(b.iter(), |x, y| x.cmp(y))
        .filter_map(|e| match e {
            EitherOrBoth::Left(x) => Some(*x),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_only_new_foreign_ids() {
        let mut pad = CrsPadding::<u32, u64>::new(0);
        let mut tgt = vec![9, 2, 5];
        let mut src = vec![5, 9, 12, 2];
        let dups = pad.update_same(3, &mut tgt, true, &mut src, true);
        assert_eq!(dups, DupCounts { tgt: 0, src: 0, union: 3 });
        assert_eq!(tgt, vec![2, 5, 9]);
        assert_eq!(
            pad.get_result(3),
            PaddingResult {
                num_in_src_not_in_tgt: 1,
                found: true
            }
        );
        assert_eq!(pad.into_increments()[&3], vec![12]);
    }

    #[test]
    fn duplicates_are_counted_per_list() {
        let mut pad = CrsPadding::<u32, u64>::new(1);
        let mut tgt = vec![1, 1, 4];
        let mut src = vec![7, 4, 7, 7];
        let dups = pad.update_import(0, 0, &mut tgt, false, &mut src, false);
        assert_eq!(dups, DupCounts { tgt: 1, src: 2, union: 1 });
        assert_eq!(src, vec![4, 7]);
        assert_eq!(pad.get_result(0).num_in_src_not_in_tgt, 1);
    }

    #[test]
    fn prior_state_is_unioned_and_pruned() {
        let mut pad = CrsPadding::<u32, u64>::new(0);
        pad.update_same(0, &mut vec![1], true, &mut vec![2, 3], true);
        pad.update_permute(0, 0, &mut vec![1], true, &mut vec![3, 4], true);
        assert_eq!(pad.iter().next().map(|(_, ids)| ids.to_vec()), Some(vec![2, 3, 4]));
        // the target row has since grown to hold 3
        pad.update_import(0, 0, &mut vec![1, 3], true, &mut vec![1], true);
        assert_eq!(pad.get_result(0).num_in_src_not_in_tgt, 2);
        pad.validate_invariants().unwrap();
    }

    #[test]
    fn untouched_rows_are_not_found() {
        let mut pad = CrsPadding::<u32, u64>::new(0);
        assert_eq!(pad.get_result(5), PaddingResult::default());
        pad.update_same(5, &mut vec![1, 2], true, &mut vec![2], true);
        assert_eq!(
            pad.get_result(5),
            PaddingResult {
                num_in_src_not_in_tgt: 0,
                found: true
            }
        );
    }

    #[test]
    fn display_respects_threshold() {
        let mut pad = CrsPadding::<u32, u64>::new(2).with_print_threshold(1);
        pad.update_same(0, &mut vec![], true, &mut vec![5, 6], true);
        pad.update_same(1, &mut vec![], true, &mut vec![7], true);
        assert_eq!(pad.to_string(), "Proc 2: entries: [(0, [5, ...]), ...]");
    }
}
