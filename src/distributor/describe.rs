//! Human-readable descriptions of plans and distributors.

use std::fmt::{self, Write};

use crate::distributor::plan::DistributorPlan;

/// How much [`DistributorPlan::describe`] prints.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Verbosity {
    /// Nothing.
    None,
    /// One line: how the plan was built and its parameters.
    #[default]
    Low,
    /// Adds the per-process message counts.
    Medium,
    /// Adds the peer lists and lengths.
    High,
    /// Adds the buffer offsets and the packing permutation.
    Extreme,
}

impl DistributorPlan {
    /// One-line summary, as used by `Display`.
    pub fn description(&self) -> String {
        let p = self.params();
        format!(
            "\"mesh_distributor::Distributor\": {{How initialized: {}, Parameters: {{Send type: {}, \
             Barrier between receives and sends: {}, Use distinct tags: {}, Debug: {}}}}}",
            self.how_initialized(),
            p.send_type,
            p.barrier_between_recv_send(),
            p.use_distinct_tags,
            p.debug
        )
    }

    /// Multi-line description of this process's view of the plan.
    pub fn describe(&self, verbosity: Verbosity) -> String {
        let mut out = String::new();
        if verbosity == Verbosity::None {
            return out;
        }
        let _ = writeln!(out, "{}", self.description());
        if verbosity < Verbosity::Medium {
            return out;
        }
        let limit = self.params().print_threshold;
        let _ = writeln!(out, "  Process {} of {}:", self.rank(), self.num_procs());
        let _ = writeln!(out, "    numSends: {}", self.num_sends());
        let _ = writeln!(out, "    numReceives: {}", self.num_receives());
        let _ = writeln!(out, "    sendMessageToSelf: {}", self.send_message_to_self());
        let _ = writeln!(out, "    maxSendLength: {}", self.max_send_length());
        let _ = writeln!(out, "    totalReceiveLength: {}", self.total_receive_length());
        if verbosity >= Verbosity::High {
            let _ = writeln!(out, "    procsTo: {}", Bounded(self.procs_to(), limit));
            let _ = writeln!(out, "    lengthsTo: {}", Bounded(self.lengths_to(), limit));
            let _ = writeln!(out, "    procsFrom: {}", Bounded(self.procs_from(), limit));
            let _ = writeln!(out, "    lengthsFrom: {}", Bounded(self.lengths_from(), limit));
        }
        if verbosity >= Verbosity::Extreme {
            let _ = writeln!(out, "    startsTo: {}", Bounded(self.starts_to(), limit));
            match self.indices_to() {
                Some(indices) => {
                    let _ = writeln!(out, "    indicesTo: {}", Bounded(indices, limit));
                }
                None => {
                    let _ = writeln!(out, "    indicesTo: (contiguous)");
                }
            }
            let _ = writeln!(out, "    startsFrom: {}", Bounded(self.starts_from(), limit));
        }
        out
    }
}

impl fmt::Display for DistributorPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// A list printed up to a threshold.
pub(crate) struct Bounded<'a, T>(pub &'a [T], pub usize);

impl<T: fmt::Display> fmt::Display for Bounded<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Bounded(items, limit) = *self;
        f.write_str("[")?;
        for (i, item) in items.iter().take(limit).enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{item}")?;
        }
        if items.len() > limit {
            write!(f, ", ... ({} more)", items.len() - limit)?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::distributor::params::DistributorParams;

    #[test]
    fn verbosity_levels_add_detail() {
        let mut plan = DistributorPlan::new(&NoComm, DistributorParams::default());
        assert!(plan.description().contains("Not initialized yet"));
        plan.create_from_sends(&NoComm, &[Some(0), Some(0)]).unwrap();
        assert!(plan.describe(Verbosity::None).is_empty());
        assert_eq!(plan.describe(Verbosity::Low).lines().count(), 1);
        let high = plan.describe(Verbosity::High);
        assert!(high.contains("lengthsTo: [2]"), "{high}");
        assert!(!high.contains("startsTo"));
        assert!(plan.describe(Verbosity::Extreme).contains("indicesTo: (contiguous)"));
        assert!(plan.to_string().contains("Send type: Send"));
    }

    #[test]
    fn bounded_lists_note_the_rest() {
        assert_eq!(Bounded(&[1, 2, 3][..], 2).to_string(), "[1, 2, ... (1 more)]");
        assert_eq!(Bounded::<u8>(&[], 2).to_string(), "[]");
    }
}
