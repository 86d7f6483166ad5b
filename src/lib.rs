#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mesh-distributor
//!
//! mesh-distributor schedules irregular point-to-point communication for
//! redistributing data across a group of cooperating processes. Given the
//! destination process of every local item, it builds a communication plan
//! once and then moves any number of payloads along that plan, or back along
//! its reverse.
//!
//! ## Features
//! - Plans built from sends (with collective discovery of the receive side),
//!   from matching send and receive lists, or from requested remote ids
//! - Memoized reverse plans that return data to where it came from
//! - Immediate, standard, ready, and synchronous send modes, with an optional
//!   barrier between posting receives and sends
//! - Constant or variable numbers of packets per item
//! - A per-row tracker of foreign column ids for merging redistributed sparse rows
//! - Pluggable communication backends: serial, in-process thread groups, and MPI
//!
//! ## Usage
//! Add `mesh-distributor` as a dependency in your `Cargo.toml` and enable
//! features as needed:
//!
//! ```toml
//! [dependencies]
//! mesh-distributor = "0.3"
//! # Optional features:
//! # features = ["mpi-support", "rayon"]
//! ```
//!
//! ## Configuration
//! [`DistributorParams`](distributor::DistributorParams) is a plain struct
//! with builder methods and `serde` support. `DistributorParams::default()`
//! never reads the environment; call
//! [`DistributorParams::from_env`](distributor::DistributorParams::from_env)
//! to overlay the `MESH_DISTRIBUTOR_*` variables.
//!
//! ## Logging
//! Diagnostics go through the `log` facade. With `debug` set in the
//! parameters, plan construction and every post emit `debug` records
//! prefixed with the process rank.

pub mod algs;
pub mod data;
pub mod debug_invariants;
pub mod distributor;
pub mod distributor_error;

pub use debug_invariants::DebugInvariants;
pub use distributor_error::DistributorError;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{CommTag, Communicator, LocalComm, NoComm, Wait};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::data::crs_padding::{CrsPadding, DupCounts, PaddingResult};
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::distributor::{
        Distributor, DistributorParams, DistributorPlan, HowInitialized, SendType, Verbosity,
    };
    pub use crate::distributor_error::DistributorError;
}
