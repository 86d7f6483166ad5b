//! Data module: merge bookkeeping for redistributed sparse rows
#![warn(missing_docs)]

pub mod crs_padding;

pub use crs_padding::{CrsPadding, DupCounts, MergePhase, PaddingResult};
