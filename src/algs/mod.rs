//! Transport layer: communicators and wire records.

pub mod communicator;
pub mod wire;

pub use communicator::{CommTag, Communicator, LocalComm, NoComm, Wait};
