//! Producer/consumer pipeline and program supervisor for the CDC relay.
//!
//! `producer` tails one sync key's source collections; `consumer` drains
//! that key's channel into its sink; `supervisor` wires the two together
//! per configured sync and owns their shared lifecycle.

pub mod consumer;
pub mod producer;
pub mod supervisor;

pub use consumer::Consumer;
pub use producer::Producer;
pub use supervisor::Supervisor;
