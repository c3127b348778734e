//! Ambient performance instrumentation shared across pipeline stages.
//!
//! Keeps the low-level primitives (latency histograms, queue depth
//! tracking) the rest of the crate builds structured metrics on top of.

pub mod latency;
pub mod queues;

pub use latency::LatencyHistogram;
pub use queues::{global_queue_registry, QueueRegistry, QueueSnapshot, QueueWaitGuard};
