//! Latency measurement primitives shared across pipeline stages.

pub mod histogram;

pub use histogram::LatencyHistogram;
