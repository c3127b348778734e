//! Real-time tick ingestion, cleaning, and anomaly/change-rate pipeline.
//!
//! Exposes the typed library interface the binary wires together;
//! CLI/HTTP surfaces are out of scope.

pub mod anomaly;
pub mod cache;
pub mod changerate;
pub mod cleaner;
pub mod config;
pub mod error;
pub mod models;
pub mod performance;
pub mod persistence;
pub mod receiver;
pub mod supervisor;
pub mod telemetry;
pub mod validator;
pub mod workerpool;

pub use config::ServiceConfig;
pub use error::TickstreamError;
pub use supervisor::Supervisor;
