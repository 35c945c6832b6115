//! The forwarder: orchestration of ingestion and delivery, checkpoint tracking, process wiring
//! and the status endpoint.

mod checkpoint;
mod orchestrator;
mod service;
pub mod status;

pub use checkpoint::CheckpointTracker;
pub use orchestrator::{Forwarder, ForwarderOptions, RunSummary};
pub use service::run_forwarder;
