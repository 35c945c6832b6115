//! Forwarder core library: crash-safe relaying of Telegram channel posts to configured targets,
//! with an idempotent delivery ledger and checkpointed ingestion in SQLite.

pub mod channels;
pub mod config;
pub mod delivery;
pub mod error;
pub mod forwarder;
pub mod init;
pub mod ledger;
pub mod listener;
pub mod lock;
pub mod routing;
pub mod store;

pub use error::{Error, Result};
