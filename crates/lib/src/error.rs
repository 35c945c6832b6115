//! Fatal error taxonomy for the forwarder.
//!
//! Delivery-level failures are not errors here: they are [`crate::delivery::DeliveryOutcome`]
//! values recorded in the ledger. Only conditions that stop the process live in [`Error`].

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The database could not be opened or written. The process must not continue without durability.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// Invalid target list, sources or credentials. Raised before ingestion starts.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Another forwarder holds the instance lock.
    #[error("another forwarder instance is running (lock held at {})", .0.display())]
    AlreadyRunning(PathBuf),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::StoreUnavailable(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
