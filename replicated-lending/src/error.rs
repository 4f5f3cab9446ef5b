use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by a storage engine.
///
/// Business rejections (unknown loan, no copies left, renewal cap) are not
/// errors: they come back as `false` / `None`. Only `Unavailable` triggers
/// failover.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage engine `{0}` is unavailable")]
    Unavailable(String),

    #[error("failed to persist {table} table to {path}")]
    Persist {
        table: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to load {table} table from {path}")]
    Load {
        table: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt {table} table at {path}")]
    Corrupt {
        table: &'static str,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot resynchronize `{0}` from itself")]
    SelfResync(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Admission and wait failures surfaced by the dispatcher.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    #[error("work queue is full")]
    QueueFull,
    #[error("timed out waiting for a worker result")]
    Timeout,
    #[error("dispatcher is shutting down")]
    Closed,
}
