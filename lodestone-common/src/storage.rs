//! Storage collaborator interface.
//!
//! The indexed header store is an external collaborator from the sync
//! core's point of view: durable on successful append and internally
//! consistent. Only the interface the core needs is defined here.

use async_trait::async_trait;
#[cfg(feature = "test-utils")]
use mockall::automock;
use thiserror::Error;

use crate::models::{BlockRange, HeaderRecord, Height};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("header at height {0} not found")]
    NotFound(Height),
    #[error("invalid append to {range}: {reason}")]
    InvalidAppend { range: BlockRange, reason: String },
    #[error("storage io error: {0}")]
    Io(String),
    #[error("corrupt journal: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Gateway to the indexed header store.
#[cfg_attr(feature = "test-utils", automock)]
#[async_trait]
pub trait HeaderGateway: Send + Sync {
    /// Highest height up to which the local index is contiguous from
    /// genesis, or `None` for an empty store. Records committed above a gap
    /// do not advance this.
    async fn current_height(&self) -> Result<Option<Height>, StorageError>;

    /// Durably writes `records`, which must exactly cover the half-open
    /// `range` in ascending height order and chain internally. On `Ok` the
    /// records have reached durable storage. Re-appending an already stored
    /// range is idempotent.
    async fn append_range(
        &self,
        range: BlockRange,
        records: Vec<HeaderRecord>,
    ) -> Result<(), StorageError>;

    /// The stored header at `height`.
    async fn header_at(&self, height: Height) -> Result<HeaderRecord, StorageError>;
}
