//! Persistence boundary.
//!
//! Every record (sessions, phase results, archives, checkpoints, human-loop
//! requests) is a JSON value under a string key, with a store-level version
//! that starts at 1 and increments on every write. Any backend offering
//! atomic per-key writes and optimistic versioning can implement [`Store`].

mod memory;
mod sqlite;
mod state;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use state::{StateStore, Stored};

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::StoreError;

/// A stored value and its version.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub version: u64,
    pub value: Value,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Record>, StoreError>;

    /// Unconditional write. Returns the new version.
    async fn put(&self, key: &str, value: Value) -> Result<u64, StoreError>;

    /// Write only if the current version equals `expected` (`None` = the key
    /// must not exist yet). Returns the new version, or
    /// `StoreError::VersionConflict`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> Result<u64, StoreError>;

    /// All records whose key starts with `prefix`, ordered by key.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Record)>, StoreError>;
}
