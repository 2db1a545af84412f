use crate::error::Result;
use crate::parser::{Record, TableSchema};
use async_trait::async_trait;

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryStore, MemoryWatermarkStore};
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged)
    }
}

/// Insert-or-update by natural key for every registered table.
#[async_trait]
pub trait DomainStore: Send + Sync {
    /// Makes sure the table for `schema` exists.
    async fn prepare(&self, schema: &TableSchema) -> Result<()>;

    async fn upsert(&self, schema: &TableSchema, record: &Record) -> Result<UpsertOutcome>;

    async fn count(&self, table: &str) -> Result<u64>;
}
