//! Search-engine collaborator boundary.

pub mod client;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::types::{DocumentId, PendingOperation, SequenceToken};

pub use client::HttpSearchIndex;

/// Replication state persisted inside the index's own mapping metadata — not
/// a separate store. The single source of truth for resuming after restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub schema_version: u32,
    pub last_seq: SequenceToken,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IndexMetadata {
    pub fn new(schema_version: u32, last_seq: SequenceToken) -> Self {
        let now = Utc::now();
        IndexMetadata {
            schema_version,
            last_seq,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_seq(&self, last_seq: SequenceToken) -> Self {
        IndexMetadata {
            schema_version: self.schema_version,
            last_seq,
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }
}

/// One operation that the engine rejected inside an otherwise-successful
/// bulk response. Counted and logged, never retried — the source event will
/// not recur.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItemFailure {
    pub doc_id: DocumentId,
    pub index: String,
    pub reason: String,
}

/// Outcome of a bulk write that the engine accepted as a whole.
#[derive(Debug, Clone, Default)]
pub struct BulkSummary {
    pub applied: usize,
    pub rejected: Vec<BulkItemFailure>,
}

/// Everything the engine needs from the search side: index lifecycle, alias
/// indirection, metadata annotations, ordered bulk writes, and server-side
/// reindex. Implementations must keep `swap_alias` atomic — readers may never
/// observe an alias resolving to zero or two indices.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn index_exists(&self, name: &str) -> Result<bool>;

    async fn create_index(&self, name: &str, mapping: &Value) -> Result<()>;

    async fn delete_index(&self, name: &str) -> Result<()>;

    async fn alias_exists(&self, alias: &str) -> Result<bool>;

    /// Concrete index the alias resolves to, or `None` when the alias does
    /// not exist.
    async fn alias_target(&self, alias: &str) -> Result<Option<String>>;

    async fn create_alias(&self, alias: &str, index: &str) -> Result<()>;

    /// Atomically repoint `alias` from `from` to `to` in a single call.
    async fn swap_alias(&self, alias: &str, from: &str, to: &str) -> Result<()>;

    /// Read the replication annotation from an index. `None` when the index
    /// or the annotation does not exist ("nothing to migrate yet").
    async fn read_metadata(&self, index: &str) -> Result<Option<IndexMetadata>>;

    async fn write_metadata(&self, index: &str, meta: &IndexMetadata) -> Result<()>;

    /// Apply an ordered list of upserts/deletes. An `Err` means the engine
    /// rejected or never received the whole request (caller requeues);
    /// per-item failures come back in the summary. Deleting a document that
    /// is not there counts as applied.
    async fn bulk(&self, operations: &[PendingOperation]) -> Result<BulkSummary>;

    /// Server-side copy of every document from `source` into `dest`.
    /// Returns the number of documents copied.
    async fn reindex(&self, source: &str, dest: &str) -> Result<u64>;

    /// Make recent writes visible to readers. Used once per migration, right
    /// before an alias starts pointing at a freshly backfilled index.
    async fn refresh(&self, index: &str) -> Result<()>;
}
