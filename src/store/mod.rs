//! Primary-store collaborator boundary.

pub mod client;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::error::Result;
use crate::types::{ChangeEvent, DocumentId, SequenceToken};

pub use client::HttpPrimaryStore;

/// One poll's worth of change feed. `last_seq` is the position to resume
/// from, even when `events` is empty (the feed moved past non-document
/// entries or the longpoll timed out).
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub events: Vec<ChangeEvent>,
    pub last_seq: SequenceToken,
}

#[derive(Debug, Clone)]
pub struct SourceRow {
    pub id: DocumentId,
    pub document: Value,
}

/// One page of a backfill scan. `next_start` feeds the following
/// `read_page` call; `None` means the scan is complete.
#[derive(Debug, Clone)]
pub struct DocumentPage {
    pub rows: Vec<SourceRow>,
    pub next_start: Option<DocumentId>,
}

/// Everything the engine needs from the primary store: discovery, a
/// resumable longpoll change feed with full document bodies, paged reads for
/// backfill, and a current-position probe for snapshot tokens.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    async fn list_databases(&self) -> Result<Vec<String>>;

    /// The feed position "now" — events at or before this token are covered
    /// by a backfill read started afterward.
    async fn current_sequence(&self, database: &str) -> Result<SequenceToken>;

    /// Longpoll the change feed from `since`. Holds up to `wait` for new
    /// changes before returning an empty batch; never blocks indefinitely.
    async fn changes_since(
        &self,
        database: &str,
        since: &SequenceToken,
        limit: usize,
        wait: Duration,
    ) -> Result<ChangeBatch>;

    /// Read one page of all documents, ordered by id, starting strictly
    /// after `start_after`.
    async fn read_page(
        &self,
        database: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<DocumentPage>;
}
