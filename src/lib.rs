//! # Griddle
//!
//! Continuous replication from per-tenant primary-store databases into a
//! search index, with versioned blue-green index migrations and atomic alias
//! cutover. Griddle tails each tenant database's change feed, transforms
//! documents, and bulk-writes them into a per-tenant index — at-least-once,
//! resumable, and isolated per tenant.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use griddle::{HttpPrimaryStore, HttpSearchIndex, SyncConfig, SyncOrchestrator};
//! use std::sync::Arc;
//!
//! # async fn run() -> griddle::Result<()> {
//! let config = SyncConfig::load_or_default(std::path::Path::new("./data"));
//! let store = Arc::new(HttpPrimaryStore::new(config.store_url.clone()));
//! let search = Arc::new(HttpSearchIndex::new(config.search_url.clone()));
//!
//! let orchestrator = SyncOrchestrator::new(store, search, config);
//! orchestrator.discover_and_watch_all().await?;
//!
//! let status = orchestrator.status();
//! println!("watching {} databases", status.databases.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Pieces
//!
//! - [`SyncOrchestrator`] — discovery, per-database lifecycle, status.
//! - [`MigrationManager`] — versioned index migration and checkpoints.
//! - [`BatchProcessor`] — shared size/idle hybrid bulk batching.
//! - [`ChangeFeedWatcher`] — live tailing, one task per database.
//! - [`PrimaryStore`] / [`SearchIndex`] — the two collaborator boundaries,
//!   with HTTP adapters [`HttpPrimaryStore`] and [`HttpSearchIndex`].

pub mod batch;
pub mod config;
pub mod error;
pub mod migration;
pub mod orchestrator;
pub mod search;
pub mod store;
pub mod transform;
pub mod types;
pub mod watcher;

use once_cell::sync::OnceCell;
use std::sync::Arc;

static GLOBAL_ORCHESTRATOR: OnceCell<Arc<orchestrator::SyncOrchestrator>> = OnceCell::new();

/// Set the process-wide orchestrator (called once during service startup).
pub fn set_global_orchestrator(orchestrator: Arc<orchestrator::SyncOrchestrator>) {
    let _ = GLOBAL_ORCHESTRATOR.set(orchestrator);
}

/// Get the process-wide orchestrator, if the embedding service installed one.
pub fn get_global_orchestrator() -> Option<Arc<orchestrator::SyncOrchestrator>> {
    GLOBAL_ORCHESTRATOR.get().map(Arc::clone)
}

pub use batch::BatchProcessor;
pub use config::{MappingSet, SyncConfig};
pub use error::{GriddleError, Result};
pub use migration::{MigrationCheckResult, MigrationManager, MigrationState};
pub use orchestrator::SyncOrchestrator;
pub use search::{BulkItemFailure, BulkSummary, HttpSearchIndex, IndexMetadata, SearchIndex};
pub use store::{ChangeBatch, DocumentPage, HttpPrimaryStore, PrimaryStore, SourceRow};
pub use transform::{transform, SourceDocument, AUDIT_SCHEMA_VERSION, USER_SCHEMA_VERSION};
pub use types::*;
pub use watcher::{ChangeFeedWatcher, DatabaseSyncState};
