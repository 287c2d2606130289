//! Top-level coordination: discovery, per-database lifecycle, status.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::batch::BatchProcessor;
use crate::config::SyncConfig;
use crate::error::{GriddleError, Result};
use crate::migration::{MigrationManager, MigrationState};
use crate::search::SearchIndex;
use crate::store::PrimaryStore;
use crate::transform::transform;
use crate::types::{parse_database_name, DatabaseKind, PendingOperation, SyncStatus, TenantId};
use crate::watcher::{ChangeFeedWatcher, DatabaseSyncState};

/// Owns the registry of active per-database sync pipelines and drives
/// discovery, migration, backfill, and watcher lifecycle.
///
/// Created with [`SyncOrchestrator::new`], which returns `Arc<Self>`; it is
/// shared with the embedding service for status and lifecycle calls.
pub struct SyncOrchestrator {
    store: Arc<dyn PrimaryStore>,
    batch: Arc<BatchProcessor>,
    migration: Arc<MigrationManager>,
    watcher: ChangeFeedWatcher,
    config: SyncConfig,
    /// One live entry per watched database name.
    registry: DashMap<String, Arc<DatabaseSyncState>>,
    /// Databases mid-`watch` (migration possibly running). Keeps per-tenant
    /// migration strictly sequential under concurrent watch calls.
    starting: DashMap<String, ()>,
    initialized: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn PrimaryStore>,
        search: Arc<dyn SearchIndex>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let batch = BatchProcessor::new(Arc::clone(&search), &config);
        batch.start_timer();

        let migration = Arc::new(MigrationManager::new(
            Arc::clone(&store),
            Arc::clone(&search),
            config.mappings.clone(),
        ));

        let watcher = ChangeFeedWatcher::new(
            Arc::clone(&store),
            Arc::clone(&batch),
            Arc::clone(&migration),
            &config,
        );

        Arc::new(Self {
            store,
            batch,
            migration,
            watcher,
            config,
            registry: DashMap::new(),
            starting: DashMap::new(),
            initialized: AtomicBool::new(false),
        })
    }

    /// List every database in the primary store and watch all syncable ones
    /// not already in the registry. Each database migrates and starts on its
    /// own task; one tenant's failure never touches another's pipeline.
    pub async fn discover_and_watch_all(self: &Arc<Self>) -> Result<()> {
        let databases = self.store.list_databases().await?;

        let mut handles = Vec::new();
        for database in databases {
            if parse_database_name(&self.config.database_prefix, &database).is_none() {
                continue;
            }
            if self.registry.contains_key(&database) {
                continue;
            }

            let orchestrator = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                if let Err(e) = orchestrator.watch(&database).await {
                    tracing::error!("[SYNC {}] watch failed: {}", database, e);
                }
            }));
        }

        let started = handles.len();
        for handle in handles {
            let _ = handle.await;
        }

        self.initialized.store(true, Ordering::Relaxed);
        tracing::info!(
            "[SYNC] discovery complete, {} new, {} watched total",
            started,
            self.registry.len()
        );
        Ok(())
    }

    /// Start syncing one database: run the migration check, backfill or
    /// reindex if required, then begin live tailing. Idempotent — watching
    /// an already-watched database logs and no-ops.
    pub async fn watch(&self, database: &str) -> Result<()> {
        let (kind, tenant_id) =
            parse_database_name(&self.config.database_prefix, database)
                .ok_or_else(|| GriddleError::NotSyncable(database.to_string()))?;

        if self.registry.contains_key(database) {
            tracing::info!("[SYNC {}] already watching", database);
            return Ok(());
        }
        if self.starting.insert(database.to_string(), ()).is_some() {
            tracing::info!("[SYNC {}] watch already in progress", database);
            return Ok(());
        }

        let result = self.watch_inner(database, kind, tenant_id).await;
        self.starting.remove(database);
        result
    }

    async fn watch_inner(
        &self,
        database: &str,
        kind: DatabaseKind,
        tenant_id: TenantId,
    ) -> Result<()> {
        let check = self.migration.check(database, kind).await?;
        tracing::info!(
            "[SYNC {}] state {:?}, target v{}, index {}",
            database,
            check.state,
            check.target_version,
            check.index_name
        );

        if check.migration_required {
            self.migration.create_target(database, kind, &check).await?;

            match check.state {
                MigrationState::LegacyUnversioned => {
                    self.migration.migrate_legacy(database, &check).await?;
                }
                _ => {
                    if check.backfill_required {
                        self.backfill(database, &tenant_id, &check.index_name).await?;
                        // Everything the backfill produced must be in the
                        // index before the alias moves.
                        self.batch.flush().await.map_err(|e| {
                            GriddleError::migration(database, format!("backfill flush: {}", e))
                        })?;
                    }
                    self.migration.finalize(database, &check).await?;
                }
            }
        }

        let state = DatabaseSyncState::new(
            database.to_string(),
            check.index_name,
            kind,
            tenant_id,
            check.target_version,
            check.resume_seq,
        );

        // Entry API keeps the one-state-per-database invariant under
        // concurrent watch calls: the loser drops its state unstarted.
        match self.registry.entry(database.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                tracing::info!("[SYNC {}] already watching", database);
                return Ok(());
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&state));
            }
        }

        self.watcher.start(state).await;
        Ok(())
    }

    /// Stop syncing one database and drop it from the registry. The target
    /// index is left untouched.
    pub async fn unwatch(&self, database: &str) -> Result<()> {
        let Some((_, state)) = self.registry.remove(database) else {
            tracing::info!("[SYNC {}] not watching, nothing to do", database);
            return Ok(());
        };

        self.watcher.stop(&state).await;
        tracing::info!("[SYNC {}] unwatched", database);
        Ok(())
    }

    /// Read-only status for the embedding service.
    pub fn status(&self) -> SyncStatus {
        let mut databases: Vec<_> = self
            .registry
            .iter()
            .map(|entry| entry.value().summary())
            .collect();
        databases.sort_by(|a, b| a.database.cmp(&b.database));

        SyncStatus {
            initialized: self.initialized.load(Ordering::Relaxed),
            pending_operations: self.batch.pending_count(),
            databases,
        }
    }

    /// Stop every watcher (each persists its final token), stop the batch
    /// timer, and run one last flush. Waits for any in-flight flush rather
    /// than aborting it.
    pub async fn shutdown(&self) {
        let databases: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        for database in databases {
            if let Err(e) = self.unwatch(&database).await {
                tracing::warn!("[SYNC {}] unwatch during shutdown failed: {}", database, e);
            }
        }

        self.batch.stop_timer();
        if let Err(e) = self.batch.flush().await {
            tracing::warn!("[SYNC] final flush failed: {}", e);
        }

        tracing::info!("[SYNC] shutdown complete");
    }

    /// One-time read of every existing document, pushed through the
    /// transformer into the target index. Page-by-page and synchronous: it
    /// blocks this database's feed start, nobody else's.
    async fn backfill(&self, database: &str, tenant_id: &TenantId, index_name: &str) -> Result<()> {
        let page_size = self.config.backfill_page_size;
        let mut start_after: Option<String> = None;
        let mut read = 0usize;
        let mut indexed = 0usize;

        loop {
            let page = self
                .store
                .read_page(database, start_after.as_deref(), page_size)
                .await?;

            read += page.rows.len();
            for row in &page.rows {
                if let Some((doc_id, document)) = transform(&row.document, tenant_id, database) {
                    indexed += 1;
                    if let Err(e) = self
                        .batch
                        .enqueue(PendingOperation::Upsert {
                            index: index_name.to_string(),
                            doc_id,
                            document,
                        })
                        .await
                    {
                        // Queued, not lost; the final flush before alias
                        // cutover retries.
                        tracing::warn!("[SYNC {}] backfill flush failed: {}", database, e);
                    }
                }
            }

            match page.next_start {
                Some(next) => start_after = Some(next),
                None => break,
            }
        }

        tracing::info!(
            "[SYNC {}] backfill read {} documents, indexed {}",
            database,
            read,
            indexed
        );
        Ok(())
    }
}

impl SyncOrchestrator {
    /// Convenience accessor used by the embedding service's health checks.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    /// Databases currently registered. Primarily for tests and debugging.
    pub fn watched_count(&self) -> usize {
        self.registry.len()
    }
}
