//! Versioned blue-green index migration with atomic alias cutover.
//!
//! Each tenant database maps to an alias named after it; the alias resolves
//! to exactly one concrete `<alias>_v<N>` index whose mapping `_meta` carries
//! the authoritative schema version and replication checkpoint.

use std::sync::Arc;

use crate::error::{GriddleError, Result};
use crate::search::{IndexMetadata, SearchIndex};
use crate::store::PrimaryStore;
use crate::transform::target_schema_version;
use crate::types::{versioned_index_name, DatabaseKind, SequenceToken};

/// Where a database's index currently stands relative to the target schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// No index and no alias — first-ever sync.
    Absent,
    /// The alias name is itself a concrete index; predates versioning.
    LegacyUnversioned,
    /// Alias resolves to an index already at the target version.
    VersionedCurrent,
    /// Alias resolves to an index below the target version.
    VersionedStale,
}

/// Computed migration decision for one database. Never persisted.
#[derive(Debug, Clone)]
pub struct MigrationCheckResult {
    pub state: MigrationState,
    pub current_version: Option<u32>,
    pub target_version: u32,
    pub migration_required: bool,
    pub backfill_required: bool,
    /// Concrete index all writes go to.
    pub index_name: String,
    /// Concrete index the alias resolves to today, when different from
    /// `index_name`; deleted after cutover.
    pub previous_index: Option<String>,
    /// Change-feed position the watcher resumes from once the migration (if
    /// any) completes.
    pub resume_seq: SequenceToken,
}

pub struct MigrationManager {
    store: Arc<dyn PrimaryStore>,
    search: Arc<dyn SearchIndex>,
    mappings: crate::config::MappingSet,
}

impl MigrationManager {
    pub fn new(
        store: Arc<dyn PrimaryStore>,
        search: Arc<dyn SearchIndex>,
        mappings: crate::config::MappingSet,
    ) -> Self {
        Self {
            store,
            search,
            mappings,
        }
    }

    /// Determine what, if anything, has to happen before `database` can be
    /// live-tailed into its index.
    pub async fn check(&self, database: &str, kind: DatabaseKind) -> Result<MigrationCheckResult> {
        let target_version = target_schema_version(kind);

        if let Some(current_index) = self.search.alias_target(database).await? {
            let meta = self.search.read_metadata(&current_index).await?;
            let current_version = meta.as_ref().map(|m| m.schema_version);

            match meta {
                Some(meta) if meta.schema_version >= target_version => {
                    // Up to date: resume from the persisted checkpoint.
                    return Ok(MigrationCheckResult {
                        state: MigrationState::VersionedCurrent,
                        current_version,
                        target_version,
                        migration_required: false,
                        backfill_required: false,
                        index_name: current_index,
                        previous_index: None,
                        resume_seq: meta.last_seq,
                    });
                }
                _ => {
                    // Stale (or metadata missing, treated as version 0): new
                    // index, full backfill replaying the feed from the start.
                    let index_name = versioned_index_name(database, target_version);
                    // The alias can already point at the target-version index
                    // with its metadata lost; rebackfill it in place rather
                    // than swapping it with itself.
                    let previous_index = if current_index != index_name {
                        Some(current_index)
                    } else {
                        None
                    };
                    return Ok(MigrationCheckResult {
                        state: MigrationState::VersionedStale,
                        current_version,
                        target_version,
                        migration_required: true,
                        backfill_required: true,
                        index_name,
                        previous_index,
                        resume_seq: SequenceToken::zero(),
                    });
                }
            }
        }

        if self.search.index_exists(database).await? {
            // A concrete index squatting on the alias name: pre-versioning
            // layout. Its contents move over with a server-side reindex.
            let snapshot = self.store.current_sequence(database).await?;
            return Ok(MigrationCheckResult {
                state: MigrationState::LegacyUnversioned,
                current_version: None,
                target_version,
                migration_required: true,
                backfill_required: false,
                index_name: versioned_index_name(database, target_version),
                previous_index: Some(database.to_string()),
                resume_seq: snapshot,
            });
        }

        // First-ever sync. Snapshot the feed position now; everything at or
        // before it is covered by the backfill read, everything after by the
        // watcher.
        let snapshot = self.store.current_sequence(database).await?;
        Ok(MigrationCheckResult {
            state: MigrationState::Absent,
            current_version: None,
            target_version,
            migration_required: true,
            backfill_required: true,
            index_name: versioned_index_name(database, target_version),
            previous_index: None,
            resume_seq: snapshot,
        })
    }

    /// Create the target versioned index for a pending migration.
    pub async fn create_target(
        &self,
        database: &str,
        kind: DatabaseKind,
        check: &MigrationCheckResult,
    ) -> Result<()> {
        if self.search.index_exists(&check.index_name).await? {
            // A crash between a previous create and cutover left it behind;
            // the re-run backfill repopulates it idempotently.
            tracing::info!(
                "[MIG {}] target index {} already exists, reusing",
                database,
                check.index_name
            );
            return Ok(());
        }

        self.search
            .create_index(&check.index_name, self.mappings.for_kind(kind))
            .await
            .map_err(|e| GriddleError::migration(database, e))?;

        tracing::info!(
            "[MIG {}] created index {} (schema v{})",
            database,
            check.index_name,
            check.target_version
        );
        Ok(())
    }

    /// Move a legacy unversioned index's documents into the target index,
    /// retire the old index, and introduce the alias. The old index must be
    /// deleted before the alias can claim its name.
    pub async fn migrate_legacy(&self, database: &str, check: &MigrationCheckResult) -> Result<()> {
        let old_index = check
            .previous_index
            .as_deref()
            .ok_or_else(|| GriddleError::migration(database, "legacy migration without source"))?;

        let copied = self
            .search
            .reindex(old_index, &check.index_name)
            .await
            .map_err(|e| GriddleError::migration(database, e))?;

        tracing::info!(
            "[MIG {}] reindexed {} documents from legacy index",
            database,
            copied
        );

        self.search
            .delete_index(old_index)
            .await
            .map_err(|e| GriddleError::migration(database, e))?;

        self.search
            .create_alias(database, &check.index_name)
            .await
            .map_err(|e| GriddleError::migration(database, e))?;

        self.write_checkpoint(&check.index_name, check.target_version, &check.resume_seq)
            .await?;

        tracing::info!(
            "[MIG {}] legacy index retired, alias now on {}",
            database,
            check.index_name
        );
        Ok(())
    }

    /// Make a freshly backfilled index live. For a first sync this creates
    /// the alias; for a stale index it swaps the alias atomically and then
    /// deletes the superseded index. The checkpoint lands in the new index's
    /// metadata first, so a crash at any point re-runs the same migration
    /// idempotently.
    pub async fn finalize(&self, database: &str, check: &MigrationCheckResult) -> Result<()> {
        self.write_checkpoint(&check.index_name, check.target_version, &check.resume_seq)
            .await?;

        self.search
            .refresh(&check.index_name)
            .await
            .map_err(|e| GriddleError::migration(database, e))?;

        match &check.previous_index {
            None => {
                self.search
                    .create_alias(database, &check.index_name)
                    .await
                    .map_err(|e| GriddleError::migration(database, e))?;
                tracing::info!(
                    "[MIG {}] alias created on {}",
                    database,
                    check.index_name
                );
            }
            Some(previous) => {
                self.search
                    .swap_alias(database, previous, &check.index_name)
                    .await
                    .map_err(|e| GriddleError::migration(database, e))?;
                tracing::info!(
                    "[MIG {}] alias swapped {} -> {}",
                    database,
                    previous,
                    check.index_name
                );

                // Only after the swap; readers never lose the alias.
                if let Err(e) = self.search.delete_index(previous).await {
                    // The next migration check doesn't mind the orphan; log
                    // and move on.
                    tracing::warn!(
                        "[MIG {}] failed to delete superseded index {}: {}",
                        database,
                        previous,
                        e
                    );
                }
            }
        }

        Ok(())
    }

    /// Persist the replication checkpoint into the index's own metadata.
    pub async fn persist_checkpoint(
        &self,
        index: &str,
        schema_version: u32,
        seq: &SequenceToken,
    ) -> Result<()> {
        self.write_checkpoint(index, schema_version, seq).await
    }

    async fn write_checkpoint(
        &self,
        index: &str,
        schema_version: u32,
        seq: &SequenceToken,
    ) -> Result<()> {
        let meta = match self.search.read_metadata(index).await? {
            Some(existing) => existing.with_seq(seq.clone()),
            None => IndexMetadata::new(schema_version, seq.clone()),
        };
        self.search.write_metadata(index, &meta).await
    }
}
