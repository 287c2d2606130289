use serde::{Deserialize, Serialize};

/// Tenant identifier — extracted from the database name, e.g. `"acme"` from
/// `griddle_user_acme`.
pub type TenantId = String;
/// Document identifier — the primary store's `_id`, reused verbatim as the
/// index document id so upserts stay idempotent.
pub type DocumentId = String;

/// Opaque change-feed position. Tokens are ordered by the primary store and
/// only ever handed back to it for resumption — never parsed or compared
/// arithmetically here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceToken(pub String);

impl SequenceToken {
    /// Beginning-of-feed sentinel. Resuming from here replays the entire
    /// change history of a database.
    pub fn zero() -> Self {
        SequenceToken("0".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SequenceToken {
    fn from(s: &str) -> Self {
        SequenceToken(s.to_string())
    }
}

/// What a syncable database holds, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseKind {
    UserData,
    AuditLog,
}

impl DatabaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::UserData => "user_data",
            DatabaseKind::AuditLog => "audit_log",
        }
    }
}

impl std::fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split a database name into kind and tenant id per the naming convention:
/// `<prefix>_user_<tenant>` and `<prefix>_audit_<tenant>`. Any other name is
/// not syncable and returns `None`.
pub fn parse_database_name(prefix: &str, name: &str) -> Option<(DatabaseKind, TenantId)> {
    let user_prefix = format!("{}_user_", prefix);
    let audit_prefix = format!("{}_audit_", prefix);

    if let Some(tenant) = name.strip_prefix(&user_prefix) {
        if !tenant.is_empty() {
            return Some((DatabaseKind::UserData, tenant.to_string()));
        }
    }
    if let Some(tenant) = name.strip_prefix(&audit_prefix) {
        if !tenant.is_empty() {
            return Some((DatabaseKind::AuditLog, tenant.to_string()));
        }
    }
    None
}

/// Concrete index name for a schema version. The alias name is the database
/// name itself; versioned indices hang off it as `<alias>_v<N>`.
pub fn versioned_index_name(alias: &str, version: u32) -> String {
    format!("{}_v{}", alias, version)
}

/// One entry from a change feed. Transient — exists only for the duration of
/// a single processing step.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub seq: SequenceToken,
    pub id: DocumentId,
    pub deleted: bool,
    /// Full document body; absent for pure deletions.
    pub doc: Option<serde_json::Value>,
}

/// A not-yet-flushed index write. Requeued verbatim if the bulk write that
/// carried it fails.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOperation {
    Upsert {
        index: String,
        doc_id: DocumentId,
        document: serde_json::Value,
    },
    Delete {
        index: String,
        doc_id: DocumentId,
    },
}

impl PendingOperation {
    pub fn index(&self) -> &str {
        match self {
            PendingOperation::Upsert { index, .. } => index,
            PendingOperation::Delete { index, .. } => index,
        }
    }

    pub fn doc_id(&self) -> &str {
        match self {
            PendingOperation::Upsert { doc_id, .. } => doc_id,
            PendingOperation::Delete { doc_id, .. } => doc_id,
        }
    }
}

/// Read-only snapshot of one watched database, for the status surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSummary {
    pub database: String,
    pub index: String,
    pub kind: DatabaseKind,
    pub tenant_id: TenantId,
    pub last_seq: SequenceToken,
}

/// Status surface exposed to the embedding service. Counts and tokens only;
/// detailed errors go to logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub initialized: bool,
    pub pending_operations: usize,
    pub databases: Vec<DatabaseSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_database() {
        let parsed = parse_database_name("griddle", "griddle_user_acme");
        assert_eq!(parsed, Some((DatabaseKind::UserData, "acme".to_string())));
    }

    #[test]
    fn test_parse_audit_database() {
        let parsed = parse_database_name("griddle", "griddle_audit_acme");
        assert_eq!(parsed, Some((DatabaseKind::AuditLog, "acme".to_string())));
    }

    #[test]
    fn test_parse_ignores_other_names() {
        assert_eq!(parse_database_name("griddle", "griddle_internal"), None);
        assert_eq!(parse_database_name("griddle", "_replicator"), None);
        assert_eq!(parse_database_name("griddle", "other_user_acme"), None);
        assert_eq!(parse_database_name("griddle", "griddle_user_"), None);
    }

    #[test]
    fn test_parse_tenant_with_underscores() {
        let parsed = parse_database_name("app", "app_user_acme_corp");
        assert_eq!(
            parsed,
            Some((DatabaseKind::UserData, "acme_corp".to_string()))
        );
    }

    #[test]
    fn test_versioned_index_name() {
        assert_eq!(versioned_index_name("griddle_user_acme", 3), "griddle_user_acme_v3");
    }

    #[test]
    fn test_sequence_token_zero() {
        assert_eq!(SequenceToken::zero().as_str(), "0");
    }
}
