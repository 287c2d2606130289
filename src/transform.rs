//! Pure document transformation: primary-store document in, index document out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{DatabaseKind, DocumentId, TenantId};

/// Schema version of user records this build understands. Documents tagged
/// with any other version are skipped, not errors — old and foreign documents
/// coexist in a primary database without corrupting the index.
pub const USER_SCHEMA_VERSION: u32 = 3;

/// Schema version of audit entries this build understands.
pub const AUDIT_SCHEMA_VERSION: u32 = 1;

/// Target schema version for a database kind; the migration manager creates
/// `<alias>_v<version>` indices from this.
pub fn target_schema_version(kind: DatabaseKind) -> u32 {
    match kind {
        DatabaseKind::UserData => USER_SCHEMA_VERSION,
        DatabaseKind::AuditLog => AUDIT_SCHEMA_VERSION,
    }
}

/// A primary-store document this build knows how to index, one variant per
/// supported schema version. Parsing is driven by the numeric
/// `schema_version` tag rather than structural probing.
#[derive(Debug, Clone)]
pub enum SourceDocument {
    UserV3(UserRecordV3),
    AuditV1(AuditEntryV1),
}

/// User record, schema version 3.
#[derive(Debug, Clone, Deserialize)]
pub struct UserRecordV3 {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    pub title: Option<String>,
    pub content: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub folder: Option<String>,
    #[serde(default)]
    pub pinned: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Activity-log entry, schema version 1.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditEntryV1 {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    pub action: Option<String>,
    pub actor: Option<String>,
    pub target_id: Option<String>,
    pub detail: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
}

// Index documents. Every Option serializes to an explicit null — the index
// mappings are strict, and "missing" vs "null" must never be ambiguous.

#[derive(Debug, Clone, Serialize)]
struct IndexedUserRecord {
    tenant_id: TenantId,
    database: String,
    title: Option<String>,
    content: Option<String>,
    tags: Vec<String>,
    folder: Option<String>,
    pinned: bool,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
struct IndexedAuditEntry {
    tenant_id: TenantId,
    database: String,
    action: Option<String>,
    actor: Option<String>,
    target_id: Option<String>,
    detail: Option<String>,
    occurred_at: Option<DateTime<Utc>>,
}

fn schema_version_tag(doc: &Value) -> Option<u32> {
    doc.get("schema_version").and_then(Value::as_u64).map(|v| v as u32)
}

impl SourceDocument {
    /// Parse a raw store document for the given database kind. Returns `None`
    /// when the version tag is missing, unrecognized, or the body does not
    /// deserialize as that version.
    pub fn parse(kind: DatabaseKind, doc: &Value) -> Option<SourceDocument> {
        match (kind, schema_version_tag(doc)?) {
            (DatabaseKind::UserData, USER_SCHEMA_VERSION) => serde_json::from_value(doc.clone())
                .ok()
                .map(SourceDocument::UserV3),
            (DatabaseKind::AuditLog, AUDIT_SCHEMA_VERSION) => serde_json::from_value(doc.clone())
                .ok()
                .map(SourceDocument::AuditV1),
            _ => None,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            SourceDocument::UserV3(r) => &r.id,
            SourceDocument::AuditV1(e) => &e.id,
        }
    }
}

/// Transform a primary-store document into its index document. Pure and
/// deterministic; returns `None` (skip, no operation) for documents tagged
/// with a schema version this build does not understand.
pub fn transform(doc: &Value, tenant_id: &str, database: &str) -> Option<(DocumentId, Value)> {
    let kind = kind_of_database(database)?;
    let source = SourceDocument::parse(kind, doc)?;
    let doc_id = source.id().to_string();

    let indexed = match source {
        SourceDocument::UserV3(r) => serde_json::to_value(IndexedUserRecord {
            tenant_id: tenant_id.to_string(),
            database: database.to_string(),
            title: r.title,
            content: r.content,
            tags: r.tags,
            folder: r.folder,
            pinned: r.pinned,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }),
        SourceDocument::AuditV1(e) => serde_json::to_value(IndexedAuditEntry {
            tenant_id: tenant_id.to_string(),
            database: database.to_string(),
            action: e.action,
            actor: e.actor,
            target_id: e.target_id,
            detail: e.detail,
            occurred_at: e.occurred_at,
        }),
    };

    indexed.ok().map(|v| (doc_id, v))
}

// The transformer is handed the database name, not a pre-parsed kind; the
// suffix convention is the same one discovery uses, minus the prefix check
// (the orchestrator only watches databases that already passed it).
fn kind_of_database(database: &str) -> Option<DatabaseKind> {
    if database.contains("_user_") {
        Some(DatabaseKind::UserData)
    } else if database.contains("_audit_") {
        Some(DatabaseKind::AuditLog)
    } else {
        None
    }
}
