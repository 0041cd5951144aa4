//! Database view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::BundleKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Meeting row without its agenda or roster.
#[derive(Debug, Clone)]
pub struct MeetingRow {
    pub id: String,
    pub metadata: Value,
    pub next_seq: i64,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Raw bundle row, used by inspection tooling.
#[derive(Debug, Clone, Serialize)]
pub struct BundleRow {
    pub activity_id: String,
    pub kind: BundleKind,
    pub revision: i64,
    pub payload: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRow {
    pub id: i64,
    pub activity_id: Option<String>,
    pub action: String,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}
