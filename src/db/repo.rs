use super::model::{AuditRow, BundleRow, MeetingRow};
use crate::model::{Activity, ActivityStatus, BundleKind, MemberRole, ParticipantScope, UserRef};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // sqlx won't create the file unless asked to
    let mut rebuilt = format!("sqlite://{}", expanded_path);
    match query_part {
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Meetings
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_meeting(
    pool: &Pool,
    meeting_id: &str,
    participants: &[UserRef],
    facilitators: &[UserRef],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("INSERT INTO meetings (id) VALUES (?)")
        .bind(meeting_id)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to insert meeting {}", meeting_id))?;
    for (role, ids) in [
        (MemberRole::Participant, participants),
        (MemberRole::Facilitator, facilitators),
    ] {
        for user_id in ids {
            sqlx::query(
                "INSERT OR IGNORE INTO meeting_members (meeting_id, user_id, role) VALUES (?, ?, ?)",
            )
            .bind(meeting_id)
            .bind(user_id)
            .bind(role.as_str())
            .execute(&mut *tx)
            .await?;
        }
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn fetch_meeting(pool: &Pool, meeting_id: &str) -> Result<Option<MeetingRow>> {
    let row = sqlx::query("SELECT id, metadata, next_seq, closed_at FROM meetings WHERE id = ?")
        .bind(meeting_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let metadata: String = row.get("metadata");
    Ok(Some(MeetingRow {
        id: row.get("id"),
        metadata: serde_json::from_str(&metadata)
            .with_context(|| format!("meeting {} has malformed metadata", meeting_id))?,
        next_seq: row.get("next_seq"),
        closed_at: row
            .try_get::<Option<DateTime<Utc>>, _>("closed_at")
            .ok()
            .flatten(),
    }))
}

#[instrument(skip_all)]
pub async fn fetch_members(pool: &Pool, meeting_id: &str, role: MemberRole) -> Result<Vec<UserRef>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT user_id FROM meeting_members WHERE meeting_id = ? AND role = ? ORDER BY user_id",
    )
    .bind(meeting_id)
    .bind(role.as_str())
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn replace_members(
    pool: &Pool,
    meeting_id: &str,
    role: MemberRole,
    user_ids: &[UserRef],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM meeting_members WHERE meeting_id = ? AND role = ?")
        .bind(meeting_id)
        .bind(role.as_str())
        .execute(&mut *tx)
        .await?;
    for user_id in user_ids {
        sqlx::query(
            "INSERT OR IGNORE INTO meeting_members (meeting_id, user_id, role) VALUES (?, ?, ?)",
        )
        .bind(meeting_id)
        .bind(user_id)
        .bind(role.as_str())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn update_meeting_metadata(pool: &Pool, meeting_id: &str, metadata: &Value) -> Result<()> {
    sqlx::query("UPDATE meetings SET metadata = ? WHERE id = ?")
        .bind(metadata.to_string())
        .bind(meeting_id)
        .execute(pool)
        .await
        .context("failed to persist meeting metadata")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_meeting_closed(pool: &Pool, meeting_id: &str) -> Result<()> {
    sqlx::query("UPDATE meetings SET closed_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(meeting_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Activities
// ---------------------------------------------------------------------------

/// Insert a new agenda row and advance the meeting's sequence counter past it.
#[instrument(skip_all)]
pub async fn insert_activity(pool: &Pool, activity: &Activity) -> Result<()> {
    let mut tx = pool.begin().await?;
    write_new_activity(&mut tx, activity).await?;
    tx.commit().await?;
    Ok(())
}

/// Insert a transfer-created agenda row together with its idempotency key.
#[instrument(skip_all)]
pub async fn insert_activity_with_key(
    pool: &Pool,
    activity: &Activity,
    idempotency_key: Option<&str>,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    write_new_activity(&mut tx, activity).await?;
    if let Some(key) = idempotency_key {
        write_transfer_commit(&mut tx, &activity.meeting_id, key, &activity.activity_id).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Input bundle, agenda row and idempotency key of a transfer target, all or
/// nothing.
#[instrument(skip_all)]
pub async fn insert_seeded_activity(
    pool: &Pool,
    activity: &Activity,
    input_payload: &str,
    idempotency_key: Option<&str>,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    write_input_bundle(&mut tx, &activity.meeting_id, &activity.activity_id, input_payload).await?;
    write_new_activity(&mut tx, activity).await?;
    if let Some(key) = idempotency_key {
        write_transfer_commit(&mut tx, &activity.meeting_id, key, &activity.activity_id).await?;
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn update_activity(pool: &Pool, activity: &Activity) -> Result<()> {
    let mut conn = pool.acquire().await?;
    write_activity_update(&mut conn, activity).await
}

/// Store the closing output revision and the completed row in one
/// transaction. Returns the new revision.
#[instrument(skip_all)]
pub async fn complete_activity(pool: &Pool, activity: &Activity, payload: &str) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let revision =
        write_output_revision(&mut tx, &activity.meeting_id, &activity.activity_id, payload).await?;
    write_activity_update(&mut tx, activity).await?;
    tx.commit().await?;
    Ok(revision)
}

#[instrument(skip_all)]
pub async fn update_order_indexes(pool: &Pool, order: &[(String, i64)]) -> Result<()> {
    let mut tx = pool.begin().await?;
    write_order_indexes(&mut tx, order).await?;
    tx.commit().await?;
    Ok(())
}

/// Soft-delete an activity and renumber the remaining agenda.
#[instrument(skip_all)]
pub async fn delete_activity(pool: &Pool, activity_id: &str, reindexed: &[(String, i64)]) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE activities SET deleted_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(activity_id)
        .execute(&mut *tx)
        .await
        .context("failed to delete activity")?;
    write_order_indexes(&mut tx, reindexed).await?;
    tx.commit().await?;
    Ok(())
}

async fn write_new_activity(conn: &mut SqliteConnection, activity: &Activity) -> Result<()> {
    sqlx::query(
        "INSERT INTO activities (id, meeting_id, tool_type, seq, order_index, config, status, elapsed_ms, participant_scope, started_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&activity.activity_id)
    .bind(&activity.meeting_id)
    .bind(&activity.tool_type)
    .bind(activity.seq)
    .bind(activity.order_index)
    .bind(activity.config.to_string())
    .bind(activity.status.as_str())
    .bind(activity.elapsed_ms)
    .bind(serde_json::to_string(&activity.participant_scope)?)
    .bind(activity.started_at)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("failed to insert activity {}", activity.activity_id))?;
    sqlx::query("UPDATE meetings SET next_seq = MAX(next_seq, ? + 1) WHERE id = ?")
        .bind(activity.seq)
        .bind(&activity.meeting_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn write_activity_update(conn: &mut SqliteConnection, activity: &Activity) -> Result<()> {
    let res = sqlx::query(
        "UPDATE activities SET order_index = ?, status = ?, elapsed_ms = ?, participant_scope = ?, started_at = ?, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(activity.order_index)
    .bind(activity.status.as_str())
    .bind(activity.elapsed_ms)
    .bind(serde_json::to_string(&activity.participant_scope)?)
    .bind(activity.started_at)
    .bind(&activity.activity_id)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("failed to update activity {}", activity.activity_id))?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("activity {} not found", activity.activity_id));
    }
    Ok(())
}

async fn write_order_indexes(conn: &mut SqliteConnection, order: &[(String, i64)]) -> Result<()> {
    for (activity_id, order_index) in order {
        sqlx::query(
            "UPDATE activities SET order_index = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(order_index)
        .bind(activity_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Live agenda rows of a meeting, in agenda order.
#[instrument(skip_all)]
pub async fn fetch_activities(pool: &Pool, meeting_id: &str) -> Result<Vec<Activity>> {
    let rows = sqlx::query(
        "SELECT id, meeting_id, tool_type, seq, order_index, config, status, elapsed_ms, participant_scope, started_at \
         FROM activities WHERE meeting_id = ? AND deleted_at IS NULL ORDER BY order_index ASC, seq ASC",
    )
    .bind(meeting_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(activity_from_row).collect()
}

fn activity_from_row(row: &SqliteRow) -> Result<Activity> {
    let id: String = row.get("id");
    let status_str: String = row.get("status");
    let status = ActivityStatus::parse_state(&status_str)
        .ok_or_else(|| anyhow!("activity {} has unknown status {}", id, status_str))?;
    let config: String = row.get("config");
    let scope: String = row.get("participant_scope");
    let scope: ParticipantScope = serde_json::from_str(&scope)
        .with_context(|| format!("activity {} has malformed participant scope", id))?;
    Ok(Activity {
        meeting_id: row.get("meeting_id"),
        tool_type: row.get("tool_type"),
        seq: row.get("seq"),
        order_index: row.get("order_index"),
        config: serde_json::from_str(&config).unwrap_or(Value::Null),
        status,
        elapsed_ms: row.get("elapsed_ms"),
        participant_scope: scope,
        started_at: row
            .try_get::<Option<DateTime<Utc>>, _>("started_at")
            .ok()
            .flatten(),
        activity_id: id,
    })
}

// ---------------------------------------------------------------------------
// Bundles
// ---------------------------------------------------------------------------

/// Latest stored payload for the key; outputs resolve to their newest revision.
#[instrument(skip_all)]
pub async fn fetch_bundle_payload(
    pool: &Pool,
    meeting_id: &str,
    activity_id: &str,
    kind: BundleKind,
) -> Result<Option<String>> {
    let payload = sqlx::query_scalar::<_, String>(
        "SELECT payload FROM bundles WHERE meeting_id = ? AND activity_id = ? AND kind = ? ORDER BY revision DESC LIMIT 1",
    )
    .bind(meeting_id)
    .bind(activity_id)
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(payload)
}

/// Returns `false` if an input bundle already existed.
#[instrument(skip_all)]
pub async fn insert_input_bundle(
    pool: &Pool,
    meeting_id: &str,
    activity_id: &str,
    payload: &str,
) -> Result<bool> {
    let mut conn = pool.acquire().await?;
    write_input_bundle(&mut conn, meeting_id, activity_id, payload).await
}

async fn write_input_bundle(
    conn: &mut SqliteConnection,
    meeting_id: &str,
    activity_id: &str,
    payload: &str,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT OR IGNORE INTO bundles (meeting_id, activity_id, kind, revision, payload) VALUES (?, ?, 'input', 0, ?)",
    )
    .bind(meeting_id)
    .bind(activity_id)
    .bind(payload)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn upsert_draft_bundle(
    pool: &Pool,
    meeting_id: &str,
    activity_id: &str,
    payload: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO bundles (meeting_id, activity_id, kind, revision, payload) VALUES (?, ?, 'draft', 0, ?) \
         ON CONFLICT(meeting_id, activity_id, kind, revision) DO UPDATE SET payload = excluded.payload, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(meeting_id)
    .bind(activity_id)
    .bind(payload)
    .execute(pool)
    .await
    .context("failed to persist draft bundle")?;
    Ok(())
}

/// Append a new immutable output revision and return its number (1..N).
#[instrument(skip_all)]
pub async fn append_output_bundle(
    pool: &Pool,
    meeting_id: &str,
    activity_id: &str,
    payload: &str,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let revision = write_output_revision(&mut tx, meeting_id, activity_id, payload).await?;
    tx.commit().await?;
    Ok(revision)
}

async fn write_output_revision(
    conn: &mut SqliteConnection,
    meeting_id: &str,
    activity_id: &str,
    payload: &str,
) -> Result<i64> {
    let current: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(revision) FROM bundles WHERE meeting_id = ? AND activity_id = ? AND kind = 'output'",
    )
    .bind(meeting_id)
    .bind(activity_id)
    .fetch_one(&mut *conn)
    .await?;
    let revision = current.unwrap_or(0) + 1;
    sqlx::query(
        "INSERT INTO bundles (meeting_id, activity_id, kind, revision, payload) VALUES (?, ?, 'output', ?, ?)",
    )
    .bind(meeting_id)
    .bind(activity_id)
    .bind(revision)
    .bind(payload)
    .execute(&mut *conn)
    .await
    .context("failed to persist output bundle")?;
    Ok(revision)
}

/// Drop the newest revision of `kind`. Used to undo a write whose companion
/// write failed.
#[instrument(skip_all)]
pub async fn delete_latest_bundle(
    pool: &Pool,
    meeting_id: &str,
    activity_id: &str,
    kind: BundleKind,
) -> Result<()> {
    sqlx::query(
        "DELETE FROM bundles WHERE meeting_id = ? AND activity_id = ? AND kind = ? AND revision = \
         (SELECT MAX(revision) FROM bundles WHERE meeting_id = ? AND activity_id = ? AND kind = ?)",
    )
    .bind(meeting_id)
    .bind(activity_id)
    .bind(kind.as_str())
    .bind(meeting_id)
    .bind(activity_id)
    .bind(kind.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn list_bundles(pool: &Pool, meeting_id: &str) -> Result<Vec<BundleRow>> {
    let rows = sqlx::query(
        "SELECT activity_id, kind, revision, payload, updated_at FROM bundles WHERE meeting_id = ? ORDER BY activity_id, kind, revision",
    )
    .bind(meeting_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|row| {
            let kind: String = row.get("kind");
            Ok(BundleRow {
                activity_id: row.get("activity_id"),
                kind: BundleKind::parse_kind(&kind)
                    .ok_or_else(|| anyhow!("unknown bundle kind {}", kind))?,
                revision: row.get("revision"),
                payload: row.get("payload"),
                updated_at: row.get("updated_at"),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Transfer idempotency
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn find_transfer_commit(
    pool: &Pool,
    meeting_id: &str,
    idempotency_key: &str,
) -> Result<Option<String>> {
    let id = sqlx::query_scalar::<_, String>(
        "SELECT activity_id FROM transfer_commits WHERE meeting_id = ? AND idempotency_key = ?",
    )
    .bind(meeting_id)
    .bind(idempotency_key)
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

async fn write_transfer_commit(
    conn: &mut SqliteConnection,
    meeting_id: &str,
    idempotency_key: &str,
    activity_id: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO transfer_commits (meeting_id, idempotency_key, activity_id) VALUES (?, ?, ?)",
    )
    .bind(meeting_id)
    .bind(idempotency_key)
    .bind(activity_id)
    .execute(&mut *conn)
    .await
    .context("failed to record transfer commit")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Audit trail
// ---------------------------------------------------------------------------

/// Append an audit entry and prune the meeting's trail down to `max_entries`.
#[instrument(skip_all)]
pub async fn append_audit(
    pool: &Pool,
    meeting_id: &str,
    activity_id: Option<&str>,
    action: &str,
    detail: &Value,
    max_entries: i64,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("INSERT INTO audit_log (meeting_id, activity_id, action, detail) VALUES (?, ?, ?, ?)")
        .bind(meeting_id)
        .bind(activity_id)
        .bind(action)
        .bind(detail.to_string())
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "DELETE FROM audit_log WHERE meeting_id = ? AND id NOT IN \
         (SELECT id FROM audit_log WHERE meeting_id = ? ORDER BY id DESC LIMIT ?)",
    )
    .bind(meeting_id)
    .bind(meeting_id)
    .bind(max_entries)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Most recent audit entries first.
#[instrument(skip_all)]
pub async fn list_audit(pool: &Pool, meeting_id: &str, limit: i64) -> Result<Vec<AuditRow>> {
    let rows = sqlx::query(
        "SELECT id, activity_id, action, detail, created_at FROM audit_log WHERE meeting_id = ? ORDER BY id DESC LIMIT ?",
    )
    .bind(meeting_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let detail: String = row.get("detail");
            AuditRow {
                id: row.get("id"),
                activity_id: row.try_get::<Option<String>, _>("activity_id").ok().flatten(),
                action: row.get("action"),
                detail: serde_json::from_str(&detail).unwrap_or(Value::Null),
                created_at: row.get("created_at"),
            }
        })
        .collect())
}
