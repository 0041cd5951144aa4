use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use agenda_conductor::config;
use agenda_conductor::db;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Print the stored agenda, bundles and audit trail of a meeting"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Meeting to inspect
    #[arg(long)]
    meeting_id: String,

    /// Only show bundles of this activity
    #[arg(long)]
    activity_id: Option<String>,

    /// Print full payloads instead of item counts
    #[arg(long)]
    payloads: bool,

    /// Number of audit entries to show
    #[arg(long, default_value = "20")]
    audit: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let meeting = db::fetch_meeting(&pool, &args.meeting_id)
        .await?
        .with_context(|| format!("meeting {} not found", args.meeting_id))?;
    println!("Meeting {} (next seq {})", meeting.id, meeting.next_seq);
    if let Some(closed_at) = meeting.closed_at {
        println!("  closed at {}", closed_at);
    }

    println!("Agenda:");
    for activity in db::fetch_activities(&pool, &args.meeting_id).await? {
        println!(
            "  [{}] {} status={} elapsed_ms={} scope={}",
            activity.order_index,
            activity.activity_id,
            activity.status.as_str(),
            activity.elapsed_ms,
            serde_json::to_string(&activity.participant_scope)?
        );
    }

    println!("Bundles:");
    for row in db::list_bundles(&pool, &args.meeting_id).await? {
        if args
            .activity_id
            .as_deref()
            .is_some_and(|id| !row.activity_id.starts_with(id))
        {
            continue;
        }
        let summary = if args.payloads {
            row.payload.clone()
        } else {
            let value: serde_json::Value = serde_json::from_str(&row.payload)
                .with_context(|| format!("malformed payload for {}", row.activity_id))?;
            let items = value
                .get("items")
                .and_then(|i| i.as_array())
                .map(|i| i.len())
                .unwrap_or(0);
            format!("{} items", items)
        };
        println!(
            "  {} {} rev={} updated={} {}",
            row.activity_id,
            row.kind.as_str(),
            row.revision,
            row.updated_at,
            summary
        );
    }

    println!("Audit (newest first):");
    for entry in db::list_audit(&pool, &args.meeting_id, args.audit).await? {
        println!(
            "  #{} {} {} {} {}",
            entry.id,
            entry.created_at,
            entry.action,
            entry.activity_id.as_deref().unwrap_or("-"),
            entry.detail
        );
    }
    Ok(())
}
