use agenda_conductor::commands::{handle_command, Inbound};
use agenda_conductor::config;
use agenda_conductor::db;
use agenda_conductor::error::OrchestratorError;
use agenda_conductor::machine::Services;
use agenda_conductor::plugin::PluginRegistry;
use agenda_conductor::registry::MeetingRegistry;
use agenda_conductor::transfer::TransferEngine;
use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Serve meeting control commands as JSON lines on stdin/stdout"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print an example config and exit
    #[arg(long)]
    print_example_config: bool,
}

/// Lines queued for stdout. Replies wait for room; snapshot events are
/// skipped while the queue is full.
const OUT_CAPACITY: usize = 256;

/// Stdin connection state: which snapshot streams are forwarded to stdout.
struct Session {
    registry: Arc<MeetingRegistry>,
    transfers: TransferEngine,
    out: mpsc::Sender<Value>,
    forwards: HashMap<(String, String), JoinHandle<()>>,
}

impl Session {
    async fn handle(&mut self, inbound: Inbound) -> Value {
        match inbound {
            Inbound::Command(envelope) => {
                let response = handle_command(&self.registry, &self.transfers, envelope).await;
                serde_json::to_value(&response).unwrap_or_else(|err| {
                    json!({ "ok": false, "error": { "code": "storage", "message": err.to_string() } })
                })
            }
            Inbound::CreateMeeting {
                meeting_id,
                participant_ids,
                facilitator_ids,
            } => match self
                .registry
                .create_meeting(&meeting_id, participant_ids, facilitator_ids)
                .await
            {
                Ok(meeting) => json!({ "ok": true, "result": { "meeting_id": meeting.id() } }),
                Err(err) => failure(&err),
            },
            Inbound::CloseMeeting { meeting_id, actor } => {
                match self.close_meeting(&meeting_id, &actor).await {
                    Ok(()) => json!({ "ok": true }),
                    Err(err) => failure(&err),
                }
            }
            Inbound::Subscribe {
                meeting_id,
                client_ref,
            } => match self.subscribe(&meeting_id, &client_ref).await {
                Ok(()) => json!({ "ok": true }),
                Err(err) => failure(&err),
            },
            Inbound::Unsubscribe {
                meeting_id,
                client_ref,
            } => {
                if let Some(task) = self.forwards.remove(&(meeting_id.clone(), client_ref.clone())) {
                    task.abort();
                }
                let removed = self
                    .registry
                    .services()
                    .broadcaster
                    .unsubscribe(&meeting_id, &client_ref);
                json!({ "ok": true, "result": { "removed": removed } })
            }
        }
    }

    async fn close_meeting(&mut self, meeting_id: &str, actor: &str) -> agenda_conductor::Result<()> {
        let meeting = self.registry.open_meeting(meeting_id).await?;
        if !meeting.is_facilitator(actor).await {
            return Err(OrchestratorError::Forbidden(actor.to_string()));
        }
        self.registry.close_meeting(meeting_id).await?;
        self.forwards.retain(|(m, _), _| m != meeting_id);
        Ok(())
    }

    async fn subscribe(&mut self, meeting_id: &str, client_ref: &str) -> agenda_conductor::Result<()> {
        let meeting = self.registry.open_meeting(meeting_id).await?;
        if !meeting.is_member(client_ref).await {
            return Err(OrchestratorError::Forbidden(client_ref.to_string()));
        }
        let subscription = self
            .registry
            .services()
            .broadcaster
            .subscribe(meeting_id, client_ref);
        let out = self.out.clone();
        let client = client_ref.to_string();
        let task = tokio::spawn(async move {
            let stream = subscription.into_stream();
            futures::pin_mut!(stream);
            while let Some(snapshot) = stream.next().await {
                let event = json!({ "event": "snapshot", "client_ref": client, "snapshot": snapshot });
                if !forward_snapshot(&out, event) {
                    break;
                }
            }
        });
        if let Some(previous) = self
            .forwards
            .insert((meeting_id.to_string(), client_ref.to_string()), task)
        {
            previous.abort();
        }
        Ok(())
    }
}

/// Queue a snapshot event without waiting on a slow reader. Each snapshot is
/// complete, so a skipped one is superseded by the next. Returns `false`
/// once stdout is gone.
fn forward_snapshot(out: &mpsc::Sender<Value>, event: Value) -> bool {
    match out.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            debug!("stdout backlog full; snapshot skipped");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

fn failure(err: &OrchestratorError) -> Value {
    json!({ "ok": false, "error": err.to_json() })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_example_config {
        print!("{}", config::example());
        return Ok(());
    }
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let plugins = PluginRegistry::with_builtin();
    info!(tools = ?plugins.tool_types(), "plugins registered");
    let services = Arc::new(Services::from_config(pool, plugins, &cfg));
    let transfers = TransferEngine::new(services.store.clone());
    let registry = Arc::new(MeetingRegistry::new(services));

    // Single writer so responses and snapshot events never interleave mid-line.
    let (out, mut out_rx) = mpsc::channel::<Value>(OUT_CAPACITY);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = out_rx.recv().await {
            let mut line = message.to_string();
            line.push('\n');
            if let Err(err) = stdout.write_all(line.as_bytes()).await {
                error!(?err, "stdout closed");
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut session = Session {
        registry,
        transfers,
        out: out.clone(),
        forwards: HashMap::new(),
    };

    info!("reading commands from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Inbound>(&line) {
            Ok(inbound) => session.handle(inbound).await,
            Err(err) => {
                warn!(%err, "unparseable input line");
                json!({ "ok": false, "error": { "code": "bad_request", "message": err.to_string() } })
            }
        };
        if out.send(reply).await.is_err() {
            break;
        }
    }

    info!("stdin closed; shutting down");
    for (_, task) in session.forwards.drain() {
        task.abort();
    }
    drop(session);
    drop(out);
    let _ = writer.await;
    Ok(())
}
