//! Periodic draft persistence for running activities.

use crate::config::AutosaveSettings;
use crate::plugin::{ActivityContext, ActivityPlugin};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

struct AutosaveTimer {
    meeting_id: String,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// One timer task per running activity, keyed by activity id.
pub struct AutosaveScheduler {
    settings: AutosaveSettings,
    timers: Mutex<HashMap<String, AutosaveTimer>>,
}

impl AutosaveScheduler {
    pub fn new(settings: AutosaveSettings) -> Self {
        Self {
            settings,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Plugin-declared period clamped to the configured bounds.
    pub fn period_for(&self, plugin: &dyn ActivityPlugin) -> Duration {
        let secs = plugin
            .autosave_seconds()
            .unwrap_or(self.settings.default_seconds)
            .clamp(self.settings.min_seconds, self.settings.max_seconds);
        Duration::from_secs(secs)
    }

    pub fn is_running(&self, activity_id: &str) -> bool {
        self.timers
            .lock()
            .map(|t| t.contains_key(activity_id))
            .unwrap_or(false)
    }

    /// Start the timer for an activity, replacing any previous one.
    pub fn start(&self, plugin: Arc<dyn ActivityPlugin>, ctx: Arc<ActivityContext>) {
        let period = self.period_for(plugin.as_ref());
        let activity_id = ctx.activity_id().to_string();
        let meeting_id = ctx.meeting_id().to_string();
        let (cancel, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(run_timer(plugin, ctx, period, cancel_rx));

        let previous = match self.timers.lock() {
            Ok(mut timers) => timers.insert(
                activity_id.clone(),
                AutosaveTimer {
                    meeting_id,
                    cancel,
                    handle,
                },
            ),
            Err(_) => {
                warn!(activity_id, "autosave registry poisoned; timer not tracked");
                None
            }
        };
        if let Some(previous) = previous {
            let _ = previous.cancel.send(true);
            previous.handle.abort();
        }
        info!(activity_id, period_secs = period.as_secs(), "autosave started");
    }

    /// Stop the timer and wait for it to exit; no draft is written afterwards.
    pub async fn cancel(&self, activity_id: &str) {
        let timer = self
            .timers
            .lock()
            .ok()
            .and_then(|mut timers| timers.remove(activity_id));
        if let Some(timer) = timer {
            stop_timer(timer).await;
            info!(activity_id, "autosave stopped");
        }
    }

    /// Stop every timer belonging to a meeting.
    pub async fn cancel_meeting(&self, meeting_id: &str) {
        let timers: Vec<AutosaveTimer> = match self.timers.lock() {
            Ok(mut timers) => {
                let ids: Vec<String> = timers
                    .iter()
                    .filter(|(_, t)| t.meeting_id == meeting_id)
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.iter().filter_map(|id| timers.remove(id)).collect()
            }
            Err(_) => Vec::new(),
        };
        let count = timers.len();
        for timer in timers {
            stop_timer(timer).await;
        }
        if count > 0 {
            info!(meeting_id, count, "autosave timers stopped for meeting");
        }
    }
}

async fn stop_timer(timer: AutosaveTimer) {
    let _ = timer.cancel.send(true);
    if let Err(err) = timer.handle.await {
        if !err.is_cancelled() {
            warn!(?err, "autosave task ended abnormally");
        }
    }
}

async fn run_timer(
    plugin: Arc<dyn ActivityPlugin>,
    ctx: Arc<ActivityContext>,
    period: Duration,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if *cancel_rx.borrow() {
                    break;
                }
                autosave_tick(plugin.as_ref(), &ctx).await;
            }
        }
    }
}

/// Failures are logged and the tick skipped; autosave never stops an activity.
#[instrument(skip_all, fields(activity_id = ctx.activity_id()))]
async fn autosave_tick(plugin: &dyn ActivityPlugin, ctx: &ActivityContext) {
    match plugin.snapshot(ctx).await {
        Ok(Some(bundle)) => match ctx.store_draft(&bundle).await {
            Ok(()) => debug!(items = bundle.items.len(), "autosaved draft"),
            Err(err) => warn!(?err, "autosave persist failed; skipping tick"),
        },
        Ok(None) => debug!("plugin opted out of autosave"),
        Err(err) => warn!(?err, "autosave snapshot failed; skipping tick"),
    }
}
