//! Per-task trigger loop.
//!
//! One loop runs per enabled task. It sleeps until the next cron firing
//! and spawns an independent execution, so a slow run never delays the
//! next firing. Runs of the same task may overlap.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Scheduler, Trigger};

pub(crate) async fn run_trigger_loop(
    scheduler: Scheduler,
    task_id: String,
    trigger: Trigger,
    token: CancellationToken,
) {
    debug!(task_id = %task_id, cron = %trigger.expr(), "Trigger registered");

    let mut last_fired = Utc::now();
    loop {
        let Some(next) = trigger.next_after(&last_fired) else {
            info!(task_id = %task_id, cron = %trigger.expr(), "Trigger has no further firings");
            break;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        if token.is_cancelled() {
            break;
        }

        last_fired = resume_point(next, Utc::now());
        let scheduler = scheduler.clone();
        let id = task_id.clone();
        tokio::spawn(async move {
            scheduler.fire(&id).await;
        });
    }

    debug!(task_id = %task_id, "Trigger stopped");
}

/// Where the next firing is searched from after waking for `planned`.
///
/// A wake past later firings (suspend, clock jump, starved runtime) fires
/// once and skips the rest instead of replaying them back to back.
fn resume_point(planned: DateTime<Utc>, woke: DateTime<Utc>) -> DateTime<Utc> {
    planned.max(woke)
}
