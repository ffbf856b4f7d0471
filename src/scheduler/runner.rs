//! Deadline-bounded task execution.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use super::history::{RunStatus, TaskResult};
use super::task::Task;

/// Deadline applied when none is configured.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);

/// Run `operation` on behalf of `task`, waiting at most `timeout`.
///
/// The deadline bounds how long the caller waits, not how long the
/// operation runs. On timeout the spawned operation is detached rather
/// than cancelled: it keeps running until it finishes on its own and its
/// result is discarded. Operations should watch their own deadlines where
/// they can.
pub async fn run_with_deadline<F>(task: &Task, operation: F, timeout: Duration) -> TaskResult
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut result = TaskResult::running(task);
    let started = Instant::now();

    // A JoinHandle detaches on drop, which is what abandonment means here.
    let handle = tokio::spawn(operation);
    let outcome = tokio::time::timeout(timeout, handle).await;
    let elapsed = started.elapsed();

    match outcome {
        Ok(Ok(Ok(()))) => result.finish(
            RunStatus::Success,
            elapsed,
            format!("Successfully executed task: {}", task.name),
            None,
        ),
        Ok(Ok(Err(e))) => result.finish(
            RunStatus::Failed,
            elapsed,
            format!("Task failed: {}", task.name),
            Some(format!("{:#}", e)),
        ),
        Ok(Err(join_err)) => result.finish(
            RunStatus::Failed,
            elapsed,
            format!("Task aborted: {}", task.name),
            Some(format!("task panicked: {}", join_err)),
        ),
        Err(_) => result.finish(
            RunStatus::Timeout,
            elapsed,
            format!("Task exceeded its {}s deadline: {}", timeout.as_secs_f64(), task.name),
            Some("task execution timed out".to_string()),
        ),
    }

    log_outcome(&result, timeout);
    result
}

fn log_outcome(result: &TaskResult, timeout: Duration) {
    let duration_ms = result.duration().as_millis() as u64;
    match result.status {
        RunStatus::Success => info!(
            task_id = %result.task_id,
            task_name = %result.task_name,
            task_type = %result.task_type,
            duration_ms,
            status = %result.status,
            "Task execution succeeded"
        ),
        RunStatus::Timeout => warn!(
            task_id = %result.task_id,
            task_name = %result.task_name,
            task_type = %result.task_type,
            duration_ms,
            timeout_ms = timeout.as_millis() as u64,
            status = %result.status,
            error = result.error.as_deref().unwrap_or_default(),
            "Task execution timed out"
        ),
        RunStatus::Failed | RunStatus::Running => error!(
            task_id = %result.task_id,
            task_name = %result.task_name,
            task_type = %result.task_type,
            duration_ms,
            status = %result.status,
            error = result.error.as_deref().unwrap_or_default(),
            "Task execution failed"
        ),
    }
}
