//! Task scheduler: fires due `ScheduledTask`s into the group queue.
//!
//! A poll loop reads tasks whose `next_run` has passed, re-checks that each
//! is still active, buffers its prompt in the group's inbox and asks the
//! queue for a check. Firing goes through the same admission and retry path
//! as chat input.
//!
//! Schedule descriptors:
//! - `cron`: 5-field (minute precision) or 6/7-field expressions evaluated
//!   in the configured timezone
//! - `interval`: milliseconds between fires
//! - `once`: RFC 3339 timestamp; the task completes after it fires

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hutch_core::config::SchedulerConfig;
use hutch_core::model::{ScheduleKind, ScheduledTask, TaskStatus};
use hutch_store::{StateStore, timestamp};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::inbox::{InboundItem, Inbox, TaskRun};
use crate::queue::GroupQueue;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid cron expression {value:?}: {reason}")]
    InvalidCron { value: String, reason: String },
    #[error("invalid interval {0:?}: expected a positive number of milliseconds")]
    InvalidInterval(String),
    #[error("invalid timestamp {0:?}: expected RFC 3339")]
    InvalidTimestamp(String),
    #[error("unknown timezone {0:?}")]
    InvalidTimezone(String),
}

fn parse_cron(value: &str) -> Result<cron::Schedule, ScheduleError> {
    let trimmed = value.trim();
    let expr = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&expr).map_err(|e| ScheduleError::InvalidCron {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_interval(value: &str) -> Result<chrono::Duration, ScheduleError> {
    match value.trim().parse::<i64>() {
        Ok(ms) if ms > 0 => Ok(chrono::Duration::milliseconds(ms)),
        _ => Err(ScheduleError::InvalidInterval(value.to_string())),
    }
}

fn next_cron_fire(
    value: &str,
    timezone: &str,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let schedule = parse_cron(value)?;
    let tz: chrono_tz::Tz = timezone
        .parse()
        .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))?;
    Ok(schedule
        .after(&now.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc)))
}

/// First fire time for a newly scheduled task. Also validates the descriptor.
pub fn first_run(
    kind: ScheduleKind,
    value: &str,
    timezone: &str,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    match kind {
        ScheduleKind::Cron => next_cron_fire(value, timezone, now),
        ScheduleKind::Interval => Ok(Some(now + parse_interval(value)?)),
        ScheduleKind::Once => DateTime::parse_from_rfc3339(value.trim())
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| ScheduleError::InvalidTimestamp(value.to_string())),
    }
}

/// Next fire time after a task fired at `now`. `None` ends the task.
pub fn calculate_next_run(
    kind: ScheduleKind,
    value: &str,
    timezone: &str,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    match kind {
        ScheduleKind::Cron => next_cron_fire(value, timezone, now),
        ScheduleKind::Interval => Ok(Some(now + parse_interval(value)?)),
        ScheduleKind::Once => Ok(None),
    }
}

/// Short summary of a run result for the task table.
pub fn result_summary(result: Option<&str>, error: Option<&str>) -> String {
    if let Some(e) = error {
        return format!("Error: {e}");
    }
    match result {
        Some(r) if r.chars().count() > 200 => r.chars().take(200).collect(),
        Some(r) => r.to_string(),
        None => "Completed".to_string(),
    }
}

#[derive(Clone)]
pub struct TaskScheduler {
    store: StateStore,
    queue: GroupQueue,
    inbox: Inbox,
    config: SchedulerConfig,
}

impl TaskScheduler {
    pub fn new(store: StateStore, queue: GroupQueue, inbox: Inbox, config: SchedulerConfig) -> Self {
        Self {
            store,
            queue,
            inbox,
            config,
        }
    }

    /// Fire every task due at `now`. Returns how many were fired.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let due = match self.store.get_due_tasks(now) {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "failed to query due tasks");
                return 0;
            }
        };
        if !due.is_empty() {
            info!(count = due.len(), "found due tasks");
        }

        let mut fired = 0;
        for task in due {
            // Status may have changed since the due query.
            match self.store.get_task(&task.id) {
                Ok(Some(current)) if current.status == TaskStatus::Active => {
                    self.fire(current, now).await;
                    fired += 1;
                }
                Ok(Some(current)) => {
                    debug!(task_id = %current.id, status = %current.status, "task no longer active, skipping");
                }
                Ok(None) => debug!(task_id = %task.id, "task deleted, skipping"),
                Err(e) => error!(task_id = %task.id, error = %e, "failed to re-check task"),
            }
        }
        fired
    }

    async fn fire(&self, task: ScheduledTask, now: DateTime<Utc>) {
        let (next_run, note) = match calculate_next_run(
            task.schedule_type,
            &task.schedule_value,
            &self.config.timezone,
            now,
        ) {
            Ok(next) => (next.map(timestamp), "queued".to_string()),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "invalid schedule, task will not repeat");
                (None, result_summary(None, Some(&e.to_string())))
            }
        };

        if let Err(e) = self
            .store
            .update_task_after_run(&task.id, next_run.as_deref(), &note, now)
        {
            // Without the advance the task would fire again on the next tick.
            error!(task_id = %task.id, error = %e, "failed to advance task, not firing");
            return;
        }

        info!(
            task_id = %task.id,
            group = %task.group_folder,
            next_run = next_run.as_deref().unwrap_or("none"),
            "firing scheduled task"
        );
        self.inbox.push(
            &task.chat_jid,
            InboundItem::Task(TaskRun {
                task_id: task.id,
                prompt: task.prompt,
                context_mode: task.context_mode,
            }),
        );
        self.queue.enqueue_message_check(&task.chat_jid).await;
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("scheduler disabled, skipping loop");
            return;
        }
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(100));
        info!(
            poll_interval_ms = poll_interval.as_millis() as u64,
            timezone = %self.config.timezone,
            "scheduler loop started"
        );

        loop {
            self.tick(Utc::now()).await;
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler loop shutting down");
                        return;
                    }
                }
            }
        }
    }
}
