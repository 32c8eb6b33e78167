use std::future::Future;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cli::config::SchedulerSettings;
use crate::crawler::runner::{CrawlTaskRunner, RunError, RunHandle};
use crate::storage::{LogStore, TaskStore};
use crate::utils::MetricsCollector;

/// What a single dispatch pass did
#[derive(Debug, Default)]
pub struct TickReport {
    pub dispatched: Vec<i64>,

    /// Due tasks left alone because a run was still in flight
    pub skipped: Vec<i64>,

    pub handles: Vec<RunHandle>,
}

/// Periodically dispatches due tasks and prunes old audit entries
pub struct TaskScheduler {
    tasks: Arc<dyn TaskStore>,
    logs: Arc<dyn LogStore>,
    runner: Arc<CrawlTaskRunner>,
    settings: SchedulerSettings,
    metrics: MetricsCollector,
}

impl TaskScheduler {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        logs: Arc<dyn LogStore>,
        runner: Arc<CrawlTaskRunner>,
        settings: SchedulerSettings,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            tasks,
            logs,
            runner,
            settings,
            metrics,
        }
    }

    /// Dispatch every task due at `now` without waiting for the runs.
    /// Each due task's next run is moved forward by the reschedule offset,
    /// whether or not it was dispatched.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let due = self.tasks.list_tasks_due_for_schedule(now).await?;
        let mut report = TickReport::default();

        if due.is_empty() {
            debug!("No scheduled tasks due");
            return Ok(report);
        }

        for task in due {
            match self.runner.dispatch(task.id) {
                Ok(handle) => {
                    info!("Running scheduled task: {}", task.name);
                    report.dispatched.push(task.id);
                    report.handles.push(handle);
                }
                Err(RunError::TaskAlreadyRunning(id)) => {
                    warn!("Scheduled task {} is still running, skipping", id);
                    report.skipped.push(id);
                }
                Err(e) => {
                    warn!("Failed to dispatch task {}: {}", task.id, e);
                    report.skipped.push(task.id);
                }
            }

            let Some(next_run) = now.checked_add_signed(self.settings.reschedule_offset()) else {
                error!("Next run for task {} is out of range, not rescheduled", task.id);
                continue;
            };
            if let Err(e) = self.tasks.set_next_run(task.id, Some(next_run)).await {
                error!("Failed to reschedule task {}: {:#}", task.id, e);
            }
        }

        Ok(report)
    }

    /// Delete audit entries older than the retention window
    pub async fn prune_logs(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now
            .checked_sub_signed(self.settings.log_retention())
            .context("Log retention cutoff is out of range")?;
        let removed = self.logs.delete_logs_older_than(cutoff).await?;
        info!("Cleaned up {} old crawler logs", removed);
        Ok(removed)
    }

    /// Run the dispatch and prune loops until `shutdown` resolves.
    /// The first dispatch pass happens immediately.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if self.settings.tick_interval == 0 || self.settings.prune_interval == 0 {
            bail!("Scheduler intervals must be greater than zero");
        }

        let mut dispatch_timer = interval(self.settings.tick_interval());
        dispatch_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let prune_every = self.settings.prune_interval();
        let mut prune_timer = interval_at(Instant::now() + prune_every, prune_every);
        prune_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Scheduler started: dispatch every {}s, prune every {}s",
            self.settings.tick_interval, self.settings.prune_interval
        );

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Scheduler shutting down");
                    break;
                }
                _ = dispatch_timer.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) => {
                            if !report.dispatched.is_empty() {
                                info!("Dispatched {} scheduled tasks", report.dispatched.len());
                            }
                            debug!("Crawl metrics:\n{}", self.metrics.get_metrics().await);
                        }
                        Err(e) => error!("Scheduled task error: {:#}", e),
                    }
                }
                _ = prune_timer.tick() => {
                    if let Err(e) = self.prune_logs(Utc::now()).await {
                        error!("Log cleanup error: {:#}", e);
                    }
                }
            }
        }

        Ok(())
    }
}
