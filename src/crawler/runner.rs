//! Executes crawl tasks end to end and keeps their status and audit trail.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use url::Url;

use crate::cli::config::CrawlerConfig;
use crate::crawler::extractor::ProductExtractor;
use crate::crawler::fetcher::PageFetcher;
use crate::crawler::persister::DeduplicatingPersister;
use crate::crawler::robots::{origin_of, request_path, RobotsPolicyCache};
use crate::crawler::task::{CrawlTask, LogLevel, NewLogEntry, StatusUpdate};
use crate::storage::{LogStore, Stores, TaskStore};
use crate::utils::MetricsCollector;

/// A run could not be started
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("Crawler task not found: {0}")]
    TaskNotFound(i64),

    #[error("Crawler task {0} is already running")]
    TaskAlreadyRunning(i64),
}

/// How a started run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { products_found: usize },
    Failed { message: String },
}

pub type RunHandle = JoinHandle<Result<RunOutcome, RunError>>;

/// Task ids with a run in flight in this process
#[derive(Debug, Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<i64>>>);

impl InFlight {
    fn claim(&self, task_id: i64) -> Option<RunClaim> {
        let mut running = self.0.lock().unwrap_or_else(|e| e.into_inner());
        running.insert(task_id).then(|| RunClaim {
            task_id,
            registry: self.clone(),
        })
    }

    fn contains(&self, task_id: i64) -> bool {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&task_id)
    }
}

/// Releases the task id when the run ends, however it ends
struct RunClaim {
    task_id: i64,
    registry: InFlight,
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.registry
            .0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.task_id);
    }
}

pub struct CrawlTaskRunner {
    tasks: Arc<dyn TaskStore>,
    logs: Arc<dyn LogStore>,
    robots: Arc<RobotsPolicyCache>,
    fetcher: PageFetcher,
    extractor: ProductExtractor,
    persister: DeduplicatingPersister,
    politeness_delay: Duration,
    in_flight: InFlight,
    metrics: MetricsCollector,
}

impl CrawlTaskRunner {
    pub fn new(
        stores: &Stores,
        robots: Arc<RobotsPolicyCache>,
        config: &CrawlerConfig,
        metrics: MetricsCollector,
    ) -> Result<Self> {
        Ok(Self {
            tasks: stores.tasks.clone(),
            logs: stores.logs.clone(),
            robots,
            fetcher: PageFetcher::new(&config.crawler)?,
            extractor: ProductExtractor::new()?,
            persister: DeduplicatingPersister::new(stores.catalog.clone(), config.catalog.clone()),
            politeness_delay: config.crawler.politeness_delay(),
            in_flight: InFlight::default(),
            metrics,
        })
    }

    /// Whether a run of `task_id` is in flight in this process
    pub fn is_running(&self, task_id: i64) -> bool {
        self.in_flight.contains(task_id)
    }

    /// Start a run in the background
    pub fn dispatch(self: &Arc<Self>, task_id: i64) -> Result<RunHandle, RunError> {
        let claim = self
            .in_flight
            .claim(task_id)
            .ok_or(RunError::TaskAlreadyRunning(task_id))?;

        let runner = Arc::clone(self);
        Ok(tokio::spawn(async move { runner.run_claimed(claim).await }))
    }

    /// Run a task to completion on the current task
    pub async fn run(&self, task_id: i64) -> Result<RunOutcome, RunError> {
        let claim = self
            .in_flight
            .claim(task_id)
            .ok_or(RunError::TaskAlreadyRunning(task_id))?;

        self.run_claimed(claim).await
    }

    async fn run_claimed(&self, claim: RunClaim) -> Result<RunOutcome, RunError> {
        let task_id = claim.task_id;

        let task = match self.tasks.find_task_by_id(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                error!("Crawler task not found: {}", task_id);
                return Err(RunError::TaskNotFound(task_id));
            }
            Err(e) => return Ok(self.fail(task_id, format!("{:#}", e)).await),
        };

        let outcome = match AssertUnwindSafe(self.crawl(&task)).catch_unwind().await {
            Ok(Ok(products_found)) => RunOutcome::Completed { products_found },
            Ok(Err(e)) => self.fail(task_id, format!("{:#}", e)).await,
            Err(panic) => self.fail(task_id, panic_message(panic)).await,
        };

        self.metrics
            .record_run(matches!(outcome, RunOutcome::Completed { .. }))
            .await;

        drop(claim);
        Ok(outcome)
    }

    /// The run body. Errors returned here are orchestration faults; problems
    /// with a single URL are logged and the run moves on.
    async fn crawl(&self, task: &CrawlTask) -> Result<usize> {
        self.tasks
            .update_task_status(task.id, &StatusUpdate::running())
            .await?;
        self.record(
            NewLogEntry::new(task.id, LogLevel::Info, format!("Starting crawl task: {}", task.name))
                .with_detail(&task.url),
        )
        .await?;

        let mut total = 0;
        for (index, url) in task.target_urls().iter().enumerate() {
            if index > 0 && !self.politeness_delay.is_zero() {
                tokio::time::sleep(self.politeness_delay).await;
            }
            total += self.crawl_url(task, url).await?;
        }

        self.tasks
            .update_task_status(task.id, &StatusUpdate::completed(Utc::now(), total as i64))
            .await?;
        self.record(NewLogEntry::new(
            task.id,
            LogLevel::Info,
            format!("Crawl completed. Found {} products.", total),
        ))
        .await?;

        Ok(total)
    }

    /// Crawl one URL, returning how many new products were saved
    async fn crawl_url(&self, task: &CrawlTask, url: &str) -> Result<usize> {
        let page_url = match Url::parse(url) {
            Ok(page_url) => page_url,
            Err(e) => {
                self.record(
                    NewLogEntry::new(task.id, LogLevel::Error, format!("Crawl error: invalid URL: {}", e))
                        .with_detail(url),
                )
                .await?;
                return Ok(0);
            }
        };

        if !self
            .robots
            .is_allowed(&origin_of(&page_url), &request_path(&page_url))
            .await
        {
            self.metrics.record_robots_block().await;
            self.record(
                NewLogEntry::new(task.id, LogLevel::Warning, format!("URL blocked by robots.txt: {}", url))
                    .with_detail(url),
            )
            .await?;
            return Ok(0);
        }

        let host = page_url.host_str().unwrap_or_default().to_string();
        let timer = self.metrics.start_timer();
        let html = match self.fetcher.fetch(url).await {
            Ok(html) => {
                self.metrics.record_fetch(&host, true, timer.end()).await;
                html
            }
            Err(e) => {
                self.metrics.record_fetch(&host, false, timer.end()).await;
                self.record(
                    NewLogEntry::new(task.id, LogLevel::Error, format!("Crawl error: {}", e.message))
                        .with_detail(e.url),
                )
                .await?;
                return Ok(0);
            }
        };

        let candidates = self
            .extractor
            .extract(&html, &page_url, task.site_config.as_ref());
        self.record(NewLogEntry::new(
            task.id,
            LogLevel::Info,
            format!("Extracted {} products from {}", candidates.len(), url),
        ))
        .await?;

        if candidates.is_empty() {
            return Ok(0);
        }

        let outcome = self.persister.persist(&candidates, task.id).await;
        self.metrics
            .record_products(outcome.saved, outcome.skipped, outcome.failed)
            .await;

        self.record(
            NewLogEntry::new(
                task.id,
                LogLevel::Info,
                format!(
                    "Saved {} products, skipped {} duplicates",
                    outcome.saved, outcome.skipped
                ),
            )
            .with_detail(url),
        )
        .await?;

        if outcome.failed > 0 {
            let mut entry = NewLogEntry::new(
                task.id,
                LogLevel::Error,
                format!("Failed to save {} products from {}", outcome.failed, url),
            );
            if let Some(last_error) = outcome.last_error {
                entry = entry.with_detail(last_error);
            }
            self.record(entry).await?;
        }

        Ok(outcome.saved)
    }

    /// Append an audit entry and mirror it to tracing
    async fn record(&self, entry: NewLogEntry) -> Result<()> {
        let detail = entry.detail.as_deref().unwrap_or_default();
        match entry.level {
            LogLevel::Info => info!(task_id = entry.task_id, detail, "{}", entry.message),
            LogLevel::Warning => warn!(task_id = entry.task_id, detail, "{}", entry.message),
            LogLevel::Error => error!(task_id = entry.task_id, detail, "{}", entry.message),
        }

        self.logs.append_log(&entry).await
    }

    /// Best-effort failure bookkeeping; errors here are only traced
    async fn fail(&self, task_id: i64, message: String) -> RunOutcome {
        error!(task_id, "Task failed: {}", message);

        if let Err(e) = self
            .tasks
            .update_task_status(task_id, &StatusUpdate::failed(Utc::now(), message.as_str()))
            .await
        {
            error!(task_id, "Failed to mark task as failed: {:#}", e);
        }

        let entry = NewLogEntry::new(task_id, LogLevel::Error, format!("Task failed: {}", message));
        if let Err(e) = self.logs.append_log(&entry).await {
            error!(task_id, "Failed to record task failure: {:#}", e);
        }

        RunOutcome::Failed { message }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("run panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("run panicked: {}", message)
    } else {
        "run panicked".to_string()
    }
}
