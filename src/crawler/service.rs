//! Administrative operations over crawl tasks.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::cli::config::CrawlerConfig;
use crate::crawler::robots::{origin_of, PolicySource, RobotsPolicyCache};
use crate::crawler::runner::{CrawlTaskRunner, RunError, RunHandle};
use crate::crawler::scheduler::TaskScheduler;
use crate::crawler::task::{CrawlLogEntry, CrawlTask, NewCrawlTask, StatusUpdate, TaskChanges, TaskStatus};
use crate::storage::{SqliteStore, Stores};
use crate::utils::MetricsCollector;

/// Audit entries returned per task
pub const TASK_LOG_LIMIT: i64 = 100;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),

    #[error("Crawler task not found: {0}")]
    TaskNotFound(i64),

    #[error("Crawler task {0} is already running")]
    TaskAlreadyRunning(i64),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<RunError> for ServiceError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::TaskNotFound(id) => ServiceError::TaskNotFound(id),
            RunError::TaskAlreadyRunning(id) => ServiceError::TaskAlreadyRunning(id),
        }
    }
}

/// Informational robots.txt verdict for a URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RobotsCheck {
    pub allowed: bool,
    pub message: String,
}

/// Input for creating a task
#[derive(Debug, Clone, Default)]
pub struct CreateTaskRequest {
    pub name: String,

    /// Primary URL first
    pub urls: Vec<String>,

    pub site_config: Option<Value>,
    pub schedule: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedTask {
    pub task_id: i64,
    pub robots_check: RobotsCheck,
}

/// Entry point for everything the CLI does with tasks
pub struct CrawlerService {
    stores: Stores,
    robots: Arc<RobotsPolicyCache>,
    runner: Arc<CrawlTaskRunner>,
    metrics: MetricsCollector,
}

impl CrawlerService {
    pub fn new(
        stores: Stores,
        robots: Arc<RobotsPolicyCache>,
        runner: Arc<CrawlTaskRunner>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            stores,
            robots,
            runner,
            metrics,
        }
    }

    /// Open the configured database and wire every component
    pub async fn from_config(config: &CrawlerConfig) -> anyhow::Result<Self> {
        let store = SqliteStore::connect(&config.storage.database_url).await?;
        let stores = Stores::sqlite(store);
        let metrics = MetricsCollector::new();
        let robots = Arc::new(
            RobotsPolicyCache::new(&config.crawler).context("Failed to create robots.txt cache")?,
        );
        let runner = Arc::new(CrawlTaskRunner::new(&stores, robots.clone(), config, metrics.clone())?);

        Ok(Self::new(stores, robots, runner, metrics))
    }

    /// A scheduler sharing this service's runner and stores
    pub fn scheduler(&self, config: &CrawlerConfig) -> TaskScheduler {
        TaskScheduler::new(
            self.stores.tasks.clone(),
            self.stores.logs.clone(),
            self.runner.clone(),
            config.scheduler.clone(),
            self.metrics.clone(),
        )
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Validate and store a new task. The robots.txt verdict is returned for
    /// information only and never blocks creation.
    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<CreatedTask, ServiceError> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(ServiceError::MissingField("name"));
        }
        let urls = validate_urls(&request.urls)?;

        let robots_check = self.check_robots(&urls[0]).await?;

        // A scheduled task is due right away
        let next_run_at = request.schedule.as_ref().map(|_| Utc::now());

        let task_id = self
            .stores
            .tasks
            .create_task(&NewCrawlTask {
                name: name.to_string(),
                urls,
                site_config: request.site_config,
                schedule: request.schedule,
                next_run_at,
            })
            .await?;

        info!("Created crawler task {}: {}", task_id, name);

        Ok(CreatedTask {
            task_id,
            robots_check,
        })
    }

    /// Start a run in the background; the handle resolves when it ends
    pub async fn run_task_now(&self, task_id: i64) -> Result<RunHandle, ServiceError> {
        self.get_task(task_id).await?;
        Ok(self.runner.dispatch(task_id)?)
    }

    pub async fn check_robots(&self, url: &str) -> Result<RobotsCheck, ServiceError> {
        let url = Url::parse(url).map_err(|_| ServiceError::InvalidUrl(url.to_string()))?;
        let allowed = self.robots.check_url(&url).await;

        let message = if allowed {
            match self.robots.policy(&origin_of(&url)).await.source {
                PolicySource::FailOpen { reason } => {
                    format!("URL is allowed by robots.txt (robots.txt unavailable: {})", reason)
                }
                PolicySource::Fetched => "URL is allowed by robots.txt".to_string(),
            }
        } else {
            "URL is blocked by robots.txt".to_string()
        };

        Ok(RobotsCheck { allowed, message })
    }

    /// The newest audit entries for a task
    pub async fn task_logs(&self, task_id: i64) -> Result<Vec<CrawlLogEntry>, ServiceError> {
        Ok(self.stores.logs.recent_logs(task_id, TASK_LOG_LIMIT).await?)
    }

    pub async fn list_tasks(&self) -> Result<Vec<CrawlTask>, ServiceError> {
        Ok(self.stores.tasks.list_tasks().await?)
    }

    pub async fn get_task(&self, task_id: i64) -> Result<CrawlTask, ServiceError> {
        self.stores
            .tasks
            .find_task_by_id(task_id)
            .await?
            .ok_or(ServiceError::TaskNotFound(task_id))
    }

    pub async fn update_task(&self, task_id: i64, mut changes: TaskChanges) -> Result<CrawlTask, ServiceError> {
        if let Some(name) = changes.name.as_mut() {
            *name = name.trim().to_string();
            if name.is_empty() {
                return Err(ServiceError::MissingField("name"));
            }
        }
        if let Some(urls) = changes.urls.take() {
            changes.urls = Some(validate_urls(&urls)?);
        }

        let existing = self.get_task(task_id).await?;

        if !self.stores.tasks.update_task(task_id, &changes).await? {
            return Err(ServiceError::TaskNotFound(task_id));
        }

        // Newly scheduled tasks become due right away
        if matches!(changes.schedule, Some(Some(_))) && existing.next_run_at.is_none() {
            self.stores.tasks.set_next_run(task_id, Some(Utc::now())).await?;
        }

        self.get_task(task_id).await
    }

    /// Delete a task; its audit entries are kept
    pub async fn delete_task(&self, task_id: i64) -> Result<(), ServiceError> {
        if self.runner.is_running(task_id) {
            return Err(ServiceError::TaskAlreadyRunning(task_id));
        }
        if !self.stores.tasks.delete_task(task_id).await? {
            return Err(ServiceError::TaskNotFound(task_id));
        }
        info!("Deleted crawler task {}", task_id);
        Ok(())
    }

    /// Move a task left `running` by a crashed process back to `pending`.
    /// Returns whether the status changed.
    pub async fn reset_task(&self, task_id: i64) -> Result<bool, ServiceError> {
        if self.runner.is_running(task_id) {
            return Err(ServiceError::TaskAlreadyRunning(task_id));
        }

        let task = self.get_task(task_id).await?;
        if task.status != TaskStatus::Running {
            return Ok(false);
        }

        self.stores
            .tasks
            .update_task_status(task_id, &StatusUpdate::reset())
            .await?;
        info!("Reset stale crawler task {}", task_id);
        Ok(true)
    }
}

/// At least one URL, each absolute http(s)
fn validate_urls(urls: &[String]) -> Result<Vec<String>, ServiceError> {
    if urls.is_empty() {
        return Err(ServiceError::MissingField("url"));
    }

    urls.iter()
        .map(|raw| {
            let trimmed = raw.trim();
            match Url::parse(trimmed) {
                Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {
                    Ok(trimmed.to_string())
                }
                _ => Err(ServiceError::InvalidUrl(raw.clone())),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::runner::RunOutcome;
    use crate::storage::TaskStore;
    use reqwest::Client;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn service() -> (SqliteStore, CrawlerService) {
        let store = SqliteStore::in_memory().await;
        let stores = Stores::sqlite(store.clone());
        let metrics = MetricsCollector::new();
        let mut config = CrawlerConfig::default();
        config.crawler.politeness_delay = 0;

        let robots = Arc::new(RobotsPolicyCache::with_client(Client::new(), "FashionBot", None));
        let runner = Arc::new(CrawlTaskRunner::new(&stores, robots.clone(), &config, metrics.clone()).unwrap());
        (store, CrawlerService::new(stores, robots, runner, metrics))
    }

    async fn robots_server(body: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;
        server
    }

    fn request(name: &str, urls: Vec<String>) -> CreateTaskRequest {
        CreateTaskRequest {
            name: name.to_string(),
            urls,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let (_store, service) = service().await;

        assert!(matches!(
            service.create_task(request("  ", vec!["https://a.example/".into()])).await,
            Err(ServiceError::MissingField("name"))
        ));
        assert!(matches!(
            service.create_task(request("shop", vec![])).await,
            Err(ServiceError::MissingField("url"))
        ));
        assert!(matches!(
            service.create_task(request("shop", vec!["not a url".into()])).await,
            Err(ServiceError::InvalidUrl(_))
        ));
        assert!(matches!(
            service.create_task(request("shop", vec!["ftp://a.example/x".into()])).await,
            Err(ServiceError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_blocked_url_is_still_created() {
        let server = robots_server("User-agent: *\nDisallow: /").await;
        let (store, service) = service().await;

        let created = service
            .create_task(request("shop", vec![format!("{}/list", server.uri())]))
            .await
            .unwrap();

        assert!(!created.robots_check.allowed);
        assert_eq!(created.robots_check.message, "URL is blocked by robots.txt");
        assert!(store.find_task_by_id(created.task_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_scheduled_task_is_due_immediately() {
        let server = robots_server("").await;
        let (store, service) = service().await;

        let mut req = request("daily", vec![format!("{}/list", server.uri())]);
        req.schedule = Some("0 3 * * *".to_string());
        let created = service.create_task(req).await.unwrap();

        assert!(created.robots_check.allowed);
        let due = store.list_tasks_due_for_schedule(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, created.task_id);
    }

    #[tokio::test]
    async fn test_check_robots_reports_fail_open() {
        let server = MockServer::start().await;
        let (_store, service) = service().await;

        let check = service
            .check_robots(&format!("{}/list", server.uri()))
            .await
            .unwrap();
        assert!(check.allowed);
        assert!(check.message.starts_with("URL is allowed by robots.txt (robots.txt unavailable"));

        assert!(matches!(
            service.check_robots("nope").await,
            Err(ServiceError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_run_now_and_logs() {
        let server = robots_server("").await;
        Mock::given(method("GET"))
            .and(path("/list"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;
        let (_store, service) = service().await;

        assert!(matches!(
            service.run_task_now(99).await,
            Err(ServiceError::TaskNotFound(99))
        ));

        let created = service
            .create_task(request("shop", vec![format!("{}/list", server.uri())]))
            .await
            .unwrap();
        let outcome = service.run_task_now(created.task_id).await.unwrap().await.unwrap();
        assert_eq!(outcome, Ok(RunOutcome::Completed { products_found: 0 }));

        let logs = service.task_logs(created.task_id).await.unwrap();
        assert_eq!(logs[0].message, "Crawl completed. Found 0 products.");
        assert_eq!(service.get_task(created.task_id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let server = robots_server("").await;
        let (store, service) = service().await;
        let created = service
            .create_task(request("shop", vec![format!("{}/list", server.uri())]))
            .await
            .unwrap();

        let updated = service
            .update_task(
                created.task_id,
                TaskChanges {
                    name: Some(" renamed ".to_string()),
                    schedule: Some(Some("weekly".to_string())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "renamed");
        assert!(updated.next_run_at.is_some());

        assert!(matches!(
            service
                .update_task(
                    created.task_id,
                    TaskChanges {
                        urls: Some(vec!["bad".to_string()]),
                        ..Default::default()
                    },
                )
                .await,
            Err(ServiceError::InvalidUrl(_))
        ));

        service.delete_task(created.task_id).await.unwrap();
        assert!(store.find_task_by_id(created.task_id).await.unwrap().is_none());
        assert!(matches!(
            service.delete_task(created.task_id).await,
            Err(ServiceError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_stale_running_task() {
        let server = robots_server("").await;
        let (store, service) = service().await;
        let created = service
            .create_task(request("shop", vec![format!("{}/list", server.uri())]))
            .await
            .unwrap();

        assert!(!service.reset_task(created.task_id).await.unwrap());

        store
            .update_task_status(created.task_id, &StatusUpdate::running())
            .await
            .unwrap();
        assert!(service.reset_task(created.task_id).await.unwrap());
        assert_eq!(
            service.get_task(created.task_id).await.unwrap().status,
            TaskStatus::Pending
        );
    }
}
