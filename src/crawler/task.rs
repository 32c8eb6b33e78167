use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a crawl task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Whether a run has finished, successfully or not
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => anyhow::bail!("Unknown task status: {}", other),
        }
    }
}

/// A configured crawl target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlTask {
    pub id: i64,

    /// Display name shown to administrators
    pub name: String,

    /// Primary target URL
    pub url: String,

    /// Further target URLs, crawled after the primary one in order
    pub extra_urls: Vec<String>,

    /// Site-specific extraction overrides, passed through to the extractor
    pub site_config: Option<Value>,

    /// Recurrence rule; tasks without one are only run on demand
    pub schedule: Option<String>,

    pub status: TaskStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,

    /// Products saved by the most recent successful run
    pub products_found: i64,

    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CrawlTask {
    /// All target URLs in crawl order, primary first
    pub fn target_urls(&self) -> Vec<String> {
        let mut urls = Vec::with_capacity(1 + self.extra_urls.len());
        urls.push(self.url.clone());
        urls.extend(self.extra_urls.iter().cloned());
        urls
    }
}

/// Data needed to insert a new task
#[derive(Debug, Clone, Default)]
pub struct NewCrawlTask {
    pub name: String,
    pub urls: Vec<String>,
    pub site_config: Option<Value>,
    pub schedule: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Administrative edits to a task; `None` leaves a field untouched
#[derive(Debug, Clone, Default)]
pub struct TaskChanges {
    pub name: Option<String>,
    pub urls: Option<Vec<String>>,
    pub site_config: Option<Option<Value>>,
    pub schedule: Option<Option<String>>,
}

/// A status transition written by the runner in a single statement
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: TaskStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub products_found: Option<i64>,

    /// `None` keeps the stored message, `Some(None)` clears it
    pub error_message: Option<Option<String>>,
}

impl StatusUpdate {
    pub fn running() -> Self {
        Self {
            status: TaskStatus::Running,
            last_run_at: None,
            products_found: None,
            error_message: None,
        }
    }

    pub fn completed(at: DateTime<Utc>, products_found: i64) -> Self {
        Self {
            status: TaskStatus::Completed,
            last_run_at: Some(at),
            products_found: Some(products_found),
            error_message: Some(None),
        }
    }

    pub fn failed(at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            last_run_at: Some(at),
            products_found: Some(0),
            error_message: Some(Some(message.into())),
        }
    }

    pub fn reset() -> Self {
        Self {
            status: TaskStatus::Pending,
            last_run_at: None,
            products_found: None,
            error_message: None,
        }
    }
}

/// Severity of an audit log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => anyhow::bail!("Unknown log level: {}", other),
        }
    }
}

/// Immutable audit record written during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlLogEntry {
    pub id: i64,
    pub task_id: i64,
    pub level: LogLevel,
    pub message: String,

    /// Extra context such as the offending URL
    pub detail: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// An audit record about to be appended
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub task_id: i64,
    pub level: LogLevel,
    pub message: String,
    pub detail: Option<String>,
}

impl NewLogEntry {
    pub fn new(task_id: i64, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            task_id,
            level,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// An extracted product not yet persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateProduct {
    pub name: String,
    pub price: f64,
    pub image: Option<String>,

    /// Product link, or the listing page when the tile has none
    pub external_url: String,

    /// Hostname of the listing page
    pub source_site: String,

    pub category: Option<String>,
}

/// A crawler-sourced catalog record as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogProduct {
    pub id: i64,
    pub name: String,
    pub category: String,
    pub price: f64,
    pub currency: String,
    pub images: Vec<String>,
    pub external_url: Option<String>,
    pub source_site: Option<String>,
    pub stock_status: String,
    pub is_featured: bool,
    pub crawl_metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// A catalog record about to be inserted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewCatalogProduct {
    pub name: String,
    pub category: String,
    pub price: f64,
    pub currency: String,
    pub images: Vec<String>,
    pub external_url: String,
    pub source_site: String,
    pub stock_status: String,
    pub is_featured: bool,
    pub crawl_metadata: Value,
}
