pub mod sqlite;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::crawler::task::{
    CatalogProduct, CrawlLogEntry, CrawlTask, NewCatalogProduct, NewCrawlTask, NewLogEntry,
    StatusUpdate, TaskChanges,
};

// Re-export common types
pub use sqlite::SqliteStore;

/// Persistence for crawl task rows
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a task and return its id
    async fn create_task(&self, task: &NewCrawlTask) -> Result<i64>;

    async fn find_task_by_id(&self, id: i64) -> Result<Option<CrawlTask>>;

    /// All tasks, newest first
    async fn list_tasks(&self) -> Result<Vec<CrawlTask>>;

    /// Tasks with a schedule whose next run is at or before `now`
    async fn list_tasks_due_for_schedule(&self, now: DateTime<Utc>) -> Result<Vec<CrawlTask>>;

    async fn update_task_status(&self, id: i64, update: &StatusUpdate) -> Result<()>;

    async fn set_next_run(&self, id: i64, next_run_at: Option<DateTime<Utc>>) -> Result<()>;

    /// Apply administrative edits; returns false when the task does not exist
    async fn update_task(&self, id: i64, changes: &TaskChanges) -> Result<bool>;

    /// Delete a task; its log entries are kept
    async fn delete_task(&self, id: i64) -> Result<bool>;
}

/// Append-only audit trail of crawl runs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append_log(&self, entry: &NewLogEntry) -> Result<()>;

    /// Most recent entries for a task, newest first
    async fn recent_logs(&self, task_id: i64, limit: i64) -> Result<Vec<CrawlLogEntry>>;

    /// Remove entries created before `cutoff`, returning how many were removed
    async fn delete_logs_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Result of inserting a catalog record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),

    /// Another record already owns the external URL
    Duplicate,
}

/// The slice of the catalog the crawler writes to
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find_product_by_external_url(&self, url: &str) -> Result<Option<CatalogProduct>>;

    async fn insert_product(&self, product: &NewCatalogProduct) -> Result<InsertOutcome>;
}

/// The three store seams the crawler writes through
#[derive(Clone)]
pub struct Stores {
    pub tasks: Arc<dyn TaskStore>,
    pub logs: Arc<dyn LogStore>,
    pub catalog: Arc<dyn CatalogStore>,
}

impl Stores {
    /// Back every seam with one SQLite database
    pub fn sqlite(store: SqliteStore) -> Self {
        let store = Arc::new(store);
        Self {
            tasks: store.clone(),
            logs: store.clone(),
            catalog: store,
        }
    }
}
