use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::debug;

use super::{CatalogStore, InsertOutcome, LogStore, TaskStore};
use crate::crawler::task::{
    CatalogProduct, CrawlLogEntry, CrawlTask, NewCatalogProduct, NewCrawlTask, NewLogEntry,
    StatusUpdate, TaskChanges,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS crawler_tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        extra_urls TEXT NOT NULL DEFAULT '[]',
        site_config TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        schedule TEXT,
        last_run_at TEXT,
        next_run_at TEXT,
        products_found INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_crawler_tasks_status ON crawler_tasks(status)",
    "CREATE INDEX IF NOT EXISTS idx_crawler_tasks_next_run ON crawler_tasks(next_run_at)",
    // No foreign key: deleting a task keeps its audit trail
    "CREATE TABLE IF NOT EXISTS crawler_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id INTEGER NOT NULL,
        level TEXT NOT NULL,
        message TEXT NOT NULL,
        detail TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_crawler_logs_task ON crawler_logs(task_id, created_at)",
    "CREATE TABLE IF NOT EXISTS products (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        description TEXT,
        category TEXT NOT NULL,
        price REAL NOT NULL,
        currency TEXT NOT NULL DEFAULT 'CNY',
        images TEXT NOT NULL DEFAULT '[]',
        external_url TEXT,
        source_site TEXT,
        stock_status TEXT NOT NULL DEFAULT 'in_stock',
        is_featured INTEGER NOT NULL DEFAULT 0,
        is_active INTEGER NOT NULL DEFAULT 1,
        crawl_data TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_products_external_url
        ON products(external_url) WHERE external_url IS NOT NULL",
];

const TASK_COLUMNS: &str = "id, name, url, extra_urls, site_config, status, schedule, \
    last_run_at, next_run_at, products_found, error_message, created_at, updated_at";

/// SQLite-backed implementation of every storage seam the crawler needs
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    name: String,
    url: String,
    extra_urls: Json<Vec<String>>,
    site_config: Option<Json<Value>>,
    status: String,
    schedule: Option<String>,
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
    products_found: i64,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for CrawlTask {
    type Error = anyhow::Error;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            name: row.name,
            url: row.url,
            extra_urls: row.extra_urls.0,
            site_config: row.site_config.map(|json| json.0),
            status: row.status.parse()?,
            schedule: row.schedule,
            last_run_at: row.last_run_at,
            next_run_at: row.next_run_at,
            products_found: row.products_found,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    id: i64,
    task_id: i64,
    level: String,
    message: String,
    detail: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<LogRow> for CrawlLogEntry {
    type Error = anyhow::Error;

    fn try_from(row: LogRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            task_id: row.task_id,
            level: row.level.parse()?,
            message: row.message,
            detail: row.detail,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProductRow {
    id: i64,
    name: String,
    category: String,
    price: f64,
    currency: String,
    images: Json<Vec<String>>,
    external_url: Option<String>,
    source_site: Option<String>,
    stock_status: String,
    is_featured: bool,
    crawl_data: Option<Json<Value>>,
    created_at: DateTime<Utc>,
}

impl From<ProductRow> for CatalogProduct {
    fn from(row: ProductRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            category: row.category,
            price: row.price,
            currency: row.currency,
            images: row.images.0,
            external_url: row.external_url,
            source_site: row.source_site,
            stock_status: row.stock_status,
            is_featured: row.is_featured,
            crawl_metadata: row.crawl_data.map(|json| json.0),
            created_at: row.created_at,
        }
    }
}

/// Path of the database file behind a `sqlite:` URL, `None` for in-memory databases
fn database_file(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || database_url.contains("mode=memory") {
        return None;
    }
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);
    let path = path.split('?').next().unwrap_or(path);
    (!path.is_empty()).then(|| PathBuf::from(path))
}

impl SqliteStore {
    /// Open (or create) the database and ensure the schema exists
    pub async fn connect(database_url: &str) -> Result<Self> {
        let file = database_file(database_url);

        if let Some(parent) = file.as_ref().and_then(|path| path.parent()) {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .context(format!("Failed to create database directory: {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .context(format!("Invalid database URL: {}", database_url))?
            .create_if_missing(true);

        // An in-memory database lives exactly as long as its single connection
        let pool_options = if file.is_none() {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .context(format!("Failed to open database: {}", database_url))?;

        let store = Self { pool };
        store.ensure_schema().await?;

        debug!("Connected to catalog database");

        Ok(store)
    }

    /// Ensure all tables and indexes exist
    async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to create catalog schema")?;
        }

        debug!("Ensured catalog schema exists");

        Ok(())
    }

    /// Append a log entry with an explicit timestamp
    pub async fn insert_log_at(&self, entry: &NewLogEntry, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO crawler_logs (task_id, level, message, detail, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entry.task_id)
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(&entry.detail)
        .bind(at)
        .execute(&self.pool)
        .await
        .context(format!("Failed to append log entry for task {}", entry.task_id))?;

        Ok(())
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn create_task(&self, task: &NewCrawlTask) -> Result<i64> {
        let (url, extra_urls) = task
            .urls
            .split_first()
            .context("A crawl task needs at least one URL")?;
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT INTO crawler_tasks
                (name, url, extra_urls, site_config, status, schedule, next_run_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, 'pending', ?, ?, ?, ?)",
        )
        .bind(&task.name)
        .bind(url)
        .bind(Json(extra_urls))
        .bind(task.site_config.as_ref().map(Json))
        .bind(&task.schedule)
        .bind(task.next_run_at)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to insert crawl task")?;

        Ok(result.last_insert_rowid())
    }

    async fn find_task_by_id(&self, id: i64) -> Result<Option<CrawlTask>> {
        let query = format!("SELECT {} FROM crawler_tasks WHERE id = ?", TASK_COLUMNS);

        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context(format!("Failed to load crawl task {}", id))?;

        row.map(CrawlTask::try_from).transpose()
    }

    async fn list_tasks(&self) -> Result<Vec<CrawlTask>> {
        let query = format!(
            "SELECT {} FROM crawler_tasks ORDER BY created_at DESC, id DESC",
            TASK_COLUMNS
        );

        let rows = sqlx::query_as::<_, TaskRow>(&query)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list crawl tasks")?;

        rows.into_iter().map(CrawlTask::try_from).collect()
    }

    async fn list_tasks_due_for_schedule(&self, now: DateTime<Utc>) -> Result<Vec<CrawlTask>> {
        let query = format!(
            "SELECT {} FROM crawler_tasks
             WHERE schedule IS NOT NULL AND next_run_at IS NOT NULL AND next_run_at <= ?
             ORDER BY next_run_at ASC",
            TASK_COLUMNS
        );

        let rows = sqlx::query_as::<_, TaskRow>(&query)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list scheduled crawl tasks")?;

        rows.into_iter().map(CrawlTask::try_from).collect()
    }

    async fn update_task_status(&self, id: i64, update: &StatusUpdate) -> Result<()> {
        let (replace_error, error_message) = match &update.error_message {
            Some(message) => (true, message.clone()),
            None => (false, None),
        };

        sqlx::query(
            "UPDATE crawler_tasks SET
                status = ?1,
                last_run_at = COALESCE(?2, last_run_at),
                products_found = COALESCE(?3, products_found),
                error_message = CASE WHEN ?4 THEN ?5 ELSE error_message END,
                updated_at = ?6
             WHERE id = ?7",
        )
        .bind(update.status.as_str())
        .bind(update.last_run_at)
        .bind(update.products_found)
        .bind(replace_error)
        .bind(error_message)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context(format!("Failed to update status of crawl task {}", id))?;

        Ok(())
    }

    async fn set_next_run(&self, id: i64, next_run_at: Option<DateTime<Utc>>) -> Result<()> {
        sqlx::query("UPDATE crawler_tasks SET next_run_at = ?, updated_at = ? WHERE id = ?")
            .bind(next_run_at)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .context(format!("Failed to set next run of crawl task {}", id))?;

        Ok(())
    }

    async fn update_task(&self, id: i64, changes: &TaskChanges) -> Result<bool> {
        let (url, extra_urls) = match &changes.urls {
            Some(urls) => {
                let (first, rest) = urls
                    .split_first()
                    .context("A crawl task needs at least one URL")?;
                (Some(first.clone()), Some(Json(rest.to_vec())))
            }
            None => (None, None),
        };
        let (replace_config, site_config) = match &changes.site_config {
            Some(config) => (true, config.clone().map(Json)),
            None => (false, None),
        };
        let (replace_schedule, schedule) = match &changes.schedule {
            Some(schedule) => (true, schedule.clone()),
            None => (false, None),
        };

        let result = sqlx::query(
            "UPDATE crawler_tasks SET
                name = COALESCE(?1, name),
                url = COALESCE(?2, url),
                extra_urls = COALESCE(?3, extra_urls),
                site_config = CASE WHEN ?4 THEN ?5 ELSE site_config END,
                schedule = CASE WHEN ?6 THEN ?7 ELSE schedule END,
                next_run_at = CASE WHEN ?6 AND ?7 IS NULL THEN NULL ELSE next_run_at END,
                updated_at = ?8
             WHERE id = ?9",
        )
        .bind(&changes.name)
        .bind(url)
        .bind(extra_urls)
        .bind(replace_config)
        .bind(site_config)
        .bind(replace_schedule)
        .bind(schedule)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context(format!("Failed to update crawl task {}", id))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_task(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM crawler_tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context(format!("Failed to delete crawl task {}", id))?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl LogStore for SqliteStore {
    async fn append_log(&self, entry: &NewLogEntry) -> Result<()> {
        self.insert_log_at(entry, Utc::now()).await
    }

    async fn recent_logs(&self, task_id: i64, limit: i64) -> Result<Vec<CrawlLogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT id, task_id, level, message, detail, created_at
             FROM crawler_logs
             WHERE task_id = ?
             ORDER BY created_at DESC, id DESC
             LIMIT ?",
        )
        .bind(task_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context(format!("Failed to load logs of crawl task {}", task_id))?;

        rows.into_iter().map(CrawlLogEntry::try_from).collect()
    }

    async fn delete_logs_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM crawler_logs WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Failed to prune crawler logs")?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CatalogStore for SqliteStore {
    async fn find_product_by_external_url(&self, url: &str) -> Result<Option<CatalogProduct>> {
        let row = sqlx::query_as::<_, ProductRow>(
            "SELECT id, name, category, price, currency, images, external_url, source_site,
                    stock_status, is_featured, crawl_data, created_at
             FROM products WHERE external_url = ?",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await
        .context(format!("Failed to look up product by URL: {}", url))?;

        Ok(row.map(CatalogProduct::from))
    }

    async fn insert_product(&self, product: &NewCatalogProduct) -> Result<InsertOutcome> {
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT INTO products
                (name, category, price, currency, images, external_url, source_site,
                 stock_status, is_featured, crawl_data, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&product.name)
        .bind(&product.category)
        .bind(product.price)
        .bind(&product.currency)
        .bind(Json(&product.images))
        .bind(&product.external_url)
        .bind(&product.source_site)
        .bind(&product.stock_status)
        .bind(product.is_featured)
        .bind(Json(&product.crawl_metadata))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(InsertOutcome::Inserted(done.last_insert_rowid())),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                debug!("Product already stored by a concurrent run: {}", product.external_url);
                Ok(InsertOutcome::Duplicate)
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("Failed to insert product: {}", product.external_url))),
        }
    }
}

#[cfg(test)]
impl SqliteStore {
    pub async fn in_memory() -> Self {
        Self::connect("sqlite::memory:").await.unwrap()
    }

    pub async fn count_products(&self) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM products")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}
