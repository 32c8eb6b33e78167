use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;
use tracing::{error, info, warn};

use crate::cli::config::CrawlerConfig;
use crate::crawler::service::CreateTaskRequest;
use crate::crawler::task::{CrawlTask, TaskChanges};
use crate::crawler::{CrawlerService, RunOutcome};

/// Field edits collected from `task update`
#[derive(Debug, Default)]
pub struct TaskEdit {
    pub name: Option<String>,
    pub urls: Vec<String>,
    pub site_config: Option<String>,
    pub clear_site_config: bool,
    pub schedule: Option<String>,
    pub clear_schedule: bool,
}

impl TaskEdit {
    fn into_changes(self) -> Result<TaskChanges> {
        let site_config = match (self.site_config, self.clear_site_config) {
            (Some(raw), _) => Some(Some(parse_site_config(&raw)?)),
            (None, true) => Some(None),
            (None, false) => None,
        };

        let schedule = match (self.schedule, self.clear_schedule) {
            (Some(rule), _) => Some(Some(rule)),
            (None, true) => Some(None),
            (None, false) => None,
        };

        Ok(TaskChanges {
            name: self.name,
            urls: (!self.urls.is_empty()).then_some(self.urls),
            site_config,
            schedule,
        })
    }
}

fn parse_site_config(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).context("Site config must be valid JSON")
}

/// Run the scheduler until Ctrl-C
pub async fn serve(config: &CrawlerConfig) -> Result<()> {
    let service = CrawlerService::from_config(config).await?;
    let scheduler = service.scheduler(config);

    scheduler
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    println!("{}", service.metrics().get_metrics().await);
    Ok(())
}

pub async fn create_task(
    config: &CrawlerConfig,
    name: String,
    urls: Vec<String>,
    site_config: Option<String>,
    schedule: Option<String>,
) -> Result<()> {
    let site_config = site_config.as_deref().map(parse_site_config).transpose()?;
    let service = CrawlerService::from_config(config).await?;

    let created = service
        .create_task(CreateTaskRequest {
            name,
            urls,
            site_config,
            schedule,
        })
        .await?;

    if !created.robots_check.allowed {
        warn!("Task {} targets a URL blocked by robots.txt", created.task_id);
    }

    println!("Task created with ID: {}", created.task_id);
    println!("Robots check: {}", created.robots_check.message);
    Ok(())
}

pub async fn list_tasks(config: &CrawlerConfig) -> Result<()> {
    let service = CrawlerService::from_config(config).await?;
    let tasks = service.list_tasks().await?;

    if tasks.is_empty() {
        println!("No crawl tasks");
        return Ok(());
    }

    println!("{:<6} {:<10} {:<10} {:<25} NAME", "ID", "STATUS", "PRODUCTS", "NEXT RUN");
    for task in &tasks {
        let next_run = task
            .next_run_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<6} {:<10} {:<10} {:<25} {}",
            task.id, task.status, task.products_found, next_run, task.name
        );
    }

    Ok(())
}

pub async fn show_task(config: &CrawlerConfig, id: i64) -> Result<()> {
    let service = CrawlerService::from_config(config).await?;
    let task = service.get_task(id).await?;
    print_task(&task);
    Ok(())
}

fn print_task(task: &CrawlTask) {
    println!("Task ID: {}", task.id);
    println!("Name: {}", task.name);
    println!("Status: {}", task.status);
    println!("URLs:");
    for url in task.target_urls() {
        println!("  - {}", url);
    }
    if let Some(schedule) = &task.schedule {
        println!("Schedule: {}", schedule);
    }
    if let Some(site_config) = &task.site_config {
        println!("Site Config: {}", site_config);
    }
    println!("Products Found: {}", task.products_found);
    if let Some(at) = task.last_run_at {
        println!("Last Run: {}", at);
    }
    if let Some(at) = task.next_run_at {
        println!("Next Run: {}", at);
    }
    if let Some(message) = &task.error_message {
        println!("Error: {}", message);
    }
    println!("Created: {}", task.created_at);
    println!("Last Updated: {}", task.updated_at);
}

pub async fn update_task(config: &CrawlerConfig, id: i64, edit: TaskEdit) -> Result<()> {
    let changes = edit.into_changes()?;
    let service = CrawlerService::from_config(config).await?;
    let task = service.update_task(id, changes).await?;

    println!("Task {} updated", id);
    print_task(&task);
    Ok(())
}

pub async fn delete_task(config: &CrawlerConfig, id: i64) -> Result<()> {
    let service = CrawlerService::from_config(config).await?;
    service.delete_task(id).await?;
    println!("Task {} deleted", id);
    Ok(())
}

pub async fn reset_task(config: &CrawlerConfig, id: i64) -> Result<()> {
    let service = CrawlerService::from_config(config).await?;
    if service.reset_task(id).await? {
        println!("Task {} reset to pending", id);
    } else {
        println!("Task {} is not stuck in running; nothing to do", id);
    }
    Ok(())
}

/// Run a task and wait for it, then print the outcome and crawl metrics
pub async fn run_task(config: &CrawlerConfig, id: i64) -> Result<()> {
    let service = CrawlerService::from_config(config).await?;
    let handle = service.run_task_now(id).await?;

    let outcome = handle.await.context("Crawl run aborted")??;
    match outcome {
        RunOutcome::Completed { products_found } => {
            info!("Task {} completed", id);
            println!("Crawl completed. Found {} products.", products_found);
        }
        RunOutcome::Failed { message } => {
            println!("Task failed: {}", message);
        }
    }

    println!("{}", service.metrics().get_metrics().await);
    Ok(())
}

pub async fn show_logs(config: &CrawlerConfig, id: i64) -> Result<()> {
    let service = CrawlerService::from_config(config).await?;
    let logs = service.task_logs(id).await?;

    if logs.is_empty() {
        println!("No log entries for task {}", id);
        return Ok(());
    }

    for entry in &logs {
        let detail = entry
            .detail
            .as_deref()
            .map(|d| format!(" ({})", d))
            .unwrap_or_default();
        println!(
            "{} [{:<7}] {}{}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.level,
            entry.message,
            detail
        );
    }

    Ok(())
}

pub async fn check_robots(config: &CrawlerConfig, url: &str) -> Result<()> {
    let service = CrawlerService::from_config(config).await?;
    let check = service.check_robots(url).await?;
    println!("{}", check.message);
    Ok(())
}

pub async fn prune_logs(config: &CrawlerConfig) -> Result<()> {
    let service = CrawlerService::from_config(config).await?;
    let removed = service.scheduler(config).prune_logs(chrono::Utc::now()).await?;
    println!("Removed {} log entries older than {} days", removed, config.scheduler.log_retention_days);
    Ok(())
}

/// Show the effective configuration, optionally writing the default file first
pub fn show_config(path: Option<&Path>, init: bool) -> Result<()> {
    let target = path.map(Path::to_path_buf).unwrap_or_else(CrawlerConfig::default_path);

    if init {
        if target.exists() {
            println!("Configuration already exists: {}", target.display());
        } else {
            CrawlerConfig::default().save_to_file(&target)?;
            println!("Wrote default configuration to {}", target.display());
        }
    }

    let config = if target.exists() {
        let mut config = CrawlerConfig::load_from_file(&target)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config
    } else {
        let mut config = CrawlerConfig::default();
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config
    };

    println!("Configuration file: {}", target.display());
    print!("{}", serde_yaml::to_string(&config).context("Failed to serialize configuration")?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_edit_maps_clear_flags() {
        let edit = TaskEdit {
            clear_site_config: true,
            clear_schedule: true,
            ..Default::default()
        };
        let changes = edit.into_changes().unwrap();
        assert_eq!(changes.site_config, Some(None));
        assert_eq!(changes.schedule, Some(None));
        assert_eq!(changes.urls, None);
        assert_eq!(changes.name, None);
    }

    #[test]
    fn test_edit_parses_site_config() {
        let edit = TaskEdit {
            site_config: Some(r#"{"tile": ".card"}"#.to_string()),
            urls: vec!["https://shop.example/a".to_string()],
            ..Default::default()
        };
        let changes = edit.into_changes().unwrap();
        assert_eq!(changes.site_config, Some(Some(json!({ "tile": ".card" }))));
        assert_eq!(changes.urls, Some(vec!["https://shop.example/a".to_string()]));

        let bad = TaskEdit {
            site_config: Some("{not json".to_string()),
            ..Default::default()
        };
        assert!(bad.into_changes().is_err());
    }

    #[test]
    fn test_config_init_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crawler.yaml");

        show_config(Some(&path), true).unwrap();
        assert_eq!(CrawlerConfig::load_from_file(&path).unwrap(), CrawlerConfig::default());
    }
}
