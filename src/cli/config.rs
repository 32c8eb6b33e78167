use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct CrawlerConfig {
    pub crawler: CrawlerSettings,
    pub scheduler: SchedulerSettings,
    pub catalog: CatalogSettings,
    pub storage: StorageSettings,
}

/// Crawler-specific settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CrawlerSettings {
    /// Identity sent with every request
    pub user_agent: String,

    /// Token matched against robots.txt `User-agent` groups
    pub robots_agent: String,

    pub politeness_delay: u64, // Delay between URLs of one run in milliseconds
    pub fetch_timeout: u64,    // Page fetch timeout in seconds
    pub robots_timeout: u64,   // robots.txt fetch timeout in seconds
    pub robots_ttl: u64,       // Seconds a cached policy stays fresh, 0 = forever
    pub accept_language: String,
}

/// Longest accepted reschedule offset, 100 years in seconds
pub const MAX_RESCHEDULE_OFFSET: u64 = 100 * 365 * 24 * 60 * 60;

/// Longest accepted audit retention
pub const MAX_LOG_RETENTION_DAYS: i64 = 100 * 365;

/// Scheduler cadence settings, all in seconds
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SchedulerSettings {
    pub tick_interval: u64,
    pub reschedule_offset: u64,
    pub prune_interval: u64,
    pub log_retention_days: i64,
}

/// Defaults applied to crawler-created catalog records
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CatalogSettings {
    pub default_category: String,
    pub default_currency: String,
}

/// Storage settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    pub database_url: String,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (compatible; FashionBot/1.0)".to_string(),
            robots_agent: "FashionBot".to_string(),
            politeness_delay: 2000,
            fetch_timeout: 10,
            robots_timeout: 5,
            robots_ttl: 86400,
            accept_language: "zh-CN,zh;q=0.9,en;q=0.8".to_string(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: 30 * 60,
            reschedule_offset: 24 * 60 * 60,
            prune_interval: 7 * 24 * 60 * 60,
            log_retention_days: 30,
        }
    }
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            default_category: "women".to_string(),
            default_currency: "CNY".to_string(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        let path = CrawlerConfig::data_dir().join("catalog.db");
        Self {
            database_url: format!("sqlite://{}", path.display()),
        }
    }
}

impl CrawlerSettings {
    pub fn politeness_delay(&self) -> Duration {
        Duration::from_millis(self.politeness_delay)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout)
    }

    pub fn robots_timeout(&self) -> Duration {
        Duration::from_secs(self.robots_timeout)
    }

    pub fn robots_ttl(&self) -> Option<Duration> {
        (self.robots_ttl > 0).then(|| Duration::from_secs(self.robots_ttl))
    }
}

impl SchedulerSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval)
    }

    /// Clamped to `MAX_RESCHEDULE_OFFSET`
    pub fn reschedule_offset(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reschedule_offset.min(MAX_RESCHEDULE_OFFSET) as i64)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval)
    }

    /// Clamped to `0..=MAX_LOG_RETENTION_DAYS`
    pub fn log_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.log_retention_days.clamp(0, MAX_LOG_RETENTION_DAYS))
    }

    /// Reject values the scheduler's date arithmetic cannot represent
    pub fn validate(&self) -> Result<()> {
        if self.reschedule_offset > MAX_RESCHEDULE_OFFSET {
            bail!(
                "scheduler.reschedule_offset must be at most {} seconds, got {}",
                MAX_RESCHEDULE_OFFSET,
                self.reschedule_offset
            );
        }

        if !(0..=MAX_LOG_RETENTION_DAYS).contains(&self.log_retention_days) {
            bail!(
                "scheduler.log_retention_days must be between 0 and {}, got {}",
                MAX_LOG_RETENTION_DAYS,
                self.log_retention_days
            );
        }

        Ok(())
    }
}

impl CrawlerConfig {
    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "catalog-crawler", "catalog-crawler")
    }

    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        Self::project_dirs()
            .map(|dirs| dirs.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./config"))
    }

    /// Get the path to the data directory holding the catalog database
    pub fn data_dir() -> PathBuf {
        Self::project_dirs()
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./data"))
    }

    pub fn default_path() -> PathBuf {
        Self::config_dir().join("default.yaml")
    }

    /// Load the configuration from `path`, or the default location when absent.
    /// Environment overrides are applied on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_default()?,
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config
            .scheduler
            .validate()
            .context("Invalid scheduler configuration")?;
        Ok(config)
    }

    /// Load the default configuration, creating it on first use
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_path();

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_to_file(&config_path)?;
            Ok(config)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// Apply `CRAWLER_USER_AGENT`, `CRAWLER_DELAY_MS` and `DATABASE_URL`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(user_agent) = lookup("CRAWLER_USER_AGENT") {
            self.crawler.user_agent = user_agent;
        }

        if let Some(delay) = lookup("CRAWLER_DELAY_MS") {
            self.crawler.politeness_delay = delay
                .trim()
                .parse()
                .context(format!("Invalid CRAWLER_DELAY_MS value: {}", delay))?;
        }

        if let Some(database_url) = lookup("DATABASE_URL") {
            self.storage.database_url = database_url;
        }

        Ok(())
    }
}
