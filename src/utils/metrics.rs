use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Crawl counters shared by every run in the process
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    metrics: Arc<Mutex<CrawlMetrics>>,
}

/// Snapshot of the crawl counters
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CrawlMetrics {
    /// Start time of the metrics collection
    pub start_time: DateTime<Utc>,

    pub runs_completed: usize,
    pub runs_failed: usize,

    pub pages_fetched: usize,
    pub fetch_failures: usize,

    /// URLs skipped because robots.txt disallowed them
    pub robots_blocked: usize,

    pub products_saved: usize,
    pub products_skipped: usize,
    pub products_failed: usize,

    /// Fetch durations in milliseconds, keyed by host
    pub fetch_durations: HashMap<String, Vec<u64>>,
}

impl CrawlMetrics {
    /// Mean fetch duration for a host in milliseconds
    pub fn average_fetch_ms(&self, host: &str) -> Option<u64> {
        let durations = self.fetch_durations.get(host)?;
        if durations.is_empty() {
            return None;
        }
        Some(durations.iter().sum::<u64>() / durations.len() as u64)
    }
}

impl fmt::Display for CrawlMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Runs: {} completed, {} failed", self.runs_completed, self.runs_failed)?;
        writeln!(
            f,
            "Pages: {} fetched, {} failed, {} blocked by robots.txt",
            self.pages_fetched, self.fetch_failures, self.robots_blocked
        )?;
        write!(
            f,
            "Products: {} saved, {} duplicates, {} failed",
            self.products_saved, self.products_skipped, self.products_failed
        )?;

        let mut hosts: Vec<&String> = self.fetch_durations.keys().collect();
        hosts.sort();
        for host in hosts {
            if let Some(avg) = self.average_fetch_ms(host) {
                write!(f, "\n  {}: avg {} ms", host, avg)?;
            }
        }

        Ok(())
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        let metrics = CrawlMetrics {
            start_time: Utc::now(),
            ..Default::default()
        };

        Self {
            metrics: Arc::new(Mutex::new(metrics)),
        }
    }

    /// Record a page fetch against its host
    pub async fn record_fetch(&self, host: &str, success: bool, duration_ms: u64) {
        let mut metrics = self.metrics.lock().await;

        if success {
            metrics.pages_fetched += 1;
        } else {
            metrics.fetch_failures += 1;
        }

        metrics.fetch_durations
            .entry(host.to_string())
            .or_default()
            .push(duration_ms);
    }

    pub async fn record_robots_block(&self) {
        self.metrics.lock().await.robots_blocked += 1;
    }

    /// Record the outcome of persisting one page's candidates
    pub async fn record_products(&self, saved: usize, skipped: usize, failed: usize) {
        let mut metrics = self.metrics.lock().await;
        metrics.products_saved += saved;
        metrics.products_skipped += skipped;
        metrics.products_failed += failed;
    }

    pub async fn record_run(&self, success: bool) {
        let mut metrics = self.metrics.lock().await;
        if success {
            metrics.runs_completed += 1;
        } else {
            metrics.runs_failed += 1;
        }
    }

    /// Start timing a fetch
    pub fn start_timer(&self) -> RequestTimer {
        RequestTimer {
            start: Instant::now(),
        }
    }

    pub async fn get_metrics(&self) -> CrawlMetrics {
        self.metrics.lock().await.clone()
    }
}

/// Request timer for measuring fetch durations
pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    /// End timing and get the duration in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
