use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, error};

use crate::cli::config::CatalogSettings;
use crate::crawler::task::{CandidateProduct, NewCatalogProduct};
use crate::storage::{CatalogStore, InsertOutcome};

const STOCK_STATUS: &str = "in_stock";

/// Counts from persisting one batch of candidates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    pub saved: usize,

    /// Candidates whose external URL was already in the catalog
    pub skipped: usize,

    pub failed: usize,

    /// Message of the most recent storage failure
    pub last_error: Option<String>,
}

/// Writes candidates to the catalog, at most one record per external URL
pub struct DeduplicatingPersister {
    catalog: Arc<dyn CatalogStore>,
    defaults: CatalogSettings,
}

impl DeduplicatingPersister {
    pub fn new(catalog: Arc<dyn CatalogStore>, defaults: CatalogSettings) -> Self {
        Self { catalog, defaults }
    }

    /// Persist candidates in order. A failure on one candidate is counted
    /// and the rest of the batch continues.
    pub async fn persist(&self, candidates: &[CandidateProduct], task_id: i64) -> PersistOutcome {
        let mut outcome = PersistOutcome::default();

        for candidate in candidates {
            match self.persist_one(candidate, task_id).await {
                Ok(true) => outcome.saved += 1,
                Ok(false) => outcome.skipped += 1,
                Err(e) => {
                    error!("Failed to save product {}: {:#}", candidate.external_url, e);
                    outcome.failed += 1;
                    outcome.last_error = Some(format!("{}: {:#}", candidate.external_url, e));
                }
            }
        }

        outcome
    }

    /// Returns whether a new record was written
    async fn persist_one(&self, candidate: &CandidateProduct, task_id: i64) -> Result<bool> {
        if self
            .catalog
            .find_product_by_external_url(&candidate.external_url)
            .await?
            .is_some()
        {
            debug!("Skipping known product: {}", candidate.external_url);
            return Ok(false);
        }

        let product = self.catalog_record(candidate, task_id);
        match self.catalog.insert_product(&product).await? {
            InsertOutcome::Inserted(id) => {
                debug!("Saved product {} as {}", candidate.external_url, id);
                Ok(true)
            }
            InsertOutcome::Duplicate => Ok(false),
        }
    }

    fn catalog_record(&self, candidate: &CandidateProduct, task_id: i64) -> NewCatalogProduct {
        NewCatalogProduct {
            name: candidate.name.clone(),
            category: candidate
                .category
                .clone()
                .unwrap_or_else(|| self.defaults.default_category.clone()),
            price: candidate.price,
            currency: self.defaults.default_currency.clone(),
            images: candidate.image.iter().cloned().collect(),
            external_url: candidate.external_url.clone(),
            source_site: candidate.source_site.clone(),
            stock_status: STOCK_STATUS.to_string(),
            is_featured: false,
            crawl_metadata: json!({
                "crawled_at": Utc::now().to_rfc3339(),
                "task_id": task_id,
            }),
        }
    }
}
