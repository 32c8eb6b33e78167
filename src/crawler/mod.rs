pub mod extractor;
pub mod fetcher;
pub mod persister;
pub mod robots;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod task;

// Re-export common types
pub use runner::RunOutcome;
pub use service::CrawlerService;
