pub mod commands;
pub mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::cli::config::CrawlerConfig;

#[derive(Parser)]
#[command(author, version, about = "Catalog crawler for product listing pages", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to the per-user config location)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Serve,

    /// Manage crawl tasks
    Task {
        #[command(subcommand)]
        action: TaskCommand,
    },

    /// Run a task now and wait for it to finish
    Run {
        #[arg(required = true)]
        id: i64,
    },

    /// Show the most recent audit entries of a task
    Logs {
        #[arg(required = true)]
        id: i64,
    },

    /// Check whether robots.txt allows crawling a URL
    Robots {
        #[arg(required = true)]
        url: String,
    },

    /// Delete audit entries older than the retention window
    PruneLogs,

    /// Show the effective configuration
    Config {
        /// Write the default configuration file if it does not exist
        #[arg(long)]
        init: bool,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Create a task
    Create {
        #[arg(short, long)]
        name: String,

        /// Target URL; repeat to crawl several pages in order
        #[arg(short, long = "url", required = true)]
        urls: Vec<String>,

        /// Site-specific extraction settings as JSON
        #[arg(long)]
        site_config: Option<String>,

        /// Recurrence rule; scheduled tasks run right away and then daily
        #[arg(short, long)]
        schedule: Option<String>,
    },

    /// List all tasks
    List,

    /// Show one task
    Show {
        #[arg(required = true)]
        id: i64,
    },

    /// Edit a task
    Update {
        #[arg(required = true)]
        id: i64,

        #[arg(short, long)]
        name: Option<String>,

        /// Replacement target URLs
        #[arg(short, long = "url")]
        urls: Vec<String>,

        #[arg(long, conflicts_with = "clear_site_config")]
        site_config: Option<String>,

        #[arg(long)]
        clear_site_config: bool,

        #[arg(short, long, conflicts_with = "clear_schedule")]
        schedule: Option<String>,

        #[arg(long)]
        clear_schedule: bool,
    },

    /// Delete a task, keeping its audit entries
    Delete {
        #[arg(required = true)]
        id: i64,
    },

    /// Return a task stuck in `running` to `pending`
    Reset {
        #[arg(required = true)]
        id: i64,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    if let Commands::Config { init } = cli.command {
        return commands::show_config(cli.config.as_deref(), init);
    }

    let config = CrawlerConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => {
            info!("Starting scheduler");
            commands::serve(&config).await
        }
        Commands::Task { action } => process_task_command(&config, action).await,
        Commands::Run { id } => {
            info!("Running task {}", id);
            commands::run_task(&config, id).await
        }
        Commands::Logs { id } => commands::show_logs(&config, id).await,
        Commands::Robots { url } => commands::check_robots(&config, &url).await,
        Commands::PruneLogs => commands::prune_logs(&config).await,
        Commands::Config { .. } => Ok(()),
    }
}

async fn process_task_command(config: &CrawlerConfig, action: TaskCommand) -> Result<()> {
    match action {
        TaskCommand::Create { name, urls, site_config, schedule } => {
            info!("Creating task {}", name);
            commands::create_task(config, name, urls, site_config, schedule).await
        }
        TaskCommand::List => commands::list_tasks(config).await,
        TaskCommand::Show { id } => commands::show_task(config, id).await,
        TaskCommand::Update {
            id,
            name,
            urls,
            site_config,
            clear_site_config,
            schedule,
            clear_schedule,
        } => {
            let edit = commands::TaskEdit {
                name,
                urls,
                site_config,
                clear_site_config,
                schedule,
                clear_schedule,
            };
            commands::update_task(config, id, edit).await
        }
        TaskCommand::Delete { id } => commands::delete_task(config, id).await,
        TaskCommand::Reset { id } => commands::reset_task(config, id).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_create_accepts_repeated_urls() {
        let cli = Cli::try_parse_from([
            "crawler",
            "task",
            "create",
            "--name",
            "shop",
            "--url",
            "https://shop.example/a",
            "--url",
            "https://shop.example/b",
        ])
        .unwrap();

        match cli.command {
            Commands::Task {
                action: TaskCommand::Create { urls, schedule, .. },
            } => {
                assert_eq!(urls.len(), 2);
                assert_eq!(schedule, None);
            }
            _ => panic!("expected task create"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["crawler", "run", "7", "--verbose", "--config", "c.yaml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("c.yaml")));
        assert!(matches!(cli.command, Commands::Run { id: 7 }));
    }

    #[test]
    fn test_update_rejects_conflicting_schedule_flags() {
        let result = Cli::try_parse_from([
            "crawler",
            "task",
            "update",
            "3",
            "--schedule",
            "daily",
            "--clear-schedule",
        ]);
        assert!(result.is_err());
    }
}
