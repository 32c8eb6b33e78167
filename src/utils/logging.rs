use anyhow::{Context, Result};
use tracing_subscriber::{fmt, EnvFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use std::path::{Path, PathBuf};
use std::fs;

/// Build the filter for the crawler's own targets; `RUST_LOG` still applies
fn build_filter(verbose: bool) -> Result<EnvFilter> {
    let level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("crawler={}", level).parse()?)
        .add_directive("sqlx=warn".parse()?)
        .add_directive("warn".parse()?);

    Ok(filter)
}

/// Initialize the logging system
pub fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let env_filter = build_filter(verbose)?;

    // stdout is reserved for command output
    let fmt_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

    if let Some(log_file) = log_file {
        let file = open_log_file(&log_file)?;
        let file_layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(file);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }

    Ok(())
}

fn open_log_file(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create log directory: {}", parent.display()))?;
        }
    }

    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context(format!("Failed to open log file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_build() {
        assert!(build_filter(true).is_ok());
        assert!(build_filter(false).is_ok());
    }

    #[test]
    fn test_log_file_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("crawler.log");

        drop(open_log_file(&path).unwrap());
        fs::write(&path, "first\n").unwrap();
        drop(open_log_file(&path).unwrap());

        assert_eq!(fs::read_to_string(&path).unwrap(), "first\n");
    }
}
