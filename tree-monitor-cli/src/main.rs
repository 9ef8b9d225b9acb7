//! Print classified change events for a directory tree.
//!
//! Usage: tree-monitor <ROOT> [--ignore-dot-files] [--exclude GLOB]... [--json]

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tree_monitor::{Monitor, MonitorConfig, MonitorEvent};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Directory to monitor. Overrides the root of `--config`.
    root: Option<PathBuf>,

    /// Skip entries whose name starts with a dot.
    #[arg(long)]
    ignore_dot_files: bool,

    /// Glob pattern of paths to skip. May be repeated.
    #[arg(long = "exclude", value_name = "GLOB")]
    exclude: Vec<String>,

    /// Maximum depth below the root.
    #[arg(long)]
    max_depth: Option<usize>,

    /// Follow symbolic links while walking.
    #[arg(long)]
    follow_symlinks: bool,

    /// JSON monitor configuration.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print events as JSON lines.
    #[arg(long)]
    json: bool,
}

impl Cli {
    async fn monitor_config(&self) -> anyhow::Result<MonitorConfig> {
        let mut config = match (&self.config, &self.root) {
            (Some(file), root) => {
                let json = tokio::fs::read_to_string(file)
                    .await
                    .with_context(|| format!("failed to read {}", file.display()))?;
                let mut config = MonitorConfig::from_json(&json)?;
                if let Some(root) = root {
                    config.root = root.clone();
                }
                config
            }
            (None, Some(root)) => MonitorConfig::new(root),
            (None, None) => bail!("a root directory or --config is required"),
        };

        let walk = &mut config.walk;
        walk.ignore_dot_files |= self.ignore_dot_files;
        walk.follow_symlinks |= self.follow_symlinks;
        walk.exclude_patterns.extend(self.exclude.iter().cloned());
        if self.max_depth.is_some() {
            walk.max_depth = self.max_depth;
        }

        config.validate()?;
        Ok(config)
    }
}

fn print_event(event: &MonitorEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
    } else if let Some(new_path) = &event.new_path {
        println!(
            "{}\t{} -> {}",
            event.kind,
            event.path.display(),
            new_path.display()
        );
    } else {
        println!("{}\t{}", event.kind, event.path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.monitor_config().await?;
    let root = config.root.clone();

    let monitor = Monitor::create(config)
        .await
        .with_context(|| format!("failed to monitor {}", root.display()))?;
    let mut events = monitor.events();
    info!("Press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = events.recv() => match received {
                Ok(event) => print_event(&event, cli.json)?,
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {skipped} events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    monitor.stop().await?;
    Ok(())
}
