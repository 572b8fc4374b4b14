mod daemon;
mod webhook_server;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use notesync_config::AppConfig;

use crate::daemon::TargetPaths;

#[derive(Debug, Parser)]
#[command(
    name = "notesync",
    version,
    about = "Keep a markdown directory and a Notion page tree in sync"
)]
struct Cli {
    /// Configuration file; a missing file means defaults.
    #[arg(long, global = true, default_value = "config/notesync.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Args)]
struct Target {
    /// Local directory to sync.
    dir: PathBuf,
    /// Id of the Notion page mirroring the directory.
    #[arg(long)]
    root: String,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync once, then keep both sides in sync until interrupted.
    Run(Target),
    /// Run a single two-way sync and exit.
    Sync(Target),
    /// Show the state file and tracked counts for a target.
    Status(Target),
}

/// Stderr output always; a non-blocking file writer when `log_to` is set.
/// The returned guard must live as long as the process logs.
fn init_tracing(level: &str, log_to: Option<&TargetPaths>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match log_to {
        Some(paths) => {
            let appender = tracing_appender::rolling::never(&paths.state_dir, paths.log_file_name());
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()?;
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    match cli.command {
        Commands::Run(target) => {
            let dir = daemon::resolve_dir(&target.dir)?;
            let paths = TargetPaths::new(&config.daemon.state_dir(), &target.root, &dir);
            paths.create_dir()?;
            let _guard = init_tracing(&config.telemetry.log_level, Some(&paths))?;
            daemon::run_daemon(config, dir, target.root, paths).await
        }
        Commands::Sync(target) => {
            init_tracing(&config.telemetry.log_level, None)?;
            let dir = daemon::resolve_dir(&target.dir)?;
            daemon::sync_once(&config, &dir, &target.root).await
        }
        Commands::Status(target) => {
            let dir = daemon::resolve_dir(&target.dir)?;
            daemon::print_status(&config, &dir, &target.root)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_global_config() {
        let cli = Cli::try_parse_from([
            "notesync",
            "run",
            "notes",
            "--root",
            "abc123",
            "--config",
            "custom.toml",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        match cli.command {
            Commands::Run(target) => {
                assert_eq!(target.dir, PathBuf::from("notes"));
                assert_eq!(target.root, "abc123");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn root_is_required() {
        assert!(Cli::try_parse_from(["notesync", "sync", "notes"]).is_err());
    }

    #[test]
    fn config_defaults_to_repo_path() {
        let cli = Cli::try_parse_from(["notesync", "status", "notes", "--root", "r"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("config/notesync.toml"));
    }
}
