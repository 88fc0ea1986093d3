use std::{path::Path, time::Duration};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use walrelay::{
    checkpoint::{file::FileCheckpointStore, CheckpointStore},
    relay::supervisor_from_settings,
    settings::{LogFormat, Settings},
    status::StatusBoard,
};

#[doc(hidden)]
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every configured relay until interrupted (default)
    Run,
    /// Print the last persisted status of relays
    Status { relay: Option<String> },
    /// Forget a relay's checkpoint so the next run snapshots its source again
    Reset { relay: String },
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::new(&args.config).context("cannot load config")?;
    init_logging(settings.log_format.unwrap_or_default());
    let state_dir = Path::new(settings.state_dir()).to_path_buf();

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            let mut supervisor = supervisor_from_settings(&settings).await?;
            let flusher = supervisor
                .status_board()
                .flush_periodically(Duration::from_secs(1));
            supervisor.start_all().await?;
            info!("relays running, press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            info!("shutting down");
            flusher.abort();
            supervisor.shutdown().await;
        }
        Command::Status { relay } => {
            let statuses = StatusBoard::load(state_dir.join("status.json")).await?;
            let shown: Vec<_> = statuses
                .iter()
                .filter(|(name, _)| relay.as_ref().map_or(true, |r| r == *name))
                .collect();
            if let Some(r) = &relay {
                if shown.is_empty() {
                    bail!("no status recorded for relay {r}");
                }
            }
            for (name, status) in shown {
                println!("{name}: {}", serde_json::to_string_pretty(status)?);
            }
        }
        Command::Reset { relay } => {
            let Some(cfg) = settings.relays.get(&relay) else {
                bail!("unknown relay {relay}");
            };
            let store = FileCheckpointStore::new(state_dir.join("checkpoints")).await?;
            store.reset(&cfg.source_id()).await?;
            println!("checkpoint of {} reset, next run snapshots it", cfg.source_id());
        }
    }
    Ok(())
}
