use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use conversa_gateway::db::SourceRepo;
use conversa_gateway::sync::SnapshotStore;
use conversa_gateway::{Config, Daemon};

/// Conversa - chat gateway with synced user context
#[derive(Parser)]
#[command(name = "conversa", version, about)]
struct Cli {
    /// Port to listen on (overrides config)
    #[arg(long, env = "CONVERSA_API_PORT")]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default)
    Serve,
    /// List registered context sources
    Sources,
    /// Print a user's latest context snapshot
    Snapshot {
        /// User ID
        #[arg(short, long)]
        user: String,
    },
    /// Sync every source linked to a user now and print the report
    Sync {
        /// User ID
        #[arg(short, long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,conversa_gateway=info",
        1 => "info,conversa_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    tracing::debug!(
        data_dir = %config.data_dir.display(),
        port = config.server.port,
        sync_enabled = config.sync.enabled,
        "loaded configuration"
    );

    let history_limit = config.sync.snapshot_history_limit;
    let daemon = Daemon::new(config)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            tracing::info!("starting conversa gateway");
            daemon.run().await?;
        }
        Command::Sources => {
            let sources = SourceRepo::new(daemon.db().clone()).list()?;
            if sources.is_empty() {
                println!("No context sources registered");
            }
            for source in sources {
                println!(
                    "{:<24} {:<8} every {:>6}s  {}",
                    source.source_id,
                    if source.enabled { "enabled" } else { "disabled" },
                    source.poll_interval_secs,
                    source.base_url
                );
            }
        }
        Command::Snapshot { user } => {
            let store = SnapshotStore::new(daemon.db().clone(), history_limit);
            match store.get_latest(&user)? {
                Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
                None => println!("No snapshot for {user}"),
            }
        }
        Command::Sync { user } => {
            let report = daemon.sync_once(&user).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
