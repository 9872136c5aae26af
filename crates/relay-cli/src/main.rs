//! Relay command-line entrypoint.

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod handlers;
mod poller;
mod shell;

use commands::Commands;
use handlers::ForceArgs;

#[derive(Parser)]
#[command(name = "relay")]
#[command(author, version, about = "Relay build pipeline orchestrator", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Commands::Validate { config } => handlers::validate(&config)?,
        Commands::Graph { config, format } => handlers::graph(&config, format)?,
        Commands::Schema => handlers::schema()?,
        Commands::Force {
            config,
            project,
            what,
            reason,
            clean,
            package,
            dry_run,
        } => {
            handlers::force(
                &config,
                ForceArgs {
                    project,
                    what,
                    reason,
                    clean,
                    package,
                    dry_run,
                },
            )
            .await?
        }
        Commands::Serve { config, dry_run } => handlers::serve(&config, dry_run).await?,
    }

    Ok(())
}
