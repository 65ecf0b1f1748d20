use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "bolson")]
#[command(about = "Stream newline-delimited JSON into Arrow IPC messages on Pulsar", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert JSONs arriving over TCP until the source disconnects
    Stream,
    /// Convert a newline-delimited JSON file, then exit
    File {
        /// Path to the input file
        path: PathBuf,
    },
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bolson=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Stream => {
            bolson::cli::run::stream(cli.config).await?;
        }
        Commands::File { path } => {
            bolson::cli::run::file(cli.config, path).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Init { stdout } => {
                bolson::cli::config::init(stdout)?;
            }
        },
    }

    Ok(())
}
