use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::BrokerArgs;

#[derive(Parser)]
#[command(name = "rabbit-backup")]
#[command(about = "RabbitMQ queue backup and restore tool", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// YAML configuration file; flags override its values
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(flatten)]
    broker: BrokerArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Drain a queue into compressed archive units
    Backup {
        /// Output directory for archive units (created if missing)
        #[arg(short = 'd', long = "dir")]
        dir: Option<String>,

        /// Messages per archive unit
        #[arg(short, long)]
        batch: Option<usize>,

        /// Compression codec (gzip, zstd, lz4, none)
        #[arg(long)]
        compression: Option<String>,

        /// Compression level (codec default when unset)
        #[arg(long)]
        compression_level: Option<i32>,

        /// Stop after this many seconds without a delivery
        #[arg(long)]
        idle_timeout: Option<u64>,

        /// Also upload each sealed unit to this location (s3://bucket/prefix)
        #[arg(long)]
        upload: Option<String>,
    },

    /// Publish the messages of archive units to an exchange
    Restore {
        /// Archive unit, or directory of units
        #[arg(short = 'f', long = "file")]
        path: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    // Priority: RUST_LOG env var > verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Backup {
            dir,
            batch,
            compression,
            compression_level,
            idle_timeout,
            upload,
        } => {
            let args = commands::backup::BackupArgs {
                dir,
                batch,
                compression,
                compression_level,
                idle_timeout,
                upload,
            };
            commands::backup::run(cli.config.as_deref(), &cli.broker, args).await?;
        }
        Commands::Restore { path } => {
            commands::restore::run(cli.config.as_deref(), &cli.broker, path).await?;
        }
    }

    Ok(())
}
