//! Keiba-Stats
//!
//! Batch statistics engine for horse racing entities.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keiba_stats::cli::{self, Cli, Commands};
use keiba_stats::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keiba_stats=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration
    let mut config = AppConfig::load()?;
    if let Some(db) = cli.db {
        config.database.path = db.to_string_lossy().to_string();
    }
    tracing::info!("Database: {}", config.database.path);

    let result = match cli.command {
        Commands::Stats {
            kinds,
            limit,
            resume,
            dry_run,
            full,
            max_batches,
            checkpoint_dir,
            format,
        } => {
            cli::run_stats(
                config,
                kinds,
                limit,
                resume,
                dry_run,
                full,
                max_batches,
                checkpoint_dir,
                format,
            )
            .await
        }
        Commands::Pairs {
            kind,
            min_samples,
            dry_run,
            top,
        } => cli::run_pairs(config, kind, min_samples, dry_run, top),
        Commands::Detect { kinds } => cli::run_detect(config, kinds),
    };

    match result {
        Ok(false) => Ok(()),
        Ok(true) => {
            tracing::warn!("Finished with errors");
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("{:#}", e);
            std::process::exit(1);
        }
    }
}
