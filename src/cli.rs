//! CLI commands for keiba-stats.
//!
//! Every command returns whether any error occurred so the binary can set
//! its exit code.

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::availability;
use crate::config::AppConfig;
use crate::external::{ExternalReconstructor, HttpResultsSource};
use crate::pairs::PairAnalyzer;
use crate::runner::{BatchRunner, RunOptions, RunReport};
use crate::storage::StatsRepository;
use crate::types::{EntityKind, PairKind};

#[derive(Parser)]
#[command(name = "keiba-stats")]
#[command(version, about = "Keiba-Stats: statistics aggregation for horses, jockeys, trainers, owners and bloodlines", long_about = None)]
pub struct Cli {
    /// Database path override
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compute and store statistics snapshots
    Stats {
        /// Entity kinds (horse, jockey, trainer, owner, sire, dam, damsire, all)
        #[arg(short, long, value_delimiter = ',', default_value = "horse,jockey,trainer")]
        kinds: Vec<String>,

        /// Maximum entities per kind
        #[arg(short, long)]
        limit: Option<u64>,

        /// Continue from the last checkpoint
        #[arg(long)]
        resume: bool,

        /// Compute without writing snapshots or checkpoints
        #[arg(long)]
        dry_run: bool,

        /// Recompute every entity, not only recently active ones
        #[arg(long)]
        full: bool,

        /// Stop after this many batches per kind
        #[arg(long)]
        max_batches: Option<u32>,

        /// Checkpoint directory override
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Output format (json, table)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Compute combined records of entity pairs
    Pairs {
        /// Pair kind (jockey-horse, trainer-jockey, owner-trainer)
        #[arg(short, long, default_value = "jockey-horse")]
        kind: String,

        /// Minimum runs for a pair to be kept
        #[arg(long)]
        min_samples: Option<u32>,

        /// Compute without replacing stored pairs
        #[arg(long)]
        dry_run: bool,

        /// Number of pairs to print
        #[arg(long, default_value_t = 20)]
        top: usize,
    },

    /// Show which source each kind would use
    Detect {
        /// Entity kinds to check
        #[arg(short, long, value_delimiter = ',', default_value = "all")]
        kinds: Vec<String>,
    },
}

/// Parse `--kinds`, accepting `all`, keeping order and dropping duplicates.
pub fn parse_kinds(raw: &[String]) -> anyhow::Result<Vec<EntityKind>> {
    let mut kinds = Vec::new();
    for name in raw {
        let parsed: Vec<EntityKind> = if name.trim().eq_ignore_ascii_case("all") {
            EntityKind::all().to_vec()
        } else {
            match EntityKind::from_str(name) {
                Some(kind) => vec![kind],
                None => bail!("Unknown entity kind: {}", name),
            }
        };
        for kind in parsed {
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
    }
    if kinds.is_empty() {
        bail!("No entity kinds given");
    }
    Ok(kinds)
}

fn open_repository(config: &AppConfig) -> anyhow::Result<StatsRepository> {
    let path = Path::new(&config.database.path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory {:?}", parent))?;
    }
    StatsRepository::new(path).with_context(|| format!("Failed to open database {:?}", path))
}

/// Run statistics computation.
#[allow(clippy::too_many_arguments)]
pub async fn run_stats(
    mut config: AppConfig,
    kinds: Vec<String>,
    limit: Option<u64>,
    resume: bool,
    dry_run: bool,
    full: bool,
    max_batches: Option<u32>,
    checkpoint_dir: Option<PathBuf>,
    format: String,
) -> anyhow::Result<bool> {
    let kinds = parse_kinds(&kinds)?;
    if let Some(dir) = checkpoint_dir {
        config.engine.checkpoint_dir = dir.to_string_lossy().to_string();
    }

    let repo = open_repository(&config)?;
    let external = HttpResultsSource::from_config(&config.external)?
        .map(|source| ExternalReconstructor::new(Box::new(source), &config.external));
    if external.is_none() {
        tracing::info!("No external results source configured; fallback disabled");
    }

    let runner = BatchRunner::new(&repo, &config, external);
    let cancel = runner.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; stopping after the current batch");
            cancel.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    });

    let options = RunOptions {
        kinds,
        limit,
        resume,
        dry_run,
        full,
        max_batches,
    };
    let report = runner
        .run(&options, Utc::now())
        .await
        .context("Statistics run failed")?;

    match format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        "table" => print_report(&report, dry_run),
        _ => {
            eprintln!("Unknown format: {}. Using table.", format);
            print_report(&report, dry_run);
        }
    }

    Ok(report.has_errors())
}

fn print_report(report: &RunReport, dry_run: bool) {
    if dry_run {
        println!("=== Statistics (dry run) ===");
    } else {
        println!("=== Statistics ===");
    }
    println!(
        "  {:<8} {:<9} {:>9} {:>8} {:>10} {:>7}  {}",
        "kind", "source", "processed", "updated", "unchanged", "errors", "status"
    );
    for k in &report.kinds {
        let status = match (&k.failure, k.completed) {
            (Some(reason), _) => format!("failed: {}", reason),
            (None, true) => "completed".to_string(),
            (None, false) => "incomplete".to_string(),
        };
        println!(
            "  {:<8} {:<9} {:>9} {:>8} {:>10} {:>7}  {}",
            k.kind.name(),
            k.source.map(|s| s.name()).unwrap_or("-"),
            k.processed,
            k.updated,
            k.unchanged,
            k.errors,
            status
        );
    }
    if report.cancelled {
        println!();
        println!("Run interrupted; rerun with --resume to continue");
    }
}

/// Run pair analysis.
pub fn run_pairs(
    config: AppConfig,
    kind: String,
    min_samples: Option<u32>,
    dry_run: bool,
    top: usize,
) -> anyhow::Result<bool> {
    let Some(kind) = PairKind::from_str(&kind) else {
        bail!("Unknown pair kind: {}", kind);
    };
    let min_samples = min_samples.unwrap_or(config.engine.min_pair_samples);

    let repo = open_repository(&config)?;
    let report = PairAnalyzer::new(&repo, min_samples)
        .run(kind, dry_run, Utc::now())
        .context("Pair analysis failed")?;

    println!("=== {} pairs (min {} runs) ===", report.kind, min_samples);
    println!(
        "  {} of {} pairs kept{}",
        report.pairs.len(),
        report.candidates,
        if dry_run { " (dry run, nothing stored)" } else { "" }
    );

    let mut ranked: Vec<_> = report.pairs.iter().collect();
    ranked.sort_by(|a, b| b.wins.cmp(&a.wins).then(b.runs.cmp(&a.runs)));
    for pair in ranked.into_iter().take(top) {
        println!(
            "  {:>10} + {:<10} runs {:>4}  wins {:>3}  win {:>6}  place {:>6}",
            pair.first_id,
            pair.second_id,
            pair.runs,
            pair.wins,
            percent(pair.win_percent),
            percent(pair.place_percent)
        );
    }

    Ok(false)
}

fn percent(value: Option<f64>) -> String {
    value.map(|v| format!("{:.2}%", v)).unwrap_or_else(|| "-".to_string())
}

/// Report the availability decision of each kind.
pub fn run_detect(config: AppConfig, kinds: Vec<String>) -> anyhow::Result<bool> {
    let kinds = parse_kinds(&kinds)?;
    let repo = open_repository(&config)?;

    println!("=== Source availability (threshold {}) ===", config.engine.availability_threshold);
    for kind in kinds {
        let result = availability::detect(&repo, kind, config.engine.availability_threshold)?;
        println!(
            "  {:<8} {:>8} events  {:?}: {}",
            kind.name(),
            result.resulted_events,
            result.decision,
            result.rationale
        );
    }

    Ok(false)
}
