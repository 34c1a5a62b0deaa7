use anyhow::{Context, Result, bail};
use chunkjoin::stages::{self, CandidatesConfig, ClassifyConfig, EqualityFilter, RescoreConfig};
use chunkjoin::{StageConfig, StageReport, classify};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, error, info, warn};
use simple_logger::SimpleLogger;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "chunkjoin")]
#[command(about = "Chunked broadcast-join record linkage: candidates, rescore, classify.")]
#[command(version)]
struct Cli {
    #[arg(short, long, default_value = "INFO", help = "Logging level (DEBUG, INFO, WARN, ERROR)")]
    log_level: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Score every primary row against the broadcast reference table.
    Candidates {
        #[arg(long, help = "Primary table (first column is the row index)")]
        left: PathBuf,
        #[arg(long, help = "Reference table broadcast to every worker")]
        right: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value_t = stages::candidates::DEFAULT_THRESHOLD)]
        threshold: f64,
        #[arg(long, help = "JSON file with field pairs (defaults to the built-in eight)")]
        fields: Option<PathBuf>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Add string-similarity features to every candidate pair.
    Rescore {
        #[arg(long, help = "Output of the candidates stage")]
        candidates: PathBuf,
        #[arg(long)]
        left: PathBuf,
        #[arg(long)]
        right: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, value_name = "COLUMN=VALUE", help = "Keep only left rows where COLUMN equals VALUE")]
        left_filter: Option<String>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Keep candidate pairs a fitted model scores above the threshold.
    Classify {
        #[arg(long, help = "Output of the rescore stage")]
        scores: PathBuf,
        #[arg(long, help = "JSON logistic model artifact")]
        model: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value_t = stages::classify::DEFAULT_THRESHOLD)]
        threshold: f64,
        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, default_value_t = chunkjoin::config::DEFAULT_CHUNK_SIZE, help = "Rows per chunk")]
    chunk_size: usize,
    #[arg(short, long, default_value = "0", help = "Number of workers (0 for auto)")]
    workers: usize,
    #[arg(long, default_value_t = chunkjoin::config::DEFAULT_MAX_IN_FLIGHT, help = "Maximum chunks in flight")]
    max_in_flight: usize,
    #[arg(long, help = "Stop after this many primary rows")]
    limit: Option<u64>,
    #[arg(long, help = "Reject reference tables larger than this many bytes")]
    broadcast_max_bytes: Option<u64>,
    #[arg(long, help = "Write run metrics as JSON to this path")]
    metrics: Option<PathBuf>,
}

impl RunArgs {
    fn stage_config(&self) -> StageConfig {
        let workers = if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        };
        StageConfig::default()
            .with_chunk_size(self.chunk_size)
            .with_workers(workers)
            .with_max_in_flight(self.max_in_flight)
            .with_row_limit(self.limit)
            .with_broadcast_max_bytes(self.broadcast_max_bytes)
            .with_metrics_path(self.metrics.clone())
    }
}

fn run(command: Command) -> Result<StageReport> {
    match command {
        Command::Candidates {
            left,
            right,
            output,
            threshold,
            fields,
            run,
        } => {
            let mut cfg = CandidatesConfig::new(left, right, output).with_threshold(threshold);
            if let Some(path) = fields {
                cfg = cfg.with_pairs(chunkjoin::transform::candidates::load_field_pairs(&path)?);
            }
            stages::candidates::run(&cfg, &run.stage_config())
        }
        Command::Rescore {
            candidates,
            left,
            right,
            output,
            left_filter,
            run,
        } => {
            let filter = match left_filter {
                Some(s) => match EqualityFilter::parse(&s) {
                    Some(f) => Some(f),
                    None => bail!("--left-filter expects COLUMN=VALUE, got {s:?}"),
                },
                None => None,
            };
            let cfg = RescoreConfig::new(candidates, left, right, output).with_left_filter(filter);
            stages::rescore::run(&cfg, &run.stage_config())
        }
        Command::Classify {
            scores,
            model,
            output,
            threshold,
            run,
        } => {
            let cfg = ClassifyConfig::new(scores, model, output).with_threshold(threshold);
            stages::classify::run(&cfg, &run.stage_config())
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let log_level = match cli.log_level.to_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        _ => {
            eprintln!("Invalid log level '{}', defaulting to INFO.", cli.log_level);
            LevelFilter::Info
        }
    };
    SimpleLogger::new()
        .with_level(log_level)
        .init()
        .context("initialize logger")?;

    match run(cli.command) {
        Ok(report) => {
            info!(
                "{} done: {} rows read, {} chunks, {} rows written in {:.2?}",
                report.stage,
                report.rows_read,
                report.chunks,
                report.rows_written(),
                report.elapsed
            );
            if let Some(path) = &report.failure_manifest {
                warn!(
                    "{} chunks failed; ranges listed in {}",
                    report.failures().len(),
                    path.display()
                );
            }
            println!("{}", serde_json::to_string_pretty(&report.metrics)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            let kind = classify(&e).map_or("error", |s| s.kind());
            error!("{kind}: {e:#}");
            Ok(ExitCode::FAILURE)
        }
    }
}
