use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use tubesift_core::{
    PathRegistry, RunConfig, StageReport, analyze, classify, collect,
    pipeline::{STAGE_ANALYZE, STAGE_CLASSIFY, STAGE_COLLECT, STAGE_SUMMARIZE},
    summarize,
};

#[derive(Parser)]
#[command(name = "tubesift")]
#[command(
    about = "Collect YouTube research data and run checkpointed LLM analysis: summaries, comment analysis, theme classification"
)]
struct Cli {
    /// Project root containing the data/ directory
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Generation model name
    #[arg(short, long)]
    model: Option<String>,

    /// Minimum delay between API requests, in seconds
    #[arg(long, value_name = "SECONDS")]
    request_delay_seconds: Option<f64>,

    /// Retry attempts for transient API errors
    #[arg(long)]
    max_retries: Option<u32>,

    /// Abort the run on the first failed item instead of continuing
    #[arg(long)]
    fail_fast: bool,

    /// Discard the stage checkpoint and reprocess everything
    #[arg(short, long)]
    force: bool,

    /// Checkpoint file override (defaults to data/processed/<stage>_checkpoint.jsonl)
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch video metadata, transcripts, and comments for the video list
    Collect,
    /// Summarize transcripts and extract topics
    Summarize,
    /// Analyze comments for questions and claims
    Analyze,
    /// Classify comments into the theme dictionary
    Classify {
        /// Ask the model for missing themes and update the dictionary
        #[arg(long)]
        update_dictionary: bool,
    },
}

impl Command {
    fn stage(&self) -> &'static str {
        match self {
            Command::Collect => STAGE_COLLECT,
            Command::Summarize => STAGE_SUMMARIZE,
            Command::Analyze => STAGE_ANALYZE,
            Command::Classify { .. } => STAGE_CLASSIFY,
        }
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        format!("{:.0}m {:.0}s", secs / 60.0, secs % 60.0)
    }
}

fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
            .template("{spinner:.cyan} {msg}")
            .unwrap(),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn print_report(report: &StageReport, elapsed: Duration) {
    println!(
        "{} {}: {} processed, {} cached, {} failed {}",
        style("✓").green().bold(),
        report.stage,
        report.summary.succeeded,
        report.summary.skipped,
        report.summary.failed,
        style(format!("[{}]", format_duration(elapsed))).dim()
    );
    if !report.summary.failed_ids.is_empty() {
        println!(
            "  {} {}",
            style("failed:").red(),
            report.summary.failed_ids.join(", ")
        );
    }
    if report.interrupted {
        println!(
            "  {}",
            style("interrupted, rerun the same command to resume").yellow()
        );
    }
    println!(
        "\n{} {}",
        style("Saved:").dim(),
        style(report.output.display()).cyan()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Validate API keys early
    let mut config = match RunConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            std::process::exit(1);
        }
    };
    if matches!(cli.command, Command::Collect)
        && let Err(e) = config.require_youtube_key()
    {
        eprintln!("{} {}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }

    if let Some(model) = cli.model {
        config.model_name = model;
    }
    if let Some(seconds) = cli.request_delay_seconds {
        config.request_delay = Duration::from_secs_f64(seconds.max(0.0));
    }
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }
    config.fail_fast = cli.fail_fast;
    config.checkpoint_path = cli.checkpoint;

    let paths = PathRegistry::new(&cli.data_dir);
    paths.ensure()?;

    if cli.force {
        let checkpoint = config
            .checkpoint_path
            .clone()
            .unwrap_or_else(|| paths.checkpoint_for(cli.command.stage()));
        if checkpoint.exists() {
            std::fs::remove_file(&checkpoint)?;
            println!(
                "{} Discarded checkpoint {}",
                style("✓").green().bold(),
                style(checkpoint.display()).dim()
            );
        }
    }

    // Single ctrl-c turns into the cooperative shutdown signal; the batch
    // finishes flushing the in-flight item before stopping.
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(());
            }
        });
    }

    println!(
        "\n{}  {}\n",
        style("tubesift").cyan().bold(),
        style("YouTube Research Pipeline").dim()
    );

    let start = Instant::now();
    let spinner = create_spinner(&format!("Running {}...", cli.command.stage()));
    let result = match cli.command {
        Command::Collect => collect(&config, &paths, shutdown_rx).await,
        Command::Summarize => summarize(&config, &paths, shutdown_rx).await,
        Command::Analyze => analyze(&config, &paths, shutdown_rx).await,
        Command::Classify { update_dictionary } => {
            classify(&config, &paths, shutdown_rx, update_dictionary).await
        }
    };
    spinner.finish_and_clear();

    match result {
        Ok(report) => {
            print_report(&report, start.elapsed());
            Ok(())
        }
        Err(e) => {
            eprintln!(
                "{} {} (completed items are checkpointed, rerun to resume)",
                style("Error:").red().bold(),
                e
            );
            std::process::exit(1);
        }
    }
}
