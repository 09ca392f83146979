mod config;
mod pipeline;
pub mod results;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lloss::{MetricLossKind, RankingLossKind};

use config::ExperimentOverrides;
use pipeline::{RunArgs, SummaryArgs, SyntheticArgs};

/// al-runner: learning-loss active learning experiments.
#[derive(Parser)]
#[command(name = "al-runner", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands for running experiments and summarizing their reports.
#[derive(Subcommand)]
enum Command {
    /// Run trials × cycles of loss-prediction active learning.
    Run {
        /// Path to experiment config TOML file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Training pool as JSON lines (`{"features": [...], "label": k}`).
        /// Synthetic blobs are generated when omitted.
        #[arg(long)]
        train: Option<PathBuf>,
        /// Test set as JSON lines, evaluated after every cycle.
        #[arg(long, requires = "train")]
        test: Option<PathBuf>,
        /// Directory for checkpoints, losses.jsonl and report.json.
        #[arg(long, default_value = "runs/latest")]
        output_dir: PathBuf,
        /// Synthetic training pool size.
        #[arg(long, default_value_t = 5_000)]
        synthetic_size: usize,
        /// Synthetic held-out test set size.
        #[arg(long, default_value_t = 1_000)]
        synthetic_test_size: usize,
        /// Synthetic number of classes.
        #[arg(long, default_value_t = 10)]
        synthetic_classes: usize,
        /// Synthetic feature width.
        #[arg(long, default_value_t = 32)]
        synthetic_dim: usize,
        /// Synthetic per-feature noise half-width.
        #[arg(long, default_value_t = 2.0)]
        synthetic_spread: f32,
        /// Write each cycle's scored subpool to losses.jsonl.
        #[arg(long)]
        log_selection: bool,
        /// Override the number of trials.
        #[arg(long)]
        trials: Option<usize>,
        /// Override the number of cycles per trial.
        #[arg(long)]
        cycles: Option<usize>,
        /// Override the number of epochs per cycle.
        #[arg(long)]
        epochs: Option<usize>,
        /// Override the initial labeled set size.
        #[arg(long)]
        initial_query: Option<usize>,
        /// Override the number of examples acquired per cycle.
        #[arg(long)]
        addendum: Option<usize>,
        /// Override the scored subpool size.
        #[arg(long)]
        subset_size: Option<usize>,
        /// Override the minibatch size.
        #[arg(long)]
        batch_size: Option<usize>,
        /// Override the trial seed offset.
        #[arg(long)]
        seed: Option<u64>,
        /// Override the base learning rate.
        #[arg(long)]
        lr: Option<f64>,
        /// Override the loss-prediction objective (e.g. MarginRanking, MSE, Triplet).
        #[arg(long)]
        ranking_loss: Option<RankingLossKind>,
        /// Override the metric-learning objective (e.g. TripletMargin, NPairs, NCA).
        #[arg(long)]
        metric_loss: Option<MetricLossKind>,
        /// Score and select at the first milestone instead of after the last epoch.
        #[arg(long)]
        mid_cycle_pick: bool,
        /// Enable the distance distillation term.
        #[arg(long)]
        distillation: bool,
    },
    /// Print per-cycle statistics from a report.json.
    Summary {
        /// Path to the report JSON file.
        #[arg(long)]
        input: PathBuf,
        /// Output as JSON instead of human-readable text.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            train,
            test,
            output_dir,
            synthetic_size,
            synthetic_test_size,
            synthetic_classes,
            synthetic_dim,
            synthetic_spread,
            log_selection,
            trials,
            cycles,
            epochs,
            initial_query,
            addendum,
            subset_size,
            batch_size,
            seed,
            lr,
            ranking_loss,
            metric_loss,
            mid_cycle_pick,
            distillation,
        } => {
            let report = pipeline::run_experiment(RunArgs {
                config,
                train,
                test,
                synthetic: SyntheticArgs {
                    train_size: synthetic_size,
                    test_size: synthetic_test_size,
                    classes: synthetic_classes,
                    dim: synthetic_dim,
                    spread: synthetic_spread,
                },
                output_dir,
                log_selection,
                overrides: ExperimentOverrides {
                    trials,
                    cycles,
                    epochs,
                    initial_query,
                    addendum,
                    subset_size,
                    batch_size,
                    seed,
                    lr,
                    ranking_loss,
                    metric_loss,
                    mid_cycle_pick,
                    distillation,
                },
            })?;
            for row in results::summarize_cycles(&report.trials) {
                if let Some(acc) = row.mean_accuracy {
                    tracing::info!(cycle = row.cycle + 1, labeled = row.mean_labeled, "mean test acc {acc:.4}");
                }
            }
            Ok(())
        }
        Command::Summary { input, json } => pipeline::run_summary(SummaryArgs { input, json }),
    }
}
