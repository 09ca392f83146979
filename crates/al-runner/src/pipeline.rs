//! Experiment pipeline: dataset loading, the active-learning run and report output.

use std::path::PathBuf;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use burn::backend::ndarray::{NdArray, NdArrayDevice};
use burn::backend::Autodiff;
use indicatif::{ProgressBar, ProgressStyle};

use lloss::checkpoint::FileCheckpointSink;
use lloss::data::{Dataset, InMemoryDataset};
use lloss::model::{LossNetConfig, MlpBackbone, MlpBackboneConfig};
use lloss::sink::{JsonlSink, ObservabilitySink, TracingSink};
use lloss::ActiveLearner;

use crate::config::{apply_overrides, load_experiment_toml, ExperimentOverrides, ExperimentToml};
use crate::results::{summarize_cycles, ExperimentReport};

type TrainBackend = Autodiff<NdArray<f32>>;

/// Synthetic data used when no dataset files are given.
#[derive(Debug, Clone)]
pub struct SyntheticArgs {
    pub train_size: usize,
    pub test_size: usize,
    pub classes: usize,
    pub dim: usize,
    pub spread: f32,
}

/// Arguments for the `run` subcommand.
#[derive(Debug)]
pub struct RunArgs {
    /// Experiment TOML. Defaults apply when absent.
    pub config: Option<PathBuf>,
    /// Training pool, JSON lines. Synthetic blobs when absent.
    pub train: Option<PathBuf>,
    /// Test set, JSON lines. With synthetic data a held-out split is used.
    pub test: Option<PathBuf>,
    pub synthetic: SyntheticArgs,
    /// Directory for checkpoints, the loss log and `report.json`.
    pub output_dir: PathBuf,
    /// Also dump every cycle's scored subpool to the loss log.
    pub log_selection: bool,
    pub overrides: ExperimentOverrides,
}

/// Arguments for the `summary` subcommand.
#[derive(Debug)]
pub struct SummaryArgs {
    pub input: PathBuf,
    pub json: bool,
}

/// Wraps a sink and drops selection dumps unless asked for them.
struct LossLog {
    inner: JsonlSink,
    selections: bool,
}

impl ObservabilitySink for LossLog {
    fn record(&mut self, iteration: u64, scalars: &[(&str, f64)]) -> anyhow::Result<()> {
        TracingSink.record(iteration, scalars)?;
        self.inner.record(iteration, scalars)
    }

    fn record_selection(&mut self, trial: usize, cycle: usize, rows: &[lloss::sink::SelectionRow]) -> anyhow::Result<()> {
        if self.selections {
            self.inner.record_selection(trial, cycle, rows)?;
        }
        Ok(())
    }
}

fn load_datasets(args: &RunArgs, seed: u64) -> anyhow::Result<(InMemoryDataset, Option<InMemoryDataset>)> {
    match &args.train {
        Some(path) => {
            let train = InMemoryDataset::from_jsonl(path)?;
            let test = args.test.as_deref().map(InMemoryDataset::from_jsonl).transpose()?;
            Ok((train, test))
        }
        None => {
            let s = &args.synthetic;
            let blobs = InMemoryDataset::gaussian_blobs(s.train_size + s.test_size, s.classes, s.dim, s.spread, seed);
            let (train, test) = blobs.split(s.train_size);
            tracing::info!(
                train = train.len(),
                test = test.len(),
                classes = s.classes,
                dim = s.dim,
                "Generated synthetic blobs"
            );
            Ok((train, (!test.is_empty()).then_some(test)))
        }
    }
}

/// Run the full experiment and write `report.json` into the output directory.
pub fn run_experiment(args: RunArgs) -> anyhow::Result<ExperimentReport> {
    let start = Instant::now();
    let started_at_unix = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();

    // 1. Resolve config: defaults < TOML < CLI
    let toml = match &args.config {
        Some(path) => load_experiment_toml(path)?,
        None => ExperimentToml::default(),
    };
    toml.model.validate()?;
    let mut config = toml.experiment_config();
    apply_overrides(&mut config, &args.overrides);

    // 2. Datasets
    let (train, test) = load_datasets(&args, config.seed)?;
    if train.is_empty() {
        anyhow::bail!("training pool is empty");
    }

    // 3. Sinks
    std::fs::create_dir_all(&args.output_dir)?;
    let loss_log = LossLog {
        inner: JsonlSink::create(&args.output_dir.join("losses.jsonl"))?,
        selections: args.log_selection,
    };
    let checkpoints = FileCheckpointSink::new(args.output_dir.join("checkpoints"));

    // 4. Learner
    let device = NdArrayDevice::default();
    let backbone_config = MlpBackboneConfig::new(train.feature_dim(), train.num_classes())
        .with_stage_dims(toml.model.stage_dims.clone());
    let module_config = LossNetConfig::new(Vec::new()).with_interm_dim(toml.model.interm_dim);
    let factory = move |device: &NdArrayDevice| -> MlpBackbone<TrainBackend> { backbone_config.init(device) };

    let mut learner = ActiveLearner::<TrainBackend, _, _>::new(config.clone(), &train, factory, module_config, device)
        .with_sink(Box::new(loss_log))
        .with_checkpoints(Box::new(checkpoints));
    if let Some(test) = &test {
        learner = learner.with_test_set(test);
    }
    learner.validate()?;

    tracing::info!(
        trials = config.trials,
        cycles = config.cycles,
        pool = train.len(),
        initial_query = config.initial_query,
        addendum = config.addendum,
        subset_size = config.subset_size,
        "Starting active learning"
    );

    // 5. Trials with progress bar
    let pb = ProgressBar::new(config.trials as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} trials ({eta}) {msg}")
            .expect("valid progress bar template")
            .progress_chars("=> "),
    );

    let mut trials = Vec::with_capacity(config.trials);
    for trial in 0..config.trials {
        pb.set_message(format!("trial {}", trial + 1));
        let report = learner.run_trial(trial)?;
        if report.exhausted {
            pb.println(format!(
                "trial {} stopped early: unlabeled pool exhausted at {} labeled",
                trial + 1,
                report.final_labeled
            ));
        }
        trials.push(report);
        pb.inc(1);
    }
    pb.finish_with_message("done");

    let report = ExperimentReport {
        started_at_unix,
        config,
        train_size: train.len(),
        test_size: test.as_ref().map_or(0, |t| t.len()),
        elapsed_secs: start.elapsed().as_secs_f64(),
        trials,
    };

    // 6. Report
    let report_path = args.output_dir.join("report.json");
    serde_json::to_writer_pretty(std::fs::File::create(&report_path)?, &report)?;
    tracing::info!(
        path = %report_path.display(),
        elapsed_secs = format!("{:.1}", report.elapsed_secs),
        "Report written"
    );
    Ok(report)
}

/// Print a per-cycle summary of a `report.json`.
pub fn run_summary(args: SummaryArgs) -> anyhow::Result<()> {
    let file = std::fs::File::open(&args.input)
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", args.input.display()))?;
    let report: ExperimentReport = serde_json::from_reader(std::io::BufReader::new(file))
        .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", args.input.display()))?;
    let rows = summarize_cycles(&report.trials);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    let exhausted = report.trials.iter().filter(|t| t.exhausted).count();
    println!(
        "{} trials, pool {}, test {} ({} exhausted early)",
        report.trials.len(),
        report.train_size,
        report.test_size,
        exhausted
    );
    println!("{:>6} {:>10} {:>10} {:>7}", "cycle", "labeled", "test acc", "trials");
    for row in &rows {
        let acc = row
            .mean_accuracy
            .map(|a| format!("{:.4}", a))
            .unwrap_or_else(|| "-".to_string());
        println!("{:>6} {:>10.1} {:>10} {:>7}", row.cycle + 1, row.mean_labeled, acc, row.trials);
    }
    Ok(())
}
