//! Integration tests for the al-runner CLI.
//!
//! Runs the built binary on small synthetic experiments; no dataset files needed.

use std::path::Path;
use std::process::Command;

fn runner() -> Command {
    Command::new(env!("CARGO_BIN_EXE_al-runner"))
}

fn run_tiny(output_dir: &Path, extra: &[&str]) -> std::process::Output {
    runner()
        .args(["run", "--output-dir"])
        .arg(output_dir)
        .args([
            "--synthetic-size",
            "80",
            "--synthetic-test-size",
            "20",
            "--synthetic-classes",
            "4",
            "--synthetic-dim",
            "6",
            "--trials",
            "2",
            "--cycles",
            "2",
            "--epochs",
            "2",
            "--initial-query",
            "16",
            "--addendum",
            "8",
            "--subset-size",
            "24",
            "--batch-size",
            "8",
        ])
        .args(extra)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to launch al-runner")
}

#[test]
fn test_run_then_summary() {
    let tmp = tempfile::TempDir::new().unwrap();
    let out = run_tiny(tmp.path(), &[]);
    assert!(out.status.success(), "run failed: {}", String::from_utf8_lossy(&out.stderr));

    let report: serde_json::Value =
        serde_json::from_reader(std::fs::File::open(tmp.path().join("report.json")).unwrap()).unwrap();
    let trials = report["trials"].as_array().unwrap();
    assert_eq!(trials.len(), 2);
    for trial in trials {
        assert_eq!(trial["labeled_sizes"], serde_json::json!([16, 24]));
        assert_eq!(trial["final_labeled"], 32);
        assert_eq!(trial["exhausted"], false);
    }
    assert!(tmp.path().join("checkpoints/trial_1/loss_net.mpk").exists());

    let summary = runner()
        .args(["summary", "--json", "--input"])
        .arg(tmp.path().join("report.json"))
        .output()
        .unwrap();
    assert!(summary.status.success());
    let rows: serde_json::Value = serde_json::from_slice(&summary.stdout).unwrap();
    assert_eq!(rows.as_array().unwrap().len(), 2);
    assert_eq!(rows[1]["mean_labeled"], 24.0);
}

#[test]
fn test_config_file_and_overrides() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = tmp.path().join("experiment.toml");
    std::fs::write(
        &config,
        "[experiment]\nmetric_loss = \"NTXentLoss\"\ndistillation = true\n[model]\nstage_dims = [12, 12, 8, 8]\ninterm_dim = 4\n",
    )
    .unwrap();

    let out = run_tiny(tmp.path(), &["--config", config.to_str().unwrap(), "--ranking-loss", "SmoothL1"]);
    assert!(out.status.success(), "run failed: {}", String::from_utf8_lossy(&out.stderr));

    let report: serde_json::Value =
        serde_json::from_reader(std::fs::File::open(tmp.path().join("report.json")).unwrap()).unwrap();
    assert_eq!(report["config"]["metric_loss"], "NTXent");
    assert_eq!(report["config"]["ranking_loss"], "SmoothL1");
    assert_eq!(report["config"]["distillation"], true);
}

#[test]
fn test_invalid_configuration_exits_with_error() {
    let tmp = tempfile::TempDir::new().unwrap();
    let out = run_tiny(tmp.path(), &["--addendum", "40"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("exceeds subset_size"), "stderr: {stderr}");
    assert!(!tmp.path().join("report.json").exists());
}

#[test]
fn test_unknown_metric_loss_flag_is_rejected() {
    let tmp = tempfile::TempDir::new().unwrap();
    let out = run_tiny(tmp.path(), &["--metric-loss", "ArcFace"]);
    assert!(!out.status.success());
}
