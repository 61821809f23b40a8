//! Smoke tests -- verify the binary runs and every subcommand is wired up.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;

fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("trendwatch.toml");
    let db = dir.join("data").join("trendwatch.db");
    std::fs::write(
        &path,
        format!(
            r#"
[engine]
bucket_width_secs = 3600
grace_window = 0
baseline_window_buckets = 4
min_observations = 3
variance_floor = 0.5
soft_threshold = 2.0
hard_threshold = 3.5
cooldown_buckets = 6
safety_blocklist = []

[engine.score_weights]
w_z = 1.0
w_g = 0.3
w_v = 0.2

[storage]
db_path = "{}"

[logging]
level = "warn"
"#,
            db.display()
        ),
    )
    .unwrap();
    path
}

fn trendwatch() -> Command {
    let mut cmd = Command::cargo_bin("trendwatch").unwrap();
    cmd.env_remove("TRENDWATCH_CONFIG");
    cmd
}

#[test]
fn test_cli_help() {
    trendwatch()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Trend detection and alerting engine"));
}

#[test]
fn test_cli_version() {
    trendwatch()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("trendwatch"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["serve", "refresh", "trends", "alerts", "check-config", "prune"] {
        trendwatch().args([sub, "--help"]).assert().success();
    }
}

#[test]
fn test_check_config_prints_effective_config() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path());

    trendwatch()
        .arg("--config")
        .arg(&config)
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("bucket_width_secs = 3600"))
        .stdout(predicate::str::contains("Refreshes in the next 24 hours"));
}

#[test]
fn test_config_from_environment() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path());

    Command::cargo_bin("trendwatch")
        .unwrap()
        .env("TRENDWATCH_CONFIG", &config)
        .args(["trends", "--limit", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No trends recorded yet."));
}

#[test]
fn test_missing_config_fails() {
    let dir = tempfile::TempDir::new().unwrap();

    trendwatch()
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg("check-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read config file"));
}

#[test]
fn test_invalid_config_fails() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path());
    let content = std::fs::read_to_string(&config)
        .unwrap()
        .replace("hard_threshold = 3.5", "hard_threshold = 1.0");
    std::fs::write(&config, content).unwrap();

    trendwatch()
        .arg("--config")
        .arg(&config)
        .arg("check-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("engine.hard_threshold"));
}

#[test]
fn test_refresh_trends_and_alerts() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path());
    let items = dir.path().join("items.jsonl");

    let mut lines = String::new();
    for (hour, count) in [10, 11, 9, 10, 52].into_iter().enumerate() {
        for i in 0..count {
            lines.push_str(&format!(
                "{{\"source\":\"reddit\",\"entity_ids\":[\"gizmo\"],\"timestamp\":\"2024-03-01T{:02}:00:{:02}Z\"}}\n",
                hour,
                i % 60
            ));
        }
    }
    std::fs::write(&items, lines).unwrap();

    trendwatch()
        .arg("--config")
        .arg(&config)
        .arg("refresh")
        .arg("--items")
        .arg(&items)
        .args(["--now", "2024-03-01T05:00:00Z", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"success\""))
        .stdout(predicate::str::contains("\"entity_id\": \"gizmo\""));

    trendwatch()
        .arg("--config")
        .arg(&config)
        .arg("trends")
        .assert()
        .success()
        .stdout(predicate::str::contains("gizmo"));

    trendwatch()
        .arg("--config")
        .arg(&config)
        .args(["alerts", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"severity\": \"viral\""));

    trendwatch()
        .arg("--config")
        .arg(&config)
        .args(["prune", "--days", "30"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Pruned"));
}
