//! Smoke tests -- verify the binary runs and the store-backed subcommands work.

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

/// Write a config pointing the database into `dir` and return its path.
fn config_in(dir: &TempDir) -> std::path::PathBuf {
    let db = dir.path().join("smartuptime.db");
    let config = dir.path().join("smartuptime.toml");
    std::fs::write(
        &config,
        format!(
            "[storage]\ndb_path = {:?}\n\n[classifier]\ntimeout_ms = 100\n",
            db.display().to_string()
        ),
    )
    .unwrap();
    config
}

fn smartuptime(config: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("smartuptime").unwrap();
    cmd.arg("--config").arg(config).env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("smartuptime")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Uptime monitoring"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("smartuptime")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(contains("smartuptime"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["serve", "--help"],
        vec!["check", "--help"],
        vec!["sites", "add", "--help"],
        vec!["rules", "run", "--help"],
        vec!["executions", "--help"],
        vec!["cleanup", "--help"],
    ] {
        Command::cargo_bin("smartuptime")
            .unwrap()
            .args(&args)
            .assert()
            .success();
    }
}

#[test]
fn test_missing_explicit_config_fails() {
    Command::cargo_bin("smartuptime")
        .unwrap()
        .args(["--config", "/nonexistent/smartuptime.toml", "sites", "list"])
        .assert()
        .failure();
}

#[test]
fn test_site_lifecycle() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    smartuptime(&config)
        .args(["sites", "list"])
        .assert()
        .success()
        .stdout(contains("No sites registered."));

    smartuptime(&config)
        .args(["sites", "add", "https://example.com", "--name", "example"])
        .assert()
        .success()
        .stdout(contains("Site 1 added"));

    smartuptime(&config)
        .args(["sites", "list"])
        .assert()
        .success()
        .stdout(contains("https://example.com"));

    smartuptime(&config)
        .args(["sites", "deactivate", "1"])
        .assert()
        .success();

    smartuptime(&config)
        .args(["sites", "remove", "1"])
        .assert()
        .success()
        .stdout(contains("Site 1 removed."));

    smartuptime(&config)
        .args(["sites", "remove", "1"])
        .assert()
        .failure();
}

#[test]
fn test_rules_seed_then_list() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    smartuptime(&config)
        .args(["rules", "seed"])
        .assert()
        .success()
        .stdout(contains("Seeded 3 default rule(s)."));

    smartuptime(&config)
        .args(["rules", "seed"])
        .assert()
        .success()
        .stdout(contains("nothing seeded"));

    smartuptime(&config)
        .args(["rules", "list"])
        .assert()
        .success()
        .stdout(contains("bash"))
        .stdout(contains("powershell"))
        .stdout(contains("python"));
}

#[test]
fn test_executions_and_cleanup_on_empty_db() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    smartuptime(&config)
        .arg("executions")
        .assert()
        .success()
        .stdout(contains("No executions recorded."));

    smartuptime(&config)
        .arg("cleanup")
        .assert()
        .success()
        .stdout(contains("Removed 0 outcome(s)"));
}
