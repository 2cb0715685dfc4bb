//! ---
//! ps_section: "15-testing-qa-runbook"
//! ps_subsection: "tests"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Exit code contract of the operator CLI."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use std::fs;
use std::path::Path;

use assert_cmd::Command;
use tempfile::tempdir;

fn ctl(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("provisyncctl").unwrap();
    cmd.current_dir(dir).env_remove("PROVISYNC_CONFIG");
    cmd
}

fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("provisync.toml");
    fs::write(
        &path,
        r#"
[logging]
format = "structured-json"

[targets.edge]
host = "127.0.0.1"
port = 1
connect_timeout = 2

[sources.drop]
kind = "local"
path = "incoming"

[subscriber]
target = "edge"
source = "drop"
"#,
    )
    .unwrap();
    fs::create_dir_all(dir.join("incoming")).unwrap();
    fs::write(
        dir.join("incoming/flows_add.txt"),
        "subscriber@address@action\ns1@10.0.0.1@permit\n",
    )
    .unwrap();
    path
}

#[test]
fn help_exits_zero() {
    let dir = tempdir().unwrap();
    ctl(dir.path()).arg("--help").assert().success();
}

#[test]
fn version_flag_prints_version() {
    let dir = tempdir().unwrap();
    let output = ctl(dir.path()).arg("-V").assert().success().get_output().stdout.clone();
    assert!(String::from_utf8(output).unwrap().starts_with("provisyncctl "));
}

#[test]
fn usage_errors_exit_one() {
    let dir = tempdir().unwrap();
    ctl(dir.path()).args(["run", "everything"]).assert().code(1);
    ctl(dir.path()).arg("frobnicate").assert().code(1);
    ctl(dir.path()).assert().code(1);
}

#[test]
fn missing_configuration_exits_one() {
    let dir = tempdir().unwrap();
    let output = ctl(dir.path())
        .args(["--config", "absent.toml", "history"])
        .assert()
        .code(1)
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8(output).unwrap();
    // logged as an event before any log file exists
    assert!(stderr.contains("ERROR"));
    assert!(stderr.contains("configuration could not be loaded"));
    assert!(!dir.path().join("logs").exists());
}

#[test]
fn history_of_fresh_install_is_empty() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    let output = ctl(dir.path())
        .arg("--config")
        .arg(&config)
        .arg("history")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert!(String::from_utf8(output).unwrap().contains("[]"));
}

#[test]
fn unconfigured_task_exits_one() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    ctl(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["plan", "shaper"])
        .assert()
        .code(1);
}

#[test]
fn unreachable_device_fails_and_is_recorded() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    ctl(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["run", "subscriber"])
        .assert()
        .code(1);

    let log = fs::read_to_string(dir.path().join("history/runs.log")).unwrap();
    assert!(log.contains("\"outcome\":\"failed\""));
    // fetch succeeded before the device was contacted
    assert!(dir.path().join("work/subscriber/raw/flows_add.txt").exists());
}
