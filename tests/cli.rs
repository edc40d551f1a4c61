use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn vmfleet() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("vmfleet").unwrap()
}

const CONFIG: &str = r#"
[retention]
tick_interval_secs = 30
boot_wait_secs = 10

[[hypervisors]]
name = "kvm-1"
uri = "qemu+ssh://build@kvm-1/system"
max_online_agents = 2

[[agents]]
name = "linux-builder-1"
hypervisor = "kvm-1"
vm_name = "linux-builder-1"
snapshot = "clean"

[[agents]]
name = "linux-builder-2"
hypervisor = "kvm-1"
vm_name = "linux-builder-2"
shutdown_method = "suspend"

[[agents]]
name = "windows-builder"
hypervisor = "kvm-1"
vm_name = "win-builder"
"#;

const SCENARIO: &str = r#"{
  "now": "2026-01-01T12:00:00Z",
  "computers": [
    {"name": "linux-builder-1", "online": true, "idle": true, "partially_idle": true,
     "accepting_tasks": true, "idle_executors": 1, "idle_since": "2026-01-01T10:00:00Z",
     "vm": {"hypervisor": "kvm-1", "vm_name": "linux-builder-1"}},
    {"name": "linux-builder-2", "online": true, "accepting_tasks": true,
     "vm": {"hypervisor": "kvm-1", "vm_name": "linux-builder-2"}},
    {"name": "windows-builder", "vm": {"hypervisor": "kvm-1", "vm_name": "win-builder"}}
  ],
  "items": [
    {"id": "msvc-build", "runs_on": ["windows-builder"]}
  ]
}"#;

fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_help_exits_successfully() {
    vmfleet().arg("--help").assert().success();
}

#[test]
fn test_version_exits_successfully() {
    vmfleet()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("vmfleet"));
}

#[test]
fn test_no_args_shows_usage() {
    vmfleet()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_unknown_subcommand_fails() {
    vmfleet()
        .arg("nonexistent")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_help_lists_all_subcommands() {
    let assert = vmfleet().arg("--help").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();

    for cmd in ["check-config", "simulate"] {
        assert!(
            output.contains(cmd),
            "Help output should list '{}' subcommand",
            cmd
        );
    }
}

#[test]
fn test_check_config_summarizes_agents() {
    let dir = TempDir::new().unwrap();
    let config = write(&dir, "fleet.toml", CONFIG);

    vmfleet()
        .arg("check-config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK: 1 hypervisor(s), 3 agent(s)"))
        .stdout(predicate::str::contains("linux-builder-2"))
        .stdout(predicate::str::contains("suspend"));
}

#[test]
fn test_check_config_json_output() {
    let dir = TempDir::new().unwrap();
    let config = write(&dir, "fleet.toml", CONFIG);

    let assert = vmfleet()
        .args(["--output", "json", "check-config"])
        .arg(&config)
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let rows: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(rows.as_array().unwrap().len(), 3);
    assert_eq!(rows[0]["snapshot"], "clean");
    assert_eq!(rows[0]["boot_wait_secs"], 10);
}

#[test]
fn test_check_config_rejects_unknown_hypervisor() {
    let dir = TempDir::new().unwrap();
    let bad = CONFIG.replace("hypervisor = \"kvm-1\"\nvm_name = \"win-builder\"", "hypervisor = \"kvm-9\"\nvm_name = \"win-builder\"");
    let config = write(&dir, "fleet.toml", &bad);

    vmfleet()
        .arg("check-config")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("kvm-9"));
}

#[test]
fn test_check_config_missing_file() {
    vmfleet()
        .args(["check-config", "/nonexistent/fleet.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read fleet config"));
}

#[test]
fn test_simulate_table_output() {
    let dir = TempDir::new().unwrap();
    let config = write(&dir, "fleet.toml", CONFIG);
    let scenario = write(&dir, "scenario.json", SCENARIO);

    vmfleet()
        .arg("simulate")
        .arg(&config)
        .arg("--scenario")
        .arg(&scenario)
        .assert()
        .success()
        .stdout(predicate::str::contains("windows-builder"))
        .stdout(predicate::str::contains("reclaim (idle 120m)"))
        .stdout(predicate::str::contains("hold: hypervisor full"));
}

#[test]
fn test_simulate_json_output() {
    let dir = TempDir::new().unwrap();
    let config = write(&dir, "fleet.toml", CONFIG);
    let scenario = write(&dir, "scenario.json", SCENARIO);

    let assert = vmfleet()
        .args(["-o", "json", "simulate"])
        .arg(&config)
        .arg("-s")
        .arg(&scenario)
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let decisions: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let decisions = decisions.as_array().unwrap();
    assert_eq!(decisions.len(), 3);

    let by_agent = |name: &str| {
        decisions
            .iter()
            .find(|d| d["agent"] == name)
            .unwrap()
            .clone()
    };
    let idle = by_agent("linux-builder-1");
    assert_eq!(idle["status"], "online");
    assert_eq!(idle["decision"]["action"], "reclaim");
    assert_eq!(idle["decision"]["detail"]["idle_minutes"], 120);

    assert_eq!(by_agent("linux-builder-2")["decision"]["detail"], "not_idle");
    assert_eq!(by_agent("windows-builder")["decision"]["detail"], "hypervisor_full");
}

#[test]
fn test_simulate_rejects_bad_scenario() {
    let dir = TempDir::new().unwrap();
    let config = write(&dir, "fleet.toml", CONFIG);
    let scenario = write(&dir, "scenario.json", "[1, 2");

    vmfleet()
        .arg("simulate")
        .arg(&config)
        .arg("--scenario")
        .arg(&scenario)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse scenario JSON"));
}
