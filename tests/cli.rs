//! End-to-end command tests against a throwaway config directory.

use assert_cmd::Command;
use predicates::prelude::*;
use serial_test::serial;
use std::path::Path;
use tempfile::TempDir;

struct Sandbox {
    home: TempDir,
    runtime: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let sandbox = Self {
            home: tempfile::tempdir().unwrap(),
            runtime: tempfile::tempdir().unwrap(),
        };
        std::fs::write(
            sandbox.home.path().join("AffinityTypes.txt"),
            "Normal:ff\nPinball:fe\nGame:0a\n",
        )
        .unwrap();
        sandbox
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("pinaffinity").unwrap();
        cmd.env("PINAFFINITY_HOME", self.home.path())
            .env("PINAFFINITY_RUNTIME_DIR", self.runtime.path())
            .env_remove("RUST_LOG");
        cmd
    }

    fn policies(&self) -> String {
        std::fs::read_to_string(self.home.path().join("SavedProcesses.txt")).unwrap_or_default()
    }

    fn lock_file(&self) -> std::path::PathBuf {
        self.runtime.path().join("pinaffinity.lock")
    }
}

#[test]
fn add_set_remove_round_trip() {
    let sandbox = Sandbox::new();

    sandbox
        .cmd()
        .args(["add", "game.exe", "tool.exe"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Added"));
    assert_eq!(sandbox.policies(), "game.exe:Pinball\ntool.exe:Pinball\n");

    sandbox
        .cmd()
        .args(["set", "Game.exe", "game"])
        .assert()
        .success();
    assert_eq!(sandbox.policies(), "game.exe:Game\ntool.exe:Pinball\n");

    sandbox
        .cmd()
        .args(["remove", "tool.exe"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed"));
    assert_eq!(sandbox.policies(), "game.exe:Game\n");

    sandbox
        .cmd()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("game.exe").and(predicate::str::contains("0xa")));
}

#[test]
fn add_keeps_existing_type() {
    let sandbox = Sandbox::new();
    std::fs::write(sandbox.home.path().join("SavedProcesses.txt"), "game.exe:Game\n").unwrap();
    sandbox
        .cmd()
        .args(["add", "GAME.EXE"])
        .assert()
        .success()
        .stdout(predicate::str::contains("already saved"));
    assert_eq!(sandbox.policies(), "game.exe:Game\n");
}

#[test]
fn unknown_type_is_rejected() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["set", "game.exe", "Turbo"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Turbo"));
    assert!(!sandbox.home.path().join("SavedProcesses.txt").exists());
}

#[test]
fn invalid_program_name_is_rejected() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["add", "bad:name.exe"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Validation"));
}

#[test]
fn list_without_programs() {
    Sandbox::new()
        .cmd()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No saved programs"));
}

#[test]
fn types_lists_catalog() {
    Sandbox::new()
        .cmd()
        .arg("types")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("Normal")
                .and(predicate::str::contains("Pinball"))
                .and(predicate::str::contains("0xa")),
        );
}

#[test]
fn status_shows_saved_program_without_instance() {
    let sandbox = Sandbox::new();
    std::fs::write(
        sandbox.home.path().join("SavedProcesses.txt"),
        "no-such-program-4c1d.exe:Game\n",
    )
    .unwrap();
    sandbox
        .cmd()
        .args(["status", "--saved-only"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no-such-program-4c1d.exe"));
}

#[test]
#[serial]
fn second_run_defers_to_the_running_instance() {
    let sandbox = Sandbox::new();
    // This test process stands in for the live holder
    write_lock(&sandbox.lock_file(), std::process::id());

    sandbox
        .cmd()
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(
            "already running (pid {})",
            std::process::id()
        )));
    assert!(sandbox.lock_file().exists());
}

#[test]
fn settings_can_relocate_the_policy_file() {
    let sandbox = Sandbox::new();
    let custom = sandbox.home.path().join("elsewhere").join("mine.txt");
    std::fs::write(
        sandbox.home.path().join("settings.json"),
        serde_json::json!({ "policies_file": custom }).to_string(),
    )
    .unwrap();

    sandbox.cmd().args(["add", "game.exe"]).assert().success();
    assert_eq!(std::fs::read_to_string(&custom).unwrap(), "game.exe:Pinball\n");
    assert!(!sandbox.home.path().join("SavedProcesses.txt").exists());
}

fn write_lock(path: &Path, pid: u32) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, pid.to_string()).unwrap();
}
