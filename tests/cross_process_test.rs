//! Locks held by a separate `epochctl` process

use epochguard::config::CoordinationConfig;
use epochguard::sync::{LockAcquired, LockNamespace};
use epochguard::SlotAllocator;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

fn config(dir: &Path) -> CoordinationConfig {
    let mut config = CoordinationConfig::with_base_path(dir.join("data"));
    config.lock_dir = Some(dir.join("locks"));
    config
}

fn write_config(dir: &Path, config: &CoordinationConfig) -> PathBuf {
    let path = dir.join("epochguard.toml");
    std::fs::write(&path, config.to_toml().expect("render config")).expect("write config");
    path
}

fn epochctl(config_path: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_epochctl"));
    cmd.arg("--config").arg(config_path);
    cmd
}

/// Start a holder of slot 0 and wait until it reports the slot
fn spawn_slot_holder(config_path: &Path) -> Child {
    let mut child = epochctl(config_path)
        .args(["slot", "--hold-secs", "60"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn epochctl");

    let stdout = child.stdout.take().expect("child stdout");
    let mut line = String::new();
    BufReader::new(stdout)
        .read_line(&mut line)
        .expect("read child output");
    assert!(
        line.starts_with("slot 0"),
        "child should lead, reported {:?}",
        line
    );
    child
}

#[cfg(unix)]
#[test]
fn test_lock_held_by_other_process_excludes_us() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config(dir.path());
    let config_path = write_config(dir.path(), &config);

    let mut child = spawn_slot_holder(&config_path);

    let namespace = LockNamespace::resolve(&config);
    let slot0 = namespace.open("slot-00");
    let busy = slot0.try_acquire().expect("try slot 0");
    assert!(busy.is_none(), "slot 0 is held by the child");

    let ours = SlotAllocator::new(&config);
    assert_eq!(ours.slot_id(), 1);
    assert!(!ours.is_leader());
    ours.release();

    let child_pid = child.id();
    child.kill().expect("kill child");
    child.wait().expect("reap child");

    let guard = slot0
        .try_acquire()
        .expect("try slot 0")
        .expect("slot 0 free after the holder died");
    assert_eq!(
        guard.acquired(),
        LockAcquired::RecoveredFromAbandoned {
            previous_holder: Some(child_pid)
        }
    );
}

#[cfg(unix)]
#[test]
fn test_killed_leader_hands_slot_zero_to_next_starter() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config(dir.path());
    let config_path = write_config(dir.path(), &config);

    let mut child = spawn_slot_holder(&config_path);
    child.kill().expect("kill child");
    child.wait().expect("reap child");

    let output = epochctl(&config_path)
        .arg("slot")
        .output()
        .expect("run epochctl");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "slot 0 (leader)");
}

#[test]
fn test_epoch_bumps_from_cli_are_visible_in_process() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config(dir.path());
    let config_path = write_config(dir.path(), &config);

    for expected in 1..=3 {
        let output = epochctl(&config_path)
            .args(["epoch", "bump", "instance1"])
            .output()
            .expect("run epochctl");
        assert!(output.status.success());
        assert_eq!(
            String::from_utf8_lossy(&output.stdout).trim(),
            expected.to_string()
        );
    }

    let store = epochguard::InstanceEpochStore::new(&config).expect("epoch store");
    assert_eq!(store.get_epoch("instance1"), 3);
}

#[test]
fn test_config_renders_as_json() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = config(dir.path());
    config.isolation_key = "orders".to_string();
    let config_path = write_config(dir.path(), &config);

    let output = epochctl(&config_path)
        .args(["config", "--json"])
        .output()
        .expect("run epochctl");
    assert!(output.status.success());

    let rendered: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("valid JSON");
    assert_eq!(rendered["isolation_key"], "orders");
    assert_eq!(rendered["stripe_count"], 1024);
    assert_eq!(rendered["resilience"]["backoff"], "exponential");
}
