//! End-to-end tests with one OS process per rank, driven through the CLI

mod common;

use common::create_temp_dir;
use std::process::Command;

const CLI: &str = env!("CARGO_BIN_EXE_shmforge_cli");

#[test]
fn test_launch_three_processes() {
    let dir = create_temp_dir().unwrap();
    let output = Command::new(CLI)
        .args(["launch", "--name", "mp-launch", "--group-size", "3"])
        .arg("--segment-dir")
        .arg(dir.path())
        .args(["--slot-bytes", "1024", "--p2p-bytes", "512"])
        .args(["--elements", "1000", "--iterations", "3"])
        .args(["--wait-timeout-ms", "60000"])
        .output()
        .expect("failed to run shmforge_cli");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "launch failed\nstdout:\n{}\nstderr:\n{}",
        stdout,
        String::from_utf8_lossy(&output.stderr)
    );

    let reports: Vec<serde_json::Value> = stdout
        .lines()
        .filter(|l| l.starts_with('{'))
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(reports.len(), 3);

    let mut ranks: Vec<i64> = reports.iter().map(|r| r["rank"].as_i64().unwrap()).collect();
    ranks.sort_unstable();
    assert_eq!(ranks, vec![0, 1, 2]);
    for report in &reports {
        assert_eq!(report["ok"], true);
        assert_eq!(report["stats"]["allreduce_calls"], 3);
    }

    // Rank 0 removed the segment on exit
    assert!(!dir.path().join("shmforge-mp-launch").exists());
}

#[test]
fn test_single_process_run() {
    let dir = create_temp_dir().unwrap();
    let output = Command::new(CLI)
        .args(["run", "--rank", "0", "--name", "mp-single", "--group-size", "1"])
        .arg("--segment-dir")
        .arg(dir.path())
        .args(["--elements", "16", "--iterations", "2"])
        .output()
        .expect("failed to run shmforge_cli");
    assert!(output.status.success());
    let report: serde_json::Value =
        serde_json::from_str(String::from_utf8_lossy(&output.stdout).trim()).unwrap();
    assert_eq!(report["ok"], true);
    assert_eq!(report["group_size"], 1);
}

#[test]
fn test_inspect_missing_segment_fails() {
    let dir = create_temp_dir().unwrap();
    let output = Command::new(CLI)
        .args(["inspect", "--name", "does-not-exist"])
        .arg("--segment-dir")
        .arg(dir.path())
        .output()
        .expect("failed to run shmforge_cli");
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn test_invalid_group_size_rejected() {
    let dir = create_temp_dir().unwrap();
    let output = Command::new(CLI)
        .args(["launch", "--group-size", "0"])
        .arg("--segment-dir")
        .arg(dir.path())
        .output()
        .expect("failed to run shmforge_cli");
    assert!(!output.status.success());
}
