use std::process::Command;

use crate::common::{TestInventory, assert_contains, assert_path_missing, init_test_logging};

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_rig_help_lists_subcommands() {
    init_test_logging();
    crate::test_log!("TEST START: test_rig_help_lists_subcommands");

    let output = Command::new(env!("CARGO_BIN_EXE_rig"))
        .arg("--help")
        .output()
        .expect("Failed to run rig --help");

    assert!(output.status.success(), "rig --help failed");
    let stdout = stdout(&output);
    for subcommand in ["hosts", "exec", "copy-to", "copy-from", "probe"] {
        assert_contains(&stdout, subcommand);
    }
    crate::test_log!("TEST PASS: test_rig_help_lists_subcommands");
}

#[test]
fn test_hosts_lists_inventory() {
    init_test_logging();
    let inventory = TestInventory::new();

    let output = inventory.run(&["hosts"]);

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let stdout = stdout(&output);
    assert_contains(&stdout, "local1");
    assert_contains(&stdout, "local2");
    assert_contains(&stdout, "el-9-x86_64");
    assert_contains(&stdout, "127.0.0.1");
}

#[test]
fn test_exec_echoes_output() {
    init_test_logging();
    let inventory = TestInventory::new();

    let output = inventory.run(&["exec", "--", "echo", "hello-from-rig"]);

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output).matches("hello-from-rig").count(), 2);
}

#[test]
fn test_exec_parallel_selected_host_with_env() {
    init_test_logging();
    let inventory = TestInventory::new();

    let output = inventory.run(&[
        "exec",
        "--hosts",
        "local2",
        "--parallel",
        "--env",
        "GREETING=hi there",
        "--",
        "printenv",
        "GREETING",
    ]);

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output).trim(), "hi there");
}

#[test]
fn test_exec_failure_exits_nonzero() {
    init_test_logging();
    let inventory = TestInventory::new();

    let output = inventory.run(&["exec", "--hosts", "local1", "--", "false"]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = stderr(&output);
    assert_contains(&stderr, "Command failed");
    assert_contains(&stderr, "host 'local1' exited with 1");
}

#[test]
fn test_exec_accepts_listed_exit_codes() {
    init_test_logging();
    let inventory = TestInventory::new();

    let output = inventory.run(&["exec", "--exit-codes", "0,1", "--", "false"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let output = inventory.run(&["exec", "--accept-all", "--", "false"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
}

#[test]
fn test_dry_run_touches_nothing() {
    init_test_logging();
    let inventory = TestInventory::new();
    let marker = inventory.scratch("marker");
    let marker_arg = marker.to_str().unwrap();

    let output = inventory.run(&["exec", "--dry-run", "--", "touch", marker_arg]);

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_path_missing(&marker);
}

#[test]
fn test_unknown_host_is_rejected() {
    init_test_logging();
    let inventory = TestInventory::new();

    let output = inventory.run(&["exec", "--hosts", "nope", "--", "true"]);

    assert!(!output.status.success());
    assert_contains(&stderr(&output), "host 'nope' is not in the inventory");
}

#[test]
fn test_missing_inventory_is_reported() {
    init_test_logging();
    let inventory = TestInventory::new();
    let missing = inventory.scratch("missing.toml");

    let output = inventory
        .rig()
        .env("RIG_INVENTORY", &missing)
        .arg("hosts")
        .output()
        .expect("Failed to run rig");

    assert!(!output.status.success());
    assert_contains(&stderr(&output), "Failed to load inventory");
}

#[test]
fn test_probe_reports_reachable_hosts() {
    init_test_logging();
    let inventory = TestInventory::new();

    let output = inventory.run(&["probe"]);

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let stdout = stdout(&output);
    assert_contains(&stdout, "local1: reachable");
    assert_contains(&stdout, "local2: reachable");
}

#[test]
fn test_exec_json_summary() {
    init_test_logging();
    let inventory = TestInventory::new();

    let output = inventory.run(&["exec", "--json", "--hosts", "local1", "--", "echo", "hi"]);

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let stdout = stdout(&output);
    let line = stdout.lines().last().expect("no output");
    let summary: serde_json::Value = serde_json::from_str(line).expect("not JSON");
    assert_eq!(summary["host"], "local1");
    assert_eq!(summary["command"], "echo hi");
    assert_eq!(summary["exit_code"], 0);
    assert_eq!(summary["stdout"], "hi\n");
}
