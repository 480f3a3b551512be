use crate::common::fixtures::write_file;
use crate::common::{
    TestInventory, assert_contains, assert_path_exists, assert_path_missing, init_test_logging,
};

#[test]
fn test_copy_to_honors_ignore_flags() {
    init_test_logging();
    crate::test_log!("TEST START: test_copy_to_honors_ignore_flags");
    let inventory = TestInventory::new();
    let source = inventory.scratch("bundle");
    write_file(&source.join("keep.txt"), "keep");
    write_file(&source.join("lib/util.sh"), "echo util");
    write_file(&source.join(".git/HEAD"), "ref");
    write_file(&source.join("target/debug/app"), "bin");
    let ignore_file = inventory.scratch("ignore.txt");
    write_file(&ignore_file, "# build output\ntarget\n\n");
    let remote = inventory.scratch("remote");

    let output = inventory.run(&[
        "copy-to",
        "--hosts",
        "local1",
        "--ignore",
        ".git",
        "--ignore-file",
        ignore_file.to_str().unwrap(),
        source.to_str().unwrap(),
        remote.to_str().unwrap(),
    ]);

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let landed = remote.join("bundle");
    assert_path_exists(&landed.join("keep.txt"));
    assert_path_exists(&landed.join("lib/util.sh"));
    assert_path_missing(&landed.join(".git"));
    assert_path_missing(&landed.join("target"));
    crate::test_log!("TEST PASS: test_copy_to_honors_ignore_flags");
}

#[test]
fn test_copy_to_missing_source_fails() {
    init_test_logging();
    let inventory = TestInventory::new();
    let missing = inventory.scratch("nothing-here");
    let remote = inventory.scratch("remote");

    let output = inventory.run(&[
        "copy-to",
        missing.to_str().unwrap(),
        remote.to_str().unwrap(),
    ]);

    assert!(!output.status.success());
    assert_contains(
        &String::from_utf8_lossy(&output.stderr),
        "no such file or directory",
    );
    assert_path_missing(&remote);
}

#[test]
fn test_copy_from_splits_by_host() {
    init_test_logging();
    let inventory = TestInventory::new();
    let remote = inventory.scratch("logs");
    write_file(&remote.join("app.log"), "started\n");
    write_file(&remote.join("old/app.log.1"), "rotated\n");
    let fetched = inventory.scratch("fetched");

    let output = inventory.run(&[
        "copy-from",
        remote.to_str().unwrap(),
        fetched.to_str().unwrap(),
    ]);

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    for host in ["local1", "local2"] {
        let dir = fetched.join(host).join("logs");
        assert_eq!(
            std::fs::read_to_string(dir.join("app.log")).unwrap(),
            "started\n"
        );
        assert_path_exists(&dir.join("old/app.log.1"));
    }
}
