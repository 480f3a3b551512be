//! File transfers through a scripted transport.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rig_common::testing::{
    MemorySink, MockCall, MockFailure, MockTransport, MockTransportFactory, init_test_logging,
};
use rig_common::{GlobalOptions, HarnessError, Host, HostConfig, Logger};
use tempfile::TempDir;

fn host_for(platform: &str, options: GlobalOptions) -> (Host, MockTransport, MockTransportFactory) {
    init_test_logging();
    let mock = MockTransport::new();
    let factory = MockTransportFactory::new(mock.clone());
    let mut config = HostConfig::new(platform);
    config.is_cygwin = false;
    config.ip = Some("10.0.0.9".into());
    let host = Host::new(
        "files1",
        config,
        Arc::new(options),
        Logger::new(Arc::new(MemorySink::default())),
    )
    .with_transports(Arc::new(factory.clone()));
    (host, mock, factory)
}

fn linux_host() -> (Host, MockTransport, MockTransportFactory) {
    host_for("el-9-x86_64", GlobalOptions::default())
}

fn ignore(entries: &[&str]) -> Vec<String> {
    entries.iter().map(|e| e.to_string()).collect()
}

/// `payload/` with a kept file, a nested dir and an ignored dir.
fn payload(root: &Path) -> PathBuf {
    let source = root.join("payload");
    fs::create_dir_all(source.join("ignored_dir/deeper")).unwrap();
    fs::create_dir_all(source.join("sub")).unwrap();
    fs::write(source.join("keep.txt"), "keep").unwrap();
    fs::write(source.join("sub/inner.txt"), "inner").unwrap();
    fs::write(source.join("ignored_dir/x.txt"), "x").unwrap();
    fs::write(source.join("ignored_dir/deeper/y.txt"), "y").unwrap();
    source
}

#[tokio::test]
async fn test_ignore_list_skips_matching_tree() {
    let tmp = TempDir::new().unwrap();
    let source = payload(tmp.path());
    let (mut host, mock, _) = linux_host();

    let result = host
        .do_copy_to(&source, "/remote", Some(ignore(&["ignored_dir"]).as_slice()))
        .await
        .unwrap();

    assert_eq!(result.exit_code, Some(0));
    assert!(result.stdout().contains("2 file(s) copied"));
    assert_eq!(
        mock.uploads(),
        vec!["/remote/payload/keep.txt", "/remote/payload/sub/inner.txt"]
    );
    assert_eq!(mock.made_dirs(), vec!["/remote/payload", "/remote/payload/sub"]);
    assert!(mock.calls().iter().all(|call| !format!("{call:?}").contains("ignored_dir")));
    assert_eq!(mock.remote_file("/remote/payload/keep.txt"), Some(b"keep".to_vec()));
}

#[tokio::test]
async fn test_directory_copy_without_ignore_copies_everything() {
    let tmp = TempDir::new().unwrap();
    let source = payload(tmp.path());
    let (mut host, mock, _) = linux_host();

    let result = host.do_copy_to(&source, "/remote/", None).await.unwrap();

    assert_eq!(result.exit_code, Some(0));
    assert_eq!(
        mock.uploads(),
        vec![
            "/remote/payload/ignored_dir/deeper/y.txt",
            "/remote/payload/ignored_dir/x.txt",
            "/remote/payload/keep.txt",
            "/remote/payload/sub/inner.txt",
        ]
    );
}

#[tokio::test]
async fn test_file_copy_uses_target_as_destination() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("app.conf");
    fs::write(&file, "port=80\n").unwrap();
    let (mut host, mock, _) = linux_host();

    host.do_copy_to(&file, "/etc/app/app.conf", None).await.unwrap();

    assert_eq!(mock.uploads(), vec!["/etc/app/app.conf"]);
    assert_eq!(mock.remote_file("/etc/app/app.conf"), Some(b"port=80\n".to_vec()));
}

#[tokio::test]
async fn test_ignored_file_reports_nothing_to_copy() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("secret.key");
    fs::write(&file, "k").unwrap();
    let (mut host, mock, factory) = linux_host();

    let result = host
        .do_copy_to(&file, "/etc/secret.key", Some(ignore(&["secret.key"]).as_slice()))
        .await
        .unwrap();

    assert_eq!(result.exit_code, Some(1));
    assert_eq!(result.stdout(), "No files to copy\n");
    assert!(mock.calls().is_empty());
    assert!(factory.created().is_empty());
}

#[tokio::test]
async fn test_missing_source_fails_before_connecting() {
    let tmp = TempDir::new().unwrap();
    let (mut host, mock, factory) = linux_host();

    let err = host
        .do_copy_to(&tmp.path().join("nope"), "/remote", None)
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::MissingSource(_)));
    assert!(err.to_string().starts_with("no such file or directory - "));
    assert!(mock.calls().is_empty());
    assert!(factory.created().is_empty());
}

#[tokio::test]
async fn test_empty_ignore_list_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let source = payload(tmp.path());
    let (mut host, mock, _) = linux_host();

    let err = host.do_copy_to(&source, "/remote", Some(ignore(&[]).as_slice())).await.unwrap_err();

    assert!(matches!(err, HarnessError::InvalidOption(_)));
    assert!(mock.calls().is_empty());
}

#[tokio::test]
async fn test_dry_run_transfer_does_nothing() {
    let tmp = TempDir::new().unwrap();
    let source = payload(tmp.path());
    let options = GlobalOptions {
        dry_run: true,
        ..GlobalOptions::default()
    };
    let (mut host, mock, factory) = host_for("el-9-x86_64", options);

    let up = host.do_copy_to(&source, "/remote", None).await.unwrap();
    let down = host
        .do_copy_from("/var/log/app", &tmp.path().join("logs"))
        .await
        .unwrap();

    assert!(up.stdout().contains("not executed"));
    assert!(down.stdout().contains("not executed"));
    assert!(mock.calls().is_empty());
    assert!(factory.created().is_empty());
    assert!(!tmp.path().join("logs").exists());
}

#[tokio::test]
async fn test_windows_paths_use_backslash() {
    let tmp = TempDir::new().unwrap();
    let source = payload(tmp.path());
    let (mut host, mock, _) = host_for("windows-2019-64", GlobalOptions::default());

    host.do_copy_to(&source, "C:\\stage", Some(ignore(&["ignored_dir"]).as_slice()))
        .await
        .unwrap();

    assert_eq!(
        mock.uploads(),
        vec![
            "C:\\stage\\payload\\keep.txt",
            "C:\\stage\\payload\\sub\\inner.txt"
        ]
    );
    assert_eq!(
        mock.made_dirs(),
        vec!["C:\\stage\\payload", "C:\\stage\\payload\\sub"]
    );
}

#[tokio::test]
async fn test_windows_directory_copy_without_ignore_uses_backslash() {
    let tmp = TempDir::new().unwrap();
    let source = payload(tmp.path());
    let (mut host, mock, _) = host_for("windows-2019-64", GlobalOptions::default());

    host.do_copy_to(&source, "C:\\stage", None).await.unwrap();

    assert_eq!(
        mock.uploads(),
        vec![
            "C:\\stage\\payload\\ignored_dir\\deeper\\y.txt",
            "C:\\stage\\payload\\ignored_dir\\x.txt",
            "C:\\stage\\payload\\keep.txt",
            "C:\\stage\\payload\\sub\\inner.txt",
        ]
    );
    assert!(
        mock.made_dirs()
            .iter()
            .chain(mock.uploads().iter())
            .all(|path| !path.contains('/'))
    );
}

#[tokio::test]
async fn test_windows_copy_from_directory_uses_backslash() {
    let tmp = TempDir::new().unwrap();
    let (mut host, mock, _) = host_for("windows-2019-64", GlobalOptions::default());
    mock.add_remote_file("C:\\logs\\app\\a.log", "A")
        .add_remote_file("C:\\logs\\app\\sub\\b.log", "B");

    host.do_copy_from("C:\\logs\\app", tmp.path()).await.unwrap();

    let downloaded: Vec<String> = mock
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            MockCall::Download { remote, .. } => Some(remote),
            _ => None,
        })
        .collect();
    assert_eq!(
        downloaded,
        vec!["C:\\logs\\app\\a.log", "C:\\logs\\app\\sub\\b.log"]
    );
    assert_eq!(fs::read_to_string(tmp.path().join("app/sub/b.log")).unwrap(), "B");
}

#[tokio::test]
async fn test_copy_from_directory_lands_under_basename() {
    let tmp = TempDir::new().unwrap();
    let (mut host, mock, _) = linux_host();
    mock.add_remote_file("/var/log/app/a.log", "A")
        .add_remote_file("/var/log/app/sub/b.log", "B")
        .add_remote_file("/var/log/other.log", "nope");

    let result = host.do_copy_from("/var/log/app", tmp.path()).await.unwrap();

    assert_eq!(result.exit_code, Some(0));
    assert_eq!(fs::read_to_string(tmp.path().join("app/a.log")).unwrap(), "A");
    assert_eq!(fs::read_to_string(tmp.path().join("app/sub/b.log")).unwrap(), "B");
    assert!(!tmp.path().join("other.log").exists());
}

#[tokio::test]
async fn test_copy_from_single_file() {
    let tmp = TempDir::new().unwrap();
    let target = tmp.path().join("fetched");
    let (mut host, mock, _) = linux_host();
    mock.add_remote_file("/etc/hosts", "127.0.0.1 localhost\n");

    host.do_copy_from("/etc/hosts", &target).await.unwrap();

    assert_eq!(
        fs::read_to_string(target.join("hosts")).unwrap(),
        "127.0.0.1 localhost\n"
    );
}

#[tokio::test]
async fn test_copy_from_missing_remote_path() {
    let tmp = TempDir::new().unwrap();
    let (mut host, _, _) = linux_host();

    let err = host.do_copy_from("/no/such", tmp.path()).await.unwrap_err();
    assert!(matches!(err, HarnessError::Transport(_)));
}

#[tokio::test]
async fn test_non_retryable_upload_error_surfaces() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("bad.txt");
    fs::write(&file, "b").unwrap();
    let (mut host, mock, _) = linux_host();
    mock.fail_upload("bad", MockFailure::Protocol);

    let err = host.do_copy_to(&file, "/tmp/bad.txt", None).await.unwrap_err();

    assert!(matches!(err, HarnessError::Transport(_)));
    assert_eq!(mock.uploads().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_upload_error_is_bounded() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("flaky.txt");
    fs::write(&file, "f").unwrap();
    let options = GlobalOptions {
        max_execute_tries: 2,
        ..GlobalOptions::default()
    };
    let (mut host, mock, _) = host_for("el-9-x86_64", options);
    mock.fail_upload("flaky", MockFailure::Reset);

    let err = host.do_copy_to(&file, "/tmp/flaky.txt", None).await.unwrap_err();

    assert!(matches!(
        err,
        HarnessError::ExecutionFailure { attempts: 2, .. }
    ));
    assert_eq!(mock.uploads().len(), 2);
    assert_eq!(mock.open_count(), 2);
}
