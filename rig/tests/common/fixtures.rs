use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

/// Two local-transport hosts in a throwaway inventory.
pub struct TestInventory {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl TestInventory {
    pub fn new() -> Self {
        crate::test_log!("FIXTURE: Creating local inventory");

        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("hosts.toml");
        fs::write(
            &path,
            r#"[options]
trace_limit = 5

[hosts.local1]
platform = "el-9-x86_64"
transport = "local"
hostname = "localhost"
role = "agent"

[hosts.local2]
platform = "el-9-x86_64"
transport = "local"
hostname = "127.0.0.1"
"#,
        )
        .expect("Failed to write inventory");

        Self { dir, path }
    }

    /// Scratch path inside the fixture directory.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// `rig` pointed at this inventory, with colors and RIG_* noise off.
    pub fn rig(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_rig"));
        cmd.env("RIG_INVENTORY", &self.path)
            .env("RIG_COLOR", "false")
            .env("RIG_LOG_LEVEL", "warn")
            .env("NO_COLOR", "1")
            .env_remove("RIG_DRY_RUN")
            .env_remove("RIG_PARALLEL");
        cmd
    }

    pub fn run(&self, args: &[&str]) -> Output {
        self.rig().args(args).output().expect("Failed to run rig")
    }
}

pub fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    fs::write(path, contents).expect("Failed to write file");
}
