//! Common types used across rig components.

use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use regex::Regex;

/// Transport used to reach a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// OpenSSH multiplexed session.
    Ssh,
    /// Windows Remote Management (WS-Management over HTTP).
    Winrm,
    /// Local child processes, no network involved.
    Local,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::Winrm => "winrm",
            Self::Local => "local",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ssh" => Ok(Self::Ssh),
            "winrm" => Ok(Self::Winrm),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown transport '{other}' (expected ssh, winrm or local)")),
        }
    }
}

/// Operating-system family a host belongs to.
///
/// Selected once from the inventory platform string; everything that differs
/// between platforms (quoting, environment syntax, elevation, temp paths)
/// hangs off this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformFamily {
    /// Linux and other POSIX systems not matched below.
    Unix,
    /// Windows reached through a Cygwin (POSIX) shell.
    Cygwin,
    /// Windows reached through cmd.exe / PowerShell.
    Windows,
    /// macOS.
    Mac,
    FreeBsd,
    Aix,
    /// Switches and routers with a vendor CLI.
    NetworkDevice,
}

impl PlatformFamily {
    pub fn is_windows(&self) -> bool {
        matches!(self, Self::Cygwin | Self::Windows)
    }

    pub fn is_posix(&self) -> bool {
        matches!(
            self,
            Self::Unix | Self::Cygwin | Self::Mac | Self::FreeBsd | Self::Aix
        )
    }

    /// Platform defaults for this family.
    pub fn defaults(&self) -> PlatformDefaults {
        match self {
            Self::Unix | Self::Aix => PlatformDefaults {
                user: "root",
                tmp_dir: "/tmp",
                path_separator: '/',
                transport: TransportKind::Ssh,
                reboot_command: "/bin/systemctl reboot -i || /sbin/shutdown -r now",
                elevation_prefix: Some("sudo -E"),
            },
            Self::Mac => PlatformDefaults {
                user: "root",
                tmp_dir: "/tmp",
                path_separator: '/',
                transport: TransportKind::Ssh,
                reboot_command: "/sbin/shutdown -r now",
                elevation_prefix: Some("sudo -E"),
            },
            Self::FreeBsd => PlatformDefaults {
                user: "root",
                tmp_dir: "/tmp",
                path_separator: '/',
                transport: TransportKind::Ssh,
                reboot_command: "/sbin/shutdown -r now",
                elevation_prefix: Some("sudo -E"),
            },
            Self::Cygwin => PlatformDefaults {
                user: "Administrator",
                tmp_dir: "/cygdrive/c/Windows/Temp",
                path_separator: '/',
                transport: TransportKind::Ssh,
                reboot_command: "shutdown /f /r /t 0",
                elevation_prefix: None,
            },
            Self::Windows => PlatformDefaults {
                user: "Administrator",
                tmp_dir: "C:\\Windows\\Temp",
                path_separator: '\\',
                transport: TransportKind::Winrm,
                reboot_command: "shutdown /f /r /t 0",
                elevation_prefix: None,
            },
            Self::NetworkDevice => PlatformDefaults {
                user: "admin",
                tmp_dir: "/tmp",
                path_separator: '/',
                transport: TransportKind::Ssh,
                reboot_command: "reload",
                elevation_prefix: None,
            },
        }
    }
}

impl std::fmt::Display for PlatformFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unix => "unix",
            Self::Cygwin => "cygwin",
            Self::Windows => "windows",
            Self::Mac => "mac",
            Self::FreeBsd => "freebsd",
            Self::Aix => "aix",
            Self::NetworkDevice => "network_device",
        };
        f.write_str(s)
    }
}

/// Static per-family facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformDefaults {
    /// Login user when neither host nor global options name one.
    pub user: &'static str,
    pub tmp_dir: &'static str,
    pub path_separator: char,
    pub transport: TransportKind,
    pub reboot_command: &'static str,
    /// Prefix that runs a command with elevated privileges, if the family has one.
    pub elevation_prefix: Option<&'static str>,
}

static MAC_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^(?:osx|macos)").expect("valid regex"));
static FREEBSD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^freebsd").expect("valid regex"));
static AIX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^aix").expect("valid regex"));
static WINDOWS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^windows").expect("valid regex"));
static NETWORK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:cisco|eos|junos|arista|huawei)").expect("valid regex")
});

/// A host platform: the raw inventory string plus its classified family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    name: String,
    family: PlatformFamily,
}

impl Platform {
    /// Classify a platform string such as `el-9-x86_64` or `windows-2019-64`.
    ///
    /// `is_cygwin` only matters for Windows platforms: it selects between a
    /// POSIX shell under Cygwin and the native command interpreter.
    pub fn parse(name: &str, is_cygwin: bool) -> Self {
        let family = if WINDOWS_RE.is_match(name) {
            if is_cygwin {
                PlatformFamily::Cygwin
            } else {
                PlatformFamily::Windows
            }
        } else if MAC_RE.is_match(name) {
            PlatformFamily::Mac
        } else if FREEBSD_RE.is_match(name) {
            PlatformFamily::FreeBsd
        } else if AIX_RE.is_match(name) {
            PlatformFamily::Aix
        } else if NETWORK_RE.is_match(name) {
            PlatformFamily::NetworkDevice
        } else {
            PlatformFamily::Unix
        };

        Self {
            name: name.to_string(),
            family,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn family(&self) -> PlatformFamily {
        self.family
    }

    pub fn defaults(&self) -> PlatformDefaults {
        self.family.defaults()
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.family)
    }
}
