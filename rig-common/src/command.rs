//! Building the literal command line sent over a transport.
//!
//! Rendering is a pure function of the [`Command`] fields and the target's
//! platform metadata ([`RenderTarget`]). Segments are assembled in a fixed
//! order and empty ones are dropped:
//!
//! 1. environment assignments
//! 2. prefix commands (`cmd.exe /c`, elevation, host and command prefixes)
//! 3. the base command
//! 4. options (`-a -b --long -x=1 --key=value`)
//! 5. positional arguments
//! 6. the host's trailing terminator, if any

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::types::PlatformFamily;

/// Platform facts and host properties a command renders against.
pub trait RenderTarget {
    fn family(&self) -> PlatformFamily;

    /// Extra prefix configured on the host (e.g. a wrapper script).
    fn prepend_cmds(&self) -> Option<&str> {
        None
    }

    /// Trailing terminator configured on the host.
    fn append_cmds(&self) -> Option<&str> {
        None
    }

    /// Property lookup used by [`CommandKind::HostCommand`] substitution.
    fn property(&self, _key: &str) -> Option<String> {
        None
    }
}

impl RenderTarget for PlatformFamily {
    fn family(&self) -> PlatformFamily {
        *self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Tokenized command: env, prefixes, options and arguments are rendered.
    #[default]
    Standard,
    /// Literal command passed through verbatim after `#{key}` substitution
    /// from the host's properties.
    HostCommand,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    kind: CommandKind,
    command: String,
    args: Vec<String>,
    /// Insertion-ordered; `None` marks a bare flag.
    options: Vec<(String, Option<String>)>,
    environment: BTreeMap<String, String>,
    prepend: Option<String>,
    elevated: bool,
    cmd_exe: bool,
}

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));

impl Command {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// A literal command that bypasses tokenization.
    pub fn host_command(command: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::HostCommand,
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add a bare flag (`-v` or `--verbose` depending on key length).
    pub fn flag(self, key: impl Into<String>) -> Self {
        self.option(key, None::<String>)
    }

    /// Add an option; a `None` value renders as a bare flag.
    ///
    /// Setting the same key twice keeps the first position and the last value.
    pub fn option(mut self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        let key = key.into();
        let value = value.map(Into::into);
        match self.options.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.options.push((key, value)),
        }
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Path-like variable: values are joined with `:`.
    pub fn env_list<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let joined = values
            .into_iter()
            .map(Into::into)
            .collect::<Vec<String>>()
            .join(":");
        self.environment.insert(key.into(), joined);
        self
    }

    /// Command-specific prefix placed right before the base command.
    pub fn prepend(mut self, prefix: impl Into<String>) -> Self {
        self.prepend = Some(prefix.into());
        self
    }

    /// Run with the platform's elevation prefix (`sudo -E` on POSIX hosts).
    pub fn elevated(mut self) -> Self {
        self.elevated = true;
        self
    }

    /// Wrap in `cmd.exe /c` on Windows-family hosts.
    pub fn cmd_exe(mut self) -> Self {
        self.cmd_exe = true;
        self
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn is_elevated(&self) -> bool {
        self.elevated
    }

    /// Render the command line for `target`.
    pub fn render(&self, target: &dyn RenderTarget) -> String {
        self.render_with(target, None, None, None)
    }

    /// Render with one-off replacements for the base command, the
    /// environment, or the command-level prefix.
    pub fn render_with(
        &self,
        target: &dyn RenderTarget,
        command: Option<&str>,
        environment: Option<&BTreeMap<String, String>>,
        prefix: Option<&str>,
    ) -> String {
        let base = command.unwrap_or(&self.command);

        if self.kind == CommandKind::HostCommand {
            return substitute_properties(base, target);
        }

        let family = target.family();
        let environment = environment.unwrap_or(&self.environment);
        let prefix = prefix.or(self.prepend.as_deref());
        let wrap_cmd_exe = self.cmd_exe && family.is_windows();

        let mut prefixes: Vec<&str> = Vec::new();
        if wrap_cmd_exe {
            prefixes.push("cmd.exe /c");
        }
        if self.elevated
            && let Some(elevation) = family.defaults().elevation_prefix
        {
            prefixes.push(elevation);
        }
        if let Some(host_prefix) = target.prepend_cmds() {
            prefixes.push(host_prefix);
        }
        if let Some(prefix) = prefix {
            prefixes.push(prefix);
        }

        let base = if wrap_cmd_exe {
            base.replace('"', "\"\"")
        } else {
            base.to_string()
        };

        let segments = [
            environment_string(family, environment),
            prefixes.join(" "),
            base,
            options_string(&self.options),
            args_string(&self.args),
            target.append_cmds().unwrap_or_default().to_string(),
        ];

        segments
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Render options as short flags, long flags, short opts, long opts.
fn options_string(options: &[(String, Option<String>)]) -> String {
    let (flags, valued): (Vec<_>, Vec<_>) = options.iter().partition(|(_, v)| v.is_none());
    let (short_flags, long_flags): (Vec<_>, Vec<_>) =
        flags.into_iter().partition(|(k, _)| k.chars().count() == 1);
    let (short_opts, long_opts): (Vec<_>, Vec<_>) =
        valued.into_iter().partition(|(k, _)| k.chars().count() == 1);

    let mut rendered: Vec<String> = Vec::with_capacity(options.len());
    rendered.extend(short_flags.iter().map(|(k, _)| format!("-{k}")));
    rendered.extend(long_flags.iter().map(|(k, _)| format!("--{k}")));
    rendered.extend(
        short_opts
            .iter()
            .map(|(k, v)| format!("-{k}={}", v.as_deref().unwrap_or_default())),
    );
    rendered.extend(
        long_opts
            .iter()
            .map(|(k, v)| format!("--{k}={}", v.as_deref().unwrap_or_default())),
    );
    rendered.join(" ")
}

fn args_string(args: &[String]) -> String {
    args.iter()
        .filter(|a| !a.is_empty())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ")
}

fn environment_string(family: PlatformFamily, environment: &BTreeMap<String, String>) -> String {
    if environment.is_empty() {
        return String::new();
    }

    // Rendered keys are upper-cased; on a collision the key sorting last wins.
    let environment: BTreeMap<String, &str> = environment
        .iter()
        .map(|(k, v)| (k.to_uppercase(), v.as_str()))
        .collect();

    match family {
        PlatformFamily::NetworkDevice => String::new(),
        PlatformFamily::Windows => environment
            .iter()
            .map(|(k, v)| format!("set \"{k}={v}\" &&"))
            .collect::<Vec<_>>()
            .join(" "),
        _ => {
            let pairs = environment
                .iter()
                .map(|(k, v)| format!("{k}=\"{}\"", v.replace('"', "\\\"")))
                .collect::<Vec<_>>()
                .join(" ");
            format!("env {pairs}")
        }
    }
}

fn substitute_properties(command: &str, target: &dyn RenderTarget) -> String {
    PLACEHOLDER_RE
        .replace_all(command, |caps: &Captures<'_>| {
            target
                .property(&caps[1])
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct TestHost {
        family: PlatformFamily,
        prepend: Option<String>,
        append: Option<String>,
    }

    impl TestHost {
        fn unix() -> Self {
            Self {
                family: PlatformFamily::Unix,
                prepend: None,
                append: None,
            }
        }
    }

    impl RenderTarget for TestHost {
        fn family(&self) -> PlatformFamily {
            self.family
        }

        fn prepend_cmds(&self) -> Option<&str> {
            self.prepend.as_deref()
        }

        fn append_cmds(&self) -> Option<&str> {
            self.append.as_deref()
        }

        fn property(&self, key: &str) -> Option<String> {
            match key {
                "ip" => Some("10.0.0.5".to_string()),
                "user" => Some("deploy".to_string()),
                _ => None,
            }
        }
    }

    #[test]
    fn test_flag_only_long_option() {
        let cmd = Command::new("echo").flag("hello");
        assert_eq!(cmd.render(&PlatformFamily::Unix), "echo --hello");
    }

    #[test]
    fn test_options_partitioning_order() {
        let cmd = Command::new("tool")
            .option("long1", Some("x"))
            .flag("a")
            .option("y", Some("z"))
            .flag("b")
            .flag("verbose");
        assert_eq!(
            cmd.render(&PlatformFamily::Unix),
            "tool -a -b --verbose -y=z --long1=x"
        );
    }

    #[test]
    fn test_option_overwrite_keeps_position() {
        let cmd = Command::new("tool")
            .option("mode", Some("fast"))
            .option("level", Some("1"))
            .option("mode", Some("slow"));
        assert_eq!(
            cmd.render(&PlatformFamily::Unix),
            "tool --mode=slow --level=1"
        );
    }

    #[test]
    fn test_segments_in_order() {
        let host = TestHost {
            family: PlatformFamily::Unix,
            prepend: Some("nice -n 5".to_string()),
            append: Some(";".to_string()),
        };
        let cmd = Command::new("ls")
            .env("lang", "C")
            .flag("l")
            .arg("/etc")
            .elevated();
        assert_eq!(
            cmd.render(&host),
            "env LANG=\"C\" sudo -E nice -n 5 ls -l /etc ;"
        );
    }

    #[test]
    fn test_unix_environment_escapes_quotes_and_sorts() {
        let cmd = Command::new("run")
            .env("ZED", "last")
            .env("msg", "say \"hi\"");
        assert_eq!(
            cmd.render(&PlatformFamily::Unix),
            "env MSG=\"say \\\"hi\\\"\" ZED=\"last\" run"
        );
    }

    #[test]
    fn test_environment_keys_collapse_by_case() {
        let cmd = Command::new("run")
            .env("PATH", "/usr/bin")
            .env("path", "/opt/bin")
            .env("b", "2")
            .env("A", "1");
        assert_eq!(
            cmd.render(&PlatformFamily::Unix),
            "env A=\"1\" B=\"2\" PATH=\"/opt/bin\" run"
        );
        assert_eq!(
            cmd.render(&PlatformFamily::Windows),
            "set \"A=1\" && set \"B=2\" && set \"PATH=/opt/bin\" && run"
        );
    }

    #[test]
    fn test_env_list_joins_with_colon() {
        let cmd = Command::new("ruby").env_list("path", ["/opt/bin", "/usr/bin"]);
        assert_eq!(
            cmd.render(&PlatformFamily::Unix),
            "env PATH=\"/opt/bin:/usr/bin\" ruby"
        );
    }

    #[test]
    fn test_windows_environment_and_cmd_exe() {
        let cmd = Command::new("echo \"hi\"").env("foo", "bar").cmd_exe();
        assert_eq!(
            cmd.render(&PlatformFamily::Windows),
            "set \"FOO=bar\" && cmd.exe /c echo \"\"hi\"\""
        );
    }

    #[test]
    fn test_cmd_exe_ignored_on_posix() {
        let cmd = Command::new("echo \"hi\"").cmd_exe();
        assert_eq!(cmd.render(&PlatformFamily::Unix), "echo \"hi\"");
    }

    #[test]
    fn test_cygwin_uses_env_prefix_without_elevation() {
        let cmd = Command::new("whoami").env("home", "/home/admin").elevated();
        assert_eq!(
            cmd.render(&PlatformFamily::Cygwin),
            "env HOME=\"/home/admin\" whoami"
        );
    }

    #[test]
    fn test_network_device_drops_environment() {
        let cmd = Command::new("show version").env("term", "dumb");
        assert_eq!(cmd.render(&PlatformFamily::NetworkDevice), "show version");
    }

    #[test]
    fn test_host_command_substitutes_properties() {
        let cmd = Command::host_command("ping -c 1 #{ip} && echo #{user} #{unknown}")
            .env("ignored", "yes")
            .arg("ignored-too");
        assert_eq!(
            cmd.render(&TestHost::unix()),
            "ping -c 1 10.0.0.5 && echo deploy #{unknown}"
        );
    }

    #[test]
    fn test_render_with_overrides() {
        let cmd = Command::new("ls").env("a", "1").prepend("time").arg("/");
        let env = BTreeMap::from([("b".to_string(), "2".to_string())]);
        assert_eq!(
            cmd.render_with(&PlatformFamily::Unix, Some("du"), Some(&env), Some("nice")),
            "env B=\"2\" nice du /"
        );
    }

    #[test]
    fn test_empty_segments_dropped() {
        let cmd = Command::new("true").arg("").args(Vec::<String>::new());
        assert_eq!(cmd.render(&PlatformFamily::Unix), "true");
    }

    proptest! {
        #[test]
        fn prop_render_is_deterministic(
            base in "[a-z]{1,8}",
            args in proptest::collection::vec("[a-z0-9]{1,6}", 0..4),
            keys in proptest::collection::vec("[a-z]{1,5}", 0..5),
        ) {
            let mut cmd = Command::new(base).args(args);
            for (i, key) in keys.iter().enumerate() {
                cmd = if i % 2 == 0 { cmd.flag(key.clone()) } else { cmd.option(key.clone(), Some("v")) };
            }
            let first = cmd.render(&PlatformFamily::Unix);
            let second = cmd.clone().render(&PlatformFamily::Unix);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_short_flags_precede_long_opts(short in "[a-z]", long in "[a-z]{2,6}") {
            let cmd = Command::new("x").option(long.clone(), Some("1")).flag(short.clone());
            let rendered = cmd.render(&PlatformFamily::Unix);
            let short_pos = rendered.find(&format!("-{short}")).unwrap();
            let long_pos = rendered.find(&format!("--{long}=1")).unwrap();
            prop_assert!(short_pos < long_pos);
        }
    }
}
