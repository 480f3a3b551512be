//! Shared utilities for rig.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::HarnessError;

static SECRET_ASSIGNMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b([A-Z0-9_]*(?:TOKEN|SECRET|PASSWORD|PASSWD|PASS|API_KEY|PRIVATE_KEY|ACCESS_KEY(?:_ID)?|DATABASE_URL)[A-Z0-9_]*=)("(?:[^"\\]|\\.)*"|'[^']*'|[^\s"']*)"#,
    )
    .expect("valid regex")
});

static SECRET_FLAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(--(?:token|password|passwd|api-key|secret)(?:=| +))("(?:[^"\\]|\\.)*"|'[^']*'|\S+)"#,
    )
    .expect("valid regex")
});

/// Mask sensitive patterns in a command string before logging.
///
/// Values of environment assignments whose key looks like a credential
/// (`*TOKEN*`, `*PASSWORD*`, `*SECRET*`, ...) and of credential flags
/// (`--token`, `--password`, ...) become `***`; the key or flag is kept.
pub fn mask_sensitive_command(cmd: &str) -> String {
    let masked = SECRET_ASSIGNMENT_RE.replace_all(cmd, "${1}***");
    SECRET_FLAG_RE.replace_all(&masked, "${1}***").into_owned()
}

/// Parse an ignore file into a list of patterns.
///
/// One pattern per line; `#` starts a comment line; blank lines are skipped
/// and surrounding whitespace is trimmed.
pub fn parse_ignore_file(path: &Path) -> std::io::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_ignore_content(&content))
}

pub fn parse_ignore_content(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.to_string())
        .collect()
}

/// Build the regex that decides whether a relative path is ignored.
///
/// An entry matches a whole path component (or a run of components), never a
/// substring of one: `build` ignores `build/out.o` and `src/build`, but not
/// `rebuild.sh`. Within a component `*` matches any run of characters and
/// `?` a single one, so `*.log` ignores every log file.
pub fn ignore_regex(patterns: &[String]) -> Result<Regex, HarnessError> {
    if patterns.is_empty() {
        return Err(HarnessError::InvalidOption(
            "ignore list must contain at least one entry".to_string(),
        ));
    }
    if let Some(pos) = patterns.iter().position(|p| p.trim().is_empty()) {
        return Err(HarnessError::InvalidOption(format!(
            "ignore list entry {pos} is empty"
        )));
    }

    let alternatives = patterns
        .iter()
        .map(|p| glob_to_regex(p.trim().trim_matches('/')))
        .collect::<Vec<_>>()
        .join("|");

    Regex::new(&format!("(?:/|^)(?:{alternatives})(?:/|$)"))
        .map_err(|e| HarnessError::InvalidOption(format!("bad ignore list: {e}")))
}

fn glob_to_regex(entry: &str) -> String {
    let mut pattern = String::with_capacity(entry.len() * 2);
    for c in entry.chars() {
        match c {
            '*' => pattern.push_str("[^/]*"),
            '?' => pattern.push_str("[^/]"),
            c => pattern.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    pattern
}

/// `path` relative to `root`, with `/` separators regardless of host OS.
pub fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Join remote path segments with the host's separator.
pub fn join_remote(base: &str, child: &str, separator: char) -> String {
    let child = child.replace(['/', '\\'], &separator.to_string());
    if base.is_empty() {
        return child;
    }
    let trimmed = base.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() {
        // base was the root itself
        return format!("{separator}{child}");
    }
    format!("{trimmed}{separator}{child}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_mask_sensitive_command() {
        let cmd = "env GITHUB_TOKEN=\"abcdef\" TZ=\"UTC\" deploy --token mytoken --password=hidden";
        let masked = mask_sensitive_command(cmd);

        assert!(masked.contains("GITHUB_TOKEN=***"));
        assert!(!masked.contains("abcdef"));
        assert!(masked.contains("TZ=\"UTC\""));
        assert!(masked.contains("--token ***"));
        assert!(!masked.contains("mytoken"));
        assert!(masked.contains("--password=***"));
        assert!(!masked.contains("hidden"));
    }

    #[test]
    fn test_mask_multiple_and_quoted() {
        assert_eq!(mask_sensitive_command("TOKEN=a TOKEN=b"), "TOKEN=*** TOKEN=***");
        assert_eq!(
            mask_sensitive_command("run DB_PASSWORD=\"my super secret\" --other"),
            "run DB_PASSWORD=*** --other"
        );
    }

    #[test]
    fn test_mask_windows_set_syntax() {
        let masked = mask_sensitive_command("set \"API_KEY=xyz\" && deploy.exe");
        assert_eq!(masked, "set \"API_KEY=***\" && deploy.exe");
    }

    #[test]
    fn test_mask_leaves_plain_commands_alone() {
        let cmd = "ls -la /etc && echo done";
        assert_eq!(mask_sensitive_command(cmd), cmd);
    }

    #[test]
    fn test_parse_ignore_content() {
        let content = "# build output\ntarget\n\n  node_modules  \n#.git\n*.log\n";
        assert_eq!(
            parse_ignore_content(content),
            vec!["target", "node_modules", "*.log"]
        );
    }

    #[test]
    fn test_parse_ignore_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".rigignore");
        std::fs::write(&path, "tmp\n# comment\nlogs\n").unwrap();
        assert_eq!(parse_ignore_file(&path).unwrap(), vec!["tmp", "logs"]);
    }

    #[test]
    fn test_ignore_regex_matches_components() {
        let re = ignore_regex(&["ignored_dir".to_string(), ".git".to_string()]).unwrap();

        assert!(re.is_match("ignored_dir"));
        assert!(re.is_match("ignored_dir/x.txt"));
        assert!(re.is_match("nested/ignored_dir/x.txt"));
        assert!(re.is_match(".git/HEAD"));
        assert!(!re.is_match("keep.txt"));
        assert!(!re.is_match("not_ignored_dir/x.txt"));
        assert!(!re.is_match("agit/x"));
    }

    #[test]
    fn test_ignore_regex_globs_stay_within_a_component() {
        let re = ignore_regex(&["*.log".to_string(), "cache-?".to_string()]).unwrap();

        assert!(re.is_match("app.log"));
        assert!(re.is_match("logs/nested/app.log"));
        assert!(re.is_match("cache-1/data.bin"));
        assert!(!re.is_match("app.log.gz"));
        assert!(!re.is_match("applog"));
        assert!(!re.is_match("cache-10/data.bin"));
    }

    #[test]
    fn test_ignore_regex_rejects_empty_entries() {
        assert!(matches!(
            ignore_regex(&[]),
            Err(HarnessError::InvalidOption(_))
        ));
        assert!(matches!(
            ignore_regex(&["ok".to_string(), "  ".to_string()]),
            Err(HarnessError::InvalidOption(_))
        ));
    }

    #[test]
    fn test_relative_slash_path() {
        let root = PathBuf::from("/src/app");
        assert_eq!(
            relative_slash_path(&root, &root.join("a").join("b.txt")).as_deref(),
            Some("a/b.txt")
        );
        assert_eq!(relative_slash_path(&root, &root).as_deref(), Some(""));
        assert!(relative_slash_path(&root, Path::new("/other")).is_none());
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/tmp/", "a/b", '/'), "/tmp/a/b");
        assert_eq!(join_remote("C:\\Temp", "a/b", '\\'), "C:\\Temp\\a\\b");
        assert_eq!(join_remote("/", "etc", '/'), "/etc");
        assert_eq!(join_remote("", "x", '/'), "x");
    }
}
