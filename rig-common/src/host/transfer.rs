//! File transfer on top of the connection's single-shot copies.
//!
//! Directory copies land in `target/<source basename>`, like `scp -r` into
//! an existing directory. An ignore list turns a directory copy into two
//! passes: create the remote directory skeleton, then copy file by file.

use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::debug;
use walkdir::WalkDir;

use super::Host;
use crate::errors::HarnessError;
use crate::result::{CommandResult, OutputStream};
use crate::util::{ignore_regex, join_remote, relative_slash_path};

impl Host {
    /// Copy a local file or directory to the host.
    ///
    /// `ignore` names path components (relative to `source`) to skip; an
    /// empty list is rejected. The source is checked before any remote
    /// activity.
    pub async fn do_copy_to(
        &mut self,
        source: &Path,
        target: &str,
        ignore: Option<&[String]>,
    ) -> Result<CommandResult, HarnessError> {
        let metadata = tokio::fs::metadata(source)
            .await
            .map_err(|_| HarnessError::MissingSource(source.to_path_buf()))?;
        let ignore = ignore.map(ignore_regex).transpose()?;

        let description = format!("scp {} {}:{target}", source.display(), self.name);
        if self.options.dry_run {
            self.logger.notify(format!("localhost (dry run) $ {description}"));
            return Ok(CommandResult::skipped(&self.name, description));
        }
        self.logger.notify(format!("localhost $ {description}"));

        if !metadata.is_dir() {
            let name = file_name(source);
            if let Some(re) = &ignore
                && re.is_match(&name)
            {
                self.logger
                    .debug(format!("{}: {name} is ignored; nothing to copy", self.name));
                return Ok(self.no_files(&description));
            }
            return self.connection().await?.scp_to(source, target).await;
        }

        let separator = self.platform.defaults().path_separator;
        let remote_root = join_remote(target, &file_name(source), separator);
        match ignore {
            None => self.connection().await?.scp_to(source, &remote_root).await,
            Some(re) => {
                self.copy_filtered(source, &remote_root, &re, separator, &description)
                    .await
            }
        }
    }

    async fn copy_filtered(
        &mut self,
        source: &Path,
        remote_root: &str,
        ignore: &Regex,
        separator: char,
        description: &str,
    ) -> Result<CommandResult, HarnessError> {
        let (dirs, files) = filtered_tree(source, ignore)?;
        if files.is_empty() {
            self.logger.debug(format!(
                "{}: every file under {} is ignored; nothing to copy",
                self.name,
                source.display()
            ));
        }

        let host = self.name.clone();
        let connection = self.connection().await?;

        connection.make_dir(remote_root).await?;
        for dir in &dirs {
            let remote = join_remote(remote_root, dir, separator);
            debug!(host = %host, dir = %remote, "creating remote directory");
            connection.make_dir(&remote).await?;
        }

        let mut result = CommandResult::new(&host, description);
        for (local, relative) in &files {
            let remote = join_remote(remote_root, relative, separator);
            let copied = connection.scp_to(local, &remote).await?;
            result.record_chunk(OutputStream::Stdout, copied.raw_stdout());
        }
        let note = format!("{description}: {} file(s) copied\n", files.len());
        result.record_chunk(OutputStream::Stdout, note.as_bytes());
        result.exit_code = Some(0);
        result.finalize();
        Ok(result)
    }

    /// Copy a remote file or directory into the local directory `target_dir`.
    pub async fn do_copy_from(
        &mut self,
        source: &str,
        target_dir: &Path,
    ) -> Result<CommandResult, HarnessError> {
        let description = format!("scp {}:{source} {}", self.name, target_dir.display());
        if self.options.dry_run {
            self.logger.notify(format!("localhost (dry run) $ {description}"));
            return Ok(CommandResult::skipped(&self.name, description));
        }
        self.logger.notify(format!("localhost $ {description}"));

        tokio::fs::create_dir_all(target_dir)
            .await
            .map_err(|source| HarnessError::Io {
                path: target_dir.to_path_buf(),
                source,
            })?;
        let destination = match remote_basename(source) {
            Some(name) => target_dir.join(name),
            None => target_dir.to_path_buf(),
        };
        self.connection().await?.scp_from(source, &destination).await
    }

    fn no_files(&self, description: &str) -> CommandResult {
        let mut result = CommandResult::new(&self.name, description);
        result.record_chunk(OutputStream::Stdout, b"No files to copy\n");
        result.exit_code = Some(1);
        result.finalize();
        result
    }
}

type FilteredTree = (Vec<String>, Vec<(PathBuf, String)>);

/// Directories and files under `source` that survive the ignore regex,
/// as `/`-separated paths relative to `source`. Ignored directories are not
/// descended into.
fn filtered_tree(source: &Path, ignore: &Regex) -> Result<FilteredTree, HarnessError> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();

    let walker = WalkDir::new(source)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            relative_slash_path(source, entry.path()).is_none_or(|rel| !ignore.is_match(&rel))
        });

    for entry in walker {
        let entry = entry.map_err(|e| HarnessError::Io {
            path: e.path().map_or_else(|| source.to_path_buf(), Path::to_path_buf),
            source: e.into(),
        })?;
        let Some(relative) = relative_slash_path(source, entry.path()) else {
            continue;
        };
        if entry.file_type().is_dir() {
            dirs.push(relative);
        } else {
            files.push((entry.path().to_path_buf(), relative));
        }
    }
    Ok((dirs, files))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn remote_basename(path: &str) -> Option<&str> {
    path.trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty())
}
