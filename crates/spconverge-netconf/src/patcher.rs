use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use glob::Pattern;
use spconverge_txn::{FileAttrs, TxnInstaller};
use tracing::{debug, info, warn};

use crate::RequiredLines;

/// Walks an interfaces file and the files it includes, appending missing
/// required lines to the stanzas of the requested interfaces.
///
/// Changed files are written through the transactional installer under the
/// patcher's module, keeping their mode and ownership.
#[derive(Debug, Clone)]
pub struct InterfacesPatcher<'a> {
    installer: &'a TxnInstaller,
    module: String,
}

impl<'a> InterfacesPatcher<'a> {
    pub fn new(installer: &'a TxnInstaller, module: impl Into<String>) -> Self {
        Self {
            installer,
            module: module.into(),
        }
    }

    /// Returns whether any file was changed.
    pub fn patch(&self, root_file: &Path, required: &RequiredLines) -> Result<bool> {
        let mut visited = BTreeSet::new();
        self.patch_file(root_file, required, &mut visited)
    }

    fn patch_file(
        &self,
        path: &Path,
        required: &RequiredLines,
        visited: &mut BTreeSet<PathBuf>,
    ) -> Result<bool> {
        let key = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if !visited.insert(key) {
            debug!(path = %path.display(), "already processed");
            return Ok(false);
        }
        debug!(path = %path.display(), "looking for interface stanzas");

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read interfaces file: {}", path.display()))?;
        let base_dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut output = String::with_capacity(raw.len());
        let mut current: Option<&str> = None;
        let mut left: Vec<&str> = Vec::new();
        let mut appended = 0_usize;
        let mut includes_changed = false;

        for line in raw.split_inclusive('\n') {
            let stripped = line.trim();
            let mut words = stripped.split_whitespace();
            let Some(keyword) = words.next() else {
                output.push_str(line);
                continue;
            };

            if current.is_some() {
                if is_stanza_start(keyword) {
                    appended += append_missing(&mut output, &mut left);
                    current = None;
                } else {
                    left.retain(|wanted| wanted.trim() != stripped);
                }
            }

            output.push_str(line);

            // The line that closed a stanza may open the next one.
            if current.is_some() {
                continue;
            }
            let Some(argument) = words.next() else {
                continue;
            };
            match keyword {
                "iface" => {
                    if let Some((name, lines)) = required.get_key_value(argument) {
                        current = Some(name.as_str());
                        left = lines.iter().map(String::as_str).collect();
                    }
                }
                "source" => {
                    let pattern = self.include_pattern(base_dir, argument);
                    includes_changed |= self.patch_matching(&pattern, required, visited)?;
                }
                "source-directory" => {
                    let pattern = format!(
                        "{}/*",
                        self.include_pattern(base_dir, argument).trim_end_matches('/')
                    );
                    includes_changed |= self.patch_matching(&pattern, required, visited)?;
                }
                _ => {}
            }
        }

        if current.is_some() {
            appended += append_missing(&mut output, &mut left);
        }

        if appended == 0 {
            debug!(path = %path.display(), "no need to update");
            return Ok(includes_changed);
        }

        self.installer
            .install_bytes(&self.module, output.as_bytes(), path, &FileAttrs::default())
            .with_context(|| format!("failed to update interfaces file: {}", path.display()))?;
        info!(path = %path.display(), lines = appended, "added interface directives");
        Ok(true)
    }

    fn patch_matching(
        &self,
        pattern: &str,
        required: &RequiredLines,
        visited: &mut BTreeSet<PathBuf>,
    ) -> Result<bool> {
        let paths = glob::glob(pattern)
            .with_context(|| format!("invalid include pattern in interfaces file: {pattern}"))?;
        let mut changed = false;
        for entry in paths {
            match entry {
                Ok(path) if path.is_file() => {
                    changed |= self.patch_file(&path, required, visited)?;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(pattern, error = %err, "skipping unreadable include");
                }
            }
        }
        Ok(changed)
    }

    /// Absolute include targets are host paths; relative ones are taken
    /// from the including file's directory.
    fn include_pattern(&self, base_dir: &Path, target: &str) -> String {
        if target.starts_with('/') {
            let root = self.installer.layout().root().to_string_lossy();
            format!("{}{}", Pattern::escape(root.trim_end_matches('/')), target)
        } else {
            let base = base_dir.to_string_lossy();
            format!("{}/{}", Pattern::escape(base.trim_end_matches('/')), target)
        }
    }
}

fn is_stanza_start(keyword: &str) -> bool {
    matches!(
        keyword,
        "iface" | "mapping" | "auto" | "source" | "source-directory"
    ) || keyword.starts_with("allow-")
}

fn append_missing(output: &mut String, left: &mut Vec<&str>) -> usize {
    if left.is_empty() {
        return 0;
    }
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    let count = left.len();
    for line in left.drain(..) {
        output.push_str(line.trim());
        output.push('\n');
    }
    count
}
