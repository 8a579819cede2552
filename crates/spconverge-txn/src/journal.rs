use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use spconverge_core::HostLayout;

use crate::TxnEntry;

const JOURNAL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Journal {
    pub version: u32,
    pub module: String,
    #[serde(default)]
    pub entries: Vec<TxnEntry>,
}

impl Journal {
    pub fn empty(module: &str) -> Self {
        Self {
            version: JOURNAL_VERSION,
            module: module.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn entry(&self, path: &Path) -> Option<&TxnEntry> {
        self.entries.iter().find(|entry| entry.path == path)
    }

    pub fn entry_mut(&mut self, path: &Path) -> Option<&mut TxnEntry> {
        self.entries.iter_mut().find(|entry| entry.path == path)
    }
}

pub(crate) fn read_journal(layout: &HostLayout, module: &str) -> Result<Option<Journal>> {
    let path = layout.txn_journal_path(module);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to read transaction journal: {}", path.display())
            });
        }
    };

    let journal: Journal = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing transaction journal: {}", path.display()))?;
    if journal.version != JOURNAL_VERSION {
        return Err(anyhow!(
            "unsupported transaction journal version {} in {}",
            journal.version,
            path.display()
        ));
    }
    if journal.module != module {
        return Err(anyhow!(
            "transaction journal {} belongs to module '{}', expected '{module}'",
            path.display(),
            journal.module
        ));
    }
    Ok(Some(journal))
}

/// Replaces the module's journal atomically.
pub(crate) fn write_journal(layout: &HostLayout, journal: &Journal) -> Result<()> {
    let path = layout.txn_journal_path(&journal.module);
    let parent = layout.txn_modules_dir();
    fs::create_dir_all(&parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let payload =
        serde_json::to_vec_pretty(journal).context("failed to encode transaction journal")?;
    let mut staged = tempfile::Builder::new()
        .prefix(".journal.")
        .tempfile_in(&parent)
        .with_context(|| format!("failed to stage transaction journal in {}", parent.display()))?;
    io::Write::write_all(&mut staged, &payload)
        .with_context(|| format!("failed to write transaction journal: {}", path.display()))?;
    staged
        .as_file()
        .sync_all()
        .with_context(|| format!("failed to sync transaction journal: {}", path.display()))?;
    staged
        .persist(&path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to replace transaction journal: {}", path.display()))?;
    Ok(())
}

pub(crate) fn remove_journal(layout: &HostLayout, module: &str) -> Result<()> {
    let path = layout.txn_journal_path(module);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err)
            .with_context(|| format!("failed to remove transaction journal: {}", path.display())),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Module names become file names, so they are limited to a safe alphabet.
pub fn validate_module_name(module: &str) -> Result<()> {
    if module.is_empty() {
        return Err(anyhow!("transaction module name must not be empty"));
    }
    if module.starts_with('.') {
        return Err(anyhow!(
            "invalid transaction module name '{module}': must not start with '.'"
        ));
    }
    if !module
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(anyhow!(
            "invalid transaction module name '{module}': use only [A-Za-z0-9._-]"
        ));
    }
    Ok(())
}

pub(crate) fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}
