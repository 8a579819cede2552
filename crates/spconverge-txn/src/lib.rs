use std::path::PathBuf;

use serde::{Deserialize, Serialize};

mod installer;
mod journal;

pub use installer::{TxnInstaller, TxnScope};
pub use journal::{sha256_hex, validate_module_name};

/// Ownership and permission bits applied to an installed file.
///
/// Unset fields keep the values of the file being replaced. A new file gets
/// mode `0o644` and the installing user's ownership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttrs {
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: Option<u32>,
}

impl FileAttrs {
    pub fn with_mode(mode: u32) -> Self {
        Self {
            mode: Some(mode),
            ..Self::default()
        }
    }

    pub fn owned_by(mut self, owner: impl Into<String>, group: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self.group = Some(group.into());
        self
    }
}

/// One destination path recorded under a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnEntry {
    pub path: PathBuf,
    /// Copy of the content the path had before the module first touched it;
    /// `None` means the path did not exist.
    pub backup: Option<PathBuf>,
    pub sha256: String,
    pub installed_at_unix: u64,
    #[serde(default)]
    pub prior_mode: Option<u32>,
    #[serde(default)]
    pub prior_uid: Option<u32>,
    #[serde(default)]
    pub prior_gid: Option<u32>,
    /// The module deleted the path rather than writing it.
    #[serde(default)]
    pub removed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    /// The destination already held the same content and mode.
    Unchanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackSummary {
    pub module: String,
    pub restored: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl RollbackSummary {
    pub fn is_empty(&self) -> bool {
        self.restored.is_empty() && self.removed.is_empty()
    }
}
