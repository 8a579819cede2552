use anyhow::{anyhow, Context, Result};
use nix::unistd::{Group, User};
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use spconverge_core::{ExclusiveLock, HostLayout};
use tracing::{debug, info};

use crate::journal::{
    current_unix_timestamp, read_journal, remove_journal, sha256_hex, validate_module_name,
    write_journal, Journal,
};
use crate::{FileAttrs, InstallOutcome, RollbackSummary, TxnEntry};

const DEFAULT_MODE: u32 = 0o644;

/// Installs files atomically and remembers, per module, how to undo them.
#[derive(Debug, Clone)]
pub struct TxnInstaller {
    layout: HostLayout,
}

impl TxnInstaller {
    pub fn new(layout: HostLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    pub fn scope(&self, module: impl Into<String>) -> TxnScope<'_> {
        TxnScope::new(self, module)
    }

    pub fn install(
        &self,
        module: &str,
        source: &Path,
        dest: &Path,
        attrs: &FileAttrs,
    ) -> Result<InstallOutcome> {
        let contents = fs::read(source)
            .with_context(|| format!("failed to read install source: {}", source.display()))?;
        self.install_bytes(module, &contents, dest, attrs)
    }

    pub fn install_bytes(
        &self,
        module: &str,
        contents: &[u8],
        dest: &Path,
        attrs: &FileAttrs,
    ) -> Result<InstallOutcome> {
        validate_module_name(module)?;
        let _lock = ExclusiveLock::acquire(&self.layout.txn_lock_path())?;

        let mut journal = read_journal(&self.layout, module)?.unwrap_or_else(|| Journal::empty(module));
        let existing = regular_file_metadata(dest)?;
        let digest = sha256_hex(contents);
        let mode = attrs
            .mode
            .or_else(|| existing.as_ref().map(permission_bits))
            .unwrap_or(DEFAULT_MODE);

        if let (Some(entry), Some(metadata)) = (journal.entry(dest), existing.as_ref()) {
            if entry.sha256 == digest
                && permission_bits(metadata) == mode
                && file_digest(dest)? == digest
            {
                debug!(module, path = %dest.display(), "file already installed");
                return Ok(InstallOutcome::Unchanged);
            }
        }

        let (uid, gid) = resolve_owner(attrs)?;
        let uid = uid.or_else(|| existing.as_ref().map(|metadata| metadata.uid()));
        let gid = gid.or_else(|| existing.as_ref().map(|metadata| metadata.gid()));
        let now = current_unix_timestamp()?;
        if let Some(entry) = journal.entry_mut(dest) {
            entry.sha256 = digest;
            entry.installed_at_unix = now;
            entry.removed = false;
        } else {
            let backup = match &existing {
                Some(_) => Some(self.backup_existing(module, dest, journal.entries.len())?),
                None => None,
            };
            journal.entries.push(TxnEntry {
                path: dest.to_path_buf(),
                backup,
                sha256: digest,
                installed_at_unix: now,
                prior_mode: existing.as_ref().map(permission_bits),
                prior_uid: existing.as_ref().map(|metadata| metadata.uid()),
                prior_gid: existing.as_ref().map(|metadata| metadata.gid()),
                removed: false,
            });
        }

        // The journal must know about the path before the path changes.
        write_journal(&self.layout, &journal)?;
        replace_file(dest, contents, mode, uid, gid)?;

        info!(module, path = %dest.display(), mode = %format!("{mode:o}"), "installed file");
        Ok(InstallOutcome::Installed)
    }

    /// Deletes `dest` under `module`; a rollback puts the old content back.
    /// Returns whether there was anything to delete.
    pub fn remove(&self, module: &str, dest: &Path) -> Result<bool> {
        validate_module_name(module)?;
        let _lock = ExclusiveLock::acquire(&self.layout.txn_lock_path())?;

        let Some(existing) = regular_file_metadata(dest)? else {
            debug!(module, path = %dest.display(), "nothing to remove");
            return Ok(false);
        };
        let mut journal = read_journal(&self.layout, module)?.unwrap_or_else(|| Journal::empty(module));
        let now = current_unix_timestamp()?;
        if let Some(entry) = journal.entry_mut(dest) {
            entry.sha256.clear();
            entry.installed_at_unix = now;
            entry.removed = true;
        } else {
            let backup = self.backup_existing(module, dest, journal.entries.len())?;
            journal.entries.push(TxnEntry {
                path: dest.to_path_buf(),
                backup: Some(backup),
                sha256: String::new(),
                installed_at_unix: now,
                prior_mode: Some(permission_bits(&existing)),
                prior_uid: Some(existing.uid()),
                prior_gid: Some(existing.gid()),
                removed: true,
            });
        }

        write_journal(&self.layout, &journal)?;
        fs::remove_file(dest).with_context(|| format!("failed to remove {}", dest.display()))?;

        info!(module, path = %dest.display(), "removed file");
        Ok(true)
    }

    /// Undoes everything `module` installed, newest first.
    pub fn rollback(&self, module: &str) -> Result<RollbackSummary> {
        validate_module_name(module)?;
        let _lock = ExclusiveLock::acquire(&self.layout.txn_lock_path())?;

        let mut summary = RollbackSummary {
            module: module.to_string(),
            ..RollbackSummary::default()
        };
        let Some(journal) = read_journal(&self.layout, module)? else {
            debug!(module, "nothing to roll back");
            return Ok(summary);
        };

        for entry in journal.entries.iter().rev() {
            match &entry.backup {
                Some(backup) => {
                    let contents = fs::read(backup).with_context(|| {
                        format!(
                            "failed to read backup {} for {}",
                            backup.display(),
                            entry.path.display()
                        )
                    })?;
                    replace_file(
                        &entry.path,
                        &contents,
                        entry.prior_mode.unwrap_or(DEFAULT_MODE),
                        entry.prior_uid,
                        entry.prior_gid,
                    )?;
                    debug!(module, path = %entry.path.display(), "restored file");
                    summary.restored.push(entry.path.clone());
                }
                None => match fs::remove_file(&entry.path) {
                    Ok(()) => {
                        debug!(module, path = %entry.path.display(), "removed file");
                        summary.removed.push(entry.path.clone());
                    }
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        return Err(err).with_context(|| {
                            format!("failed to remove {}", entry.path.display())
                        });
                    }
                },
            }
        }

        let backups = self.layout.txn_backups_dir(module);
        if backups.exists() {
            fs::remove_dir_all(&backups)
                .with_context(|| format!("failed to remove {}", backups.display()))?;
        }
        remove_journal(&self.layout, module)?;

        info!(
            module,
            restored = summary.restored.len(),
            removed = summary.removed.len(),
            "rolled back transaction module"
        );
        Ok(summary)
    }

    pub fn list_modules(&self) -> Result<BTreeSet<String>> {
        let dir = self.layout.txn_modules_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", dir.display()));
            }
        };

        let mut modules = BTreeSet::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                if validate_module_name(stem).is_ok() {
                    modules.insert(stem.to_string());
                }
            }
        }
        Ok(modules)
    }

    pub fn entries(&self, module: &str) -> Result<Vec<TxnEntry>> {
        validate_module_name(module)?;
        Ok(read_journal(&self.layout, module)?
            .map(|journal| journal.entries)
            .unwrap_or_default())
    }

    fn backup_existing(&self, module: &str, dest: &Path, index: usize) -> Result<PathBuf> {
        let dir = self.layout.txn_backups_dir(module);
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let backup = dir.join(format!("{index:04}"));
        fs::copy(dest, &backup).with_context(|| {
            format!(
                "failed to back up {} to {}",
                dest.display(),
                backup.display()
            )
        })?;
        Ok(backup)
    }
}

/// A transaction module bound to an installer, optionally confined to a
/// prefix such as a container's root filesystem.
#[derive(Debug, Clone)]
pub struct TxnScope<'a> {
    installer: &'a TxnInstaller,
    module: String,
    prefix: Option<PathBuf>,
}

impl<'a> TxnScope<'a> {
    pub fn new(installer: &'a TxnInstaller, module: impl Into<String>) -> Self {
        Self {
            installer,
            module: module.into(),
            prefix: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn resolve(&self, dest: &Path) -> PathBuf {
        match &self.prefix {
            Some(prefix) => HostLayout::new(prefix).host_path(dest),
            None => dest.to_path_buf(),
        }
    }

    pub fn install(&self, source: &Path, dest: &Path, attrs: &FileAttrs) -> Result<InstallOutcome> {
        self.installer
            .install(&self.module, source, &self.resolve(dest), attrs)
    }

    pub fn install_bytes(
        &self,
        contents: &[u8],
        dest: &Path,
        attrs: &FileAttrs,
    ) -> Result<InstallOutcome> {
        self.installer
            .install_bytes(&self.module, contents, &self.resolve(dest), attrs)
    }

    pub fn remove(&self, dest: &Path) -> Result<bool> {
        self.installer.remove(&self.module, &self.resolve(dest))
    }

    pub fn rollback(&self) -> Result<RollbackSummary> {
        self.installer.rollback(&self.module)
    }
}

fn regular_file_metadata(path: &Path) -> Result<Option<fs::Metadata>> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => Ok(Some(metadata)),
        Ok(_) => Err(anyhow!(
            "refusing to replace non-regular file: {}",
            path.display()
        )),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to stat {}", path.display())),
    }
}

fn permission_bits(metadata: &fs::Metadata) -> u32 {
    metadata.permissions().mode() & 0o7777
}

fn file_digest(path: &Path) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(sha256_hex(&contents))
}

fn resolve_owner(attrs: &FileAttrs) -> Result<(Option<u32>, Option<u32>)> {
    let uid = match &attrs.owner {
        Some(name) => Some(
            User::from_name(name)
                .with_context(|| format!("failed to look up user '{name}'"))?
                .ok_or_else(|| anyhow!("unknown user '{name}'"))?
                .uid
                .as_raw(),
        ),
        None => None,
    };
    let gid = match &attrs.group {
        Some(name) => Some(
            Group::from_name(name)
                .with_context(|| format!("failed to look up group '{name}'"))?
                .ok_or_else(|| anyhow!("unknown group '{name}'"))?
                .gid
                .as_raw(),
        ),
        None => None,
    };
    Ok((uid, gid))
}

/// Writes `contents` to a temporary file next to `dest`, applies the
/// attributes, and renames it over `dest`.
fn replace_file(
    dest: &Path,
    contents: &[u8],
    mode: u32,
    uid: Option<u32>,
    gid: Option<u32>,
) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow!("destination has no parent directory: {}", dest.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;

    let mut staged = tempfile::Builder::new()
        .prefix(".spconverge.")
        .tempfile_in(parent)
        .with_context(|| format!("failed to create a temporary file in {}", parent.display()))?;
    staged
        .write_all(contents)
        .with_context(|| format!("failed to stage contents for {}", dest.display()))?;
    staged
        .as_file()
        .sync_all()
        .with_context(|| format!("failed to sync staged contents for {}", dest.display()))?;
    fs::set_permissions(staged.path(), fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to set the mode of {}", staged.path().display()))?;

    let staged_meta = staged
        .as_file()
        .metadata()
        .with_context(|| format!("failed to stat {}", staged.path().display()))?;
    let uid = uid.filter(|uid| *uid != staged_meta.uid());
    let gid = gid.filter(|gid| *gid != staged_meta.gid());
    if uid.is_some() || gid.is_some() {
        std::os::unix::fs::chown(staged.path(), uid, gid)
            .with_context(|| format!("failed to change the owner of {}", staged.path().display()))?;
    }

    staged
        .persist(dest)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to move staged file into place: {}", dest.display()))?;
    Ok(())
}
