use anyhow::{anyhow, Context, Result};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

/// Which layer of which owner asked for which packages, plus the packages
/// that no layer wants any more but that could not be removed yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    #[serde(default)]
    pub charms: BTreeMap<String, OwnerEntry>,
    #[serde(default)]
    pub packages: RemovalEntry,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerEntry {
    #[serde(default)]
    pub layers: BTreeMap<String, LayerEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerEntry {
    #[serde(default)]
    pub packages: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalEntry {
    #[serde(default)]
    pub remove: BTreeSet<String>,
}

impl OwnershipRecord {
    pub fn layer_packages(&self, owner: &str, layer: &str) -> BTreeSet<String> {
        self.charms
            .get(owner)
            .and_then(|entry| entry.layers.get(layer))
            .map(|layer| layer.packages.clone())
            .unwrap_or_default()
    }

    pub fn record<I, S>(&mut self, owner: &str, layer: &str, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let owned = &mut self
            .charms
            .entry(owner.to_string())
            .or_default()
            .layers
            .entry(layer.to_string())
            .or_default()
            .packages;
        owned.extend(names.into_iter().map(Into::into));
        let owned = owned.clone();
        self.packages.remove.retain(|name| !owned.contains(name));
    }

    /// Forgets the layer and returns the packages it owned.
    pub fn drop_layer(&mut self, owner: &str, layer: &str) -> BTreeSet<String> {
        let Some(entry) = self.charms.get_mut(owner) else {
            return BTreeSet::new();
        };
        let freed = entry
            .layers
            .remove(layer)
            .map(|layer| layer.packages)
            .unwrap_or_default();
        if entry.layers.is_empty() {
            self.charms.remove(owner);
        }
        freed
    }

    /// Every package some layer of some owner still wants.
    pub fn owned(&self) -> BTreeSet<String> {
        self.charms
            .values()
            .flat_map(|entry| entry.layers.values())
            .flat_map(|layer| layer.packages.iter().cloned())
            .collect()
    }

    pub fn removal_candidates(&self, freed: &BTreeSet<String>) -> BTreeSet<String> {
        let owned = self.owned();
        self.packages
            .remove
            .union(freed)
            .filter(|name| !owned.contains(*name))
            .cloned()
            .collect()
    }
}

/// The on-disk ownership record; every access holds an exclusive lock on
/// the record file for the whole read-modify-write.
#[derive(Debug, Clone)]
pub struct OwnershipStore {
    path: PathBuf,
}

impl OwnershipStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock(&self) -> Result<LockedOwnership> {
        if let Some(parent) = self.path.parent() {
            if !parent.is_dir() {
                DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .with_context(|| format!("failed to open ownership record: {}", self.path.display()))?;
        let mut file = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            anyhow!(
                "failed to lock ownership record {}: {errno}",
                self.path.display()
            )
        })?;

        let mut raw = String::new();
        file.read_to_string(&mut raw)
            .with_context(|| format!("failed to read ownership record: {}", self.path.display()))?;
        let record = if raw.trim().is_empty() {
            OwnershipRecord::default()
        } else {
            serde_json::from_str(&raw).with_context(|| {
                format!(
                    "failed to parse ownership record: {}",
                    self.path.display()
                )
            })?
        };

        Ok(LockedOwnership {
            path: self.path.clone(),
            file,
            record,
        })
    }

    /// Reads the record if it exists, without creating it.
    pub fn read(&self) -> Result<Option<OwnershipRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        Ok(Some(self.lock()?.record))
    }
}

/// A locked, loaded ownership record; the lock is released on drop.
pub struct LockedOwnership {
    path: PathBuf,
    file: Flock<File>,
    pub record: OwnershipRecord,
}

impl LockedOwnership {
    /// Rewrites the record file in place while still holding the lock.
    pub fn save(&mut self) -> Result<()> {
        let mut payload =
            serde_json::to_vec_pretty(&self.record).context("failed to encode ownership record")?;
        payload.push(b'\n');

        rewrite(&mut self.file, &payload)
            .with_context(|| format!("failed to write ownership record: {}", self.path.display()))
    }
}

fn rewrite(file: &mut File, payload: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;
    file.write_all(payload)?;
    file.sync_all()
}
