use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};

use spconverge_core::{ConvergeError, ConvergeResult, HostLayout};
use tracing::{debug, info, warn};

use crate::{plan_installation, OwnershipStore, PackageBackend, PackageRequest};

/// Packages that only pass the removal dry run when removed together.
pub const CO_REMOVAL_GROUPS: &[&[&str]] = &[&["libwww-perl", "liblwp-protocol-https-perl"]];

/// Installs requested packages and remembers which layer wanted them, so a
/// layer's teardown removes only the packages nobody else still needs.
#[derive(Debug, Clone)]
pub struct PackageReconciler<B> {
    backend: B,
    store: OwnershipStore,
    owner: String,
}

impl<B: PackageBackend> PackageReconciler<B> {
    pub fn new(backend: B, layout: &HostLayout, owner: impl Into<String>) -> Self {
        Self::with_store(backend, OwnershipStore::new(layout.install_list_path()), owner)
    }

    pub fn with_store(backend: B, store: OwnershipStore, owner: impl Into<String>) -> Self {
        Self {
            backend,
            store,
            owner: owner.into(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn store(&self) -> &OwnershipStore {
        &self.store
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Installs whatever part of `requests` is not already satisfied and
    /// returns every package whose installed version changed as a result,
    /// dependencies included.
    pub fn install(&self, requests: &PackageRequest) -> ConvergeResult<BTreeSet<String>> {
        let mut policies = BTreeMap::new();
        for name in requests.keys() {
            let policy = self.backend.policy(name).map_err(|err| {
                ConvergeError::install_failure(
                    requests.keys().cloned(),
                    format!("could not query the APT policy: {err:#}"),
                )
            })?;
            policies.insert(name.clone(), policy);
        }

        let selected = plan_installation(requests, &policies)
            .map_err(|err| ConvergeError::install_failure([err.package()], err.to_string()))?;
        if selected.is_empty() {
            debug!(requested = requests.len(), "all requested packages already installed");
            return Ok(BTreeSet::new());
        }

        info!(packages = %selected.join(" "), "installing packages");
        let install_failure =
            |err: anyhow::Error| ConvergeError::install_failure(selected.clone(), format!("{err:#}"));
        let before = self.backend.installed_versions().map_err(install_failure)?;
        self.backend.install(&selected).map_err(install_failure)?;
        let after = self.backend.installed_versions().map_err(install_failure)?;

        let changed = after
            .iter()
            .filter(|(name, version)| before.get(*name) != Some(*version))
            .map(|(name, _)| name.clone())
            .collect::<BTreeSet<_>>();
        info!(
            packages = %changed.iter().cloned().collect::<Vec<_>>().join(" "),
            "installed or upgraded packages"
        );
        Ok(changed)
    }

    /// Adds `names` to the layer's owned set; none of them is a removal
    /// candidate any more.
    pub fn record<I, S>(&self, layer: &str, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut locked = self.store.lock()?;
        locked.record.record(&self.owner, layer, names);
        locked.save()?;
        debug!(owner = %self.owner, layer, "recorded packages");
        Ok(())
    }

    /// Forgets the layer, then removes every package no remaining layer
    /// owns, for as long as removals keep succeeding. Returns the packages
    /// actually removed.
    pub fn unrecord(&self, layer: &str) -> Result<BTreeSet<String>> {
        if !self.store.path().exists() {
            debug!(layer, "no ownership record, nothing to remove");
            return Ok(BTreeSet::new());
        }

        let mut locked = self.store.lock()?;
        let freed = locked.record.drop_layer(&self.owner, layer);
        let mut candidates = locked.record.removal_candidates(&freed);
        locked.record.packages.remove = candidates.clone();
        locked.save()?;

        let removed = self.remove_until_stable(&mut candidates)?;
        locked.record.packages.remove = candidates;
        locked.save()?;

        if !locked.record.packages.remove.is_empty() {
            debug!(
                pending = %locked.record.packages.remove.iter().cloned().collect::<Vec<_>>().join(" "),
                "packages kept for a later removal attempt"
            );
        }
        Ok(removed)
    }

    pub fn update_index(&self) -> Result<()> {
        self.backend.update_index()
    }

    pub fn package_files(&self, name: &str) -> Result<Vec<String>> {
        self.backend.installed_package_files(name)
    }

    pub fn package_depends(&self, name: &str) -> Result<Vec<String>> {
        self.backend.package_depends(name)
    }

    fn remove_until_stable(&self, candidates: &mut BTreeSet<String>) -> Result<BTreeSet<String>> {
        let mut removed = BTreeSet::new();
        loop {
            let mut removed_now = BTreeSet::new();

            for group in CO_REMOVAL_GROUPS {
                if !group.iter().all(|name| candidates.contains(*name)) {
                    continue;
                }
                let names = group.iter().map(ToString::to_string).collect::<Vec<_>>();
                if self.try_remove(&names)? {
                    removed_now.extend(names);
                }
            }

            for name in candidates.iter() {
                if removed_now.contains(name) {
                    continue;
                }
                if self.try_remove(std::slice::from_ref(name))? {
                    removed_now.insert(name.clone());
                }
            }

            if removed_now.is_empty() {
                break;
            }
            candidates.retain(|name| !removed_now.contains(name));
            removed.extend(removed_now);
        }
        Ok(removed)
    }

    fn try_remove(&self, names: &[String]) -> Result<bool> {
        if !self.backend.removal_dry_run(names)? {
            debug!(packages = %names.join(" "), "removal dry run refused");
            return Ok(false);
        }
        match self.backend.purge(names) {
            Ok(()) => {
                info!(packages = %names.join(" "), "removed packages");
                Ok(true)
            }
            Err(err) => {
                warn!(packages = %names.join(" "), error = %format!("{err:#}"), "could not purge packages");
                Ok(false)
            }
        }
    }
}
