use anyhow::{Context, Result};
use std::cell::RefCell;
use std::fs;

use spconverge_core::{
    running_in_lxc, ConvergeResult, FlagStore, HostLayout, JsonFlagStore, LayeredSettings,
    StorpoolConfCache, KEY_OUR_ID, SP_OURID,
};
use spconverge_packages::{AptBackend, PackageBackend, PackageReconciler};
use spconverge_txn::TxnInstaller;
use tracing::warn;

use crate::host::{ContainerTools, KernelTools, Lxd, ServiceManager, SystemKernelTools, Systemctl};

/// Owner name recorded in the package ownership file.
pub const PACKAGE_OWNER: &str = "spconverge";

/// Overrides the node name used to pick the `[section]` of storpool.conf.
pub const SETTING_NODE_NAME: &str = "storpool_node_name";

/// Everything a stage body works with: settings, host paths and the tools
/// that change the host.
pub struct StageContext {
    layout: HostLayout,
    settings: LayeredSettings,
    flags: Box<dyn FlagStore>,
    installer: TxnInstaller,
    packages: PackageReconciler<Box<dyn PackageBackend>>,
    services: Box<dyn ServiceManager>,
    kernel: Box<dyn KernelTools>,
    containers: Box<dyn ContainerTools>,
    conf: RefCell<StorpoolConfCache>,
    in_lxc: bool,
}

impl StageContext {
    pub fn new(
        layout: HostLayout,
        settings: LayeredSettings,
        flags: Box<dyn FlagStore>,
        backend: Box<dyn PackageBackend>,
        services: Box<dyn ServiceManager>,
        kernel: Box<dyn KernelTools>,
    ) -> Result<Self> {
        let node = node_name(&layout, &settings)?;
        let conf = StorpoolConfCache::new(layout.storpool_conf_path(), node);
        Ok(Self {
            installer: TxnInstaller::new(layout.clone()),
            packages: PackageReconciler::new(backend, &layout, PACKAGE_OWNER),
            in_lxc: running_in_lxc(&layout),
            conf: RefCell::new(conf),
            layout,
            settings,
            flags,
            services,
            kernel,
            containers: Box::new(Lxd),
        })
    }

    /// Replaces the tools used to reach the host's containers.
    pub fn with_containers(mut self, containers: Box<dyn ContainerTools>) -> Self {
        self.containers = containers;
        self
    }

    /// A context that drives the real host tools.
    pub fn system(layout: HostLayout, settings: LayeredSettings) -> Result<Self> {
        layout.ensure_state_dirs()?;
        let flags = JsonFlagStore::open(layout.flags_path());
        Self::new(
            layout,
            settings,
            Box::new(flags),
            Box::new(AptBackend::new()),
            Box::new(Systemctl),
            Box::new(SystemKernelTools),
        )
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    pub fn settings(&self) -> &LayeredSettings {
        &self.settings
    }

    pub fn flags(&self) -> &dyn FlagStore {
        self.flags.as_ref()
    }

    pub fn installer(&self) -> &TxnInstaller {
        &self.installer
    }

    pub fn packages(&self) -> &PackageReconciler<Box<dyn PackageBackend>> {
        &self.packages
    }

    pub fn services(&self) -> &dyn ServiceManager {
        self.services.as_ref()
    }

    pub fn kernel(&self) -> &dyn KernelTools {
        self.kernel.as_ref()
    }

    pub fn containers(&self) -> &dyn ContainerTools {
        self.containers.as_ref()
    }

    pub fn in_lxc(&self) -> bool {
        self.in_lxc
    }

    pub fn set_in_lxc(&mut self, in_lxc: bool) {
        self.in_lxc = in_lxc;
    }

    /// Whether the operator skipped `check`; warns loudly when so.
    pub fn bypassed(&self, check: &str) -> bool {
        let bypassed = self.settings.bypassed(check);
        if bypassed {
            warn!(
                check,
                "the '{check}' bypass is meant FOR DEVELOPMENT ONLY, do not run a StorPool cluster in production with it"
            );
        }
        bypassed
    }

    /// Looks up a key in this node's view of storpool.conf.
    pub fn storpool_conf(&self, key: &str) -> Result<Option<String>> {
        self.conf.borrow_mut().get(key)
    }

    /// The node whose storpool.conf section applies here.
    pub fn node_name(&self) -> String {
        self.conf.borrow().node().to_string()
    }

    pub fn drop_conf_cache(&self) {
        self.conf.borrow_mut().drop_cache();
    }

    pub fn our_id(&self) -> Result<Option<String>> {
        self.flags.get(KEY_OUR_ID)
    }

    /// Re-reads storpool.conf and caches this node's `SP_OURID`.
    pub fn refresh_our_id(&self) -> ConvergeResult<String> {
        self.drop_conf_cache();
        let node = self.node_name();
        let our_id = self.storpool_conf(SP_OURID)?.ok_or_else(|| {
            anyhow::anyhow!("no {SP_OURID} for the '{node}' node in the StorPool config")
        })?;
        self.flags.set(KEY_OUR_ID, &our_id)?;
        Ok(our_id)
    }

    pub fn forget_our_id(&self) -> Result<()> {
        self.flags.unset(KEY_OUR_ID)
    }
}

fn node_name(layout: &HostLayout, settings: &LayeredSettings) -> Result<String> {
    if let Some(node) = settings.string(SETTING_NODE_NAME) {
        return Ok(node.to_string());
    }
    let path = layout.hostname_path();
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read the host name: {}", path.display()))?;
    Ok(raw.trim().to_string())
}
