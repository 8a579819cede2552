use anyhow::{anyhow, Context};
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use spconverge_core::{ConvergeError, ConvergeResult, FlagStore};
use spconverge_packages::{request, VersionConstraint};
use spconverge_txn::{FileAttrs, InstallOutcome, TxnScope};
use tracing::{debug, info, warn};

use super::{install_and_record, rollback_files, unrecord_packages, StageBody, SETTING_VERSION};
use crate::{StageContext, StageId};

const SETTING_INSTALL: &str = "storpool_openstack_install";
const SETTING_OSI_VERSION: &str = "storpool_openstack_version";
const SETTING_HANDLE_LXC: &str = "handle_lxc";

/// Flag holding the integration version this host was set up for.
pub const KEY_OSI_VERSION: &str = "storpool-osi.version";

/// Flag holding the container that runs Cinder, if any.
pub const KEY_CINDER_LXD: &str = "storpool-openstack-integration.lxd-name";

/// The OpenStack components `sp-openstack` knows how to detect and patch.
pub const OPENSTACK_COMPONENTS: &[&str] = &["cinder", "os_brick", "nova"];

const INTEGRATION_PACKAGE: &str = "storpool-openstack-integration";
const CONTAINER_PACKAGES: &[&str] = &["txn-install", "python-storpool-spopenstack"];

const BLOCK_CONF: &str = "/etc/storpool.conf.d/storpool-cinder-block.conf";
const OURID_CONF: &str = "/etc/storpool.conf.d/storpool-cinder-ourid.conf";
const STORPOOL_CONF: &str = "/etc/storpool.conf";

const BLOCK_SERVICE: &str = "storpool_block";
const NOVA_SERVICE: &str = "nova-compute";

/// Installs the StorPool OpenStack integration on the host and, when asked
/// to, in the host's LXD containers.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenStackBody;

/// What the component scan found.
#[derive(Debug, Default)]
struct Findings {
    cinder_container: Option<String>,
    nova_on_host: bool,
}

fn describe(container: Option<&str>) -> String {
    match container {
        Some(name) => format!("the \"{name}\" container"),
        None => "the host".to_string(),
    }
}

impl OpenStackBody {
    fn install_packages(ctx: &StageContext, version: &str, osi_version: &str) -> ConvergeResult<()> {
        let exact = |name: &str, version: &str| {
            (name.to_string(), VersionConstraint::Exact(version.to_string()))
        };
        let packages = request([
            exact("storpool-block", version),
            exact("python-storpool-spopenstack", version),
            exact(INTEGRATION_PACKAGE, osi_version),
        ]);
        install_and_record(ctx, StageId::OpenStackIntegration, &packages)?;
        Ok(())
    }

    /// Copies an installed package and the dependencies the container lacks
    /// into the container's root filesystem.
    fn copy_package_tree(
        ctx: &StageContext,
        scope: &TxnScope<'_>,
        container: &str,
        name: &str,
        seen: &mut BTreeSet<String>,
    ) -> ConvergeResult<()> {
        if !seen.insert(name.to_string()) {
            return Ok(());
        }
        let query = ["dpkg-query", "-W", "-f", "${Version}", "--", name];
        if ctx.containers().run(Some(container), &query)? {
            debug!(container, package = name, "the package is present in the container");
            return Ok(());
        }
        for dep in ctx.packages().package_depends(name)? {
            Self::copy_package_tree(ctx, scope, container, &dep, seen)?;
        }

        debug!(container, package = name, "copying the package files");
        for file in ctx.packages().package_files(name)? {
            let source = ctx.layout().host_path(&file);
            let Ok(metadata) = fs::metadata(&source) else {
                debug!(path = %source.display(), "skipping a missing package file");
                continue;
            };
            if metadata.is_dir() {
                let dir = scope.resolve(Path::new(&file));
                fs::create_dir_all(&dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            } else if metadata.is_file() {
                let mode = metadata.permissions().mode() & 0o7777;
                scope.install(&source, Path::new(&file), &FileAttrs::with_mode(mode))?;
            }
        }
        Ok(())
    }

    fn our_id(ctx: &StageContext) -> ConvergeResult<String> {
        match ctx.our_id()? {
            Some(our_id) => Ok(our_id),
            None => ctx.refresh_our_id(),
        }
    }

    /// Gives a container with an OpenStack component what it needs to talk
    /// to StorPool.
    fn prepare_container(
        ctx: &StageContext,
        scope: &TxnScope<'_>,
        container: &str,
        seen: &mut BTreeSet<String>,
    ) -> ConvergeResult<()> {
        for package in CONTAINER_PACKAGES {
            Self::copy_package_tree(ctx, scope, container, package, seen)?;
        }
        let attrs = FileAttrs::with_mode(0o644);
        scope.install(&ctx.layout().storpool_conf_path(), Path::new(STORPOOL_CONF), &attrs)?;

        let our_id = Self::our_id(ctx)?;
        let ourid_conf = format!("[{container}]\nSP_OURID={our_id}\n");
        scope.install_bytes(ourid_conf.as_bytes(), Path::new(OURID_CONF), &attrs)?;
        Ok(())
    }

    /// Runs `sp-openstack` for every component found on the target.
    fn integrate(
        ctx: &StageContext,
        scope: &TxnScope<'_>,
        container: Option<&str>,
        findings: &mut Findings,
    ) -> ConvergeResult<()> {
        let tools = ctx.containers();
        let mut seen = BTreeSet::new();
        if let Some(name) = container {
            Self::copy_package_tree(ctx, scope, name, INTEGRATION_PACKAGE, &mut seen)?;
        }

        for &component in OPENSTACK_COMPONENTS {
            if !tools.run(container, &["sp-openstack", "--", "detect", component])? {
                debug!(component, target = %describe(container), "component not found");
                continue;
            }
            info!(component, target = %describe(container), "found an OpenStack component");

            match container {
                Some(name) => {
                    if component == "cinder" {
                        match &findings.cinder_container {
                            None => findings.cinder_container = Some(name.to_string()),
                            Some(first) => warn!(
                                first = %first,
                                second = name,
                                "found two Cinder containers, using the first one"
                            ),
                        }
                    }
                    Self::prepare_container(ctx, scope, name, &mut seen)?;
                }
                None => {
                    if component == "nova" {
                        findings.nova_on_host = true;
                    }
                }
            }

            if tools.run(container, &["sp-openstack", "--", "check", component])? {
                debug!(component, target = %describe(container), "the integration is already there");
                continue;
            }
            let module = scope.module();
            let install = ["sp-openstack", "-T", module, "--", "install", component];
            if !tools.run(container, &install)? {
                return Err(ConvergeError::Fault(anyhow!(
                    "could not install the StorPool OpenStack integration for {component} in {}",
                    describe(container)
                )));
            }
            info!(component, target = %describe(container), "installed the OpenStack integration");
        }
        Ok(())
    }

    /// Points storpool_block at the Cinder container, or stops doing so.
    fn write_block_conf(ctx: &StageContext, cinder: Option<&str>) -> ConvergeResult<()> {
        let module = StageId::OpenStackIntegration.txn_module();
        let path = ctx.layout().host_path(BLOCK_CONF);
        let changed = match cinder {
            Some(name) => {
                let contents = format!("[{}]\nSP_EXTRA_FS=lxd:{name}\n", ctx.node_name());
                let outcome = ctx.installer().install_bytes(
                    &module,
                    contents.as_bytes(),
                    &path,
                    &FileAttrs::with_mode(0o644),
                )?;
                ctx.flags().set(KEY_CINDER_LXD, name)?;
                outcome == InstallOutcome::Installed
            }
            None => {
                let removed = ctx.installer().remove(&module, &path)?;
                ctx.flags().unset(KEY_CINDER_LXD)?;
                removed
            }
        };
        if changed {
            Self::restart_block(ctx);
        }
        Ok(())
    }

    /// storpool_block may not be running yet, so failures are only logged.
    fn restart_block(ctx: &StageContext) {
        match ctx.services().is_active(BLOCK_SERVICE) {
            Ok(true) => {
                if let Err(err) = ctx.services().restart(BLOCK_SERVICE) {
                    warn!(error = %format!("{err:#}"), "could not restart {BLOCK_SERVICE}");
                }
            }
            Ok(false) => debug!("{BLOCK_SERVICE} is not running"),
            Err(err) => warn!(error = %format!("{err:#}"), "could not query {BLOCK_SERVICE}"),
        }
    }
}

impl StageBody for OpenStackBody {
    fn converge(&self, ctx: &StageContext) -> ConvergeResult<()> {
        let stage = StageId::OpenStackIntegration;
        if !ctx.settings().bool(SETTING_INSTALL) {
            debug!(stage = %stage, "the OpenStack integration is not requested");
            ctx.flags().unset(KEY_OSI_VERSION)?;
            return Ok(());
        }
        let versions = ctx.settings().require(&[SETTING_VERSION, SETTING_OSI_VERSION])?;
        let (version, osi_version) = (&versions[0], &versions[1]);
        Self::install_packages(ctx, version, osi_version)?;

        let containers = if ctx.settings().bool(SETTING_HANDLE_LXC) {
            ctx.containers().list()?
        } else {
            Vec::new()
        };
        let layout = ctx.layout();
        let module = stage.txn_module();
        let mut findings = Findings::default();

        let host_scope = ctx.installer().scope(module.as_str()).with_prefix(layout.root());
        Self::integrate(ctx, &host_scope, None, &mut findings)?;
        for name in &containers {
            let scope = ctx
                .installer()
                .scope(module.as_str())
                .with_prefix(layout.lxd_rootfs(name));
            Self::integrate(ctx, &scope, Some(name.as_str()), &mut findings)?;
        }

        Self::write_block_conf(ctx, findings.cinder_container.as_deref())?;
        if findings.nova_on_host {
            if let Err(err) = ctx.services().restart(NOVA_SERVICE) {
                warn!(error = %format!("{err:#}"), "could not restart {NOVA_SERVICE}");
            }
        }

        ctx.flags().set(KEY_OSI_VERSION, osi_version)?;
        info!(
            version = %osi_version,
            containers = containers.len(),
            "the OpenStack integration is in place"
        );
        Ok(())
    }

    fn teardown(&self, ctx: &StageContext) -> ConvergeResult<()> {
        let stage = StageId::OpenStackIntegration;
        rollback_files(ctx, stage);
        unrecord_packages(ctx, stage)?;
        ctx.flags().unset(KEY_CINDER_LXD)?;
        ctx.flags().unset(KEY_OSI_VERSION)?;
        Ok(())
    }
}
