use spconverge_core::{ConvergeResult, SP_IFACE};
use spconverge_netconf::{required_lines_from_spec, InterfacesPatcher};
use spconverge_packages::{PackageRequest, VersionConstraint};
use spconverge_txn::FileAttrs;
use tracing::{debug, info, warn};

use super::{install_and_record, rollback_files, storpool_version, unrecord_packages, StageBody};
use crate::{StageContext, StageId};

const SETTING_CONF: &str = "storpool_conf";

/// Installs the StorPool configuration and the host networking it needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigBody;

impl ConfigBody {
    fn unload_kernel_modules(ctx: &StageContext) {
        let loaded = match ctx.kernel().loaded_modules() {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "could not list the loaded kernel modules");
                return;
            }
        };
        for module in loaded.iter().filter(|name| name.starts_with("storpool_")) {
            debug!(module = %module, "unloading a kernel module");
            if let Err(err) = ctx.kernel().unload(module) {
                warn!(module = %module, error = %format!("{err:#}"), "could not unload a kernel module");
            }
        }

        match ctx.kernel().loaded_modules() {
            Ok(after) => {
                let remaining = after
                    .into_iter()
                    .filter(|name| name.starts_with("storpool_"))
                    .collect::<Vec<_>>();
                if !remaining.is_empty() {
                    warn!(modules = %remaining.join(" "), "some StorPool kernel modules are still loaded");
                }
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "could not recheck the loaded kernel modules");
            }
        }
    }
}

impl StageBody for ConfigBody {
    fn converge(&self, ctx: &StageContext) -> ConvergeResult<()> {
        let stage = StageId::Config;
        let conf = ctx.settings().require_one(SETTING_CONF)?;
        let (version, majmin) = storpool_version(ctx)?;

        let mut request = PackageRequest::new();
        request.insert("txn-install".to_string(), VersionConstraint::Any);
        request.insert(
            format!("storpool-config-{majmin}"),
            VersionConstraint::Exact(version),
        );
        install_and_record(ctx, stage, &request)?;

        let mut contents = conf;
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
        ctx.installer().install_bytes(
            &stage.txn_module(),
            contents.as_bytes(),
            &ctx.layout().storpool_conf_path(),
            &FileAttrs::with_mode(0o644),
        )?;

        let our_id = ctx.refresh_our_id()?;
        info!(our_id = %our_id, "installed the StorPool configuration");

        if ctx.in_lxc() {
            debug!("running in a container, leaving the network configuration alone");
            return Ok(());
        }

        let iface = ctx.storpool_conf(SP_IFACE)?.ok_or_else(|| {
            anyhow::anyhow!("no {SP_IFACE} in the StorPool configuration")
        })?;
        let required = required_lines_from_spec(&iface)?;
        let changed = InterfacesPatcher::new(ctx.installer(), stage.txn_module())
            .patch(&ctx.layout().interfaces_path(), &required)?;
        if changed {
            info!(iface = %iface, "updated the network interfaces configuration");
        } else {
            debug!("the network interfaces configuration is up to date");
        }
        Ok(())
    }

    fn teardown(&self, ctx: &StageContext) -> ConvergeResult<()> {
        rollback_files(ctx, StageId::Config);
        if !ctx.in_lxc() {
            Self::unload_kernel_modules(ctx);
        }
        unrecord_packages(ctx, StageId::Config)?;
        ctx.forget_our_id()?;
        ctx.drop_conf_cache();
        Ok(())
    }
}
