use anyhow::Context;
use std::fs;
use std::path::Path;

use spconverge_core::{ConvergeError, ConvergeResult};
use spconverge_packages::{request, VersionConstraint};
use spconverge_txn::FileAttrs;
use tracing::{debug, info, warn};

use super::{install_and_record, rollback_files, storpool_version, unrecord_packages, StageBody};
use crate::cgroups::render_cgconfig;
use crate::resources::{ResourcePartition, ResourceReserve};
use crate::{StageContext, StageId};

pub const KERNEL_REQUIRED_PARAMS: &[&str] = &[
    "swapaccount=1",
    "vga=normal",
    "nofb",
    "nomodeset",
    "video=vesafb:off",
    "i915.modeset=0",
];

/// Host files copied from the etcfiles package.
const ETC_FILES: &[&str] = &[
    "/etc/rsyslog.d/99-StorPool.conf",
    "/etc/sysctl.d/99-StorPool.conf",
];

/// Installs the base StorPool packages and partitions the host resources.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommonBody;

impl CommonBody {
    fn check_kernel_parameters(ctx: &StageContext) -> ConvergeResult<()> {
        let path = ctx.layout().proc_cmdline();
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let line = raw
            .lines()
            .next()
            .ok_or_else(|| anyhow::anyhow!("could not read a single line from {}", path.display()))?;
        let words = line.split_whitespace().collect::<Vec<_>>();
        let missing = KERNEL_REQUIRED_PARAMS
            .iter()
            .filter(|param| !words.contains(*param))
            .copied()
            .collect::<Vec<_>>();
        if missing.is_empty() || ctx.bypassed("kernel_parameters") {
            return Ok(());
        }
        Err(ConvergeError::precondition(format!(
            "missing kernel parameters: {}",
            missing.join(" ")
        )))
    }

    fn kernel_release(ctx: &StageContext) -> ConvergeResult<String> {
        let path = ctx.layout().kernel_release_path();
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read the kernel release: {}", path.display()))?;
        Ok(raw.trim().to_string())
    }

    fn write_cgconfig(ctx: &StageContext) -> ConvergeResult<()> {
        let pad_cpus = ctx.bypassed("very_few_cpus");
        let reserve = if ctx.bypassed("very_little_memory") {
            ResourceReserve::DEVELOPMENT
        } else {
            ResourceReserve::PRODUCTION
        };
        let partition = ResourcePartition::from_host(ctx.layout(), pad_cpus, reserve)?;
        debug!(partition = ?partition, "generating the cgroup configuration");

        let dir = ctx.layout().cgconfig_dir();
        for (name, contents) in render_cgconfig(&partition) {
            ctx.installer().install_bytes(
                &StageId::Common.txn_module(),
                contents.as_bytes(),
                &dir.join(name),
                &FileAttrs::with_mode(0o644),
            )?;
        }

        if let Err(err) = ctx.services().daemon_reload() {
            warn!(error = %format!("{err:#}"), "could not reload the service database");
        }
        if let Err(err) = ctx.services().resume("cgconfig") {
            warn!(error = %format!("{err:#}"), "could not start the cgconfig service");
        }
        Ok(())
    }

    fn copy_etc_files(ctx: &StageContext, majmin: &str) -> ConvergeResult<()> {
        let basedir = ctx.layout().etcfiles_dir(majmin);
        let mut missing = Vec::new();
        for file in ETC_FILES {
            let source = basedir.join(Path::new(file.trim_start_matches('/')));
            if !source.is_file() {
                missing.push(source.display().to_string());
                continue;
            }
            ctx.installer().install(
                &StageId::Common.txn_module(),
                &source,
                &ctx.layout().host_path(file),
                &FileAttrs::with_mode(0o644),
            )?;
        }
        if !missing.is_empty() {
            return Err(ConvergeError::prerequisite(missing));
        }

        ctx.services().restart("rsyslog")?;
        Ok(())
    }
}

impl StageBody for CommonBody {
    fn converge(&self, ctx: &StageContext) -> ConvergeResult<()> {
        Self::check_kernel_parameters(ctx)?;
        let (version, majmin) = storpool_version(ctx)?;
        let release = Self::kernel_release(ctx)?;

        let exact = |name: String| (name, VersionConstraint::Exact(version.clone()));
        let packages = request([
            exact(format!("storpool-cli-{majmin}")),
            exact(format!("storpool-common-{majmin}")),
            exact(format!("storpool-etcfiles-{majmin}")),
            exact(format!("kmod-storpool-{majmin}-{release}")),
            exact(format!("python-storpool-{majmin}")),
        ]);
        install_and_record(ctx, StageId::Common, &packages)?;

        ctx.kernel().depmod()?;
        Self::write_cgconfig(ctx)?;
        Self::copy_etc_files(ctx, &majmin)?;
        info!(version = %version, "the StorPool common setup is complete");
        Ok(())
    }

    fn teardown(&self, ctx: &StageContext) -> ConvergeResult<()> {
        rollback_files(ctx, StageId::Common);
        unrecord_packages(ctx, StageId::Common)
    }
}
