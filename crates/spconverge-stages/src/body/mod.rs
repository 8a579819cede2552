use std::collections::BTreeSet;

use spconverge_core::{major_minor, ConvergeResult};
use spconverge_packages::PackageRequest;
use tracing::{debug, info, warn};

use crate::{StageContext, StageId};

mod common;
mod config;
mod openstack;
mod repo_add;
mod service;

pub use common::{CommonBody, KERNEL_REQUIRED_PARAMS};
pub use config::ConfigBody;
pub use openstack::{OpenStackBody, KEY_CINDER_LXD, KEY_OSI_VERSION, OPENSTACK_COMPONENTS};
pub use repo_add::{RepoAddBody, OBSOLETE_REPO_FILES};
pub use service::ServiceBody;

pub(crate) const SETTING_VERSION: &str = "storpool_version";

/// The work one stage does on the host.
pub trait StageBody {
    fn converge(&self, ctx: &StageContext) -> ConvergeResult<()>;
    fn teardown(&self, ctx: &StageContext) -> ConvergeResult<()>;
}

pub fn default_body(stage: StageId) -> Box<dyn StageBody> {
    match stage {
        StageId::RepoAdd => Box::new(RepoAddBody),
        StageId::Config => Box::new(ConfigBody),
        StageId::Common => Box::new(CommonBody),
        StageId::OpenStackIntegration => Box::new(OpenStackBody),
        StageId::Beacon => Box::new(ServiceBody::beacon()),
        StageId::Block => Box::new(ServiceBody::block()),
    }
}

/// The requested StorPool version and its `major.minor` prefix.
pub(crate) fn storpool_version(ctx: &StageContext) -> ConvergeResult<(String, String)> {
    let version = ctx.settings().require_one(SETTING_VERSION)?;
    let majmin = major_minor(&version);
    Ok((version, majmin))
}

/// Installs `request` and records whatever changed under the stage's layer.
pub(crate) fn install_and_record(
    ctx: &StageContext,
    stage: StageId,
    request: &PackageRequest,
) -> ConvergeResult<BTreeSet<String>> {
    let names = request.keys().cloned().collect::<Vec<_>>().join(" ");
    debug!(stage = %stage, packages = %names, "installing packages");
    let installed = ctx.packages().install(request)?;
    if installed.is_empty() {
        debug!(stage = %stage, "all the packages were installed already");
    } else {
        info!(
            stage = %stage,
            installed = %installed.iter().cloned().collect::<Vec<_>>().join(" "),
            "installed packages"
        );
        ctx.packages().record(&stage.layer(), &installed)?;
    }
    Ok(installed)
}

/// Rolls back the stage's files, logging instead of failing.
pub(crate) fn rollback_files(ctx: &StageContext, stage: StageId) {
    match ctx.installer().rollback(&stage.txn_module()) {
        Ok(summary) if summary.is_empty() => {
            debug!(stage = %stage, "no files to roll back");
        }
        Ok(summary) => {
            info!(
                stage = %stage,
                restored = summary.restored.len(),
                removed = summary.removed.len(),
                "rolled back the stage files"
            );
        }
        Err(err) => {
            warn!(stage = %stage, error = %format!("{err:#}"), "could not roll back the stage files");
        }
    }
}

pub(crate) fn unrecord_packages(ctx: &StageContext, stage: StageId) -> ConvergeResult<()> {
    let removed = ctx.packages().unrecord(&stage.layer())?;
    if !removed.is_empty() {
        info!(
            stage = %stage,
            removed = %removed.iter().cloned().collect::<Vec<_>>().join(" "),
            "removed packages"
        );
    }
    Ok(())
}
