use spconverge_core::{ConvergeError, ConvergeResult};
use spconverge_packages::{PackageRequest, VersionConstraint};
use tracing::{debug, info, warn};

use super::{install_and_record, storpool_version, unrecord_packages, StageBody};
use crate::cgroups::check_cgroups;
use crate::{StageContext, StageId};

const STAT_SERVICE: &str = "storpool_stat";

/// Installs and runs one StorPool service.
#[derive(Debug, Clone, Copy)]
pub struct ServiceBody {
    stage: StageId,
    /// Short name, e.g. `beacon`.
    name: &'static str,
    with_stat: bool,
}

impl ServiceBody {
    pub fn beacon() -> Self {
        Self {
            stage: StageId::Beacon,
            name: "beacon",
            with_stat: false,
        }
    }

    pub fn block() -> Self {
        Self {
            stage: StageId::Block,
            name: "block",
            with_stat: true,
        }
    }

    pub fn service(&self) -> String {
        format!("storpool_{}", self.name)
    }

    fn stat_present(&self, ctx: &StageContext) -> bool {
        self.with_stat && ctx.layout().storpool_stat_bin().is_file()
    }

    fn check_unit(&self, ctx: &StageContext) -> ConvergeResult<()> {
        let service = self.service();
        match ctx.services().unit_type(&service)?.as_deref() {
            Some("forking") | Some("simple") => Ok(()),
            other => {
                debug!(service = %service, unit_type = ?other, "unexpected unit type");
                Err(ConvergeError::prerequisite([format!("{service}.service")]))
            }
        }
    }
}

impl StageBody for ServiceBody {
    fn converge(&self, ctx: &StageContext) -> ConvergeResult<()> {
        if ctx.in_lxc() {
            debug!(stage = %self.stage, "running in a container, skipping the service");
            return Ok(());
        }

        let (_, majmin) = storpool_version(ctx)?;
        let mut packages = PackageRequest::new();
        packages.insert(format!("storpool-{}-{majmin}", self.name), VersionConstraint::Any);
        install_and_record(ctx, self.stage, &packages)?;

        check_cgroups(ctx, self.name)?;
        if let Err(err) = ctx.services().daemon_reload() {
            warn!(error = %format!("{err:#}"), "could not reload the service database");
        }
        self.check_unit(ctx)?;

        let service = self.service();
        ctx.services().resume(&service)?;
        if self.stat_present(ctx) {
            ctx.services().resume(STAT_SERVICE)?;
        }
        info!(service = %service, "the service is running");
        Ok(())
    }

    fn teardown(&self, ctx: &StageContext) -> ConvergeResult<()> {
        if !ctx.in_lxc() {
            let mut services = vec![self.service()];
            if self.stat_present(ctx) {
                services.push(STAT_SERVICE.to_string());
            }
            for service in services {
                if let Err(err) = ctx.services().pause(&service) {
                    warn!(service = %service, error = %format!("{err:#}"), "could not stop the service");
                }
            }
        }
        unrecord_packages(ctx, self.stage)
    }
}
