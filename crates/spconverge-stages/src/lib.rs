//! The StorPool client stages: what each one does to the host, the order
//! they run in, and the state each one is left in.

mod body;
mod cgroups;
mod context;
mod graph;
pub mod host;
mod orchestrator;
pub mod os_release;
pub mod resources;
mod state;

pub use body::{
    default_body, CommonBody, ConfigBody, OpenStackBody, RepoAddBody, ServiceBody, StageBody,
    KERNEL_REQUIRED_PARAMS, KEY_CINDER_LXD, KEY_OSI_VERSION, OBSOLETE_REPO_FILES,
    OPENSTACK_COMPONENTS,
};
pub use cgroups::{cgroup_paths, check_cgroups, render_cgconfig, CGCONFIG_FILES};
pub use context::{StageContext, PACKAGE_OWNER, SETTING_NODE_NAME};
pub use graph::{StageGraph, StageId};
pub use host::{ContainerTools, KernelTools, Lxd, ServiceManager, SystemKernelTools, Systemctl};
pub use orchestrator::{HookEvent, Orchestrator, Outcome};
pub use resources::{ResourcePartition, ResourceReserve};
pub use state::{load_state, store_state, StageState};
