mod error;
mod flags;
mod layout;
mod lock;
mod process;
mod settings;
mod storpool_conf;

pub use error::{ConvergeError, ConvergeResult, ErrorClass};
pub use flags::{FlagStore, JsonFlagStore, MemoryFlagStore, KEY_OUR_ID, KEY_STATUS};
pub use layout::{running_in_lxc, HostLayout};
pub use lock::ExclusiveLock;
pub use process::{command_output, command_succeeds, run_command};
pub use settings::{
    is_truthy, parse_overrides, LayeredSettings, SettingsLayer, SETTING_BYPASSED_CHECKS,
};
pub use storpool_conf::{StorpoolConf, StorpoolConfCache, SP_IFACE, SP_OURID, SP_USE_CGROUPS};

/// The `major.minor` prefix of a StorPool version string, e.g. `18.01`.
pub fn major_minor(version: &str) -> String {
    version.split('.').take(2).collect::<Vec<_>>().join(".")
}
