use anyhow::{Context, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Resolves every host path the convergence engine touches relative to a
/// root directory, so that a whole host can be staged under a scratch tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    root: PathBuf,
}

impl HostLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn system() -> Self {
        Self::new("/")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps an absolute host path such as `/etc/storpool.conf` under the root.
    pub fn host_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let mut out = self.root.clone();
        let mut depth = 0_usize;
        for component in path.as_ref().components() {
            match component {
                Component::Normal(part) => {
                    out.push(part);
                    depth += 1;
                }
                Component::ParentDir => {
                    if depth > 0 {
                        out.pop();
                        depth -= 1;
                    }
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        out
    }

    pub fn state_dir(&self) -> PathBuf {
        self.host_path("/var/lib/spconverge")
    }

    pub fn flags_path(&self) -> PathBuf {
        self.state_dir().join("flags.json")
    }

    pub fn txn_dir(&self) -> PathBuf {
        self.state_dir().join("txn")
    }

    pub fn txn_lock_path(&self) -> PathBuf {
        self.txn_dir().join("lock")
    }

    pub fn txn_modules_dir(&self) -> PathBuf {
        self.txn_dir().join("modules")
    }

    pub fn txn_journal_path(&self, module: &str) -> PathBuf {
        self.txn_modules_dir().join(format!("{module}.json"))
    }

    pub fn txn_backups_dir(&self, module: &str) -> PathBuf {
        self.txn_dir().join("backups").join(module)
    }

    pub fn package_state_dir(&self) -> PathBuf {
        self.host_path("/var/lib/storpool")
    }

    pub fn install_list_path(&self) -> PathBuf {
        self.package_state_dir().join("install-charms.json")
    }

    pub fn storpool_conf_path(&self) -> PathBuf {
        self.host_path("/etc/storpool.conf")
    }

    pub fn interfaces_path(&self) -> PathBuf {
        self.host_path("/etc/network/interfaces")
    }

    pub fn os_release_path(&self) -> PathBuf {
        self.host_path("/etc/os-release")
    }

    pub fn apt_sources_dir(&self) -> PathBuf {
        self.host_path("/etc/apt/sources.list.d")
    }

    pub fn keyrings_dir(&self) -> PathBuf {
        self.host_path("/usr/share/keyrings")
    }

    pub fn cgconfig_dir(&self) -> PathBuf {
        self.host_path("/etc/cgconfig.d")
    }

    pub fn cgroup_fs_dir(&self) -> PathBuf {
        self.host_path("/sys/fs/cgroup")
    }

    pub fn etcfiles_dir(&self, majmin: &str) -> PathBuf {
        self.host_path(format!("/usr/lib/storpool/etcfiles/storpool-common-{majmin}"))
    }

    pub fn storpool_stat_bin(&self) -> PathBuf {
        self.host_path("/usr/sbin/storpool_stat.bin")
    }

    /// Root filesystem of the named LXD container.
    pub fn lxd_rootfs(&self, container: &str) -> PathBuf {
        self.host_path(format!("/var/lib/lxd/containers/{container}/rootfs"))
    }

    pub fn proc_cmdline(&self) -> PathBuf {
        self.host_path("/proc/cmdline")
    }

    pub fn proc_cpuinfo(&self) -> PathBuf {
        self.host_path("/proc/cpuinfo")
    }

    pub fn proc_meminfo(&self) -> PathBuf {
        self.host_path("/proc/meminfo")
    }

    pub fn proc_swaps(&self) -> PathBuf {
        self.host_path("/proc/swaps")
    }

    pub fn proc_init_environ(&self) -> PathBuf {
        self.host_path("/proc/1/environ")
    }

    pub fn hostname_path(&self) -> PathBuf {
        self.host_path("/proc/sys/kernel/hostname")
    }

    pub fn kernel_release_path(&self) -> PathBuf {
        self.host_path("/proc/sys/kernel/osrelease")
    }

    pub fn ensure_state_dirs(&self) -> Result<()> {
        for dir in [
            self.state_dir(),
            self.txn_dir(),
            self.txn_modules_dir(),
            self.package_state_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

impl Default for HostLayout {
    fn default() -> Self {
        Self::system()
    }
}

/// Whether this host is an LXC/LXD container, judged by init's environment.
pub fn running_in_lxc(layout: &HostLayout) -> bool {
    match fs::read(layout.proc_init_environ()) {
        Ok(raw) => raw
            .split(|byte| *byte == 0)
            .any(|entry| entry == b"container=lxc"),
        Err(_) => false,
    }
}
