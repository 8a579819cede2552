use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::process::Command;

use spconverge_core::{command_output, command_succeeds, run_command};

/// The service manager operations the stages need.
pub trait ServiceManager {
    /// Enables and starts the service.
    fn resume(&self, name: &str) -> Result<()>;
    /// Stops and disables the service.
    fn pause(&self, name: &str) -> Result<()>;
    fn restart(&self, name: &str) -> Result<()>;
    fn is_active(&self, name: &str) -> Result<bool>;
    fn daemon_reload(&self) -> Result<()>;
    /// The unit's `Type=` property, if the unit is known.
    fn unit_type(&self, name: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone, Default)]
pub struct Systemctl;

impl Systemctl {
    fn systemctl(args: &[&str], context_message: &str) -> Result<()> {
        run_command(Command::new("systemctl").args(args), context_message)
    }
}

impl ServiceManager for Systemctl {
    fn resume(&self, name: &str) -> Result<()> {
        Self::systemctl(&["enable", name], &format!("failed to enable {name}"))?;
        Self::systemctl(&["start", name], &format!("failed to start {name}"))
    }

    fn pause(&self, name: &str) -> Result<()> {
        Self::systemctl(&["stop", name], &format!("failed to stop {name}"))?;
        Self::systemctl(&["disable", name], &format!("failed to disable {name}"))
    }

    fn restart(&self, name: &str) -> Result<()> {
        Self::systemctl(&["restart", name], &format!("failed to restart {name}"))
    }

    fn is_active(&self, name: &str) -> Result<bool> {
        command_succeeds(
            Command::new("systemctl").args(["is-active", "--quiet", name]),
            &format!("failed to query the state of {name}"),
        )
    }

    fn daemon_reload(&self) -> Result<()> {
        Self::systemctl(&["daemon-reload"], "failed to reload the service database")
    }

    fn unit_type(&self, name: &str) -> Result<Option<String>> {
        let raw = command_output(
            Command::new("systemctl").args(["show", "-p", "Type", &format!("{name}.service")]),
            &format!("failed to query the {name} service"),
        )?;
        Ok(parse_unit_type(&raw))
    }
}

/// Parses `systemctl show -p Type` output, which must be a single
/// `Type=...` line with a non-empty value.
pub fn parse_unit_type(raw: &str) -> Option<String> {
    let mut lines = raw.lines().filter(|line| !line.trim().is_empty());
    let line = lines.next()?;
    if lines.next().is_some() {
        return None;
    }
    line.trim()
        .strip_prefix("Type=")
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

/// Kernel module tooling.
pub trait KernelTools {
    fn depmod(&self) -> Result<()>;
    fn loaded_modules(&self) -> Result<Vec<String>>;
    fn unload(&self, module: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemKernelTools;

impl KernelTools for SystemKernelTools {
    fn depmod(&self) -> Result<()> {
        run_command(
            Command::new("depmod").arg("-a"),
            "failed to update the kernel module dependencies",
        )
    }

    fn loaded_modules(&self) -> Result<Vec<String>> {
        let raw = command_output(&mut Command::new("lsmod"), "failed to list kernel modules")?;
        Ok(parse_lsmod(&raw))
    }

    fn unload(&self, module: &str) -> Result<()> {
        run_command(
            Command::new("rmmod").arg(module),
            &format!("failed to unload the {module} kernel module"),
        )
    }
}

/// Module names from `lsmod` output, without the header line.
pub fn parse_lsmod(raw: &str) -> Vec<String> {
    raw.lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|name| *name != "Module")
        .map(ToOwned::to_owned)
        .collect()
}

/// Runs commands on the host itself or inside one of its LXD containers.
pub trait ContainerTools {
    /// Names of the containers on this host.
    fn list(&self) -> Result<Vec<String>>;

    /// Runs `command` on the host (`None`) or in the named container and
    /// reports whether it exited successfully.
    fn run(&self, container: Option<&str>, command: &[&str]) -> Result<bool>;
}

#[derive(Debug, Clone, Default)]
pub struct Lxd;

impl ContainerTools for Lxd {
    fn list(&self) -> Result<Vec<String>> {
        let raw = command_output(
            Command::new("lxc").args(["list", "--format=json"]),
            "failed to list the LXD containers",
        )?;
        parse_lxc_list(&raw)
    }

    fn run(&self, container: Option<&str>, command: &[&str]) -> Result<bool> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("no command to run"))?;
        let mut cmd = match container {
            Some(name) => {
                let mut cmd = Command::new("lxc");
                cmd.args(["exec", name, "--", program]);
                cmd
            }
            None => Command::new(program),
        };
        cmd.args(args);
        command_succeeds(&mut cmd, &format!("failed to run {}", command.join(" ")))
    }
}

#[derive(Debug, Deserialize)]
struct LxcContainer {
    name: String,
}

/// Container names from `lxc list --format=json`.
pub fn parse_lxc_list(raw: &str) -> Result<Vec<String>> {
    let containers = serde_json::from_str::<Vec<LxcContainer>>(raw)
        .context("failed to parse the LXD container list")?;
    Ok(containers.into_iter().map(|container| container.name).collect())
}
