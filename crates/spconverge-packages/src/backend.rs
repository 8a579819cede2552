use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::process::Command;

use spconverge_core::{command_output, command_succeeds, run_command};

use crate::PackagePolicy;

/// The package manager operations the reconciler relies on.
pub trait PackageBackend {
    /// `Ok(None)` when the package manager's answer could not be understood.
    fn policy(&self, name: &str) -> Result<Option<PackagePolicy>>;

    /// Every package currently marked as installed, with its version.
    fn installed_versions(&self) -> Result<BTreeMap<String, String>>;

    fn install(&self, names: &[String]) -> Result<()>;

    /// Whether removing all of `names` together would succeed.
    fn removal_dry_run(&self, names: &[String]) -> Result<bool>;

    fn purge(&self, names: &[String]) -> Result<()>;

    fn update_index(&self) -> Result<()>;

    fn installed_package_files(&self, name: &str) -> Result<Vec<String>>;

    /// Names of the packages an installed package depends on.
    fn package_depends(&self, name: &str) -> Result<Vec<String>>;
}

/// Drives `apt-get`, `apt-cache`, `dpkg` and `dpkg-query`.
#[derive(Debug, Clone, Default)]
pub struct AptBackend;

impl AptBackend {
    pub fn new() -> Self {
        Self
    }

    fn apt_get() -> Command {
        let mut command = Command::new("apt-get");
        command.env("DEBIAN_FRONTEND", "noninteractive");
        command
    }
}

const DPKG_QUERY_FORMAT: &str = "${Package}\t${Version}\t${Status}\n";

impl PackageBackend for AptBackend {
    fn policy(&self, name: &str) -> Result<Option<PackagePolicy>> {
        let raw = command_output(
            Command::new("apt-cache").args(["policy", "--", name]),
            &format!("failed to query the APT policy for {name}"),
        )?;
        Ok(parse_policy(&raw))
    }

    fn installed_versions(&self) -> Result<BTreeMap<String, String>> {
        let raw = command_output(
            Command::new("dpkg-query").args(["-W", "--showformat", DPKG_QUERY_FORMAT]),
            "failed to list the installed packages",
        )?;
        Ok(parse_installed_versions(&raw))
    }

    fn install(&self, names: &[String]) -> Result<()> {
        run_command(
            Self::apt_get()
                .args(["install", "-y", "--no-install-recommends", "--"])
                .args(names),
            &format!("failed to install {}", names.join(" ")),
        )
    }

    fn removal_dry_run(&self, names: &[String]) -> Result<bool> {
        command_succeeds(
            Command::new("dpkg")
                .args(["-r", "--dry-run", "--"])
                .args(names),
            &format!("failed to check the removal of {}", names.join(" ")),
        )
    }

    fn purge(&self, names: &[String]) -> Result<()> {
        run_command(
            Command::new("dpkg").args(["--purge", "--"]).args(names),
            &format!("failed to purge {}", names.join(" ")),
        )
    }

    fn update_index(&self) -> Result<()> {
        run_command(
            Self::apt_get().arg("update"),
            "failed to update the APT package index",
        )
    }

    fn installed_package_files(&self, name: &str) -> Result<Vec<String>> {
        let raw = command_output(
            Command::new("dpkg").args(["-L", "--", name]),
            &format!("failed to list the files of {name}"),
        )
        .with_context(|| format!("is the {name} package installed?"))?;
        let mut files = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToOwned::to_owned)
            .collect::<Vec<_>>();
        files.sort();
        Ok(files)
    }

    fn package_depends(&self, name: &str) -> Result<Vec<String>> {
        let raw = command_output(
            Command::new("dpkg-query").args(["-W", "-f", "${Depends}", "--", name]),
            &format!("failed to query the dependencies of {name}"),
        )?;
        Ok(parse_depends(&raw))
    }
}

/// Package names from a `${Depends}` field; version restrictions and
/// `:any` qualifiers are dropped and only the first of each set of
/// alternatives is kept.
pub fn parse_depends(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|item| item.split_whitespace().next())
        .map(|name| name.strip_suffix(":any").unwrap_or(name))
        .filter(|name| !name.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Extracts the `Installed:` and `Candidate:` versions from `apt-cache policy`
/// output. Returns `None` if either is missing or appears twice.
pub fn parse_policy(raw: &str) -> Option<PackagePolicy> {
    let mut installed: Option<Option<String>> = None;
    let mut candidate: Option<Option<String>> = None;

    for line in raw.lines() {
        let line = line.trim();
        let (slot, rest) = if let Some(rest) = line.strip_prefix("Installed:") {
            (&mut installed, rest)
        } else if let Some(rest) = line.strip_prefix("Candidate:") {
            (&mut candidate, rest)
        } else {
            continue;
        };

        let mut words = rest.split_whitespace();
        let version = words.next()?;
        if words.next().is_some() || slot.is_some() {
            return None;
        }
        *slot = Some((version != "(none)").then(|| version.to_string()));
    }

    Some(PackagePolicy {
        installed: installed?,
        candidate: candidate?,
    })
}

/// Parses `dpkg-query -W` output in `package<TAB>version<TAB>status` form,
/// keeping only the packages whose status starts with `install`.
pub fn parse_installed_versions(raw: &str) -> BTreeMap<String, String> {
    raw.lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next()?;
            let version = fields.next()?;
            let status = fields.next()?;
            if fields.next().is_some() || name.is_empty() || !status.starts_with("install") {
                return None;
            }
            Some((name.to_string(), version.to_string()))
        })
        .collect()
}

impl<T: PackageBackend + ?Sized> PackageBackend for Box<T> {
    fn policy(&self, name: &str) -> Result<Option<PackagePolicy>> {
        (**self).policy(name)
    }

    fn installed_versions(&self) -> Result<BTreeMap<String, String>> {
        (**self).installed_versions()
    }

    fn install(&self, names: &[String]) -> Result<()> {
        (**self).install(names)
    }

    fn removal_dry_run(&self, names: &[String]) -> Result<bool> {
        (**self).removal_dry_run(names)
    }

    fn purge(&self, names: &[String]) -> Result<()> {
        (**self).purge(names)
    }

    fn update_index(&self) -> Result<()> {
        (**self).update_index()
    }

    fn installed_package_files(&self, name: &str) -> Result<Vec<String>> {
        (**self).installed_package_files(name)
    }

    fn package_depends(&self, name: &str) -> Result<Vec<String>> {
        (**self).package_depends(name)
    }
}
