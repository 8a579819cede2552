use std::collections::BTreeMap;
use std::fmt;

mod backend;
mod ownership;
mod plan;
mod reconciler;

pub use backend::{
    parse_depends, parse_installed_versions, parse_policy, AptBackend, PackageBackend,
};
pub use ownership::{OwnershipRecord, OwnershipStore};
pub use plan::{plan_installation, PlanError};
pub use reconciler::{PackageReconciler, CO_REMOVAL_GROUPS};

/// Package name to version constraint, in a stable order.
pub type PackageRequest = BTreeMap<String, VersionConstraint>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum VersionConstraint {
    /// Whatever the repositories offer.
    Any,
    Exact(String),
}

impl VersionConstraint {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "*" | "" => Self::Any,
            version => Self::Exact(version.to_string()),
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Exact(version) => f.write_str(version),
        }
    }
}

impl From<&str> for VersionConstraint {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<String> for VersionConstraint {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

/// Installed and candidate versions as reported by the package manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackagePolicy {
    pub installed: Option<String>,
    pub candidate: Option<String>,
}

impl PackagePolicy {
    pub fn new(installed: Option<&str>, candidate: Option<&str>) -> Self {
        Self {
            installed: installed.map(ToOwned::to_owned),
            candidate: candidate.map(ToOwned::to_owned),
        }
    }
}

/// Builds a request from `(name, constraint)` pairs.
pub fn request<I, N, C>(pairs: I) -> PackageRequest
where
    I: IntoIterator<Item = (N, C)>,
    N: Into<String>,
    C: Into<VersionConstraint>,
{
    pairs
        .into_iter()
        .map(|(name, constraint)| (name.into(), constraint.into()))
        .collect()
}

#[cfg(test)]
mod tests;
