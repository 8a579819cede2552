use std::collections::BTreeMap;

use thiserror::Error;

use crate::{PackagePolicy, PackageRequest, VersionConstraint};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("could not determine the APT policy for the {package} package")]
    UnknownPolicy { package: String },

    #[error("the {package} package is not available in the repositories, cannot proceed")]
    Unavailable { package: String },

    #[error(
        "the {requested} version of the {package} package is not available in the repositories, found candidate {candidate} instead"
    )]
    VersionMismatch {
        package: String,
        requested: String,
        candidate: String,
    },
}

impl PlanError {
    pub fn package(&self) -> &str {
        match self {
            Self::UnknownPolicy { package }
            | Self::Unavailable { package }
            | Self::VersionMismatch { package, .. } => package,
        }
    }
}

/// Selects the requested packages that must be installed, in request order.
///
/// A wildcard request is satisfied by an installed version equal to the
/// candidate (or by any installed version when the repositories offer
/// none); an exact request only by that installed version. Anything else
/// needs a candidate, and for an exact request the candidate must match.
pub fn plan_installation(
    requests: &PackageRequest,
    policies: &BTreeMap<String, Option<PackagePolicy>>,
) -> Result<Vec<String>, PlanError> {
    let mut selected = Vec::new();

    for (name, constraint) in requests {
        let policy = policies
            .get(name)
            .and_then(Option::as_ref)
            .ok_or_else(|| PlanError::UnknownPolicy {
                package: name.clone(),
            })?;

        let satisfied = match (constraint, &policy.installed) {
            (_, None) => false,
            (VersionConstraint::Any, Some(installed)) => policy
                .candidate
                .as_ref()
                .map_or(true, |candidate| candidate == installed),
            (VersionConstraint::Exact(version), Some(installed)) => installed == version,
        };
        if satisfied {
            continue;
        }

        let candidate = policy
            .candidate
            .as_ref()
            .ok_or_else(|| PlanError::Unavailable {
                package: name.clone(),
            })?;
        if let VersionConstraint::Exact(version) = constraint {
            if version != candidate {
                return Err(PlanError::VersionMismatch {
                    package: name.clone(),
                    requested: version.clone(),
                    candidate: candidate.clone(),
                });
            }
        }

        selected.push(name.clone());
    }

    Ok(selected)
}
