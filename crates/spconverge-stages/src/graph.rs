use anyhow::{anyhow, Result};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageId {
    RepoAdd,
    Config,
    Common,
    OpenStackIntegration,
    Beacon,
    Block,
}

impl StageId {
    pub const ALL: [StageId; 6] = [
        StageId::RepoAdd,
        StageId::Config,
        StageId::Common,
        StageId::OpenStackIntegration,
        StageId::Beacon,
        StageId::Block,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RepoAdd => "repo-add",
            Self::Config => "config",
            Self::Common => "common",
            Self::OpenStackIntegration => "openstack-integration",
            Self::Beacon => "beacon",
            Self::Block => "block",
        }
    }

    /// Stages that must be converged before this one.
    pub fn upstream(self) -> &'static [StageId] {
        match self {
            Self::RepoAdd => &[],
            Self::Config => &[Self::RepoAdd],
            Self::Common => &[Self::Config],
            Self::OpenStackIntegration => &[Self::Common],
            Self::Beacon => &[Self::OpenStackIntegration],
            Self::Block => &[Self::Beacon],
        }
    }

    /// Owner name used for the packages this stage installs.
    pub fn layer(self) -> String {
        format!("storpool-{}", self.as_str())
    }

    /// Transaction module holding the files this stage installs.
    pub fn txn_module(self) -> String {
        format!("charm-storpool-{}", self.as_str())
    }

    pub fn state_key(self) -> String {
        format!("spconverge.{}.state", self.as_str())
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == value)
            .ok_or_else(|| {
                anyhow!(
                    "unknown stage '{value}'; expected one of: {}",
                    Self::ALL.map(StageId::as_str).join(", ")
                )
            })
    }
}

/// The static stage dependency graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageGraph;

impl StageGraph {
    pub fn new() -> Self {
        Self
    }

    /// Every stage, each after all of its upstream stages.
    pub fn order(&self) -> Vec<StageId> {
        let mut ordered = Vec::new();
        for stage in StageId::ALL {
            self.push_with_upstream(stage, &mut ordered);
        }
        ordered
    }

    /// Stages that directly or transitively depend on `stage`, nearest first.
    pub fn downstream(&self, stage: StageId) -> Vec<StageId> {
        let mut found = Vec::new();
        let mut frontier = vec![stage];
        while let Some(current) = frontier.pop() {
            for candidate in StageId::ALL {
                if candidate.upstream().contains(&current) && !found.contains(&candidate) {
                    found.push(candidate);
                    frontier.insert(0, candidate);
                }
            }
        }
        found
    }

    /// The stage with nothing depending on it, where a full converge starts.
    pub fn entry(&self) -> StageId {
        self.order()
            .into_iter()
            .rev()
            .find(|stage| self.downstream(*stage).is_empty())
            .unwrap_or(StageId::Block)
    }

    fn push_with_upstream(&self, stage: StageId, ordered: &mut Vec<StageId>) {
        if ordered.contains(&stage) {
            return;
        }
        for upstream in stage.upstream() {
            self.push_with_upstream(*upstream, ordered);
        }
        ordered.push(stage);
    }
}
