use anyhow::{anyhow, Result};
use std::fmt;
use std::str::FromStr;

use spconverge_core::FlagStore;

use crate::StageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Pending,
    Converged,
    Failed,
    Stopped,
}

impl StageState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Converged => "converged",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageState {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "converged" => Ok(Self::Converged),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(anyhow!("unknown stage state '{other}'")),
        }
    }
}

/// A stage without a stored state is pending.
pub fn load_state(flags: &dyn FlagStore, stage: StageId) -> Result<StageState> {
    match flags.get(&stage.state_key())? {
        Some(raw) => raw.parse(),
        None => Ok(StageState::Pending),
    }
}

pub fn store_state(flags: &dyn FlagStore, stage: StageId, state: StageState) -> Result<()> {
    match state {
        StageState::Pending => flags.unset(&stage.state_key()),
        other => flags.set(&stage.state_key(), other.as_str()),
    }
}
