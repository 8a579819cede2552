use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt;

use spconverge_core::{ConvergeError, ConvergeResult, FlagStore, KEY_OUR_ID, KEY_STATUS};
use tracing::{debug, error, info};

use crate::body::{default_body, StageBody};
use crate::state::{load_state, store_state};
use crate::{StageContext, StageGraph, StageId, StageState};

/// How a converge request ended for the requested stage.
#[derive(Debug)]
pub enum Outcome {
    /// The stage body ran and the stage is now converged.
    Converged,
    AlreadyConverged,
    /// The stage has been torn down and stays that way until reset.
    Stopped,
    /// An upstream stage is stopped.
    Blocked { by: StageId },
    /// The stage waits for more configuration.
    Pending(ConvergeError),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => f.write_str("converged"),
            Self::AlreadyConverged => f.write_str("already converged"),
            Self::Stopped => f.write_str("stopped"),
            Self::Blocked { by } => write!(f, "blocked by the stopped {by} stage"),
            Self::Pending(err) => write!(f, "pending: {err}"),
        }
    }
}

/// External events that invalidate converged stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    ConfigChanged,
    UpgradeCharm,
}

/// What happened to a stage earlier in the same converge call.
#[derive(Debug, Clone)]
enum Visit {
    Ran,
    Unchanged,
    Stopped,
    Blocked(StageId),
    Pending(Vec<String>),
}

impl Visit {
    fn outcome(&self) -> Outcome {
        match self {
            Self::Ran => Outcome::Converged,
            Self::Unchanged => Outcome::AlreadyConverged,
            Self::Stopped => Outcome::Stopped,
            Self::Blocked(by) => Outcome::Blocked { by: *by },
            Self::Pending(missing) => Outcome::Pending(ConvergeError::missing(missing.clone())),
        }
    }
}

/// Walks the stage graph, running stage bodies in dependency order and
/// keeping each stage's state in the flag store.
pub struct Orchestrator {
    ctx: StageContext,
    graph: StageGraph,
    bodies: BTreeMap<StageId, Box<dyn StageBody>>,
}

impl Orchestrator {
    pub fn new(ctx: StageContext) -> Self {
        let bodies = StageId::ALL
            .into_iter()
            .map(|stage| (stage, default_body(stage)))
            .collect();
        Self {
            ctx,
            graph: StageGraph::new(),
            bodies,
        }
    }

    /// Replaces the body run for `stage`.
    pub fn with_body(mut self, stage: StageId, body: Box<dyn StageBody>) -> Self {
        self.bodies.insert(stage, body);
        self
    }

    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn state(&self, stage: StageId) -> Result<StageState> {
        load_state(self.ctx.flags(), stage)
    }

    /// Converges `stage` after everything it depends on.
    pub fn converge(&self, stage: StageId) -> ConvergeResult<Outcome> {
        let mut visited = BTreeMap::new();
        self.converge_stage(stage, &mut visited)
    }

    fn converge_stage(
        &self,
        stage: StageId,
        visited: &mut BTreeMap<StageId, Visit>,
    ) -> ConvergeResult<Outcome> {
        if let Some(visit) = visited.get(&stage) {
            return Ok(visit.outcome());
        }

        let flags = self.ctx.flags();
        let state = load_state(flags, stage)?;
        if state == StageState::Stopped {
            debug!(stage = %stage, "the stage is stopped");
            visited.insert(stage, Visit::Stopped);
            return Ok(Outcome::Stopped);
        }
        if state == StageState::Failed {
            info!(stage = %stage, "retrying a previously failed stage");
            store_state(flags, stage, StageState::Pending)?;
        }

        let mut upstream_ran = false;
        for upstream in stage.upstream() {
            let visit = match self.converge_stage(*upstream, visited)? {
                Outcome::Converged => {
                    upstream_ran = true;
                    continue;
                }
                Outcome::AlreadyConverged => continue,
                Outcome::Stopped => Visit::Blocked(*upstream),
                Outcome::Blocked { by } => Visit::Blocked(by),
                Outcome::Pending(err) => {
                    debug!(stage = %stage, upstream = %upstream, "waiting for an upstream stage");
                    let missing = match &err {
                        ConvergeError::MissingConfiguration { missing } => missing.clone(),
                        _ => Vec::new(),
                    };
                    visited.insert(stage, Visit::Pending(missing));
                    return Ok(Outcome::Pending(err));
                }
            };
            let outcome = visit.outcome();
            visited.insert(stage, visit);
            return Ok(outcome);
        }

        if state == StageState::Converged && !upstream_ran {
            debug!(stage = %stage, "the stage is already converged");
            visited.insert(stage, Visit::Unchanged);
            return Ok(Outcome::AlreadyConverged);
        }

        let body = self
            .bodies
            .get(&stage)
            .ok_or_else(|| anyhow::anyhow!("no body registered for the {stage} stage"))?;
        info!(stage = %stage, "converging");
        match body.converge(&self.ctx) {
            Ok(()) => {
                store_state(flags, stage, StageState::Converged)?;
                self.clear_status(stage)?;
                info!(stage = %stage, "converged");
                visited.insert(stage, Visit::Ran);
                Ok(Outcome::Converged)
            }
            Err(ConvergeError::MissingConfiguration { missing }) => {
                let err = ConvergeError::missing(missing.clone());
                info!(stage = %stage, "{err}");
                store_state(flags, stage, StageState::Pending)?;
                visited.insert(stage, Visit::Pending(missing));
                Ok(Outcome::Pending(err))
            }
            Err(err) => {
                error!(stage = %stage, kind = err.kind(), "{err:#}");
                store_state(flags, stage, StageState::Failed)?;
                flags.set(KEY_STATUS, &format!("{stage}: {}: {err}", err.kind()))?;
                Err(err)
            }
        }
    }

    fn clear_status(&self, stage: StageId) -> Result<()> {
        let flags = self.ctx.flags();
        let prefix = format!("{stage}: ");
        if flags
            .get(KEY_STATUS)?
            .is_some_and(|status| status.starts_with(&prefix))
        {
            flags.unset(KEY_STATUS)?;
        }
        Ok(())
    }

    /// Tears down every stage that depends on `stage`, then `stage`
    /// itself, then everything it depends on.
    pub fn teardown(&self, stage: StageId) -> ConvergeResult<()> {
        for dependent in self.graph.downstream(stage).into_iter().rev() {
            self.teardown_one(dependent)?;
        }
        let mut pending = vec![stage];
        while let Some(current) = pending.pop() {
            self.teardown_one(current)?;
            pending.extend(current.upstream().iter().rev());
        }
        Ok(())
    }

    fn teardown_one(&self, stage: StageId) -> ConvergeResult<()> {
        let flags = self.ctx.flags();
        if load_state(flags, stage)? == StageState::Stopped {
            debug!(stage = %stage, "the stage is already stopped");
            return Ok(());
        }
        let body = self
            .bodies
            .get(&stage)
            .ok_or_else(|| anyhow::anyhow!("no body registered for the {stage} stage"))?;

        info!(stage = %stage, "tearing down");
        store_state(flags, stage, StageState::Stopped)?;
        if let Err(err) = body.teardown(&self.ctx) {
            error!(stage = %stage, kind = err.kind(), "teardown failed: {err:#}");
            store_state(flags, stage, StageState::Failed)?;
            return Err(err);
        }
        Ok(())
    }

    /// Resets the stages the event invalidates to pending and returns them.
    pub fn handle_event(&self, event: HookEvent) -> Result<Vec<StageId>> {
        let affected = match event {
            HookEvent::ConfigChanged => {
                self.ctx.flags().unset(KEY_OUR_ID)?;
                self.ctx.drop_conf_cache();
                let mut stages = vec![StageId::Config];
                stages.extend(self.graph.downstream(StageId::Config));
                stages
            }
            HookEvent::UpgradeCharm => self.graph.order(),
        };

        let mut reset = Vec::new();
        for stage in affected {
            match self.state(stage)? {
                StageState::Stopped | StageState::Pending => {}
                StageState::Converged | StageState::Failed => {
                    store_state(self.ctx.flags(), stage, StageState::Pending)?;
                    reset.push(stage);
                }
            }
        }
        info!(event = ?event, reset = reset.len(), "handled an event");
        Ok(reset)
    }

    pub fn status(&self) -> Result<Vec<(StageId, StageState)>> {
        self.graph
            .order()
            .into_iter()
            .map(|stage| Ok((stage, self.state(stage)?)))
            .collect()
    }

    /// Makes a stopped or failed stage, and the stopped stages it depends
    /// on, eligible for converging again.
    pub fn reset(&self, stage: StageId) -> Result<Vec<StageId>> {
        let mut reset = Vec::new();
        let mut pending = vec![stage];
        while let Some(current) = pending.pop() {
            let state = self.state(current)?;
            if current == stage || state == StageState::Stopped {
                if state != StageState::Pending {
                    store_state(self.ctx.flags(), current, StageState::Pending)?;
                    reset.push(current);
                }
                pending.extend(current.upstream());
            }
        }
        info!(stage = %stage, reset = reset.len(), "reset stages");
        Ok(reset)
    }
}
