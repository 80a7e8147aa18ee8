//! The phase engine: lifecycle schedule, per-phase readiness, and think-tick
//! accounting.
//!
//! Phases are tagged variants dispatched by the orchestrator; there is no
//! handler hierarchy. The schedule is generated once from configuration, so
//! termination is structural: a finite vector walked left to right.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::config::ConsensusConfig;

/// A phase in the issue lifecycle. Cycle and round numbers are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Propose,
    Feedback(u32),
    Revise(u32),
    Stake(u32),
    Finalize,
}

impl Phase {
    /// Label recorded in ledger events, e.g. `FEEDBACK_2`, `STAKE_1`.
    pub fn label(&self) -> String {
        match self {
            Phase::Propose => "PROPOSE".to_string(),
            Phase::Feedback(cycle) => format!("FEEDBACK_{}", cycle),
            Phase::Revise(cycle) => format!("REVISE_{}", cycle),
            Phase::Stake(round) => format!("STAKE_{}", round),
            Phase::Finalize => "FINALIZE".to_string(),
        }
    }

    /// The STAKE round number, if this is a STAKE phase.
    pub fn stake_round(&self) -> Option<u32> {
        match self {
            Phase::Stake(round) => Some(*round),
            _ => None,
        }
    }

    /// Whether an action of the given kind is admissible in this phase.
    /// `signal_ready` is admissible in every non-terminal phase.
    pub fn admits(&self, action: ActionKind) -> bool {
        if self == &Phase::Finalize {
            return false;
        }
        match action {
            ActionKind::SignalReady => true,
            ActionKind::SubmitProposal => matches!(self, Phase::Propose),
            ActionKind::SubmitFeedback => matches!(self, Phase::Feedback(_)),
            ActionKind::SubmitRevision => matches!(self, Phase::Revise(_)),
            ActionKind::StakeAdd | ActionKind::StakeSwitch | ActionKind::StakeWithdraw => {
                matches!(self, Phase::Stake(_))
            }
        }
    }
}

/// Lightweight action discriminant for admissibility checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    SubmitProposal,
    SignalReady,
    SubmitFeedback,
    SubmitRevision,
    StakeAdd,
    StakeSwitch,
    StakeWithdraw,
}

/// Generate the full phase schedule for a run.
pub fn schedule(config: &ConsensusConfig) -> Vec<Phase> {
    let mut phases = vec![Phase::Propose];
    for cycle in 1..=config.revision_cycles {
        phases.push(Phase::Feedback(cycle));
        phases.push(Phase::Revise(cycle));
    }
    for round in 1..=config.stake_rounds {
        phases.push(Phase::Stake(round));
    }
    phases.push(Phase::Finalize);
    phases
}

/// Tracks the cursor into the schedule, per-phase readiness, the think-tick
/// counter, and the per-phase feedback quota.
#[derive(Debug)]
pub struct PhaseEngine {
    schedule: Vec<Phase>,
    cursor: usize,
    /// Ticks spent in the current phase.
    phase_ticks: u32,
    agents: Vec<AgentId>,
    ready: BTreeSet<AgentId>,
    feedback_counts: BTreeMap<AgentId, u32>,
}

impl PhaseEngine {
    pub fn new(config: &ConsensusConfig, mut agents: Vec<AgentId>) -> Self {
        agents.sort();
        Self {
            schedule: schedule(config),
            cursor: 0,
            phase_ticks: 0,
            agents,
            ready: BTreeSet::new(),
            feedback_counts: BTreeMap::new(),
        }
    }

    pub fn current(&self) -> Phase {
        self.schedule[self.cursor]
    }

    pub fn is_terminal(&self) -> bool {
        self.current() == Phase::Finalize
    }

    /// Count one tick against the current phase's think budget.
    pub fn begin_tick(&mut self) -> u32 {
        self.phase_ticks += 1;
        self.phase_ticks
    }

    pub fn phase_ticks(&self) -> u32 {
        self.phase_ticks
    }

    /// Mark an agent ready. Returns true the first time within the phase.
    pub fn mark_ready(&mut self, agent: &str) -> bool {
        self.ready.insert(agent.to_string())
    }

    pub fn is_ready(&self, agent: &str) -> bool {
        self.ready.contains(agent)
    }

    pub fn all_ready(&self) -> bool {
        self.agents.iter().all(|a| self.ready.contains(a))
    }

    /// Agents that have not completed this phase, in UID order.
    pub fn unready(&self) -> Vec<AgentId> {
        self.agents
            .iter()
            .filter(|a| !self.ready.contains(*a))
            .cloned()
            .collect()
    }

    pub fn feedback_count(&self, agent: &str) -> u32 {
        self.feedback_counts.get(agent).copied().unwrap_or(0)
    }

    pub fn record_feedback(&mut self, agent: &str) {
        *self.feedback_counts.entry(agent.to_string()).or_insert(0) += 1;
    }

    /// Advance to the next phase, resetting readiness, the think counter,
    /// and the feedback quota. Returns the phase entered.
    pub fn advance(&mut self) -> Phase {
        debug_assert!(!self.is_terminal(), "cannot advance past FINALIZE");
        self.cursor += 1;
        self.phase_ticks = 0;
        self.ready.clear();
        self.feedback_counts.clear();
        self.current()
    }
}
