//! The orchestrator: the process-wide driver that exposes the action API,
//! advances ticks, dispatches phase logic, and commits every change through
//! the credit manager and the ledger.
//!
//! The commit path is strictly serial. Agents may deliberate anywhere, but
//! their actions enter here one at a time and are validated in a fixed
//! order: authentication, issue assignment, phase admissibility, resources,
//! semantics, commit. Only the commit step mutates state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::agent::{AgentId, Roster};
use crate::config::ConsensusConfig;
use crate::credit::CreditManager;
use crate::delta::dissimilarity;
use crate::error::{ActionResult, FatalError};
use crate::event::{EventKind, Ledger, LedgerEvent, Tick};
use crate::issue::{FeedbackRecord, Issue};
use crate::phase::{ActionKind, Phase, PhaseEngine};
use crate::proposal::{ProposalBody, ProposalGraph, ProposalId};
use crate::stake::StakeKind;

/// An action as submitted by an agent, with its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentAction {
    SubmitProposal { body: ProposalBody },
    SignalReady,
    SubmitFeedback { target: ProposalId, body: String },
    SubmitRevision { body: ProposalBody },
    StakeAdd { proposal: ProposalId, amount: u64 },
    StakeSwitch { stake_id: String, proposal: ProposalId },
    StakeWithdraw { stake_id: String },
}

impl AgentAction {
    fn kind(&self) -> ActionKind {
        match self {
            AgentAction::SubmitProposal { .. } => ActionKind::SubmitProposal,
            AgentAction::SignalReady => ActionKind::SignalReady,
            AgentAction::SubmitFeedback { .. } => ActionKind::SubmitFeedback,
            AgentAction::SubmitRevision { .. } => ActionKind::SubmitRevision,
            AgentAction::StakeAdd { .. } => ActionKind::StakeAdd,
            AgentAction::StakeSwitch { .. } => ActionKind::StakeSwitch,
            AgentAction::StakeWithdraw { .. } => ActionKind::StakeWithdraw,
        }
    }

    /// Ledger event kind used when this action is rejected.
    fn rejection_kind(&self) -> Option<EventKind> {
        match self.kind() {
            ActionKind::SubmitProposal => Some(EventKind::ProposalRejected),
            ActionKind::SubmitFeedback => Some(EventKind::FeedbackRejected),
            ActionKind::SubmitRevision => Some(EventKind::RevisionRejected),
            ActionKind::StakeAdd | ActionKind::StakeSwitch | ActionKind::StakeWithdraw => {
                Some(EventKind::StakeRejected)
            }
            ActionKind::SignalReady => None,
        }
    }
}

/// One recorded action submission; the unit of deterministic replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub tick: Tick,
    pub agent: AgentId,
    pub action: AgentAction,
}

/// What a single `tick()` call did.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub tick: Tick,
    /// Phase in effect after the tick.
    pub phase: Phase,
    pub transitioned: bool,
    /// Agents substituted by kick-out during this tick.
    pub kicked: Vec<AgentId>,
    pub finalized: bool,
}

/// Per-agent aggregate contribution to a proposal at finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupporterShare {
    pub agent: AgentId,
    pub raw_stake: u64,
    /// Conviction-weighted contribution, summed over the agent's records.
    pub weight: f64,
}

/// One author line's standing at finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedProposal {
    pub proposal: ProposalId,
    pub author: String,
    pub revision: u32,
    pub score: f64,
    pub raw_staked: u64,
    pub last_stake_tick: Option<Tick>,
    pub supporters: Vec<SupporterShare>,
}

/// The finalization result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub winner: Option<ProposalId>,
    pub winner_author: Option<String>,
    pub score: f64,
    pub finalize_tick: Tick,
    /// All author lines ranked by score, tie-breaks applied.
    pub rankings: Vec<RankedProposal>,
}

/// A proposal as seen through `query_state`.
#[derive(Debug, Clone, Serialize)]
pub struct ProposalView {
    pub id: ProposalId,
    pub author: String,
    pub revision: u32,
    pub body: ProposalBody,
    pub created_tick: Tick,
    pub updated_tick: Tick,
}

/// One of the querying agent's own stakes.
#[derive(Debug, Clone, Serialize)]
pub struct StakeView {
    pub id: String,
    pub proposal: ProposalId,
    pub amount: u64,
    pub rounds_held: u32,
    pub kind: StakeKind,
}

/// Snapshot returned by `query_state`, subject to blind-staking visibility:
/// while a STAKE round is open, stake-movement events recorded during it are
/// withheld. The agent's own stake records stay visible (an agent always
/// knows what it holds); everyone else's in-round moves do not leak.
#[derive(Debug, Clone, Serialize)]
pub struct StateView {
    pub tick: Tick,
    pub phase: String,
    pub agent: AgentId,
    pub balance: u64,
    pub locked: u64,
    pub proposals: Vec<ProposalView>,
    pub feedback: Vec<FeedbackRecord>,
    pub own_stakes: Vec<StakeView>,
    pub events: Vec<LedgerEvent>,
    pub finalized: bool,
    pub outcome: Option<Outcome>,
}

/// The consensus driver for one issue.
pub struct Orchestrator {
    config: ConsensusConfig,
    issue: Issue,
    roster: Roster,
    ledger: Ledger,
    credits: CreditManager,
    proposals: ProposalGraph,
    engine: PhaseEngine,
    feedback: Vec<FeedbackRecord>,
    clock: Tick,
    /// Tick at which the currently open STAKE round began; the blind-staking
    /// visibility horizon.
    stake_round_started: Tick,
    finalized: bool,
    outcome: Option<Outcome>,
    trace: Vec<TraceEntry>,
}

impl Orchestrator {
    /// Build a run: validate the configuration, snapshot the issue with its
    /// assigned agent set, and enroll every agent with the invite payment.
    pub fn new(
        config: ConsensusConfig,
        mut issue: Issue,
        roster: Roster,
    ) -> Result<Self, FatalError> {
        config.validate()?;
        if roster.is_empty() {
            return Err(FatalError::InvalidRoster("empty roster".into()));
        }
        issue.agents = roster.ids();
        issue.created_tick = 0;

        let mut ledger = Ledger::new();
        let mut credits = CreditManager::new(&config, &issue.id);
        let engine = PhaseEngine::new(&config, roster.ids());
        let label = engine.current().label();
        for agent in roster.ids() {
            credits.award(
                &mut ledger,
                0,
                &label,
                &agent,
                config.standard_invite_payment,
                "enrollment",
            )?;
        }
        info!(
            issue = %issue.id,
            agents = roster.len(),
            "consensus run constructed"
        );
        Ok(Self {
            config,
            issue,
            roster,
            ledger,
            credits,
            proposals: ProposalGraph::new(),
            engine,
            feedback: Vec::new(),
            clock: 0,
            stake_round_started: 0,
            finalized: false,
            outcome: None,
            trace: Vec::new(),
        })
    }

    // -- read access ---------------------------------------------------------

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn issue(&self) -> &Issue {
        &self.issue
    }

    pub fn current_tick(&self) -> Tick {
        self.clock
    }

    pub fn phase(&self) -> Phase {
        if self.finalized {
            Phase::Finalize
        } else {
            self.engine.current()
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn credits(&self) -> &CreditManager {
        &self.credits
    }

    pub fn proposals(&self) -> &ProposalGraph {
        &self.proposals
    }

    pub fn feedback(&self) -> &[FeedbackRecord] {
        &self.feedback
    }

    /// The recorded action sequence, for replay.
    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    // -- action API ----------------------------------------------------------

    pub fn submit_proposal(
        &mut self,
        credential: &str,
        body: ProposalBody,
    ) -> Result<ActionResult, FatalError> {
        self.submit(credential, AgentAction::SubmitProposal { body })
    }

    pub fn signal_ready(&mut self, credential: &str) -> Result<ActionResult, FatalError> {
        self.submit(credential, AgentAction::SignalReady)
    }

    pub fn submit_feedback(
        &mut self,
        credential: &str,
        target: &str,
        body: &str,
    ) -> Result<ActionResult, FatalError> {
        self.submit(
            credential,
            AgentAction::SubmitFeedback {
                target: target.to_string(),
                body: body.to_string(),
            },
        )
    }

    pub fn submit_revision(
        &mut self,
        credential: &str,
        body: ProposalBody,
    ) -> Result<ActionResult, FatalError> {
        self.submit(credential, AgentAction::SubmitRevision { body })
    }

    pub fn stake_add(
        &mut self,
        credential: &str,
        proposal: &str,
        amount: u64,
    ) -> Result<ActionResult, FatalError> {
        self.submit(
            credential,
            AgentAction::StakeAdd {
                proposal: proposal.to_string(),
                amount,
            },
        )
    }

    pub fn stake_switch(
        &mut self,
        credential: &str,
        stake_id: &str,
        new_proposal: &str,
    ) -> Result<ActionResult, FatalError> {
        self.submit(
            credential,
            AgentAction::StakeSwitch {
                stake_id: stake_id.to_string(),
                proposal: new_proposal.to_string(),
            },
        )
    }

    pub fn stake_withdraw(
        &mut self,
        credential: &str,
        stake_id: &str,
    ) -> Result<ActionResult, FatalError> {
        self.submit(
            credential,
            AgentAction::StakeWithdraw {
                stake_id: stake_id.to_string(),
            },
        )
    }

    /// Submit any action by value; the typed wrappers above are sugar over
    /// this. Useful for drivers that carry actions as data.
    pub fn submit_action(
        &mut self,
        credential: &str,
        action: AgentAction,
    ) -> Result<ActionResult, FatalError> {
        self.submit(credential, action)
    }

    fn submit(
        &mut self,
        credential: &str,
        action: AgentAction,
    ) -> Result<ActionResult, FatalError> {
        let agent = match self.roster.authenticate(credential) {
            Some(agent) => agent.clone(),
            None => return Ok(ActionResult::RejectedUnauthenticated),
        };
        if !self.issue.is_assigned(&agent) {
            return Ok(ActionResult::RejectedSemantic("agent_not_assigned".into()));
        }
        if self.finalized {
            return Ok(ActionResult::RejectedInvalidPhase);
        }
        self.dispatch_recorded(&agent, action)
    }

    /// Record the action in the trace, then run it through the phase gate
    /// and its handler. Also the entry point used by replay.
    fn dispatch_recorded(
        &mut self,
        agent: &AgentId,
        action: AgentAction,
    ) -> Result<ActionResult, FatalError> {
        self.trace.push(TraceEntry {
            tick: self.clock,
            agent: agent.clone(),
            action: action.clone(),
        });

        let phase = self.engine.current();
        if !phase.admits(action.kind()) {
            if let Some(kind) = action.rejection_kind() {
                self.ledger.append(
                    self.clock,
                    &phase.label(),
                    Some(agent),
                    kind,
                    format!(
                        "Rejected action from {}: not admissible in {}",
                        agent,
                        phase.label()
                    ),
                    json!({ "reason": "invalid_phase" }),
                )?;
            }
            return Ok(ActionResult::RejectedInvalidPhase);
        }

        debug!(agent = %agent, tick = self.clock, phase = %phase.label(), "action received");
        match action {
            AgentAction::SubmitProposal { body } => self.handle_submit_proposal(agent, body),
            AgentAction::SignalReady => self.handle_signal_ready(agent),
            AgentAction::SubmitFeedback { target, body } => {
                self.handle_feedback(agent, &target, &body)
            }
            AgentAction::SubmitRevision { body } => self.handle_revision(agent, body),
            AgentAction::StakeAdd { proposal, amount } => {
                self.handle_stake_add(agent, &proposal, amount)
            }
            AgentAction::StakeSwitch { stake_id, proposal } => {
                self.handle_stake_switch(agent, &stake_id, &proposal)
            }
            AgentAction::StakeWithdraw { stake_id } => {
                self.handle_stake_withdraw(agent, &stake_id)
            }
        }
    }

    // -- handlers ------------------------------------------------------------

    fn handle_submit_proposal(
        &mut self,
        agent: &str,
        body: ProposalBody,
    ) -> Result<ActionResult, FatalError> {
        let label = self.engine.current().label();
        if self.proposals.is_committed(agent) {
            self.ledger.append(
                self.clock,
                &label,
                Some(agent),
                EventKind::ProposalRejected,
                format!("Rejected proposal from {}: already submitted", agent),
                json!({ "reason": "already_submitted" }),
            )?;
            return Ok(ActionResult::RejectedSemantic("already_submitted".into()));
        }
        if self.credits.balance(agent) < self.config.proposal_self_stake {
            self.ledger.append(
                self.clock,
                &label,
                Some(agent),
                EventKind::ProposalRejected,
                format!("Rejected proposal from {}: not enough CP to self-stake", agent),
                json!({
                    "reason": "insufficient_cp_for_stake",
                    "required": self.config.proposal_self_stake,
                    "balance": self.credits.balance(agent)
                }),
            )?;
            return Ok(ActionResult::RejectedInsufficientCredit);
        }

        let issue_id = self.issue.id.clone();
        let id = self.proposals.submit(agent, &issue_id, body, self.clock);
        self.credits.stake_to_proposal(
            &mut self.ledger,
            self.clock,
            &label,
            agent,
            &id,
            self.config.proposal_self_stake,
            StakeKind::MandatorySelf,
        )?;
        self.ledger.append(
            self.clock,
            &label,
            Some(agent),
            EventKind::ProposalAccepted,
            format!("Proposal accepted from {}: {}", agent, id),
            json!({ "proposal": id, "revision": 1 }),
        )?;
        self.mark_ready(agent, "proposal_accepted")?;
        Ok(ActionResult::ok_with(id))
    }

    fn handle_signal_ready(&mut self, agent: &str) -> Result<ActionResult, FatalError> {
        // In PROPOSE, standing down is itself a commitment: the agent is
        // assigned to the canonical NoAction proposal, self-stake included.
        if self.engine.current() == Phase::Propose && !self.proposals.is_committed(agent) {
            self.assign_noaction(agent)?;
        }
        self.mark_ready(agent, "signal_ready")?;
        Ok(ActionResult::ok())
    }

    fn handle_feedback(
        &mut self,
        agent: &str,
        target: &str,
        body: &str,
    ) -> Result<ActionResult, FatalError> {
        let label = self.engine.current().label();

        if self.engine.feedback_count(agent) >= self.config.max_feedback_per_agent {
            self.ledger.append(
                self.clock,
                &label,
                Some(agent),
                EventKind::FeedbackRejected,
                format!("Rejected feedback from {}: feedback limit reached", agent),
                json!({ "reason": "feedback_limit_reached", "limit": self.config.max_feedback_per_agent }),
            )?;
            return Ok(ActionResult::RejectedQuotaExceeded);
        }
        if body.chars().count() > self.config.feedback_char_limit {
            self.ledger.append(
                self.clock,
                &label,
                Some(agent),
                EventKind::FeedbackRejected,
                format!("Rejected feedback from {}: body too long", agent),
                json!({
                    "reason": "feedback_too_long",
                    "length": body.chars().count(),
                    "limit": self.config.feedback_char_limit
                }),
            )?;
            return Ok(ActionResult::RejectedSemantic("feedback_too_long".into()));
        }
        match self.proposals.get(target) {
            Some(p) if p.active => {}
            _ => {
                self.ledger.append(
                    self.clock,
                    &label,
                    Some(agent),
                    EventKind::FeedbackRejected,
                    format!("Rejected feedback from {}: unknown proposal {}", agent, target),
                    json!({ "reason": "unknown_proposal", "target": target }),
                )?;
                return Ok(ActionResult::RejectedNotFound);
            }
        }
        if self.proposals.assignment(agent).map(String::as_str) == Some(target) {
            self.ledger.append(
                self.clock,
                &label,
                Some(agent),
                EventKind::FeedbackRejected,
                format!("Rejected feedback from {}: cannot comment on own proposal", agent),
                json!({ "reason": "own_proposal", "target": target }),
            )?;
            return Ok(ActionResult::RejectedSemantic("own_proposal".into()));
        }
        if self.config.feedback_stake > 0
            && !self.credits.attempt_deduct(
                &mut self.ledger,
                self.clock,
                &label,
                agent,
                self.config.feedback_stake,
                "feedback_stake",
            )?
        {
            self.ledger.append(
                self.clock,
                &label,
                Some(agent),
                EventKind::FeedbackRejected,
                format!("Rejected feedback from {}: insufficient CP", agent),
                json!({ "reason": "insufficient_cp", "required": self.config.feedback_stake }),
            )?;
            return Ok(ActionResult::RejectedInsufficientCredit);
        }

        self.feedback.push(FeedbackRecord {
            author: agent.to_string(),
            target: target.to_string(),
            body: body.to_string(),
            tick: self.clock,
        });
        self.engine.record_feedback(agent);
        self.ledger.append(
            self.clock,
            &label,
            Some(agent),
            EventKind::FeedbackRecorded,
            format!("Feedback from {} on {}", agent, target),
            json!({ "target": target, "length": body.chars().count() }),
        )?;
        Ok(ActionResult::ok())
    }

    fn handle_revision(
        &mut self,
        agent: &str,
        body: ProposalBody,
    ) -> Result<ActionResult, FatalError> {
        let label = self.engine.current().label();
        let (old_id, old_text) = match self.proposals.active_of_author(agent) {
            Some(p) => (p.id.clone(), p.body.text()),
            None => {
                self.ledger.append(
                    self.clock,
                    &label,
                    Some(agent),
                    EventKind::RevisionRejected,
                    format!("Rejected revision from {}: no own active proposal", agent),
                    json!({ "reason": "no_own_proposal" }),
                )?;
                return Ok(ActionResult::RejectedSemantic("no_own_proposal".into()));
            }
        };

        let delta = dissimilarity(&old_text, &body.text());
        let cost = (self.config.proposal_self_stake as f64 * delta).round() as u64;

        if cost > 0 {
            // The tap may free locked self-stake, but only when the full
            // cost is coverable; otherwise state stays untouched.
            if !self.credits.auto_stake_tap(
                &mut self.ledger,
                self.clock,
                &label,
                agent,
                &old_id,
                cost,
            )? {
                self.credits.attempt_deduct(
                    &mut self.ledger,
                    self.clock,
                    &label,
                    agent,
                    cost,
                    "revision_cost",
                )?;
                self.ledger.append(
                    self.clock,
                    &label,
                    Some(agent),
                    EventKind::RevisionRejected,
                    format!("Rejected revision from {}: insufficient CP for cost {}", agent, cost),
                    json!({ "reason": "insufficient_cp", "cost": cost, "delta": delta }),
                )?;
                return Ok(ActionResult::RejectedInsufficientCredit);
            }
            self.credits.attempt_deduct(
                &mut self.ledger,
                self.clock,
                &label,
                agent,
                cost,
                "revision_cost",
            )?;
        }

        let (old_id, new_id) = self.proposals.revise(agent, body, self.clock);
        let transferred = self.credits.transfer_stake(&old_id, &new_id);
        let revision = self
            .proposals
            .get(&new_id)
            .map(|p| p.revision)
            .unwrap_or(0);
        self.ledger.append(
            self.clock,
            &label,
            Some(agent),
            EventKind::RevisionRecorded,
            format!(
                "Revision accepted from {}: {} -> {} (delta {:.3}, cost {} CP)",
                agent, old_id, new_id, delta, cost
            ),
            json!({
                "parent": old_id,
                "proposal": new_id,
                "revision": revision,
                "delta": delta,
                "cost": cost,
                "transferred_stakes": transferred
            }),
        )?;
        self.mark_ready(agent, "revision_accepted")?;
        Ok(ActionResult::ok_with(new_id))
    }

    fn handle_stake_add(
        &mut self,
        agent: &str,
        proposal: &str,
        amount: u64,
    ) -> Result<ActionResult, FatalError> {
        let label = self.engine.current().label();
        if amount == 0 {
            self.ledger.append(
                self.clock,
                &label,
                Some(agent),
                EventKind::StakeRejected,
                format!("Rejected stake from {}: amount must be positive", agent),
                json!({ "reason": "invalid_amount", "proposal": proposal }),
            )?;
            return Ok(ActionResult::RejectedSemantic("invalid_amount".into()));
        }
        match self.proposals.get(proposal) {
            Some(p) if p.active => {}
            _ => {
                self.ledger.append(
                    self.clock,
                    &label,
                    Some(agent),
                    EventKind::StakeRejected,
                    format!("Rejected stake from {}: unknown proposal {}", agent, proposal),
                    json!({ "reason": "unknown_proposal", "proposal": proposal }),
                )?;
                return Ok(ActionResult::RejectedNotFound);
            }
        }
        match self.credits.stake_to_proposal(
            &mut self.ledger,
            self.clock,
            &label,
            agent,
            proposal,
            amount,
            StakeKind::Voluntary,
        )? {
            Some(stake_id) => Ok(ActionResult::ok_with(stake_id)),
            None => {
                self.ledger.append(
                    self.clock,
                    &label,
                    Some(agent),
                    EventKind::StakeRejected,
                    format!("Rejected stake from {}: insufficient CP", agent),
                    json!({ "reason": "insufficient_credit", "amount": amount }),
                )?;
                Ok(ActionResult::RejectedInsufficientCredit)
            }
        }
    }

    fn handle_stake_switch(
        &mut self,
        agent: &str,
        stake_id: &str,
        new_proposal: &str,
    ) -> Result<ActionResult, FatalError> {
        let label = self.engine.current().label();
        let (owner, mandatory, current_target) = match self.credits.stakes().get(stake_id) {
            Some(r) if r.is_active() => (r.agent.clone(), r.is_mandatory(), r.proposal.clone()),
            _ => {
                self.ledger.append(
                    self.clock,
                    &label,
                    Some(agent),
                    EventKind::StakeRejected,
                    format!("Rejected switch from {}: unknown stake", agent),
                    json!({ "reason": "unknown_stake", "stake_id": stake_id }),
                )?;
                return Ok(ActionResult::RejectedNotFound);
            }
        };
        if owner != agent {
            self.ledger.append(
                self.clock,
                &label,
                Some(agent),
                EventKind::StakeRejected,
                format!("Rejected switch from {}: not the stake owner", agent),
                json!({ "reason": "not_stake_owner", "stake_id": stake_id }),
            )?;
            return Ok(ActionResult::RejectedSemantic("not_stake_owner".into()));
        }
        if mandatory {
            self.ledger.append(
                self.clock,
                &label,
                Some(agent),
                EventKind::StakeRejected,
                format!("Rejected switch from {}: mandatory self-stake is immutable", agent),
                json!({ "reason": "stake_immutable", "stake_id": stake_id }),
            )?;
            return Ok(ActionResult::RejectedSemantic("stake_immutable".into()));
        }
        match self.proposals.get(new_proposal) {
            Some(p) if p.active => {}
            _ => {
                self.ledger.append(
                    self.clock,
                    &label,
                    Some(agent),
                    EventKind::StakeRejected,
                    format!("Rejected switch from {}: unknown proposal {}", agent, new_proposal),
                    json!({ "reason": "unknown_proposal", "proposal": new_proposal }),
                )?;
                return Ok(ActionResult::RejectedNotFound);
            }
        }
        if current_target == new_proposal {
            self.ledger.append(
                self.clock,
                &label,
                Some(agent),
                EventKind::StakeRejected,
                format!("Rejected switch from {}: stake already targets {}", agent, new_proposal),
                json!({ "reason": "same_proposal", "stake_id": stake_id }),
            )?;
            return Ok(ActionResult::RejectedSemantic("same_proposal".into()));
        }

        self.credits.switch_voluntary(
            &mut self.ledger,
            self.clock,
            &label,
            stake_id,
            new_proposal,
        )?;
        Ok(ActionResult::ok_with(stake_id))
    }

    fn handle_stake_withdraw(
        &mut self,
        agent: &str,
        stake_id: &str,
    ) -> Result<ActionResult, FatalError> {
        let label = self.engine.current().label();
        let (owner, mandatory) = match self.credits.stakes().get(stake_id) {
            Some(r) if r.is_active() => (r.agent.clone(), r.is_mandatory()),
            _ => {
                self.ledger.append(
                    self.clock,
                    &label,
                    Some(agent),
                    EventKind::StakeRejected,
                    format!("Rejected withdraw from {}: unknown stake", agent),
                    json!({ "reason": "unknown_stake", "stake_id": stake_id }),
                )?;
                return Ok(ActionResult::RejectedNotFound);
            }
        };
        if owner != agent {
            self.ledger.append(
                self.clock,
                &label,
                Some(agent),
                EventKind::StakeRejected,
                format!("Rejected withdraw from {}: not the stake owner", agent),
                json!({ "reason": "not_stake_owner", "stake_id": stake_id }),
            )?;
            return Ok(ActionResult::RejectedSemantic("not_stake_owner".into()));
        }
        if mandatory {
            self.ledger.append(
                self.clock,
                &label,
                Some(agent),
                EventKind::StakeRejected,
                format!("Rejected withdraw from {}: mandatory self-stake is immutable", agent),
                json!({ "reason": "stake_immutable", "stake_id": stake_id }),
            )?;
            return Ok(ActionResult::RejectedSemantic("stake_immutable".into()));
        }
        self.credits.withdraw_voluntary(
            &mut self.ledger,
            self.clock,
            &label,
            stake_id,
            "voluntary_withdraw",
        )?;
        Ok(ActionResult::ok())
    }

    // -- tick loop -----------------------------------------------------------

    /// Advance the logical clock one step. Privileged: only the external
    /// scheduler calls this, never agents.
    pub fn tick(&mut self) -> Result<TickReport, FatalError> {
        if self.finalized {
            return Ok(TickReport {
                tick: self.clock,
                phase: Phase::Finalize,
                transitioned: false,
                kicked: Vec::new(),
                finalized: true,
            });
        }
        self.clock += 1;
        let phase_tick = self.engine.begin_tick();

        let mut kicked = Vec::new();
        let mut transitioned = false;
        if self.engine.all_ready() {
            self.transition()?;
            transitioned = true;
        } else if phase_tick >= self.config.max_think_ticks {
            kicked = self.kick_out()?;
            self.transition()?;
            transitioned = true;
        }

        Ok(TickReport {
            tick: self.clock,
            phase: self.phase(),
            transitioned,
            kicked,
            finalized: self.finalized,
        })
    }

    fn transition(&mut self) -> Result<(), FatalError> {
        let from = self.engine.current();
        // Leaving a STAKE round: held stakes accrue one round of conviction.
        if from.stake_round().is_some() {
            self.credits
                .advance_round(&mut self.ledger, self.clock, &from.label())?;
        }
        let to = self.engine.advance();
        self.ledger.append(
            self.clock,
            &to.label(),
            None,
            EventKind::PhaseTransition,
            format!("Phase transition: {} -> {}", from.label(), to.label()),
            json!({ "from": from.label(), "to": to.label() }),
        )?;
        info!(tick = self.clock, from = %from.label(), to = %to.label(), "phase transition");
        if to.stake_round().is_some() {
            self.stake_round_started = self.clock;
        }
        if to == Phase::Finalize {
            self.run_finalize()?;
        }
        Ok(())
    }

    fn kick_out(&mut self) -> Result<Vec<AgentId>, FatalError> {
        let phase = self.engine.current();
        let label = phase.label();
        let unready = self.engine.unready();
        self.ledger.append(
            self.clock,
            &label,
            None,
            EventKind::PhaseTimeout,
            format!(
                "Think budget exhausted in {}: substituting for {} agent(s)",
                label,
                unready.len()
            ),
            json!({ "phase": label, "agents": unready }),
        )?;
        for agent in &unready {
            // Substitution per phase: PROPOSE forces the NoAction
            // commitment; FEEDBACK and REVISE stand pat; STAKE leaves the
            // agent's stakes exactly where they are.
            if phase == Phase::Propose && !self.proposals.is_committed(agent) {
                self.assign_noaction(agent)?;
            }
            if self.config.kick_out_penalty > 0 {
                self.credits.attempt_deduct(
                    &mut self.ledger,
                    self.clock,
                    &label,
                    agent,
                    self.config.kick_out_penalty,
                    "kick_out_penalty",
                )?;
            }
            self.engine.mark_ready(agent);
            self.ledger.append(
                self.clock,
                &label,
                Some(agent),
                EventKind::AgentReady,
                format!("Agent {} substituted by kick-out", agent),
                json!({ "reason": "kick_out" }),
            )?;
        }
        Ok(unready)
    }

    /// Assign the agent to the canonical NoAction proposal, applying the
    /// mandatory self-stake. On insufficient CP the assignment still stands
    /// with zero locked stake; the shortfall is in the ledger.
    fn assign_noaction(&mut self, agent: &str) -> Result<(), FatalError> {
        let label = self.engine.current().label();
        let issue_id = self.issue.id.clone();
        let noaction = self.proposals.assign_noaction(agent, &issue_id, self.clock);
        self.ledger.append(
            self.clock,
            &label,
            Some(agent),
            EventKind::ProposalAccepted,
            format!("Agent {} assigned to canonical NoAction proposal", agent),
            json!({ "proposal": noaction, "noaction": true }),
        )?;
        self.credits.stake_to_proposal(
            &mut self.ledger,
            self.clock,
            &label,
            agent,
            &noaction,
            self.config.proposal_self_stake,
            StakeKind::MandatorySelf,
        )?;
        Ok(())
    }

    fn mark_ready(&mut self, agent: &str, reason: &str) -> Result<(), FatalError> {
        if self.engine.mark_ready(agent) {
            let label = self.engine.current().label();
            self.ledger.append(
                self.clock,
                &label,
                Some(agent),
                EventKind::AgentReady,
                format!("Agent {} marked as ready", agent),
                json!({ "reason": reason }),
            )?;
        }
        Ok(())
    }

    // -- finalization --------------------------------------------------------

    fn run_finalize(&mut self) -> Result<(), FatalError> {
        let label = Phase::Finalize.label();
        let curve = *self.credits.curve();

        // Rank every author line by conviction-weighted score.
        let mut rankings: Vec<RankedProposal> = Vec::new();
        for p in self.proposals.active_proposals() {
            let stakes = self.credits.stakes();
            let mut shares: BTreeMap<AgentId, SupporterShare> = BTreeMap::new();
            let mut raw_staked = 0u64;
            for record in stakes.active_on(&p.id) {
                raw_staked += record.amount;
                let entry = shares
                    .entry(record.agent.clone())
                    .or_insert_with(|| SupporterShare {
                        agent: record.agent.clone(),
                        raw_stake: 0,
                        weight: 0.0,
                    });
                entry.raw_stake += record.amount;
                entry.weight += curve.effective_weight(record);
            }
            rankings.push(RankedProposal {
                proposal: p.id.clone(),
                author: p.author.clone(),
                revision: p.revision,
                score: stakes.score(&p.id, &curve),
                raw_staked,
                last_stake_tick: stakes.last_stake_tick(&p.id),
                supporters: shares.into_values().collect(),
            });
        }

        // Highest score wins; ties go to the earliest LastStakeTick, then to
        // the lexicographically smallest proposal ID.
        rankings.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let a_last = a.last_stake_tick.unwrap_or(Tick::MAX);
                    let b_last = b.last_stake_tick.unwrap_or(Tick::MAX);
                    a_last.cmp(&b_last)
                })
                .then_with(|| a.proposal.cmp(&b.proposal))
        });

        let winner = rankings.first().cloned();
        let tied: Vec<&RankedProposal> = match &winner {
            Some(w) => rankings.iter().filter(|r| r.score == w.score).collect(),
            None => Vec::new(),
        };

        self.ledger.append(
            self.clock,
            &label,
            None,
            EventKind::Finalize,
            match &winner {
                Some(w) => format!(
                    "Issue {} finalized: {} wins with score {:.4}",
                    self.issue.id, w.proposal, w.score
                ),
                None => format!("Issue {} finalized with no proposals", self.issue.id),
            },
            json!({
                "winner": winner.as_ref().map(|w| w.proposal.clone()),
                "winner_author": winner.as_ref().map(|w| w.author.clone()),
                "score": winner.as_ref().map(|w| w.score).unwrap_or(0.0),
                "tie_break": {
                    "contenders": tied.iter().map(|r| r.proposal.clone()).collect::<Vec<_>>(),
                    "rule": "earliest_last_stake_tick",
                    "last_stake_ticks": tied
                        .iter()
                        .map(|r| json!({ "proposal": r.proposal, "last_stake_tick": r.last_stake_tick }))
                        .collect::<Vec<_>>()
                },
                "rankings": rankings
                    .iter()
                    .map(|r| json!({
                        "proposal": r.proposal,
                        "author": r.author,
                        "score": r.score,
                        "raw_staked": r.raw_staked
                    }))
                    .collect::<Vec<_>>()
            }),
        )?;

        if let Some(w) = &winner {
            for share in &w.supporters {
                let multiplier = if share.raw_stake > 0 {
                    share.weight / share.raw_stake as f64
                } else {
                    1.0
                };
                self.ledger.append(
                    self.clock,
                    &label,
                    Some(&share.agent),
                    EventKind::InfluenceRecorded,
                    format!(
                        "Agent {} contributed {:.2} CP effective weight to winning proposal {}",
                        share.agent, share.weight, w.proposal
                    ),
                    json!({
                        "winning_proposal": w.proposal,
                        "contribution": share.weight,
                        "raw_stake": share.raw_stake,
                        "multiplier": multiplier
                    }),
                )?;
            }
        }

        self.credits
            .burn_all_stakes(&mut self.ledger, self.clock, &label)?;
        self.ledger.seal();
        self.finalized = true;
        let score = winner.as_ref().map(|w| w.score).unwrap_or(0.0);
        info!(
            issue = %self.issue.id,
            winner = winner.as_ref().map(|w| w.proposal.as_str()).unwrap_or("-"),
            score,
            tick = self.clock,
            "issue finalized"
        );
        self.outcome = Some(Outcome {
            winner: winner.as_ref().map(|w| w.proposal.clone()),
            winner_author: winner.as_ref().map(|w| w.author.clone()),
            score,
            finalize_tick: self.clock,
            rankings,
        });
        Ok(())
    }

    // -- queries -------------------------------------------------------------

    /// Agent-facing state snapshot, blind-staking rule applied.
    pub fn query_state(&self, credential: &str) -> Option<StateView> {
        let agent = self.roster.authenticate(credential)?.clone();
        let phase = self.phase();
        let in_stake_round = !self.finalized && phase.stake_round().is_some();

        let events: Vec<LedgerEvent> = self
            .ledger
            .events()
            .iter()
            .filter(|e| {
                !(in_stake_round
                    && e.kind.is_stake_movement()
                    && e.tick >= self.stake_round_started)
            })
            .cloned()
            .collect();

        let proposals = self
            .proposals
            .active_proposals()
            .map(|p| ProposalView {
                id: p.id.clone(),
                author: p.author.clone(),
                revision: p.revision,
                body: p.body.clone(),
                created_tick: p.created_tick,
                updated_tick: p.updated_tick,
            })
            .collect();

        let own_stakes = self
            .credits
            .stakes()
            .active_of_agent(&agent)
            .map(|r| StakeView {
                id: r.id.clone(),
                proposal: r.proposal.clone(),
                amount: r.amount,
                rounds_held: r.rounds_held,
                kind: r.kind,
            })
            .collect();

        Some(StateView {
            tick: self.clock,
            phase: phase.label(),
            balance: self.credits.balance(&agent),
            locked: self.credits.locked(&agent),
            agent,
            proposals,
            feedback: self.feedback.clone(),
            own_stakes,
            events,
            finalized: self.finalized,
            outcome: if self.finalized {
                self.outcome.clone()
            } else {
                None
            },
        })
    }

    // -- replay --------------------------------------------------------------

    /// Re-run a recorded action sequence against a fresh state. With the
    /// same configuration, issue, and roster, the produced ledger is
    /// byte-identical to the original run's.
    pub fn replay(
        config: ConsensusConfig,
        issue: Issue,
        roster: Roster,
        trace: &[TraceEntry],
    ) -> Result<Orchestrator, FatalError> {
        let mut run = Orchestrator::new(config, issue, roster)?;
        let mut next = 0;
        while !run.finalized {
            while next < trace.len() && trace[next].tick == run.clock {
                let entry = trace[next].clone();
                run.dispatch_recorded(&entry.agent, entry.action)?;
                next += 1;
            }
            run.tick()?;
        }
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentProfile;

    fn roster(n: usize) -> Roster {
        Roster::new(
            (1..=n)
                .map(|i| AgentProfile::new(format!("A{}", i), format!("Agent {}", i), cred(i)))
                .collect(),
        )
        .unwrap()
    }

    fn cred(i: usize) -> String {
        format!("cred-A{}", i)
    }

    fn body(text: &str) -> ProposalBody {
        ProposalBody {
            title: text.to_string(),
            action: format!("carry out {}", text),
            rationale: format!("{} is the sensible path", text),
            ..Default::default()
        }
    }

    fn orchestrator(n: usize, config: ConsensusConfig) -> Orchestrator {
        Orchestrator::new(config, Issue::new("ISS-1", "decide something"), roster(n)).unwrap()
    }

    /// Drive everyone through PROPOSE with distinct proposals.
    fn propose_all(run: &mut Orchestrator, n: usize) {
        for i in 1..=n {
            let result = run
                .submit_proposal(&cred(i), body(&format!("plan {}", i)))
                .unwrap();
            assert!(result.is_ok(), "proposal {} rejected: {:?}", i, result);
        }
        run.tick().unwrap();
    }

    /// signal_ready for all agents, then tick.
    fn all_ready_tick(run: &mut Orchestrator, n: usize) {
        for i in 1..=n {
            run.signal_ready(&cred(i)).unwrap();
        }
        run.tick().unwrap();
    }

    /// Walk through the (FEEDBACK, REVISE) cycles with everyone idle.
    fn skip_revision_cycles(run: &mut Orchestrator, n: usize) {
        for _ in 0..run.config().revision_cycles * 2 {
            all_ready_tick(run, n);
        }
    }

    // =========================================================================
    // Construction and enrollment
    // =========================================================================

    #[test]
    fn test_enrollment_awards_invite_payment() {
        let run = orchestrator(3, ConsensusConfig::default());
        for agent in ["A1", "A2", "A3"] {
            assert_eq!(run.credits().balance(agent), 100);
        }
        let awards = run
            .ledger()
            .events()
            .iter()
            .filter(|e| e.kind == EventKind::CreditAward)
            .count();
        assert_eq!(awards, 3);
    }

    #[test]
    fn test_invalid_config_aborts_construction() {
        let config = ConsensusConfig {
            conviction_saturation_rounds: 0,
            ..Default::default()
        };
        let result = Orchestrator::new(config, Issue::new("ISS-1", "x"), roster(2));
        assert!(result.is_err());
    }

    // =========================================================================
    // Validation pipeline
    // =========================================================================

    #[test]
    fn test_unknown_credential_rejected() {
        let mut run = orchestrator(2, ConsensusConfig::default());
        let result = run.submit_proposal("who-is-this", body("x")).unwrap();
        assert_eq!(result, ActionResult::RejectedUnauthenticated);
        // Unauthenticated submissions never reach the trace or the ledger
        assert!(run.trace().is_empty());
    }

    #[test]
    fn test_phase_violation_rejected_and_logged() {
        let mut run = orchestrator(2, ConsensusConfig::default());
        let result = run.stake_add(&cred(1), "PA2@v1", 10).unwrap();
        assert_eq!(result, ActionResult::RejectedInvalidPhase);
        assert_eq!(
            run.ledger().events().last().unwrap().kind,
            EventKind::StakeRejected
        );
    }

    #[test]
    fn test_second_proposal_rejected() {
        let mut run = orchestrator(2, ConsensusConfig::default());
        assert!(run.submit_proposal(&cred(1), body("first")).unwrap().is_ok());
        let result = run.submit_proposal(&cred(1), body("second")).unwrap();
        assert_eq!(
            result,
            ActionResult::RejectedSemantic("already_submitted".into())
        );
    }

    #[test]
    fn test_rejection_is_noop_on_state() {
        let mut run = orchestrator(2, ConsensusConfig::default());
        run.submit_proposal(&cred(1), body("first")).unwrap();
        let balance = run.credits().balance("A1");
        let locked = run.credits().locked("A1");
        run.submit_proposal(&cred(1), body("second")).unwrap();
        assert_eq!(run.credits().balance("A1"), balance);
        assert_eq!(run.credits().locked("A1"), locked);
    }

    // =========================================================================
    // PROPOSE
    // =========================================================================

    #[test]
    fn test_proposal_locks_self_stake() {
        let mut run = orchestrator(3, ConsensusConfig::default());
        let result = run.submit_proposal(&cred(1), body("harbor")).unwrap();
        assert_eq!(result.reference(), Some("PA1@v1"));
        assert_eq!(run.credits().balance("A1"), 50);
        assert_eq!(run.credits().locked("A1"), 50);
    }

    #[test]
    fn test_signal_ready_in_propose_assigns_noaction() {
        let mut run = orchestrator(2, ConsensusConfig::default());
        run.signal_ready(&cred(1)).unwrap();
        assert_eq!(
            run.proposals().assignment("A1").map(String::as_str),
            Some("Psystem@v1")
        );
        assert_eq!(run.credits().locked("A1"), 50);
    }

    #[test]
    fn test_kick_out_assigns_noaction() {
        // Scenario: an agent never acts in PROPOSE within MaxThinkTicks
        let mut run = orchestrator(3, ConsensusConfig::default());
        run.submit_proposal(&cred(1), body("one")).unwrap();
        run.submit_proposal(&cred(2), body("two")).unwrap();
        let mut kicked = Vec::new();
        for _ in 0..3 {
            let report = run.tick().unwrap();
            kicked.extend(report.kicked);
            if report.transitioned {
                break;
            }
        }
        assert_eq!(kicked, vec!["A3"]);
        assert_eq!(
            run.proposals().assignment("A3").map(String::as_str),
            Some("Psystem@v1")
        );
        assert_eq!(run.credits().locked("A3"), 50);
    }

    #[test]
    fn test_kick_out_insufficient_cp_assigns_with_zero_stake() {
        let config = ConsensusConfig {
            standard_invite_payment: 30,
            proposal_self_stake: 50,
            ..Default::default()
        };
        let mut run = orchestrator(2, config);
        run.signal_ready(&cred(1)).unwrap();
        for _ in 0..3 {
            if run.tick().unwrap().transitioned {
                break;
            }
        }
        // A2 was kicked; assignment stands, stake could not be taken
        assert_eq!(
            run.proposals().assignment("A2").map(String::as_str),
            Some("Psystem@v1")
        );
        assert_eq!(run.credits().locked("A2"), 0);
        assert!(run
            .ledger()
            .events()
            .iter()
            .any(|e| e.kind == EventKind::InsufficientCredit && e.agent.as_deref() == Some("A2")));
    }

    #[test]
    fn test_max_think_ticks_zero_kicks_everyone_to_finalize() {
        let config = ConsensusConfig {
            max_think_ticks: 0,
            revision_cycles: 1,
            stake_rounds: 1,
            ..Default::default()
        };
        let mut run = orchestrator(3, config);
        while !run.is_finalized() {
            run.tick().unwrap();
        }
        let outcome = run.outcome().unwrap();
        // Everyone was substituted into NoAction, which wins unopposed
        assert_eq!(outcome.winner.as_deref(), Some("Psystem@v1"));
        assert_eq!(outcome.rankings.len(), 1);
    }

    // =========================================================================
    // FEEDBACK
    // =========================================================================

    fn into_feedback(run: &mut Orchestrator, n: usize) {
        propose_all(run, n);
        assert_eq!(run.phase(), Phase::Feedback(1));
    }

    #[test]
    fn test_feedback_burns_stake() {
        let mut run = orchestrator(3, ConsensusConfig::default());
        into_feedback(&mut run, 3);
        let result = run
            .submit_feedback(&cred(1), "PA2@v1", "needs a budget")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(run.credits().balance("A1"), 45);
        assert_eq!(run.feedback().len(), 1);
    }

    #[test]
    fn test_feedback_on_own_proposal_rejected() {
        let mut run = orchestrator(3, ConsensusConfig::default());
        into_feedback(&mut run, 3);
        let result = run
            .submit_feedback(&cred(1), "PA1@v1", "I like my own idea")
            .unwrap();
        assert_eq!(result, ActionResult::RejectedSemantic("own_proposal".into()));
        assert_eq!(run.credits().balance("A1"), 50);
    }

    #[test]
    fn test_feedback_quota_enforced() {
        let config = ConsensusConfig {
            max_feedback_per_agent: 2,
            ..Default::default()
        };
        let mut run = orchestrator(3, config);
        into_feedback(&mut run, 3);
        assert!(run.submit_feedback(&cred(1), "PA2@v1", "a").unwrap().is_ok());
        assert!(run.submit_feedback(&cred(1), "PA3@v1", "b").unwrap().is_ok());
        let result = run.submit_feedback(&cred(1), "PA2@v1", "c").unwrap();
        assert_eq!(result, ActionResult::RejectedQuotaExceeded);
    }

    #[test]
    fn test_feedback_too_long_rejected() {
        let config = ConsensusConfig {
            feedback_char_limit: 10,
            ..Default::default()
        };
        let mut run = orchestrator(2, config);
        into_feedback(&mut run, 2);
        let result = run
            .submit_feedback(&cred(1), "PA2@v1", "this body is far too long")
            .unwrap();
        assert_eq!(
            result,
            ActionResult::RejectedSemantic("feedback_too_long".into())
        );
    }

    // =========================================================================
    // REVISE
    // =========================================================================

    fn into_revise(run: &mut Orchestrator, n: usize) {
        into_feedback(run, n);
        all_ready_tick(run, n);
        assert_eq!(run.phase(), Phase::Revise(1));
    }

    #[test]
    fn test_revision_costs_scaled_delta() {
        let mut run = orchestrator(2, ConsensusConfig::default());
        into_revise(&mut run, 2);
        let before = run.credits().balance("A1");
        let old_text = run
            .proposals()
            .active_of_author("A1")
            .unwrap()
            .body
            .text();
        let new_body = body("entirely different scheme");
        let delta = dissimilarity(&old_text, &new_body.text());
        let expected_cost = (50.0 * delta).round() as u64;

        let result = run.submit_revision(&cred(1), new_body).unwrap();
        assert_eq!(result.reference(), Some("PA1@v2"));
        assert_eq!(run.credits().balance("A1"), before - expected_cost);

        // Self-stake followed the line to v2
        let mandatory = run
            .credits()
            .stakes()
            .mandatory_of_on("A1", "PA1@v2")
            .unwrap();
        assert_eq!(mandatory.amount, 50);
    }

    #[test]
    fn test_zero_delta_revision_costs_nothing() {
        let mut run = orchestrator(2, ConsensusConfig::default());
        into_revise(&mut run, 2);
        let same = run
            .proposals()
            .active_of_author("A1")
            .unwrap()
            .body
            .clone();
        let before = run.credits().balance("A1");
        let result = run.submit_revision(&cred(1), same).unwrap();
        assert!(result.is_ok());
        assert_eq!(run.credits().balance("A1"), before);
        // A new active version still exists
        assert_eq!(run.proposals().active_of_author("A1").unwrap().revision, 2);
    }

    #[test]
    fn test_revision_auto_tap_reduces_self_stake() {
        // Full rewrite with thin liquidity: the tap frees self-stake to
        // cover the cost and the residue follows the line to v2.
        let config = ConsensusConfig {
            feedback_stake: 45,
            ..Default::default()
        };
        let mut run = orchestrator(2, config);
        into_feedback(&mut run, 2);
        // A1 burns 45 on feedback, leaving 5 liquid against a 50 CP rewrite
        assert!(run
            .submit_feedback(&cred(1), "PA2@v1", "start over")
            .unwrap()
            .is_ok());
        all_ready_tick(&mut run, 2);
        assert_eq!(run.phase(), Phase::Revise(1));
        assert_eq!(run.credits().balance("A1"), 5);

        // Shares no token with the original: delta = 1, cost = 50
        let rewrite = ProposalBody {
            title: "zzz yyy xxx".into(),
            action: "www vvv uuu".into(),
            rationale: "ttt sss rrr".into(),
            ..Default::default()
        };
        let result = run.submit_revision(&cred(1), rewrite).unwrap();
        assert!(result.is_ok());

        assert_eq!(run.credits().balance("A1"), 0);
        let mandatory = run
            .credits()
            .stakes()
            .mandatory_of_on("A1", "PA1@v2")
            .unwrap();
        assert_eq!(mandatory.amount, 5);
        assert!(run.ledger().events().iter().any(|e| {
            e.kind == EventKind::StakeWithdrawn && e.payload["reason"] == json!("auto_tap")
        }));
        assert!(run
            .ledger()
            .events()
            .iter()
            .any(|e| e.kind == EventKind::RevisionRecorded));
    }

    // =========================================================================
    // STAKE
    // =========================================================================

    fn into_stake(run: &mut Orchestrator, n: usize) {
        propose_all(run, n);
        skip_revision_cycles(run, n);
        assert_eq!(run.phase(), Phase::Stake(1));
    }

    #[test]
    fn test_voluntary_stake_and_withdraw() {
        let mut run = orchestrator(3, ConsensusConfig::default());
        into_stake(&mut run, 3);
        let result = run.stake_add(&cred(1), "PA2@v1", 20).unwrap();
        let stake_id = result.reference().unwrap().to_string();
        assert_eq!(run.credits().balance("A1"), 30);

        let result = run.stake_withdraw(&cred(1), &stake_id).unwrap();
        assert!(result.is_ok());
        assert_eq!(run.credits().balance("A1"), 50);
    }

    #[test]
    fn test_mandatory_stake_immutable() {
        let mut run = orchestrator(2, ConsensusConfig::default());
        into_stake(&mut run, 2);
        let mandatory_id = run
            .credits()
            .stakes()
            .mandatory_of_on("A1", "PA1@v1")
            .unwrap()
            .id
            .clone();
        let result = run.stake_switch(&cred(1), &mandatory_id, "PA2@v1").unwrap();
        assert_eq!(
            result,
            ActionResult::RejectedSemantic("stake_immutable".into())
        );
        let result = run.stake_withdraw(&cred(1), &mandatory_id).unwrap();
        assert_eq!(
            result,
            ActionResult::RejectedSemantic("stake_immutable".into())
        );
    }

    #[test]
    fn test_switch_other_agents_stake_rejected() {
        let mut run = orchestrator(3, ConsensusConfig::default());
        into_stake(&mut run, 3);
        let stake_id = run
            .stake_add(&cred(1), "PA2@v1", 10)
            .unwrap()
            .reference()
            .unwrap()
            .to_string();
        let result = run.stake_switch(&cred(2), &stake_id, "PA3@v1").unwrap();
        assert_eq!(
            result,
            ActionResult::RejectedSemantic("not_stake_owner".into())
        );
    }

    #[test]
    fn test_conviction_accrues_across_rounds() {
        let config = ConsensusConfig {
            stake_rounds: 4,
            ..Default::default()
        };
        let mut run = orchestrator(2, config);
        into_stake(&mut run, 2);
        let stake_id = run
            .stake_add(&cred(1), "PA2@v1", 30)
            .unwrap()
            .reference()
            .unwrap()
            .to_string();
        // Rounds 1..3 pass; during round 4 the counter shows 3
        for _ in 0..3 {
            all_ready_tick(&mut run, 2);
        }
        assert_eq!(run.phase(), Phase::Stake(4));
        let record = run.credits().stakes().get(&stake_id).unwrap();
        assert_eq!(record.rounds_held, 3);
    }

    // =========================================================================
    // Blind staking
    // =========================================================================

    #[test]
    fn test_blind_staking_hides_current_round() {
        let config = ConsensusConfig {
            stake_rounds: 2,
            ..Default::default()
        };
        let mut run = orchestrator(3, config);
        into_stake(&mut run, 3);

        // Round 1: A1 stakes; A2's query must not see it
        run.stake_add(&cred(1), "PA2@v1", 20).unwrap();
        let view = run.query_state(&cred(2)).unwrap();
        let hidden = view
            .events
            .iter()
            .any(|e| e.kind == EventKind::StakeRecorded && e.tick >= run.stake_round_started);
        assert!(!hidden, "in-round stake events must be withheld");
        // Self-stakes from PROPOSE stay visible
        assert!(view
            .events
            .iter()
            .any(|e| e.kind == EventKind::StakeRecorded));

        // After the round closes, the stake becomes visible in full
        all_ready_tick(&mut run, 3);
        assert_eq!(run.phase(), Phase::Stake(2));
        let view = run.query_state(&cred(2)).unwrap();
        let visible = view.events.iter().any(|e| {
            e.kind == EventKind::StakeRecorded
                && e.payload["proposal"] == json!("PA2@v1")
                && e.payload["kind"] == json!("voluntary")
        });
        assert!(visible, "previous round must be visible");
    }

    #[test]
    fn test_query_outside_stake_rounds_sees_everything() {
        let mut run = orchestrator(2, ConsensusConfig::default());
        propose_all(&mut run, 2);
        let view = run.query_state(&cred(1)).unwrap();
        assert_eq!(view.events.len(), run.ledger().len());
    }

    // =========================================================================
    // FINALIZE
    // =========================================================================

    fn run_to_finalize(run: &mut Orchestrator, n: usize) {
        while !run.is_finalized() {
            for i in 1..=n {
                run.signal_ready(&cred(i)).unwrap();
            }
            run.tick().unwrap();
        }
    }

    #[test]
    fn test_winner_by_score() {
        let config = ConsensusConfig {
            stake_rounds: 1,
            revision_cycles: 0,
            ..Default::default()
        };
        let mut run = orchestrator(3, config);
        propose_all(&mut run, 3);
        assert_eq!(run.phase(), Phase::Stake(1));
        run.stake_add(&cred(1), "PA2@v1", 30).unwrap();
        run.stake_add(&cred(3), "PA2@v1", 10).unwrap();
        run_to_finalize(&mut run, 3);

        let outcome = run.outcome().unwrap();
        assert_eq!(outcome.winner.as_deref(), Some("PA2@v1"));
        assert_eq!(outcome.winner_author.as_deref(), Some("A2"));
        // Every stake was burned
        assert!(run.credits().stakes().active().next().is_none());
        assert!(run.ledger().is_sealed());
    }

    #[test]
    fn test_tie_break_earliest_last_stake_tick() {
        let config = ConsensusConfig {
            stake_rounds: 1,
            revision_cycles: 0,
            max_think_ticks: 5,
            ..Default::default()
        };
        let mut run = orchestrator(4, config);
        propose_all(&mut run, 4);
        assert_eq!(run.phase(), Phase::Stake(1));

        // Same amount, same round, different ticks: identical conviction,
        // so PA1 and PA2 tie on score while PA2's stake lands later.
        run.stake_add(&cred(3), "PA1@v1", 20).unwrap();
        run.tick().unwrap();
        assert_eq!(run.phase(), Phase::Stake(1), "round must still be open");
        run.stake_add(&cred(4), "PA2@v1", 20).unwrap();
        run_to_finalize(&mut run, 4);

        let outcome = run.outcome().unwrap();
        let pa1 = outcome
            .rankings
            .iter()
            .find(|r| r.proposal == "PA1@v1")
            .unwrap();
        let pa2 = outcome
            .rankings
            .iter()
            .find(|r| r.proposal == "PA2@v1")
            .unwrap();
        assert_eq!(pa1.score, pa2.score, "scores must tie exactly");
        assert!(pa1.last_stake_tick.unwrap() < pa2.last_stake_tick.unwrap());
        // Earliest LastStakeTick wins the tie
        assert_eq!(outcome.winner.as_deref(), Some("PA1@v1"));
    }

    #[test]
    fn test_residual_tie_falls_to_proposal_id() {
        let config = ConsensusConfig {
            stake_rounds: 1,
            revision_cycles: 0,
            ..Default::default()
        };
        let mut run = orchestrator(2, config);
        propose_all(&mut run, 2);
        run_to_finalize(&mut run, 2);

        // Both lines carry only their self-stakes from the same tick:
        // identical scores, identical LastStakeTick.
        let outcome = run.outcome().unwrap();
        assert_eq!(outcome.rankings[0].score, outcome.rankings[1].score);
        assert_eq!(
            outcome.rankings[0].last_stake_tick,
            outcome.rankings[1].last_stake_tick
        );
        assert_eq!(outcome.winner.as_deref(), Some("PA1@v1"));
    }

    #[test]
    fn test_finalize_emits_influence_for_supporters() {
        let config = ConsensusConfig {
            stake_rounds: 1,
            revision_cycles: 0,
            ..Default::default()
        };
        let mut run = orchestrator(3, config);
        propose_all(&mut run, 3);
        run.stake_add(&cred(1), "PA2@v1", 30).unwrap();
        run_to_finalize(&mut run, 3);

        let influence: Vec<_> = run
            .ledger()
            .events()
            .iter()
            .filter(|e| e.kind == EventKind::InfluenceRecorded)
            .collect();
        // A1 (voluntary) and A2 (self-stake) both contributed to PA2@v1
        assert_eq!(influence.len(), 2);
        assert_eq!(influence[0].agent.as_deref(), Some("A1"));
        assert_eq!(influence[1].agent.as_deref(), Some("A2"));
    }

    #[test]
    fn test_actions_after_finalize_rejected() {
        let config = ConsensusConfig {
            stake_rounds: 1,
            revision_cycles: 0,
            ..Default::default()
        };
        let mut run = orchestrator(2, config);
        run_to_finalize(&mut run, 2);
        let before = run.ledger().len();
        let result = run.signal_ready(&cred(1)).unwrap();
        assert_eq!(result, ActionResult::RejectedInvalidPhase);
        assert_eq!(run.ledger().len(), before);
        // Ticking after finalization is a stable no-op
        let report = run.tick().unwrap();
        assert!(report.finalized);
        assert_eq!(run.ledger().len(), before);
    }

    // =========================================================================
    // Universal invariants
    // =========================================================================

    fn assert_conservation(run: &Orchestrator) {
        let awards: u64 = run
            .ledger()
            .events()
            .iter()
            .filter(|e| e.kind == EventKind::CreditAward)
            .map(|e| e.payload["amount"].as_u64().unwrap())
            .sum();
        let burns: u64 = run
            .ledger()
            .events()
            .iter()
            .filter(|e| e.kind == EventKind::CreditBurn)
            .map(|e| e.payload["amount"].as_u64().unwrap())
            .sum();
        let balances: u64 = run.credits().balances().values().sum();
        let locked: u64 = run
            .credits()
            .stakes()
            .active()
            .map(|r| r.amount)
            .sum();
        assert_eq!(
            balances + locked + burns,
            awards,
            "CP conservation violated"
        );
    }

    #[test]
    fn test_cp_conservation_full_run() {
        let mut run = orchestrator(3, ConsensusConfig::default());
        propose_all(&mut run, 3);
        run.submit_feedback(&cred(1), "PA2@v1", "tighten the scope").unwrap();
        assert_conservation(&run);
        all_ready_tick(&mut run, 3);
        run.submit_revision(&cred(2), body("revised plan two")).unwrap();
        assert_conservation(&run);
        all_ready_tick(&mut run, 3);
        all_ready_tick(&mut run, 3);
        all_ready_tick(&mut run, 3);
        run.stake_add(&cred(1), "PA2@v2", 20).unwrap();
        assert_conservation(&run);
        while !run.is_finalized() {
            for i in 1..=3 {
                run.signal_ready(&cred(i)).unwrap();
            }
            run.tick().unwrap();
        }
        assert_conservation(&run);
    }

    #[test]
    fn test_ledger_seq_strictly_increasing() {
        let mut run = orchestrator(3, ConsensusConfig::default());
        propose_all(&mut run, 3);
        run_to_finalize(&mut run, 3);
        let seqs: Vec<_> = run.ledger().events().iter().map(|e| e.seq).collect();
        for pair in seqs.windows(2) {
            assert!(pair[1] == pair[0] + 1);
        }
    }

    #[test]
    fn test_signal_ready_idempotent() {
        let mut run = orchestrator(2, ConsensusConfig::default());
        run.submit_proposal(&cred(1), body("x")).unwrap();
        let before = run.ledger().len();
        assert!(run.signal_ready(&cred(1)).unwrap().is_ok());
        // Already ready from the proposal: no new event
        assert_eq!(run.ledger().len(), before);
    }

    // =========================================================================
    // Replay
    // =========================================================================

    #[test]
    fn test_replay_reproduces_ledger_byte_for_byte() {
        let config = ConsensusConfig {
            stake_rounds: 2,
            ..Default::default()
        };
        let mut run = orchestrator(3, config.clone());
        propose_all(&mut run, 3);
        run.submit_feedback(&cred(1), "PA2@v1", "needs detail").unwrap();
        all_ready_tick(&mut run, 3);
        run.submit_revision(&cred(2), body("sharper plan")).unwrap();
        all_ready_tick(&mut run, 3);
        all_ready_tick(&mut run, 3);
        all_ready_tick(&mut run, 3);
        run.stake_add(&cred(1), "PA2@v2", 25).unwrap();
        run.stake_add(&cred(3), "PA1@v1", 10).unwrap();
        while !run.is_finalized() {
            for i in 1..=3 {
                run.signal_ready(&cred(i)).unwrap();
            }
            run.tick().unwrap();
        }

        let replayed = Orchestrator::replay(
            config,
            Issue::new("ISS-1", "decide something"),
            roster(3),
            run.trace(),
        )
        .unwrap();
        assert_eq!(
            run.ledger().canonical_lines(),
            replayed.ledger().canonical_lines()
        );
        assert_eq!(
            run.outcome().unwrap().winner,
            replayed.outcome().unwrap().winner
        );
    }
}
