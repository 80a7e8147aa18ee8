//! The append-only ledger: sequence-numbered events, the sole durable record
//! of state changes.
//!
//! Every mutation in the system funnels through [`Ledger::append`], which
//! assigns the next sequence number. Events are immutable once appended and
//! the ledger refuses appends after it is sealed at finalization. Payloads
//! are `serde_json` values; the default `serde_json::Map` is sorted by key,
//! so serialized events are canonical and replay comparison is byte-exact.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::error::FatalError;

/// Logical time step. The tick is the only clock the protocol knows.
pub type Tick = u64;

/// Ledger sequence number: unique, strictly increasing, starting at 1.
pub type Seq = u64;

/// Event type tags recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CreditAward,
    CreditBurn,
    AwardRejected,
    StakeRecorded,
    StakeSwitched,
    StakeWithdrawn,
    ConvictionUpdated,
    ConvictionSwitched,
    ProposalAccepted,
    ProposalRejected,
    RevisionRecorded,
    RevisionRejected,
    FeedbackRecorded,
    FeedbackRejected,
    StakeRejected,
    InsufficientCredit,
    AgentReady,
    PhaseTransition,
    PhaseTimeout,
    InfluenceRecorded,
    Finalize,
}

impl EventKind {
    /// The snake_case tag as stored in serialized events.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CreditAward => "credit_award",
            EventKind::CreditBurn => "credit_burn",
            EventKind::AwardRejected => "award_rejected",
            EventKind::StakeRecorded => "stake_recorded",
            EventKind::StakeSwitched => "stake_switched",
            EventKind::StakeWithdrawn => "stake_withdrawn",
            EventKind::ConvictionUpdated => "conviction_updated",
            EventKind::ConvictionSwitched => "conviction_switched",
            EventKind::ProposalAccepted => "proposal_accepted",
            EventKind::ProposalRejected => "proposal_rejected",
            EventKind::RevisionRecorded => "revision_recorded",
            EventKind::RevisionRejected => "revision_rejected",
            EventKind::FeedbackRecorded => "feedback_recorded",
            EventKind::FeedbackRejected => "feedback_rejected",
            EventKind::StakeRejected => "stake_rejected",
            EventKind::InsufficientCredit => "insufficient_credit",
            EventKind::AgentReady => "agent_ready",
            EventKind::PhaseTransition => "phase_transition",
            EventKind::PhaseTimeout => "phase_timeout",
            EventKind::InfluenceRecorded => "influence_recorded",
            EventKind::Finalize => "finalize",
        }
    }

    /// Whether this kind is a stake movement subject to blind-staking
    /// visibility during STAKE rounds.
    pub fn is_stake_movement(&self) -> bool {
        matches!(
            self,
            EventKind::StakeRecorded
                | EventKind::StakeSwitched
                | EventKind::StakeWithdrawn
                | EventKind::ConvictionSwitched
        )
    }
}

/// One immutable ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub seq: Seq,
    pub tick: Tick,
    /// Phase label at commit time, e.g. `PROPOSE`, `STAKE_2`.
    pub phase: String,
    /// Acting agent, or `None` for system events.
    pub agent: Option<String>,
    pub kind: EventKind,
    /// Human-readable description; never parsed.
    pub message: String,
    /// Structured payload with sorted keys.
    pub payload: Value,
}

/// Append-only, single-writer event log.
#[derive(Debug, Default)]
pub struct Ledger {
    events: Vec<LedgerEvent>,
    sealed: bool,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, assigning the next sequence number.
    ///
    /// Fails with [`FatalError::LedgerSealed`] after the issue finalized; a
    /// caller hitting that case is a protocol bug and must abort the run.
    pub fn append(
        &mut self,
        tick: Tick,
        phase: &str,
        agent: Option<&str>,
        kind: EventKind,
        message: impl Into<String>,
        payload: Value,
    ) -> Result<Seq, FatalError> {
        if self.sealed {
            return Err(FatalError::LedgerSealed);
        }
        let seq = self.events.len() as Seq + 1;
        let message = message.into();
        trace!(seq, tick, phase, kind = kind.as_str(), "{}", message);
        self.events.push(LedgerEvent {
            seq,
            tick,
            phase: phase.to_string(),
            agent: agent.map(str::to_string),
            kind,
            message,
            payload,
        });
        Ok(seq)
    }

    /// Seal the ledger; called once after the `finalize` event is recorded.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// All events in commit order.
    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    /// Events with `from_seq <= seq < to_seq`.
    pub fn range(&self, from_seq: Seq, to_seq: Seq) -> &[LedgerEvent] {
        let lo = from_seq.saturating_sub(1).min(self.events.len() as Seq) as usize;
        let hi = to_seq.saturating_sub(1).min(self.events.len() as Seq) as usize;
        &self.events[lo..hi.max(lo)]
    }

    /// Canonical one-line-per-event serialization, used for byte-identical
    /// replay comparison and for streaming the ledger out of the process.
    pub fn canonical_lines(&self) -> Vec<String> {
        self.events
            .iter()
            .map(|e| serde_json::to_string(e).expect("ledger events always serialize"))
            .collect()
    }
}
