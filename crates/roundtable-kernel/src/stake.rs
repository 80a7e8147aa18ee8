//! Atomic stake records and the conviction engine.
//!
//! Every stake is an independent record: moving or withdrawing one resets
//! only that record's consecutive-rounds counter. Conviction grows along an
//! exponential approach to saturation and multiplies the staked amount into
//! an effective weight; a proposal's score is the square root of the summed
//! weights of its active stakes.

use mti::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentId;
use crate::config::ConsensusConfig;
use crate::event::Tick;
use crate::proposal::ProposalId;

/// Namespace UUID for deterministic stake identifiers.
const STAKE_NAMESPACE: Uuid = Uuid::from_bytes([
    0x2f, 0x1c, 0x60, 0xe4, 0x5a, 0x0b, 0x4f, 0x27, 0x9a, 0x83, 0x1d, 0x6e, 0xb2, 0x94, 0x7c, 0x05,
]);

/// Create a deterministic stake ID from the issue and a per-run counter.
///
/// Uses a v5 UUID so the ID is a pure function of its inputs: replays mint
/// identical identifiers.
fn create_stake_mti(issue: &str, counter: u64) -> String {
    let name = format!("{}:stake:{}", issue, counter);
    let v5_uuid = Uuid::new_v5(&STAKE_NAMESPACE, name.as_bytes());
    let prefix = TypeIdPrefix::try_from("stake").expect("stake is a valid prefix");
    let suffix = TypeIdSuffix::from(v5_uuid);
    MagicTypeId::new(prefix, suffix).to_string()
}

/// Whether a stake was forced at proposal submission or placed voluntarily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakeKind {
    /// Locked at submission; never withdrawn by the agent, but retargeted to
    /// the author's newer version on revision (and tapped during REVISE).
    MandatorySelf,
    /// Placed during STAKE rounds; may be added, switched, or withdrawn.
    Voluntary,
}

/// Lifecycle state of a stake record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakeStatus {
    Active,
    Withdrawn,
    Burned,
}

/// One atomic stake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakeRecord {
    pub id: String,
    pub agent: AgentId,
    /// Always the active version of the target author's line at placement.
    pub proposal: ProposalId,
    pub amount: u64,
    /// Tick the stake landed on its current target; re-stamped on switch.
    pub origin_tick: Tick,
    /// Consecutive STAKE rounds held without movement, capped at saturation.
    pub rounds_held: u32,
    pub kind: StakeKind,
    pub status: StakeStatus,
    /// Set on switch; cleared by `advance_round` so a moved stake does not
    /// accrue conviction for the round it moved in.
    #[serde(skip)]
    moved_this_round: bool,
}

impl StakeRecord {
    pub fn is_active(&self) -> bool {
        self.status == StakeStatus::Active
    }

    pub fn is_mandatory(&self) -> bool {
        self.kind == StakeKind::MandatorySelf
    }
}

/// The conviction multiplier curve.
///
/// `mult(r) = 1 + (max − 1) · (1 − e^(−k·r))` with
/// `k = −ln(1 − target_fraction) / saturation_rounds`, so a stake held for
/// `saturation_rounds` rounds reaches `target_fraction` of the way to the
/// maximum multiplier. Pure function of `r` and configuration.
#[derive(Debug, Clone, Copy)]
pub struct ConvictionCurve {
    k: f64,
    max_multiplier: f64,
    saturation_rounds: u32,
}

impl ConvictionCurve {
    pub fn from_config(config: &ConsensusConfig) -> Self {
        let k = -(1.0 - config.conviction_target_fraction).ln()
            / config.conviction_saturation_rounds as f64;
        Self {
            k,
            max_multiplier: config.max_conviction_multiplier,
            saturation_rounds: config.conviction_saturation_rounds,
        }
    }

    /// Multiplier for a stake held `rounds` consecutive rounds.
    pub fn multiplier(&self, rounds: u32) -> f64 {
        1.0 + (self.max_multiplier - 1.0) * (1.0 - (-self.k * rounds as f64).exp())
    }

    /// Counter cap: holding longer than this accrues nothing further.
    pub fn saturation_rounds(&self) -> u32 {
        self.saturation_rounds
    }

    /// Effective weight contributed by a record.
    pub fn effective_weight(&self, record: &StakeRecord) -> f64 {
        record.amount as f64 * self.multiplier(record.rounds_held)
    }
}

/// Summary of one record's counter update from `advance_round`.
#[derive(Debug, Clone)]
pub struct ConvictionUpdate {
    pub stake_id: String,
    pub agent: AgentId,
    pub proposal: ProposalId,
    pub amount: u64,
    pub rounds_held: u32,
    pub multiplier: f64,
}

/// The stake registry: every record ever created, in placement order.
///
/// Withdrawn and burned records stay in the book for audit; all derived
/// quantities (custody, weights, scores) read active records only.
#[derive(Debug, Default)]
pub struct StakeBook {
    records: Vec<StakeRecord>,
    counter: u64,
}

impl StakeBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new stake and return its ID.
    pub fn add(
        &mut self,
        issue: &str,
        agent: &str,
        proposal: &str,
        amount: u64,
        kind: StakeKind,
        tick: Tick,
    ) -> String {
        self.counter += 1;
        let id = create_stake_mti(issue, self.counter);
        self.records.push(StakeRecord {
            id: id.clone(),
            agent: agent.to_string(),
            proposal: proposal.to_string(),
            amount,
            origin_tick: tick,
            rounds_held: 0,
            kind,
            status: StakeStatus::Active,
            moved_this_round: false,
        });
        id
    }

    pub fn get(&self, id: &str) -> Option<&StakeRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut StakeRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    /// Active records in placement order.
    pub fn active(&self) -> impl Iterator<Item = &StakeRecord> {
        self.records.iter().filter(|r| r.is_active())
    }

    /// All records, including withdrawn and burned ones.
    pub fn all(&self) -> &[StakeRecord] {
        &self.records
    }

    /// Active records targeting a proposal.
    pub fn active_on<'a>(
        &'a self,
        proposal: &str,
    ) -> impl Iterator<Item = &'a StakeRecord> + 'a {
        let proposal = proposal.to_string();
        self.active().filter(move |r| r.proposal == proposal)
    }

    /// Active records owned by an agent.
    pub fn active_of_agent<'a>(
        &'a self,
        agent: &str,
    ) -> impl Iterator<Item = &'a StakeRecord> + 'a {
        let agent = agent.to_string();
        self.active().filter(move |r| r.agent == agent)
    }

    /// CP held in custody on behalf of an agent.
    pub fn locked_of(&self, agent: &str) -> u64 {
        self.active_of_agent(agent).map(|r| r.amount).sum()
    }

    /// The agent's active mandatory self-stake on a proposal, if any.
    pub fn mandatory_of_on<'a>(&'a self, agent: &str, proposal: &str) -> Option<&'a StakeRecord> {
        self.active_on(proposal)
            .find(|r| r.agent == agent && r.is_mandatory())
    }

    /// Retarget every active record from one proposal version to its
    /// successor, preserving counters and origin ticks. Used on revision.
    pub fn retarget(&mut self, old_proposal: &str, new_proposal: &str) -> Vec<String> {
        let mut moved = Vec::new();
        for record in &mut self.records {
            if record.is_active() && record.proposal == old_proposal {
                record.proposal = new_proposal.to_string();
                moved.push(record.id.clone());
            }
        }
        moved
    }

    /// Move a voluntary stake to a new target: counter resets to zero and
    /// the origin tick is re-stamped. The caller validates kind and status.
    pub(crate) fn switch(&mut self, id: &str, new_proposal: &str, tick: Tick) -> Option<u32> {
        let record = self.get_mut(id)?;
        let previous_rounds = record.rounds_held;
        record.proposal = new_proposal.to_string();
        record.origin_tick = tick;
        record.rounds_held = 0;
        record.moved_this_round = true;
        Some(previous_rounds)
    }

    /// End-of-round counter sweep: every active record that did not move
    /// this round accrues one round of conviction, capped at saturation.
    pub fn advance_round(&mut self, curve: &ConvictionCurve) -> Vec<ConvictionUpdate> {
        let mut updates = Vec::new();
        for record in &mut self.records {
            if !record.is_active() {
                continue;
            }
            if record.moved_this_round {
                record.moved_this_round = false;
                continue;
            }
            record.rounds_held = (record.rounds_held + 1).min(curve.saturation_rounds());
            updates.push(ConvictionUpdate {
                stake_id: record.id.clone(),
                agent: record.agent.clone(),
                proposal: record.proposal.clone(),
                amount: record.amount,
                rounds_held: record.rounds_held,
                multiplier: curve.multiplier(record.rounds_held),
            });
        }
        updates
    }

    /// Conviction-weighted score: `√(Σ effective_weight)` over the
    /// proposal's active stakes.
    pub fn score(&self, proposal: &str, curve: &ConvictionCurve) -> f64 {
        self.active_on(proposal)
            .map(|r| curve.effective_weight(r))
            .sum::<f64>()
            .sqrt()
    }

    /// Latest tick any stake landed on the proposal (add or switch).
    /// Drives the finalization tie-break.
    pub fn last_stake_tick(&self, proposal: &str) -> Option<Tick> {
        self.active_on(proposal).map(|r| r.origin_tick).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve() -> ConvictionCurve {
        ConvictionCurve::from_config(&ConsensusConfig::default())
    }

    // =========================================================================
    // Conviction curve
    // =========================================================================

    #[test]
    fn test_multiplier_at_zero_rounds_is_one() {
        assert!((curve().multiplier(0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_multiplier_reaches_target_fraction_at_saturation() {
        // Defaults: max 2.0, target 0.98, saturation 5.
        // mult(5) = 1 + 1.0 * 0.98 = 1.98 exactly.
        assert!((curve().multiplier(5) - 1.98).abs() < 1e-9);
    }

    #[test]
    fn test_multiplier_monotone() {
        let c = curve();
        for r in 0..10 {
            assert!(c.multiplier(r + 1) > c.multiplier(r));
        }
    }

    #[test]
    fn test_multiplier_bounded_by_max() {
        let c = curve();
        for r in 0..100 {
            assert!(c.multiplier(r) < 2.0);
        }
    }

    #[test]
    fn test_known_curve_points() {
        // k = ln(50)/5; mult(3) = 1 + (1 - 50^(-3/5))
        let c = curve();
        let k = (50.0_f64).ln() / 5.0;
        let expected = 1.0 + (1.0 - (-k * 3.0).exp());
        assert!((c.multiplier(3) - expected).abs() < 1e-12);
        assert!((c.multiplier(3) - 1.9044).abs() < 1e-3);
    }

    // =========================================================================
    // Record lifecycle
    // =========================================================================

    #[test]
    fn test_stake_ids_deterministic() {
        let mut a = StakeBook::new();
        let mut b = StakeBook::new();
        let id_a = a.add("ISS-1", "A1", "PA2@v1", 20, StakeKind::Voluntary, 5);
        let id_b = b.add("ISS-1", "A1", "PA2@v1", 20, StakeKind::Voluntary, 5);
        assert_eq!(id_a, id_b);
        assert!(id_a.starts_with("stake_"));
    }

    #[test]
    fn test_independent_records_same_agent_same_proposal() {
        let mut book = StakeBook::new();
        let first = book.add("ISS-1", "A1", "PA2@v1", 10, StakeKind::Voluntary, 1);
        book.advance_round(&curve());
        let second = book.add("ISS-1", "A1", "PA2@v1", 10, StakeKind::Voluntary, 2);
        book.advance_round(&curve());

        // Same agent, same proposal, distinct counters
        assert_eq!(book.get(&first).unwrap().rounds_held, 2);
        assert_eq!(book.get(&second).unwrap().rounds_held, 1);
    }

    #[test]
    fn test_switch_resets_counter_and_restamps_origin() {
        let mut book = StakeBook::new();
        let id = book.add("ISS-1", "A1", "PA2@v1", 30, StakeKind::Voluntary, 1);
        for _ in 0..3 {
            book.advance_round(&curve());
        }
        assert_eq!(book.get(&id).unwrap().rounds_held, 3);

        let previous = book.switch(&id, "PA3@v1", 9).unwrap();
        assert_eq!(previous, 3);
        let record = book.get(&id).unwrap();
        assert_eq!(record.rounds_held, 0);
        assert_eq!(record.origin_tick, 9);
        assert_eq!(record.proposal, "PA3@v1");
    }

    #[test]
    fn test_switched_stake_skips_increment_that_round() {
        let mut book = StakeBook::new();
        let id = book.add("ISS-1", "A1", "PA2@v1", 30, StakeKind::Voluntary, 1);
        book.switch(&id, "PA3@v1", 2);
        book.advance_round(&curve());
        // Moved this round: no accrual at the round boundary it moved in
        assert_eq!(book.get(&id).unwrap().rounds_held, 0);
        book.advance_round(&curve());
        assert_eq!(book.get(&id).unwrap().rounds_held, 1);
    }

    #[test]
    fn test_counter_caps_at_saturation() {
        let mut book = StakeBook::new();
        let id = book.add("ISS-1", "A1", "PA2@v1", 30, StakeKind::Voluntary, 1);
        for _ in 0..12 {
            book.advance_round(&curve());
        }
        assert_eq!(book.get(&id).unwrap().rounds_held, 5);
    }

    #[test]
    fn test_retarget_preserves_counter() {
        let mut book = StakeBook::new();
        let id = book.add("ISS-1", "A1", "PA1@v1", 50, StakeKind::MandatorySelf, 1);
        book.advance_round(&curve());
        let moved = book.retarget("PA1@v1", "PA1@v2");
        assert_eq!(moved, vec![id.clone()]);
        let record = book.get(&id).unwrap();
        assert_eq!(record.proposal, "PA1@v2");
        assert_eq!(record.rounds_held, 1);
        assert_eq!(record.origin_tick, 1);
    }

    // =========================================================================
    // Scores and custody
    // =========================================================================

    #[test]
    fn test_score_is_sqrt_of_weight_sum() {
        let mut book = StakeBook::new();
        book.add("ISS-1", "A1", "PA2@v1", 49, StakeKind::Voluntary, 1);
        // r = 0, mult = 1: score = sqrt(49) = 7
        assert!((book.score("PA2@v1", &curve()) - 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_score_empty_proposal_is_zero() {
        let book = StakeBook::new();
        assert_eq!(book.score("PA9@v1", &curve()), 0.0);
    }

    #[test]
    fn test_locked_sums_active_only() {
        let mut book = StakeBook::new();
        let id = book.add("ISS-1", "A1", "PA2@v1", 20, StakeKind::Voluntary, 1);
        book.add("ISS-1", "A1", "PA3@v1", 15, StakeKind::Voluntary, 1);
        assert_eq!(book.locked_of("A1"), 35);
        book.get_mut(&id).unwrap().status = StakeStatus::Withdrawn;
        assert_eq!(book.locked_of("A1"), 15);
    }

    #[test]
    fn test_last_stake_tick_tracks_max_origin() {
        let mut book = StakeBook::new();
        book.add("ISS-1", "A1", "PX@v1", 10, StakeKind::Voluntary, 41);
        let id = book.add("ISS-1", "A2", "PX@v1", 10, StakeKind::Voluntary, 30);
        assert_eq!(book.last_stake_tick("PX@v1"), Some(41));
        book.switch(&id, "PY@v1", 42);
        book.switch(&id, "PX@v1", 44);
        assert_eq!(book.last_stake_tick("PX@v1"), Some(44));
    }
}
