//! The credit manager: sole authority over CP balances and stake custody.
//!
//! Every CP movement (award, burn, lock, unlock) happens here and emits a
//! ledger event in the same call. Other components read balances through the
//! manager and never mutate them.

use std::collections::BTreeMap;

use serde_json::json;

use crate::agent::AgentId;
use crate::config::ConsensusConfig;
use crate::error::FatalError;
use crate::event::{EventKind, Ledger, Tick};
use crate::stake::{ConvictionCurve, StakeBook, StakeKind, StakeStatus};

/// Reason string recorded on stake burns at finalization.
pub const REASON_STAKE_BURN: &str = "stake_burn";
/// Reason string recorded on automatic self-stake taps during REVISE.
pub const REASON_AUTO_TAP: &str = "auto_tap";

/// CP balances plus stake custody for one run.
#[derive(Debug)]
pub struct CreditManager {
    balances: BTreeMap<AgentId, u64>,
    stakes: StakeBook,
    curve: ConvictionCurve,
    maximum_credit: Option<u64>,
    issue: String,
}

impl CreditManager {
    pub fn new(config: &ConsensusConfig, issue: &str) -> Self {
        Self {
            balances: BTreeMap::new(),
            stakes: StakeBook::new(),
            curve: ConvictionCurve::from_config(config),
            maximum_credit: config.maximum_credit,
            issue: issue.to_string(),
        }
    }

    /// Liquid balance of an agent.
    pub fn balance(&self, agent: &str) -> u64 {
        self.balances.get(agent).copied().unwrap_or(0)
    }

    /// CP locked into proposals on the agent's behalf.
    pub fn locked(&self, agent: &str) -> u64 {
        self.stakes.locked_of(agent)
    }

    /// All balances, in UID order.
    pub fn balances(&self) -> &BTreeMap<AgentId, u64> {
        &self.balances
    }

    /// Read access to the stake registry.
    pub fn stakes(&self) -> &StakeBook {
        &self.stakes
    }

    pub fn curve(&self) -> &ConvictionCurve {
        &self.curve
    }

    /// Add CP to a balance. Refused (with an `award_rejected` event) if the
    /// result would exceed `MaximumCredit`.
    pub fn award(
        &mut self,
        ledger: &mut Ledger,
        tick: Tick,
        phase: &str,
        agent: &str,
        amount: u64,
        reason: &str,
    ) -> Result<bool, FatalError> {
        let balance = self.balance(agent);
        if let Some(max) = self.maximum_credit {
            if balance + amount > max {
                ledger.append(
                    tick,
                    phase,
                    Some(agent),
                    EventKind::AwardRejected,
                    format!(
                        "Award refused: {} +{} CP would exceed maximum {}",
                        agent, amount, max
                    ),
                    json!({ "amount": amount, "balance": balance, "maximum": max, "reason": reason }),
                )?;
                return Ok(false);
            }
        }
        self.balances.insert(agent.to_string(), balance + amount);
        ledger.append(
            tick,
            phase,
            Some(agent),
            EventKind::CreditAward,
            format!("Credit awarded: {} +{} CP ({})", agent, amount, reason),
            json!({ "amount": amount, "new_balance": balance + amount, "reason": reason }),
        )?;
        Ok(true)
    }

    /// Atomically deduct-and-burn, or log `insufficient_credit` and return
    /// false without touching state.
    pub fn attempt_deduct(
        &mut self,
        ledger: &mut Ledger,
        tick: Tick,
        phase: &str,
        agent: &str,
        amount: u64,
        reason: &str,
    ) -> Result<bool, FatalError> {
        let balance = self.balance(agent);
        if balance < amount {
            ledger.append(
                tick,
                phase,
                Some(agent),
                EventKind::InsufficientCredit,
                format!(
                    "Insufficient credit: {} attempted {} CP but has {} CP ({})",
                    agent, amount, balance, reason
                ),
                json!({ "amount": amount, "balance": balance, "reason": reason }),
            )?;
            return Ok(false);
        }
        self.balances.insert(agent.to_string(), balance - amount);
        ledger.append(
            tick,
            phase,
            Some(agent),
            EventKind::CreditBurn,
            format!("Credit burned: {} -{} CP ({})", agent, amount, reason),
            json!({ "amount": amount, "new_balance": balance - amount, "reason": reason }),
        )?;
        Ok(true)
    }

    /// Lock CP from the agent's balance into a stake on a proposal.
    ///
    /// Returns the new stake ID, or `None` (after logging
    /// `insufficient_credit`) if the balance cannot cover the amount.
    pub fn stake_to_proposal(
        &mut self,
        ledger: &mut Ledger,
        tick: Tick,
        phase: &str,
        agent: &str,
        proposal: &str,
        amount: u64,
        kind: StakeKind,
    ) -> Result<Option<String>, FatalError> {
        let balance = self.balance(agent);
        if balance < amount {
            ledger.append(
                tick,
                phase,
                Some(agent),
                EventKind::InsufficientCredit,
                format!(
                    "Insufficient credit: {} cannot stake {} CP on {} (has {})",
                    agent, amount, proposal, balance
                ),
                json!({ "amount": amount, "balance": balance, "proposal": proposal, "reason": "stake" }),
            )?;
            return Ok(None);
        }
        self.balances.insert(agent.to_string(), balance - amount);
        let stake_id = self
            .stakes
            .add(&self.issue, agent, proposal, amount, kind, tick);
        ledger.append(
            tick,
            phase,
            Some(agent),
            EventKind::StakeRecorded,
            format!("Staked {} CP from {} to proposal {}", amount, agent, proposal),
            json!({ "stake_id": stake_id, "proposal": proposal, "amount": amount, "kind": kind }),
        )?;
        Ok(Some(stake_id))
    }

    /// Reassign all active stakes from an archived version to its successor,
    /// preserving conviction counters. Returns the moved stake IDs; the
    /// caller folds them into its `revision_recorded` payload.
    pub fn transfer_stake(&mut self, old_proposal: &str, new_proposal: &str) -> Vec<String> {
        self.stakes.retarget(old_proposal, new_proposal)
    }

    /// Move a validated voluntary stake to a new target. Resets the
    /// conviction counter and re-stamps the origin tick.
    pub fn switch_voluntary(
        &mut self,
        ledger: &mut Ledger,
        tick: Tick,
        phase: &str,
        stake_id: &str,
        new_proposal: &str,
    ) -> Result<(), FatalError> {
        let (agent, from, amount, previous_rounds) = {
            let record = self
                .stakes
                .get(stake_id)
                .expect("switch_voluntary called on validated stake");
            (
                record.agent.clone(),
                record.proposal.clone(),
                record.amount,
                record.rounds_held,
            )
        };
        self.stakes.switch(stake_id, new_proposal, tick);
        ledger.append(
            tick,
            phase,
            Some(&agent),
            EventKind::StakeSwitched,
            format!(
                "Stake switched: {} moved {} CP from {} to {}",
                agent, amount, from, new_proposal
            ),
            json!({ "stake_id": stake_id, "from": from, "to": new_proposal, "amount": amount }),
        )?;
        ledger.append(
            tick,
            phase,
            Some(&agent),
            EventKind::ConvictionSwitched,
            format!(
                "Conviction reset for stake {}: {} rounds dropped on switch",
                stake_id, previous_rounds
            ),
            json!({
                "stake_id": stake_id,
                "from": from,
                "to": new_proposal,
                "previous_rounds": previous_rounds
            }),
        )?;
        Ok(())
    }

    /// Return a validated voluntary stake to the agent's balance.
    pub fn withdraw_voluntary(
        &mut self,
        ledger: &mut Ledger,
        tick: Tick,
        phase: &str,
        stake_id: &str,
        reason: &str,
    ) -> Result<u64, FatalError> {
        let (agent, proposal, amount) = {
            let record = self
                .stakes
                .get_mut(stake_id)
                .expect("withdraw_voluntary called on validated stake");
            record.status = StakeStatus::Withdrawn;
            (record.agent.clone(), record.proposal.clone(), record.amount)
        };
        let balance = self.balance(&agent) + amount;
        self.balances.insert(agent.clone(), balance);
        ledger.append(
            tick,
            phase,
            Some(&agent),
            EventKind::StakeWithdrawn,
            format!(
                "Stake withdrawn: {} recovered {} CP from {} ({})",
                agent, amount, proposal, reason
            ),
            json!({ "stake_id": stake_id, "proposal": proposal, "amount": amount, "reason": reason }),
        )?;
        Ok(amount)
    }

    /// REVISE-only liquidity tap: if the agent's balance cannot cover
    /// `needed`, un-stake the minimum from their mandatory self-stake on
    /// `own_proposal` to close the gap.
    ///
    /// All-or-nothing: when even the full self-stake cannot cover the
    /// deficit, nothing moves and `false` is returned.
    pub fn auto_stake_tap(
        &mut self,
        ledger: &mut Ledger,
        tick: Tick,
        phase: &str,
        agent: &str,
        own_proposal: &str,
        needed: u64,
    ) -> Result<bool, FatalError> {
        let liquid = self.balance(agent);
        if liquid >= needed {
            return Ok(true);
        }
        let deficit = needed - liquid;
        let (stake_id, available) = match self.stakes.mandatory_of_on(agent, own_proposal) {
            Some(record) => (record.id.clone(), record.amount),
            None => return Ok(false),
        };
        if available < deficit {
            return Ok(false);
        }

        {
            let record = self
                .stakes
                .get_mut(&stake_id)
                .expect("tapped stake exists");
            record.amount -= deficit;
            if record.amount == 0 {
                record.status = StakeStatus::Withdrawn;
            }
        }
        self.balances.insert(agent.to_string(), liquid + deficit);
        ledger.append(
            tick,
            phase,
            Some(agent),
            EventKind::StakeWithdrawn,
            format!(
                "Auto-tap: {} recovered {} CP of self-stake from {}",
                agent, deficit, own_proposal
            ),
            json!({
                "stake_id": stake_id,
                "proposal": own_proposal,
                "amount": deficit,
                "remaining_self_stake": available - deficit,
                "reason": REASON_AUTO_TAP
            }),
        )?;
        Ok(true)
    }

    /// End-of-round conviction sweep; emits one `conviction_updated` per
    /// accruing stake.
    pub fn advance_round(
        &mut self,
        ledger: &mut Ledger,
        tick: Tick,
        phase: &str,
    ) -> Result<(), FatalError> {
        let updates = self.stakes.advance_round(&self.curve);
        for u in updates {
            ledger.append(
                tick,
                phase,
                Some(&u.agent),
                EventKind::ConvictionUpdated,
                format!(
                    "Conviction update: stake {} on {} held {} rounds (x{:.4})",
                    u.stake_id, u.proposal, u.rounds_held, u.multiplier
                ),
                json!({
                    "stake_id": u.stake_id,
                    "proposal": u.proposal,
                    "amount": u.amount,
                    "rounds_held": u.rounds_held,
                    "multiplier": u.multiplier
                }),
            )?;
        }
        Ok(())
    }

    /// FINALIZE: destroy every active stake. Each produces a `credit_burn`
    /// with reason `stake_burn`; balances are untouched (the CP was locked).
    pub fn burn_all_stakes(
        &mut self,
        ledger: &mut Ledger,
        tick: Tick,
        phase: &str,
    ) -> Result<(), FatalError> {
        let ids: Vec<String> = self.stakes.active().map(|r| r.id.clone()).collect();
        for id in ids {
            let (agent, proposal, amount) = {
                let record = self.stakes.get_mut(&id).expect("active stake exists");
                record.status = StakeStatus::Burned;
                (record.agent.clone(), record.proposal.clone(), record.amount)
            };
            ledger.append(
                tick,
                phase,
                Some(&agent),
                EventKind::CreditBurn,
                format!(
                    "Stake burned at finalization: {} -{} CP on {}",
                    agent, amount, proposal
                ),
                json!({ "stake_id": id, "proposal": proposal, "amount": amount, "reason": REASON_STAKE_BURN }),
            )?;
        }
        Ok(())
    }
}
