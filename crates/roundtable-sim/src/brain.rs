//! Scripted agent brains: deterministic decision policies for simulation.
//!
//! A brain never touches protocol state. It reads the agent's `StateView`
//! (already blind-staking filtered by the kernel) and emits the actions the
//! runner will submit under the agent's credential. All choices flow from a
//! per-agent seeded RNG, so a rerun with the same scenario seed produces the
//! same action stream.

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use roundtable_kernel::{AgentAction, ProposalBody, StateView};

/// Word bank for generated proposal bodies and revisions.
const WORDS: &[&str] = &[
    "repave", "the", "harbor", "road", "fund", "library", "annex", "extend", "market", "hours",
    "plant", "orchard", "repair", "north", "bridge", "upgrade", "water", "main", "open", "late",
    "clinic", "build", "storage", "shed", "survey", "coastline", "paths",
];

/// Decision policy for a scripted agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Authors a proposal, gives feedback, revises when criticized, holds
    /// its self-stake.
    Builder,
    /// Stands down to NoAction in PROPOSE and places a voluntary stake on
    /// another line in the first STAKE round.
    Supporter,
    /// Never acts; exercised by the kick-out path.
    Idler,
}

impl Policy {
    pub fn name(&self) -> &'static str {
        match self {
            Policy::Builder => "builder",
            Policy::Supporter => "supporter",
            Policy::Idler => "idler",
        }
    }
}

/// A deterministic scripted brain for one agent.
pub struct ScriptedBrain {
    policy: Policy,
    rng: ChaCha8Rng,
    /// Phase label the brain last acted in; one decision burst per phase.
    acted_phase: Option<String>,
}

impl ScriptedBrain {
    pub fn new(policy: Policy, seed: u64) -> Self {
        Self {
            policy,
            rng: ChaCha8Rng::seed_from_u64(seed),
            acted_phase: None,
        }
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Decide the actions for the current view. Empty when the brain has
    /// nothing (more) to do this phase.
    pub fn act(&mut self, view: &StateView) -> Vec<AgentAction> {
        if self.policy == Policy::Idler || view.finalized {
            return Vec::new();
        }
        if self.acted_phase.as_deref() == Some(view.phase.as_str()) {
            return Vec::new();
        }
        self.acted_phase = Some(view.phase.clone());

        if view.phase == "PROPOSE" {
            return self.act_propose();
        }
        if view.phase.starts_with("FEEDBACK") {
            return self.act_feedback(view);
        }
        if view.phase.starts_with("REVISE") {
            return self.act_revise(view);
        }
        if view.phase.starts_with("STAKE") {
            return self.act_stake(view);
        }
        Vec::new()
    }

    fn act_propose(&mut self) -> Vec<AgentAction> {
        match self.policy {
            Policy::Builder => vec![AgentAction::SubmitProposal {
                body: self.random_body(),
            }],
            // Supporters stand down; the kernel assigns NoAction
            _ => vec![AgentAction::SignalReady],
        }
    }

    fn act_feedback(&mut self, view: &StateView) -> Vec<AgentAction> {
        let mut actions = Vec::new();
        if self.policy == Policy::Builder {
            if let Some(target) = self.pick_other_proposal(view) {
                actions.push(AgentAction::SubmitFeedback {
                    target,
                    body: format!(
                        "Consider the {} impact before committing",
                        WORDS[self.rng.random_range(0..WORDS.len())]
                    ),
                });
            }
        }
        actions.push(AgentAction::SignalReady);
        actions
    }

    fn act_revise(&mut self, view: &StateView) -> Vec<AgentAction> {
        if self.policy == Policy::Builder {
            let own = view.proposals.iter().find(|p| p.author == view.agent);
            if let Some(own) = own {
                let criticized = view.feedback.iter().any(|f| f.target == own.id);
                if criticized {
                    // Append a clause: a small, cheap delta
                    let mut body = own.body.clone();
                    body.rationale = format!(
                        "{} and {} {}",
                        body.rationale,
                        WORDS[self.rng.random_range(0..WORDS.len())],
                        WORDS[self.rng.random_range(0..WORDS.len())],
                    );
                    return vec![AgentAction::SubmitRevision { body }];
                }
            }
        }
        vec![AgentAction::SignalReady]
    }

    fn act_stake(&mut self, view: &StateView) -> Vec<AgentAction> {
        let mut actions = Vec::new();
        let first_round = view.phase == "STAKE_1";
        if first_round && self.policy == Policy::Supporter && view.balance >= 10 {
            if let Some(target) = self.pick_other_proposal(view) {
                let ceiling = view.balance.min(30);
                let amount = self.rng.random_range(10..=ceiling);
                actions.push(AgentAction::StakeAdd {
                    proposal: target,
                    amount,
                });
            }
        }
        actions.push(AgentAction::SignalReady);
        actions
    }

    fn random_body(&mut self) -> ProposalBody {
        let pick = |rng: &mut ChaCha8Rng, n: usize| -> String {
            (0..n)
                .map(|_| WORDS[rng.random_range(0..WORDS.len())])
                .collect::<Vec<_>>()
                .join(" ")
        };
        ProposalBody {
            title: pick(&mut self.rng, 3),
            action: pick(&mut self.rng, 6),
            rationale: pick(&mut self.rng, 8),
            ..Default::default()
        }
    }

    /// A random active proposal that is not the agent's own assignment.
    fn pick_other_proposal(&mut self, view: &StateView) -> Option<String> {
        let own: Vec<&str> = view
            .own_stakes
            .iter()
            .map(|s| s.proposal.as_str())
            .chain(
                view.proposals
                    .iter()
                    .filter(|p| p.author == view.agent)
                    .map(|p| p.id.as_str()),
            )
            .collect();
        let candidates: Vec<&str> = view
            .proposals
            .iter()
            .map(|p| p.id.as_str())
            .filter(|id| !own.contains(id))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let index = self.rng.random_range(0..candidates.len());
        Some(candidates[index].to_string())
    }
}
