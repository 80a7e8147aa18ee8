//! Scenario generation: seeded agent pools and issues for simulation runs.
//!
//! Everything here is a pure function of the scenario seed, so a scenario
//! regenerated from its recorded parameters yields the identical roster and
//! credentials. That is what lets a saved run artifact be replayed.

use rand::prelude::*;
use rand::seq::index::sample;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use roundtable_kernel::{AgentProfile, Issue, Roster};

/// First names used for generated agent display names.
const NAMES: &[&str] = &[
    "Asta", "Bram", "Cleo", "Dara", "Edda", "Falk", "Gwen", "Hugo", "Iris", "Joss", "Kira",
    "Lior", "Mona", "Nils", "Orla", "Pax", "Quin", "Rhea", "Sem", "Tova", "Ugo", "Vera", "Wim",
    "Xena", "Yael", "Zeno",
];

/// Parameters describing one generated scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub agent_count: usize,
    pub seed: u64,
    /// Trailing agents that never act and always get kicked out.
    #[serde(default)]
    pub idlers: usize,
    #[serde(default = "default_issue_id")]
    pub issue_id: String,
}

fn default_issue_id() -> String {
    "ISS-1".to_string()
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            agent_count: 3,
            seed: 0,
            idlers: 0,
            issue_id: default_issue_id(),
        }
    }
}

/// A pool of candidate agents a scenario selects its roster from.
#[derive(Debug, Clone)]
pub struct AgentPool {
    profiles: Vec<AgentProfile>,
}

impl AgentPool {
    /// Generate a pool of `size` candidates from a seed.
    pub fn generate(size: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let profiles = (0..size)
            .map(|i| {
                let name = NAMES[i % NAMES.len()];
                let credential: String = (0..4)
                    .map(|_| format!("{:08x}", rng.next_u32()))
                    .collect();
                AgentProfile::new(
                    format!("A{}", i + 1),
                    format!("{} {}", name, i + 1),
                    credential,
                )
            })
            .collect();
        Self { profiles }
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn profiles(&self) -> &[AgentProfile] {
        &self.profiles
    }

    /// Select a random subset of the pool, seeded.
    pub fn select_random(&self, count: usize, seed: u64) -> Vec<AgentProfile> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let count = count.min(self.profiles.len());
        let mut picked: Vec<AgentProfile> = sample(&mut rng, self.profiles.len(), count)
            .into_iter()
            .map(|i| self.profiles[i].clone())
            .collect();
        // Roster order is identity order regardless of draw order
        picked.sort_by(|a, b| a.id.cmp(&b.id));
        picked
    }
}

/// A fully generated scenario: roster plus issue.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub config: ScenarioConfig,
    pub profiles: Vec<AgentProfile>,
    pub issue: Issue,
}

impl Scenario {
    /// Build the scenario deterministically from its parameters.
    pub fn generate(config: ScenarioConfig) -> Self {
        let pool = AgentPool::generate(config.agent_count.max(4) * 2, config.seed);
        let profiles = pool.select_random(config.agent_count, config.seed.wrapping_add(1));
        let issue = Issue::new(
            config.issue_id.clone(),
            "Allocate the remaining community budget for this cycle",
        )
        .with_background(
            "A fixed budget remains; the round table decides the single \
             allocation that will be carried out.",
        );
        Self {
            config,
            profiles,
            issue,
        }
    }

    pub fn roster(&self) -> anyhow::Result<Roster> {
        Ok(Roster::new(self.profiles.clone())?)
    }
}
