//! Agent identity: profiles, credentials, and the roster for a run.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::FatalError;

/// Stable agent identifier (UID).
pub type AgentId = String;

/// An identified participant. The credential is an opaque secret presented
/// with every action; balances live in the credit manager, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: AgentId,
    pub display_name: String,
    /// Opaque secret binding actions to this identity.
    pub credential: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AgentProfile {
    pub fn new(id: impl Into<AgentId>, display_name: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            credential: credential.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// The set of agents enrolled in a run, with credential lookup.
///
/// Iteration is always in UID order so every sweep over agents (kick-out,
/// finalization) is deterministic.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    agents: BTreeMap<AgentId, AgentProfile>,
    credentials: HashMap<String, AgentId>,
}

impl Roster {
    /// Build a roster, rejecting duplicate UIDs or credentials.
    pub fn new(profiles: Vec<AgentProfile>) -> Result<Self, FatalError> {
        let mut agents = BTreeMap::new();
        let mut credentials = HashMap::new();
        for profile in profiles {
            if credentials
                .insert(profile.credential.clone(), profile.id.clone())
                .is_some()
            {
                return Err(FatalError::InvalidRoster(format!(
                    "duplicate credential for agent {}",
                    profile.id
                )));
            }
            if agents.insert(profile.id.clone(), profile).is_some() {
                return Err(FatalError::InvalidRoster("duplicate agent UID".into()));
            }
        }
        Ok(Self { agents, credentials })
    }

    /// Resolve a credential to the agent it identifies.
    pub fn authenticate(&self, credential: &str) -> Option<&AgentId> {
        self.credentials.get(credential)
    }

    pub fn contains(&self, agent: &str) -> bool {
        self.agents.contains_key(agent)
    }

    pub fn get(&self, agent: &str) -> Option<&AgentProfile> {
        self.agents.get(agent)
    }

    /// Agent UIDs in sorted order.
    pub fn ids(&self) -> Vec<AgentId> {
        self.agents.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
