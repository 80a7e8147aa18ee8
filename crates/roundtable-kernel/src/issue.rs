//! Issues: the decision instance a consensus run resolves, and the feedback
//! recorded against its proposals.

use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::event::Tick;

/// A single decision instance. Exactly one issue is active per run; the
/// orchestrator snapshots the assigned agent set at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub problem_statement: String,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub indicators: Vec<String>,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Agents assigned to this issue; filled in at orchestrator construction.
    #[serde(default)]
    pub agents: Vec<AgentId>,
    #[serde(default)]
    pub created_tick: Tick,
}

impl Issue {
    pub fn new(id: impl Into<String>, problem_statement: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            problem_statement: problem_statement.into(),
            background: String::new(),
            indicators: Vec::new(),
            goals: Vec::new(),
            attachments: Vec::new(),
            agents: Vec::new(),
            created_tick: 0,
        }
    }

    pub fn with_background(mut self, background: impl Into<String>) -> Self {
        self.background = background.into();
        self
    }

    /// Whether the agent is assigned to (authorized to act on) this issue.
    pub fn is_assigned(&self, agent: &str) -> bool {
        self.agents.iter().any(|a| a == agent)
    }
}

/// One immutable feedback entry. Feedback is append-only and never revised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub author: AgentId,
    /// Target proposal; validated to never be the author's own.
    pub target: String,
    pub body: String,
    pub tick: Tick,
}
