//! The versioned proposal graph.
//!
//! Proposals live in an arena indexed by stable string IDs of the form
//! `P<author>@v<n>`. Each author owns one line of versions linked by parent
//! pointers; exactly one version per line is active, older versions are
//! archived and never mutated. The canonical NoAction proposal is a shared
//! line authored by the system.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::event::Tick;

/// Stable proposal identifier, `P<author>@v<n>`.
pub type ProposalId = String;

/// Author recorded on the canonical NoAction line.
pub const NOACTION_AUTHOR: &str = "system";

/// Build the identifier for a given author line and revision number.
pub fn make_proposal_id(author: &str, revision: u32) -> ProposalId {
    format!("P{}@v{}", author, revision)
}

/// Structured proposal content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProposalBody {
    pub title: String,
    pub action: String,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<String>,
}

impl ProposalBody {
    /// Flatten the body to the text the dissimilarity measure runs over.
    pub fn text(&self) -> String {
        let mut parts = vec![
            self.title.as_str(),
            self.action.as_str(),
            self.rationale.as_str(),
        ];
        if let Some(impact) = &self.impact {
            parts.push(impact);
        }
        if let Some(risk) = &self.risk {
            parts.push(risk);
        }
        if let Some(notes) = &self.notes {
            parts.push(notes);
        }
        parts.join("\n")
    }

    /// Body of the canonical NoAction proposal.
    pub fn noaction() -> Self {
        Self {
            title: "No action".to_string(),
            action: "Take no action on this issue".to_string(),
            rationale: "Default position for agents without a distinct proposal".to_string(),
            ..Default::default()
        }
    }
}

/// One immutable proposal version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    /// Author line owner; [`NOACTION_AUTHOR`] for the canonical NoAction line.
    pub author: String,
    pub issue: String,
    /// Previous version in this line; `None` for v1.
    pub parent: Option<ProposalId>,
    /// 1-based revision number.
    pub revision: u32,
    pub body: ProposalBody,
    pub created_tick: Tick,
    pub updated_tick: Tick,
    pub archived: bool,
    pub active: bool,
}

impl Proposal {
    pub fn is_noaction(&self) -> bool {
        self.author == NOACTION_AUTHOR
    }
}

/// Arena of proposal versions plus the author-line and backer indexes.
#[derive(Debug, Default)]
pub struct ProposalGraph {
    arena: Vec<Proposal>,
    index: HashMap<ProposalId, usize>,
    /// Author line -> arena slot of the line's active version.
    active_by_author: BTreeMap<String, usize>,
    /// Agent -> proposal they are assigned to (their own line, or NoAction).
    backers: BTreeMap<AgentId, ProposalId>,
}

impl ProposalGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Proposal> {
        self.index.get(id).map(|&slot| &self.arena[slot])
    }

    /// The active version of an author's line, if the line exists.
    pub fn active_of_author(&self, author: &str) -> Option<&Proposal> {
        self.active_by_author
            .get(author)
            .map(|&slot| &self.arena[slot])
    }

    /// The proposal this agent currently backs (own line or NoAction).
    pub fn assignment(&self, agent: &str) -> Option<&ProposalId> {
        self.backers.get(agent)
    }

    /// Whether the agent already authored a line or was assigned to NoAction.
    pub fn is_committed(&self, agent: &str) -> bool {
        self.backers.contains_key(agent)
    }

    /// Active versions of every author line, in author order.
    pub fn active_proposals(&self) -> impl Iterator<Item = &Proposal> {
        self.active_by_author.values().map(|&slot| &self.arena[slot])
    }

    /// Agents assigned to the given proposal, in UID order.
    pub fn backers_of(&self, proposal: &str) -> Vec<AgentId> {
        self.backers
            .iter()
            .filter(|(_, pid)| pid.as_str() == proposal)
            .map(|(agent, _)| agent.clone())
            .collect()
    }

    /// Create version 1 of a new author line and assign the author to it.
    ///
    /// The caller must have checked that the agent has no line yet.
    pub fn submit(
        &mut self,
        agent: &str,
        issue: &str,
        body: ProposalBody,
        tick: Tick,
    ) -> ProposalId {
        debug_assert!(!self.is_committed(agent), "agent already committed");
        let id = make_proposal_id(agent, 1);
        self.insert(Proposal {
            id: id.clone(),
            author: agent.to_string(),
            issue: issue.to_string(),
            parent: None,
            revision: 1,
            body,
            created_tick: tick,
            updated_tick: tick,
            archived: false,
            active: true,
        });
        self.backers.insert(agent.to_string(), id.clone());
        id
    }

    /// Get or create the canonical NoAction proposal for the issue.
    pub fn ensure_noaction(&mut self, issue: &str, tick: Tick) -> ProposalId {
        if let Some(existing) = self.active_of_author(NOACTION_AUTHOR) {
            return existing.id.clone();
        }
        let id = make_proposal_id(NOACTION_AUTHOR, 1);
        self.insert(Proposal {
            id: id.clone(),
            author: NOACTION_AUTHOR.to_string(),
            issue: issue.to_string(),
            parent: None,
            revision: 1,
            body: ProposalBody::noaction(),
            created_tick: tick,
            updated_tick: tick,
            archived: false,
            active: true,
        });
        id
    }

    /// Assign an agent to the canonical NoAction proposal.
    pub fn assign_noaction(&mut self, agent: &str, issue: &str, tick: Tick) -> ProposalId {
        let id = self.ensure_noaction(issue, tick);
        self.backers.insert(agent.to_string(), id.clone());
        id
    }

    /// Archive the author's active version and create the next one.
    ///
    /// Returns `(old_id, new_id)`. The caller must have checked that the
    /// agent authors an active line.
    pub fn revise(&mut self, author: &str, body: ProposalBody, tick: Tick) -> (ProposalId, ProposalId) {
        let slot = *self
            .active_by_author
            .get(author)
            .expect("revise requires an active author line");
        let (old_id, revision, issue) = {
            let old = &mut self.arena[slot];
            old.archived = true;
            old.active = false;
            (old.id.clone(), old.revision, old.issue.clone())
        };

        let new_id = make_proposal_id(author, revision + 1);
        self.insert(Proposal {
            id: new_id.clone(),
            author: author.to_string(),
            issue,
            parent: Some(old_id.clone()),
            revision: revision + 1,
            body,
            created_tick: tick,
            updated_tick: tick,
            archived: false,
            active: true,
        });
        self.backers.insert(author.to_string(), new_id.clone());
        (old_id, new_id)
    }

    fn insert(&mut self, proposal: Proposal) {
        let slot = self.arena.len();
        self.index.insert(proposal.id.clone(), slot);
        self.active_by_author.insert(proposal.author.clone(), slot);
        self.arena.push(proposal);
    }
}
