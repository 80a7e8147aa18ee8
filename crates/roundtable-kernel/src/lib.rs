//! Round Table consensus kernel: a deterministic, tick-driven decision
//! engine in which identified agents spend Conviction Points (CP) to select
//! a single winning proposal for an issue.
//!
//! A run walks a fixed phase schedule (PROPOSE, then (FEEDBACK, REVISE)
//! cycles, then STAKE rounds, then FINALIZE) under a logical clock. Every
//! state change
//! funnels through one serial commit path and lands in an append-only
//! ledger, so a recorded action trace replays to a byte-identical event
//! stream.
//!
//! ## Quick start
//!
//! ```ignore
//! use roundtable_kernel::{
//!     AgentProfile, ConsensusConfig, Issue, Orchestrator, ProposalBody, Roster,
//! };
//!
//! let roster = Roster::new(vec![
//!     AgentProfile::new("A1", "Alice", "cred-1"),
//!     AgentProfile::new("A2", "Bob", "cred-2"),
//! ])?;
//! let mut run = Orchestrator::new(
//!     ConsensusConfig::default(),
//!     Issue::new("ISS-1", "Where does the new harbor go?"),
//!     roster,
//! )?;
//!
//! run.submit_proposal("cred-1", ProposalBody { /* ... */ })?;
//! run.signal_ready("cred-2")?;
//! while !run.is_finalized() {
//!     run.tick()?;
//! }
//! println!("{:?}", run.outcome());
//! ```
//!
//! The kernel is transport- and storage-agnostic: drivers feed it actions
//! and ticks, then stream the ledger wherever they like.

pub mod agent;
pub mod config;
pub mod credit;
pub mod delta;
pub mod error;
pub mod event;
pub mod issue;
pub mod orchestrator;
pub mod phase;
pub mod proposal;
pub mod stake;

pub use agent::{AgentId, AgentProfile, Roster};
pub use config::ConsensusConfig;
pub use credit::CreditManager;
pub use delta::dissimilarity;
pub use error::{ActionResult, FatalError};
pub use event::{EventKind, Ledger, LedgerEvent, Seq, Tick};
pub use issue::{FeedbackRecord, Issue};
pub use orchestrator::{
    AgentAction, Orchestrator, Outcome, RankedProposal, StateView, SupporterShare, TickReport,
    TraceEntry,
};
pub use phase::Phase;
pub use proposal::{Proposal, ProposalBody, ProposalId};
pub use stake::{ConvictionCurve, StakeKind, StakeRecord};
