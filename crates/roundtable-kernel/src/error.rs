//! Error types: fatal aborts vs. rejected actions.
//!
//! Rejections are ordinary data returned by the action API; they are logged
//! to the ledger and never unwind state. Fatal errors abort the run.

use thiserror::Error;

/// Unrecoverable errors: configuration inconsistencies and ledger-integrity
/// violations. Raising one of these aborts the consensus run.
#[derive(Debug, Error)]
pub enum FatalError {
    /// The configuration snapshot is internally inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An event append was attempted after the issue was finalized.
    #[error("ledger is sealed: issue already finalized")]
    LedgerSealed,

    /// The agent roster is malformed (duplicate UID or credential).
    #[error("invalid roster: {0}")]
    InvalidRoster(String),
}

/// Outcome of a single action submitted through the action API.
///
/// Every rejection is also visible in the ledger as a `*_rejected` or
/// `insufficient_credit` event; the returned variant is the caller-facing
/// mirror of that event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    /// The action committed. `reference` carries the identifier the action
    /// produced, when there is one (proposal ID, stake ID).
    Ok { reference: Option<String> },
    /// The action is not admissible in the current phase.
    RejectedInvalidPhase,
    /// Unknown credential.
    RejectedUnauthenticated,
    /// The agent's liquid balance cannot cover the action.
    RejectedInsufficientCredit,
    /// A per-phase quota was exhausted (feedback limit).
    RejectedQuotaExceeded,
    /// The action violates a protocol rule; the reason names which.
    RejectedSemantic(String),
    /// The referenced proposal or stake does not exist (or is archived).
    RejectedNotFound,
}

impl ActionResult {
    /// Convenience constructor for an accepted action without a reference.
    pub fn ok() -> Self {
        ActionResult::Ok { reference: None }
    }

    /// Convenience constructor for an accepted action carrying an identifier.
    pub fn ok_with(reference: impl Into<String>) -> Self {
        ActionResult::Ok {
            reference: Some(reference.into()),
        }
    }

    /// Whether the action committed.
    pub fn is_ok(&self) -> bool {
        matches!(self, ActionResult::Ok { .. })
    }

    /// The reference produced by an accepted action, if any.
    pub fn reference(&self) -> Option<&str> {
        match self {
            ActionResult::Ok { reference } => reference.as_deref(),
            _ => None,
        }
    }
}
