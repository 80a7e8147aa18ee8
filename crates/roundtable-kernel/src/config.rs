//! Configuration for a consensus run.
//!
//! The configuration is frozen at run start: the orchestrator takes an owned
//! snapshot and nothing mutates it afterwards. Field names serialize to the
//! exact keys recognized in configuration files.

use serde::{Deserialize, Serialize};

use crate::error::FatalError;

/// Immutable configuration snapshot for one consensus run.
///
/// All quantities are logical: CP amounts are integers, time is counted in
/// ticks, and the conviction curve is parameterized by rounds, never by
/// wall-clock time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConsensusConfig {
    /// Initial CP awarded to every agent on enrollment.
    pub standard_invite_payment: u64,

    /// Upper bound on any agent balance. `None` means unbounded.
    pub maximum_credit: Option<u64>,

    /// Mandatory CP locked into a proposal at submission.
    pub proposal_self_stake: u64,

    /// Per-phase inactivity budget in ticks before kick-out substitution.
    pub max_think_ticks: u32,

    /// CP burned from an agent on kick-out (0 disables the penalty).
    pub kick_out_penalty: u64,

    /// CP burned per feedback submission.
    pub feedback_stake: u64,

    /// Feedback submissions allowed per agent per FEEDBACK phase.
    pub max_feedback_per_agent: u32,

    /// Maximum feedback body length in characters.
    pub feedback_char_limit: usize,

    /// Number of (FEEDBACK, REVISE) cycles between PROPOSE and the STAKE
    /// rounds.
    pub revision_cycles: u32,

    /// Number of STAKE rounds. Must be at least 1; a finite value is what
    /// guarantees the run terminates.
    pub stake_rounds: u32,

    /// Conviction multiplier approached as a stake is held indefinitely.
    pub max_conviction_multiplier: f64,

    /// Fraction of the maximum multiplier reached after
    /// `ConvictionSaturationRounds` consecutive rounds held.
    pub conviction_target_fraction: f64,

    /// Rounds-held value at which the conviction counter stops growing.
    pub conviction_saturation_rounds: u32,

    /// Seed for all randomness outside the kernel (scenario generation,
    /// agent brains). The kernel itself is random-free; the seed is recorded
    /// so external brains replay identically.
    pub random_seed: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            standard_invite_payment: 100,
            maximum_credit: None,
            proposal_self_stake: 50,
            max_think_ticks: 3,
            kick_out_penalty: 0,
            feedback_stake: 5,
            max_feedback_per_agent: 3,
            feedback_char_limit: 500,
            revision_cycles: 2,
            stake_rounds: 5,
            max_conviction_multiplier: 2.0,
            conviction_target_fraction: 0.98,
            conviction_saturation_rounds: 5,
            random_seed: 0,
        }
    }
}

impl ConsensusConfig {
    /// Check the snapshot for inconsistencies that would make the run
    /// ill-defined. Called once at orchestrator construction.
    pub fn validate(&self) -> Result<(), FatalError> {
        if self.stake_rounds == 0 {
            return Err(FatalError::InvalidConfig(
                "StakeRounds must be at least 1".into(),
            ));
        }
        if self.conviction_saturation_rounds == 0 {
            return Err(FatalError::InvalidConfig(
                "ConvictionSaturationRounds must be at least 1".into(),
            ));
        }
        if !(self.conviction_target_fraction > 0.0 && self.conviction_target_fraction < 1.0) {
            return Err(FatalError::InvalidConfig(format!(
                "ConvictionTargetFraction must be in (0, 1), got {}",
                self.conviction_target_fraction
            )));
        }
        if self.max_conviction_multiplier < 1.0 {
            return Err(FatalError::InvalidConfig(format!(
                "MaxConvictionMultiplier must be at least 1.0, got {}",
                self.max_conviction_multiplier
            )));
        }
        if let Some(max) = self.maximum_credit {
            if max < self.standard_invite_payment {
                return Err(FatalError::InvalidConfig(format!(
                    "MaximumCredit ({}) is below StandardInvitePayment ({})",
                    max, self.standard_invite_payment
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ConsensusConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_stake_rounds_rejected() {
        let cfg = ConsensusConfig {
            stake_rounds: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_saturation_rounds_rejected() {
        let cfg = ConsensusConfig {
            conviction_saturation_rounds: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_target_fraction_bounds() {
        for bad in [0.0, 1.0, 1.5, -0.1] {
            let cfg = ConsensusConfig {
                conviction_target_fraction: bad,
                ..Default::default()
            };
            assert!(cfg.validate().is_err(), "fraction {} should be rejected", bad);
        }
    }

    #[test]
    fn test_max_credit_below_invite_payment_rejected() {
        let cfg = ConsensusConfig {
            maximum_credit: Some(50),
            standard_invite_payment: 100,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_keys_round_trip() {
        let yaml_like = serde_json::json!({
            "StandardInvitePayment": 80,
            "ProposalSelfStake": 40,
            "StakeRounds": 3
        });
        let cfg: ConsensusConfig = serde_json::from_value(yaml_like).unwrap();
        assert_eq!(cfg.standard_invite_payment, 80);
        assert_eq!(cfg.proposal_self_stake, 40);
        assert_eq!(cfg.stake_rounds, 3);
        // Unspecified keys fall back to defaults
        assert_eq!(cfg.feedback_stake, 5);
    }
}
