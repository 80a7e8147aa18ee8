//! Configuration file loading for the simulator.
//!
//! The YAML file carries the consensus options under their canonical keys
//! (`StandardInvitePayment`, `ProposalSelfStake`, ...). Missing keys fall
//! back to the kernel defaults; the snapshot is frozen before the run
//! starts. CLI flags may override individual values afterwards.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use roundtable_kernel::ConsensusConfig;

/// Load a consensus configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<ConsensusConfig> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
    let config: ConsensusConfig =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}
