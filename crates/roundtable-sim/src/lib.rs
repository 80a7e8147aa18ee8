//! Simulation driver for the Round Table consensus kernel.
//!
//! Provides what the kernel deliberately leaves out: YAML configuration
//! loading, seeded scenario and roster generation, deterministic scripted
//! agent brains, the tick loop, and run artifacts with replay verification.

pub mod brain;
pub mod config;
pub mod results;
pub mod runner;
pub mod scenario;

pub use brain::{Policy, ScriptedBrain};
pub use results::{RunArtifact, RunSummary};
pub use runner::{run_scenario, verify_artifact};
pub use scenario::{AgentPool, Scenario, ScenarioConfig};
