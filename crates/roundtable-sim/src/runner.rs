//! The simulation runner: wires scripted brains to an orchestrator and
//! drives the tick loop to finalization.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{debug, info};

use roundtable_kernel::{ConsensusConfig, Orchestrator};

use crate::brain::{Policy, ScriptedBrain};
use crate::results::{RunArtifact, RunSummary};
use crate::scenario::{Scenario, ScenarioConfig};

/// Assign policies across the roster: trailing agents idle (if configured),
/// the rest alternate builder / supporter starting with a builder.
pub fn assign_policies(agent_count: usize, idlers: usize) -> Vec<Policy> {
    let idlers = idlers.min(agent_count);
    (0..agent_count)
        .map(|i| {
            if i >= agent_count - idlers {
                Policy::Idler
            } else if i % 2 == 0 {
                Policy::Builder
            } else {
                Policy::Supporter
            }
        })
        .collect()
}

/// Run one scenario to finalization and package the artifact.
pub fn run_scenario(config: ConsensusConfig, scenario_config: ScenarioConfig) -> Result<RunArtifact> {
    let started_at = Utc::now();
    let scenario = Scenario::generate(scenario_config.clone());
    let roster = scenario.roster()?;
    let policies = assign_policies(scenario_config.agent_count, scenario_config.idlers);

    let credentials: Vec<String> = scenario
        .profiles
        .iter()
        .map(|p| p.credential.clone())
        .collect();
    let mut brains: Vec<ScriptedBrain> = policies
        .iter()
        .enumerate()
        .map(|(i, &policy)| {
            ScriptedBrain::new(policy, scenario_config.seed.wrapping_add(i as u64 + 1))
        })
        .collect();
    info!(
        agents = scenario_config.agent_count,
        idlers = scenario_config.idlers,
        seed = scenario_config.seed,
        "starting consensus run"
    );

    let mut run = Orchestrator::new(config.clone(), scenario.issue.clone(), roster)?;

    // Hard ceiling: the schedule is finite and every phase lasts at most
    // max(1, MaxThinkTicks) ticks, so this bound is never the exit path.
    let phase_count = 2 + 2 * config.revision_cycles as u64 + config.stake_rounds as u64;
    let max_ticks = phase_count * (config.max_think_ticks.max(1) as u64 + 1) + 8;

    while !run.is_finalized() {
        if run.current_tick() > max_ticks {
            bail!("run exceeded {} ticks without finalizing", max_ticks);
        }
        for (i, brain) in brains.iter_mut().enumerate() {
            let credential = &credentials[i];
            let view = match run.query_state(credential) {
                Some(view) => view,
                None => continue,
            };
            for action in brain.act(&view) {
                let result = run
                    .submit_action(credential, action.clone())
                    .context("action submission hit a fatal error")?;
                debug!(agent = %view.agent, ?action, ?result, "brain action");
            }
        }
        run.tick()?;
    }

    let ended_at = Utc::now();
    let summary = RunSummary::from_run(&run, &scenario_config, started_at, ended_at);
    Ok(RunArtifact {
        config,
        scenario: scenario_config,
        trace: run.trace().to_vec(),
        ledger: run.ledger().canonical_lines(),
        summary,
    })
}

/// Replay a saved artifact against a fresh kernel and verify the ledger is
/// byte-identical.
pub fn verify_artifact(artifact: &RunArtifact) -> Result<RunSummary> {
    let scenario = Scenario::generate(artifact.scenario.clone());
    let roster = scenario.roster()?;
    let replayed = Orchestrator::replay(
        artifact.config.clone(),
        scenario.issue.clone(),
        roster,
        &artifact.trace,
    )?;
    let lines = replayed.ledger().canonical_lines();
    if lines != artifact.ledger {
        let diverged = lines
            .iter()
            .zip(artifact.ledger.iter())
            .position(|(a, b)| a != b)
            .unwrap_or_else(|| lines.len().min(artifact.ledger.len()));
        bail!(
            "replay diverged from recorded ledger at event {} ({} recorded, {} replayed)",
            diverged + 1,
            artifact.ledger.len(),
            lines.len()
        );
    }
    Ok(RunSummary::from_run(
        &replayed,
        &artifact.scenario,
        artifact.summary.started_at,
        artifact.summary.ended_at,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_assignment() {
        assert_eq!(
            assign_policies(5, 1),
            vec![
                Policy::Builder,
                Policy::Supporter,
                Policy::Builder,
                Policy::Supporter,
                Policy::Idler
            ]
        );
    }

    #[test]
    fn test_policy_assignment_all_idlers_capped() {
        assert_eq!(assign_policies(2, 9), vec![Policy::Idler, Policy::Idler]);
    }

    #[test]
    fn test_run_finalizes_with_winner() {
        let artifact = run_scenario(
            ConsensusConfig::default(),
            ScenarioConfig {
                agent_count: 4,
                seed: 11,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(artifact.summary.winner.is_some());
        assert!(!artifact.ledger.is_empty());
    }

    #[test]
    fn test_same_seed_reproduces_ledger() {
        let scenario = ScenarioConfig {
            agent_count: 4,
            seed: 7,
            idlers: 1,
            ..Default::default()
        };
        let a = run_scenario(ConsensusConfig::default(), scenario.clone()).unwrap();
        let b = run_scenario(ConsensusConfig::default(), scenario).unwrap();
        assert_eq!(a.ledger, b.ledger);
    }

    #[test]
    fn test_verify_artifact_round_trip() {
        let artifact = run_scenario(
            ConsensusConfig::default(),
            ScenarioConfig {
                agent_count: 3,
                seed: 21,
                ..Default::default()
            },
        )
        .unwrap();
        let summary = verify_artifact(&artifact).unwrap();
        assert_eq!(summary.winner, artifact.summary.winner);
    }

    #[test]
    fn test_verify_detects_tampering() {
        let mut artifact = run_scenario(
            ConsensusConfig::default(),
            ScenarioConfig {
                agent_count: 3,
                seed: 22,
                ..Default::default()
            },
        )
        .unwrap();
        artifact.ledger[0] = artifact.ledger[0].replace("credit_award", "credit_burn");
        assert!(verify_artifact(&artifact).is_err());
    }
}
