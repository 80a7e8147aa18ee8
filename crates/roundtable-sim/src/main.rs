//! Round Table consensus simulator CLI.
//!
//! Commands:
//! - run: run a scenario to finalization and save the run artifact
//! - replay: re-run a saved artifact and verify the ledger byte-for-byte
//! - generate: print the roster and issue a scenario would produce

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use roundtable_kernel::ConsensusConfig;
use roundtable_sim::results::{timestamped_path, RunArtifact};
use roundtable_sim::runner::{assign_policies, run_scenario, verify_artifact};
use roundtable_sim::scenario::{Scenario, ScenarioConfig};

#[derive(Parser)]
#[command(name = "roundtable-sim")]
#[command(version)]
#[command(about = "Round Table consensus simulations")]
struct Cli {
    /// Consensus configuration file (YAML); defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario to finalization
    Run {
        /// Number of agents
        #[arg(long, default_value = "4")]
        agents: usize,

        /// Trailing agents that never act (exercise kick-out)
        #[arg(long, default_value = "0")]
        idlers: usize,

        /// Random seed
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Issue identifier
        #[arg(long, default_value = "ISS-1")]
        issue: String,

        /// Output file for the run artifact
        #[arg(long, default_value = "run.json")]
        output: PathBuf,

        /// Also print every ledger event
        #[arg(long)]
        ledger: bool,
    },

    /// Verify a saved run artifact by deterministic replay
    Replay {
        /// Path to a run artifact produced by `run`
        artifact: PathBuf,
    },

    /// Generate and display a scenario without running it
    Generate {
        /// Number of agents
        #[arg(long, default_value = "4")]
        agents: usize,

        /// Trailing agents that never act
        #[arg(long, default_value = "0")]
        idlers: usize,

        /// Random seed
        #[arg(long, default_value = "0")]
        seed: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    let config = match &cli.config {
        Some(path) => roundtable_sim::config::load_config(path)?,
        None => ConsensusConfig::default(),
    };

    match cli.command {
        Commands::Run {
            agents,
            idlers,
            seed,
            issue,
            output,
            ledger,
        } => {
            let scenario = ScenarioConfig {
                agent_count: agents,
                seed,
                idlers,
                issue_id: issue,
            };
            let artifact = run_scenario(config, scenario)?;

            if ledger {
                println!("=== Ledger ===");
                for line in &artifact.ledger {
                    println!("{}", line);
                }
            }
            artifact.summary.print();

            let output_path = timestamped_path(&output);
            artifact.save(&output_path)?;
            println!("\nRun artifact saved to: {}", output_path.display());
        }

        Commands::Replay { artifact } => {
            let artifact = RunArtifact::load(&artifact)?;
            info!(
                events = artifact.ledger.len(),
                actions = artifact.trace.len(),
                "replaying recorded run"
            );
            let summary = verify_artifact(&artifact)?;
            summary.print();
            println!("\nReplay verified: ledger is byte-identical ({} events)", artifact.ledger.len());
        }

        Commands::Generate {
            agents,
            idlers,
            seed,
        } => {
            let scenario = Scenario::generate(ScenarioConfig {
                agent_count: agents,
                seed,
                idlers,
                ..Default::default()
            });
            let policies = assign_policies(agents, idlers);
            println!("Issue: {}: {}", scenario.issue.id, scenario.issue.problem_statement);
            println!("Agents:");
            for (profile, policy) in scenario.profiles.iter().zip(policies) {
                println!(
                    "  {:<4} {:<10} policy={:<9} credential={}...",
                    profile.id,
                    profile.display_name,
                    policy.name(),
                    &profile.credential[..8.min(profile.credential.len())]
                );
            }
        }
    }

    Ok(())
}
