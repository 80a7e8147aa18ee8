//! Run results: summaries, saved artifacts, and the console outcome table.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use roundtable_kernel::{ConsensusConfig, Orchestrator, TraceEntry};

use crate::scenario::ScenarioConfig;

/// Generate a timestamped output path from the given path.
/// e.g., "run.json" -> "run-20260802-010530.json"
pub fn timestamped_path(path: &Path) -> PathBuf {
    let timestamp = Local::now().format("%Y%m%d-%H%M%S");
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("run");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("json");
    let parent = path.parent().unwrap_or(Path::new("."));
    parent.join(format!("{}-{}.{}", stem, timestamp, ext))
}

/// One line of the final ranking table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingRow {
    pub proposal: String,
    pub author: String,
    pub revision: u32,
    pub score: f64,
    pub raw_staked: u64,
    pub supporters: usize,
}

/// Human- and machine-readable summary of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub issue_id: String,
    pub agent_count: usize,
    pub seed: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub total_ticks: u64,
    pub ledger_events: usize,
    pub winner: Option<String>,
    pub winner_author: Option<String>,
    pub score: f64,
    pub rankings: Vec<RankingRow>,
    pub final_balances: BTreeMap<String, u64>,
}

impl RunSummary {
    pub fn from_run(
        run: &Orchestrator,
        scenario: &ScenarioConfig,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        let outcome = run.outcome();
        Self {
            issue_id: run.issue().id.clone(),
            agent_count: scenario.agent_count,
            seed: scenario.seed,
            started_at,
            ended_at,
            total_ticks: run.current_tick(),
            ledger_events: run.ledger().len(),
            winner: outcome.and_then(|o| o.winner.clone()),
            winner_author: outcome.and_then(|o| o.winner_author.clone()),
            score: outcome.map(|o| o.score).unwrap_or(0.0),
            rankings: outcome
                .map(|o| {
                    o.rankings
                        .iter()
                        .map(|r| RankingRow {
                            proposal: r.proposal.clone(),
                            author: r.author.clone(),
                            revision: r.revision,
                            score: r.score,
                            raw_staked: r.raw_staked,
                            supporters: r.supporters.len(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
            final_balances: run.credits().balances().clone(),
        }
    }

    /// Print the outcome table to stdout.
    pub fn print(&self) {
        println!("\n=== Consensus Finalized: {} ===", self.issue_id);
        match &self.winner {
            Some(winner) => println!(
                "Winner: {} (author {}) with score {:.4}",
                winner,
                self.winner_author.as_deref().unwrap_or("-"),
                self.score
            ),
            None => println!("No winner: no proposals received stakes"),
        }
        println!("Ticks: {}   Ledger events: {}", self.total_ticks, self.ledger_events);
        println!("\nRankings:");
        for (rank, row) in self.rankings.iter().enumerate() {
            println!(
                "  #{:<2} {:<16} author={:<8} rev={} score={:>8.4} raw={:>5} CP supporters={}",
                rank + 1,
                row.proposal,
                row.author,
                row.revision,
                row.score,
                row.raw_staked,
                row.supporters
            );
        }
        println!("\nFinal balances:");
        for (agent, balance) in &self.final_balances {
            println!("  {:<8} {:>6} CP", agent, balance);
        }
    }
}

/// Everything needed to reproduce and verify a run: the frozen inputs, the
/// recorded action trace, and the canonical ledger it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunArtifact {
    pub config: ConsensusConfig,
    pub scenario: ScenarioConfig,
    pub trace: Vec<TraceEntry>,
    pub ledger: Vec<String>,
    pub summary: RunSummary,
}

impl RunArtifact {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }
}
