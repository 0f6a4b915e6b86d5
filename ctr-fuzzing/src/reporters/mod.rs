// ctr-fuzzing/src/reporters/mod.rs
//! Campaign statistics and reports

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::harness::{ConstructionStrategy, IterationStatus};
use crate::utils::timestamped_filename;

/// Attempts and successes for one construction strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StrategyStats {
    pub attempted: u64,
    pub succeeded: u64,
}

/// Counters accumulated over a campaign
#[derive(Debug, Clone, Serialize)]
pub struct CampaignStats {
    pub started_at: DateTime<Utc>,
    pub iterations: u64,
    pub connection_failures: u64,
    pub input_exhausted: u64,
    pub completed: u64,
    pub imports_attempted: u64,
    pub imports_succeeded: u64,
    pub constructions: BTreeMap<String, StrategyStats>,
    pub deletions: u64,
    pub deletion_failures: u64,
    pub recoveries: u64,
    pub daemon_starts: u64,
    pub teardowns: u64,
    pub teardown_failures: u64,
}

impl Default for CampaignStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            iterations: 0,
            connection_failures: 0,
            input_exhausted: 0,
            completed: 0,
            imports_attempted: 0,
            imports_succeeded: 0,
            constructions: BTreeMap::new(),
            deletions: 0,
            deletion_failures: 0,
            recoveries: 0,
            daemon_starts: 0,
            teardowns: 0,
            teardown_failures: 0,
        }
    }
}

impl CampaignStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_status(&mut self, status: IterationStatus) {
        self.iterations += 1;
        match status {
            IterationStatus::ConnectionFailed => self.connection_failures += 1,
            IterationStatus::InputExhausted => self.input_exhausted += 1,
            IterationStatus::Completed => self.completed += 1,
        }
    }

    pub fn record_import(&mut self, succeeded: bool) {
        self.imports_attempted += 1;
        if succeeded {
            self.imports_succeeded += 1;
        }
    }

    pub fn record_construction(&mut self, strategy: ConstructionStrategy, succeeded: bool) {
        let entry = self.constructions.entry(strategy.to_string()).or_default();
        entry.attempted += 1;
        if succeeded {
            entry.succeeded += 1;
        }
    }

    pub fn record_deletion(&mut self, succeeded: bool) {
        if succeeded {
            self.deletions += 1;
        } else {
            self.deletion_failures += 1;
        }
    }

    pub fn constructions_attempted(&self) -> u64 {
        self.constructions.values().map(|stats| stats.attempted).sum()
    }

    pub fn constructions_succeeded(&self) -> u64 {
        self.constructions.values().map(|stats| stats.succeeded).sum()
    }

    /// Print a human-readable summary to stdout
    pub fn print_summary(&self) {
        println!("\n=== Container Fuzzing Results ===");
        println!("Started: {}", self.started_at.to_rfc3339());
        println!("Iterations: {}", self.iterations);
        println!("  completed: {}", self.completed);
        println!("  input exhausted: {}", self.input_exhausted);
        println!("  connection failed: {}", self.connection_failures);
        println!(
            "Imports: {} attempted, {} succeeded",
            self.imports_attempted, self.imports_succeeded
        );

        if !self.constructions.is_empty() {
            println!("\nConstructions:");
            for (strategy, stats) in &self.constructions {
                println!("  {}: {}/{}", strategy, stats.succeeded, stats.attempted);
            }
        }

        println!(
            "\nDeletions: {} ({} failed)",
            self.deletions, self.deletion_failures
        );
        println!("Socket recoveries: {}", self.recoveries);
        println!("Daemon starts: {}", self.daemon_starts);
        if self.teardowns > 0 || self.teardown_failures > 0 {
            println!(
                "Teardowns: {} ({} failed)",
                self.teardowns, self.teardown_failures
            );
        }
    }

    /// Write the statistics as JSON into `dir` and return the file path
    pub fn save_report(&self, dir: &Path) -> io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(timestamped_filename("campaign", "json"));
        let json = serde_json::to_string_pretty(self)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let mut file = File::create(&path)?;
        file.write_all(json.as_bytes())?;
        Ok(path)
    }
}
