//! Per-instruction summaries and the JSON run report.

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::SkipCounters;
use crate::mode::TargetMode;

/// Outcome of testing one instruction form in one mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrSummary {
    pub name: String,
    pub mode: TargetMode,
    /// Encodings the enumerator produced.
    pub encodings: u64,
    pub executed: u64,
    pub skipped: u64,
    pub failures: u64,
    pub skips: SkipCounters,
}

impl InstrSummary {
    pub fn new(name: &str, mode: TargetMode) -> Self {
        Self {
            name: name.to_string(),
            mode,
            encodings: 0,
            executed: 0,
            skipped: 0,
            failures: 0,
            skips: SkipCounters::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub mode: TargetMode,
    pub seed: u64,
    pub instructions: Vec<InstrSummary>,
    pub executed: u64,
    pub skipped: u64,
    pub failures: u64,
    pub skips: SkipCounters,
}

impl RunReport {
    pub fn new(mode: TargetMode, seed: u64) -> Self {
        Self {
            mode,
            seed,
            instructions: Vec::new(),
            executed: 0,
            skipped: 0,
            failures: 0,
            skips: SkipCounters::default(),
        }
    }

    pub fn push(&mut self, summary: InstrSummary) {
        self.executed += summary.executed;
        self.skipped += summary.skipped;
        self.failures += summary.failures;
        self.skips.add(&summary.skips);
        self.instructions.push(summary);
    }

    pub fn passed(&self) -> bool {
        self.failures == 0
    }

    pub fn log_summary(&self) {
        info!(
            mode = %self.mode,
            seed = self.seed,
            instructions = self.instructions.len(),
            executed = self.executed,
            skipped = self.skipped,
            failures = self.failures,
            "cidet run finished"
        );
        for summary in self.instructions.iter().filter(|s| s.failures > 0) {
            warn!(
                instruction = %summary.name,
                failures = summary.failures,
                executed = summary.executed,
                "instruction has failures"
            );
        }
    }

    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        std::fs::write(path, contents)
    }
}
