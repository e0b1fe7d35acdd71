//! Run summaries.
//!
//! A [`RunReport`] is produced by every partition at the end of
//! [`Simulation::run`](crate::simulation::Simulation::run) and can be
//! exported as JSON or as a `metric,value` table.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

use crate::error::SimResult;
use crate::types::{Rank, SimTime};

/// Counters maintained by a partition while it runs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    /// Activities popped from the vortex
    pub activities: u64,

    /// Timed events sent from this partition
    pub events_sent: u64,

    /// Events handed to a handler or a polling queue
    pub events_delivered: u64,

    /// Events that arrived on a disconnected or unconfigured endpoint
    pub events_dropped: u64,

    /// Events handed to the sync layer
    pub events_exported: u64,

    /// Events received from other partitions
    pub events_imported: u64,

    /// Untimed messages sent
    pub untimed_sent: u64,

    /// Clock edges fired
    pub clock_edges: u64,

    /// One-shot callbacks fired
    pub oneshots_fired: u64,

    /// Sync horizons processed
    pub sync_rounds: u64,

    /// Bytes sent to other partitions
    pub sync_bytes: u64,
}

/// Summary of one partition's run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunReport {
    /// Partition that produced the report
    pub rank: Rank,

    /// Number of partitions in the run
    pub num_ranks: Rank,

    /// Simulated time at which the run ended
    pub final_time: SimTime,

    /// `final_time` rendered in SI units
    pub final_time_text: String,

    /// Why the dispatch loop stopped
    pub end_reason: String,

    pub counters: RunCounters,

    /// Init phases executed
    pub init_phases: u32,

    /// Init phases that carried at least one message
    pub untimed_rounds: u32,

    /// Complete phases executed
    pub complete_phases: u32,

    /// Largest number of pending activities
    pub max_vortex_depth: usize,

    /// Statistics registered on this partition
    pub statistics: usize,

    /// Wall-clock time of the whole run in milliseconds
    pub wall_time_ms: f64,

    /// Report of every profile tool, keyed by tool name
    pub profile: serde_json::Value,
}

impl RunReport {
    /// Exports the report to pretty JSON.
    pub fn to_json(&self) -> SimResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Exports the report to a JSON file.
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> SimResult<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Exports the scalar metrics as CSV.
    pub fn to_csv(&self) -> String {
        let c = &self.counters;
        let mut csv = String::new();
        csv.push_str("metric,value\n");
        csv.push_str(&format!("rank,{}\n", self.rank));
        csv.push_str(&format!("final_time,{}\n", self.final_time));
        csv.push_str(&format!("activities,{}\n", c.activities));
        csv.push_str(&format!("events_sent,{}\n", c.events_sent));
        csv.push_str(&format!("events_delivered,{}\n", c.events_delivered));
        csv.push_str(&format!("events_dropped,{}\n", c.events_dropped));
        csv.push_str(&format!("events_exported,{}\n", c.events_exported));
        csv.push_str(&format!("events_imported,{}\n", c.events_imported));
        csv.push_str(&format!("clock_edges,{}\n", c.clock_edges));
        csv.push_str(&format!("sync_rounds,{}\n", c.sync_rounds));
        csv.push_str(&format!("sync_bytes,{}\n", c.sync_bytes));
        csv.push_str(&format!("untimed_rounds,{}\n", self.untimed_rounds));
        csv.push_str(&format!("wall_time_ms,{:.2}\n", self.wall_time_ms));
        csv
    }

    /// Writes a human-readable summary.
    pub fn write_summary<W: Write>(&self, mut w: W) -> std::io::Result<()> {
        writeln!(w, "=== Rank {} of {} ===", self.rank, self.num_ranks)?;
        writeln!(w, "Ended at {} ({})", self.final_time_text, self.end_reason)?;
        writeln!(w, "Activities: {}", self.counters.activities)?;
        writeln!(
            w,
            "Events: {} sent, {} delivered, {} dropped",
            self.counters.events_sent, self.counters.events_delivered, self.counters.events_dropped
        )?;
        if self.num_ranks > 1 {
            writeln!(
                w,
                "Sync: {} rounds, {} bytes, {} exported, {} imported",
                self.counters.sync_rounds,
                self.counters.sync_bytes,
                self.counters.events_exported,
                self.counters.events_imported
            )?;
        }
        writeln!(
            w,
            "Untimed: {} init phases ({} with messages), {} complete phases",
            self.init_phases, self.untimed_rounds, self.complete_phases
        )?;
        writeln!(w, "Wall time: {:.2} ms", self.wall_time_ms)?;
        Ok(())
    }

    /// Returns the summary as a string.
    pub fn summary(&self) -> String {
        let mut buf = Vec::new();
        // Writing to a Vec cannot fail.
        let _ = self.write_summary(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// A simple timer for measuring wall-clock time.
#[derive(Debug)]
pub struct Timer {
    start: std::time::Instant,
}

impl Timer {
    /// Starts a new timer.
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Returns elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::start()
    }
}
