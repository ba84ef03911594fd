//! Per-function reconstruction report.

use std::io::Write;

use anyhow::Result;

use crate::core::callgraph::CallGraph;
use crate::core::reconstruct::DfsStats;
use crate::core::types::StInfoSet;

/// Aggregated outcome of one reconstruction walk over a function's
/// fingerprint group.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Report {
    unique_traces: u64,
    resolved: u64,
    unresolved: u64,
    traces_with_incorrect: u64,
    incorrect: u64,
    direct_sites_resolved: u64,
    indirect_sites_resolved: u64,
    visited: u64,
    pruned: u64,
}

impl Report {
    pub fn new(graph: &CallGraph, set: &StInfoSet, stats: &DfsStats) -> Report {
        let mut report = Report {
            visited: stats.visited,
            pruned: stats.pruned,
            ..Report::default()
        };
        for info in set.values() {
            report.unique_traces += 1;
            if info.matched {
                report.resolved += 1;
                // Break the correctly resolved frames down by edge kind.
                for &pc in &info.trace {
                    report.direct_sites_resolved += graph.is_direct_site(pc) as u64;
                    report.indirect_sites_resolved += graph.is_indirect_site(pc) as u64;
                }
            } else {
                report.unresolved += 1;
            }
            let incorrect = info.incorrect_matches();
            report.traces_with_incorrect += (incorrect > 0) as u64;
            report.incorrect += incorrect;
        }
        report
    }

    /// Percentage of fingerprints resolved to an exact trace. An empty
    /// group counts as fully resolved.
    pub fn success_rate(&self) -> f64 {
        if self.unique_traces == 0 {
            100.0
        } else {
            self.resolved as f64 / self.unique_traces as f64 * 100.0
        }
    }

    pub fn write(&self, out: &mut dyn Write) -> Result<()> {
        writeln!(out)?;
        writeln!(out, "Num unique stack traces         : {}", self.unique_traces)?;
        writeln!(out, "Num decompressed correctly      : {}", self.resolved)?;
        writeln!(out, "Num could not be decompressed   : {}", self.unresolved)?;
        writeln!(out, "Success rate                    : {:.2}%", self.success_rate())?;
        writeln!(out, "Num ST had incorrect collisions : {}", self.traces_with_incorrect)?;
        writeln!(out, "Num incorrect collisions        : {}", self.incorrect)?;
        writeln!(out, "Num dir calls found correctly   : {}", self.direct_sites_resolved)?;
        writeln!(out, "Num indir calls found correctly : {}", self.indirect_sites_resolved)?;
        writeln!(out, "Num nodes visited during DFS    : {}", self.visited)?;
        writeln!(out, "Num pruning done                : {}", self.pruned)?;
        Ok(())
    }
}

/// Dumps the stack traces that could not be resolved, in the input record
/// format, under a per-function banner.
pub fn write_unresolved(func: &str, set: &StInfoSet, out: &mut dyn Write) -> Result<()> {
    writeln!(out, "== STACK TRACES CAN'T DECOMP FOR \"{func}\" ==")?;
    for info in set.values() {
        if info.matched {
            continue;
        }
        write!(out, "{func}")?;
        for &pc in &info.trace {
            write!(out, " {pc:x}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}
