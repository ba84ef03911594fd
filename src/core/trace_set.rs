//! Loader for the recorded fingerprint set.
//!
//! One record per line: `<symbol> <pc> <pc> ...`, addresses in hex, the
//! symbol naming the innermost function of the trace. Records are grouped by
//! symbol so each group can be resolved with a single walk rooted at that
//! function.

use std::io::{self, Read};

use log::warn;
use rustc_hash::FxHashMap;

use crate::core::hash;
use crate::core::types::{Pc, StInfo, StInfoSet};

/// Fingerprint records grouped by innermost function symbol, plus the
/// irregularity counters accumulated while reading.
#[derive(Debug, Default)]
pub struct TraceSet {
    pub groups: FxHashMap<String, StInfoSet>,
    /// Records longer than the depth limit, truncated on input.
    pub clipped: usize,
    /// Distinct input traces that collided on a fingerprint. The later
    /// record wins; bucketing colliding records instead is an open followup.
    pub collisions: usize,
    /// Records dropped because a frame failed to parse.
    pub malformed: usize,
}

impl TraceSet {
    /// Reads the whole fingerprint input. Malformed records are dropped
    /// with a diagnostic; only I/O failures are fatal.
    pub fn read<R: Read>(
        mut reader: R,
        depth_limit: usize,
        mid_index: usize,
    ) -> io::Result<TraceSet> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;

        let mut set = TraceSet::default();
        for (idx, line) in text.lines().enumerate() {
            let mut tokens = line.split_whitespace();
            let Some(name) = tokens.next() else {
                continue;
            };
            let Some(mut trace) = parse_frames(tokens, idx + 1) else {
                set.malformed += 1;
                continue;
            };
            if trace.len() > depth_limit {
                trace.truncate(depth_limit);
                set.clipped += 1;
            }
            let fingerprint = hash::fingerprint(&trace, mid_index);
            let group = set.groups.entry(name.to_string()).or_default();
            if group.insert(fingerprint, StInfo::new(trace, fingerprint)).is_some() {
                set.collisions += 1;
            }
        }

        if set.clipped > 0 {
            warn!("{} stack traces were clipped to the depth limit", set.clipped);
        }
        if set.collisions > 0 {
            warn!(
                "{} stack traces collided on a fingerprint; kept the last record of each",
                set.collisions
            );
        }
        Ok(set)
    }

    /// Total fingerprints across all groups.
    pub fn len(&self) -> usize {
        self.groups.values().map(FxHashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

fn parse_frames<'a>(tokens: impl Iterator<Item = &'a str>, lineno: usize) -> Option<Vec<Pc>> {
    let mut trace = Vec::new();
    for token in tokens {
        match u64::from_str_radix(token, 16) {
            Ok(pc) => trace.push(pc),
            Err(_) => {
                warn!("discarding record on line {lineno}: invalid frame \"{token}\"");
                return None;
            }
        }
    }
    Some(trace)
}
