//! Depth-first reconstruction over the reverse call graph.
//!
//! One walk probes every fingerprint recorded for a single innermost
//! function. The running two-lane hash is checked against the whole
//! fingerprint set at every node, so all targets are matched in one
//! traversal. At the mid depth the low lane (the rolling CRC of the sites
//! folded so far) is checked against the frozen prefix lanes of the sought
//! fingerprints; a miss there means no descendant can match, and the whole
//! subtree is abandoned.
//!
//! Cycles in the reverse graph are walked on purpose. A recursive function
//! contributes one candidate stack per unwinding depth, all of them
//! legitimate; the depth bound is the sole termination mechanism.

use rustc_hash::FxHashSet;

use crate::core::callgraph::CallGraph;
use crate::core::hash;
use crate::core::types::{Pc, StInfoSet};

/// Counters accumulated by one walk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DfsStats {
    /// Nodes visited, the root included.
    pub visited: u64,
    /// Subtrees abandoned at the mid depth.
    pub pruned: u64,
    /// Whether the optional node limit cut the walk short.
    pub truncated: bool,
}

/// Search parameters shared by all per-function walks.
pub struct Reconstructor<'a> {
    graph: &'a CallGraph,
    depth_limit: usize,
    mid_index: usize,
    node_limit: Option<u64>,
}

impl<'a> Reconstructor<'a> {
    pub fn new(
        graph: &'a CallGraph,
        depth_limit: usize,
        mid_index: usize,
        node_limit: Option<u64>,
    ) -> Self {
        Reconstructor {
            graph,
            depth_limit,
            mid_index,
            node_limit,
        }
    }

    /// Runs one walk rooted at `entry`, updating the match records in `set`
    /// in place.
    pub fn run(&self, entry: Pc, set: &mut StInfoSet) -> DfsStats {
        let mid_set = set.keys().map(|&fp| hash::mid_lane(fp)).collect();
        let mut walk = Walk {
            graph: self.graph,
            set,
            mid_set,
            buf: vec![0; self.depth_limit],
            depth_limit: self.depth_limit,
            mid_index: self.mid_index,
            node_limit: self.node_limit,
            stats: DfsStats::default(),
        };
        walk.visit(entry, 0, 0);
        walk.stats
    }
}

/// Mutable state of one walk. Everything the recursion touches lives here,
/// so results travel by reference instead of through globals, and the
/// working buffer is owned by exactly one walk.
struct Walk<'a, 'b> {
    graph: &'a CallGraph,
    set: &'b mut StInfoSet,
    mid_set: FxHashSet<u32>,
    buf: Vec<Pc>,
    depth_limit: usize,
    mid_index: usize,
    node_limit: Option<u64>,
    stats: DfsStats,
}

impl<'a> Walk<'a, '_> {
    fn visit(&mut self, entry: Pc, hash: u64, depth: usize) {
        self.stats.visited += 1;

        if self.set.contains_key(&hash) {
            self.record_match(hash, depth);
        }

        // At the mid depth the low lane holds the rolling CRC of the first
        // `mid_index` sites, the exact value a complete fingerprint froze
        // into its high lane.
        if depth == self.mid_index && !self.mid_set.contains(&(hash as u32)) {
            self.stats.pruned += 1;
            return;
        }
        if depth == self.depth_limit {
            return;
        }
        if let Some(limit) = self.node_limit {
            if self.stats.visited >= limit {
                self.stats.truncated = true;
                return;
            }
        }

        let graph: &'a CallGraph = self.graph;
        for &edge in graph.callers_of(entry) {
            self.buf[depth] = edge.site;
            let next = hash::step(hash, edge.site, depth, self.mid_index);
            self.visit(edge.caller, next, depth + 1);
        }
    }

    /// The running hash is a key of the fingerprint set: verify the
    /// candidate against the stored trace and account the hit.
    fn record_match(&mut self, hash: u64, depth: usize) {
        let candidate = &self.buf[..depth];
        // Disagreement between the rolled hash and a recomputation is a bug
        // in the fold, not bad input.
        assert_eq!(
            hash::fingerprint(candidate, self.mid_index),
            hash,
            "running hash diverged from recomputation"
        );
        if let Some(info) = self.set.get_mut(&hash) {
            if candidate == info.trace.as_slice() {
                info.matched = true;
            }
            info.hash_matches += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::trace_set::TraceSet;
    use crate::core::types::StInfo;

    const CHAIN: &str = "\
FUNCTION SYMBOLS
100 main
200 foo
300 bar

DIRECT CALL SITES
100 150 200
200 250 300
";

    const RECURSIVE: &str = "\
FUNCTION SYMBOLS
100 bar

DIRECT CALL SITES
100 110 100
";

    const INDIRECT: &str = "\
INDIRECT TARGETS TYPES
7 200 300

INDIRECT CALLS TYPES
7 160

INDIRECT CALL SITES
100 160

FUNCTION SYMBOLS
100 ind
200 foo
300 bar
";

    fn graph(text: &str) -> CallGraph {
        CallGraph::parse(text.as_bytes()).unwrap()
    }

    fn load(text: &str, depth_limit: usize, mid_index: usize) -> TraceSet {
        TraceSet::read(text.as_bytes(), depth_limit, mid_index).unwrap()
    }

    fn resolve(
        graph: &CallGraph,
        set: &mut TraceSet,
        func: &str,
        depth_limit: usize,
        mid_index: usize,
        node_limit: Option<u64>,
    ) -> DfsStats {
        let entry = graph.entry_by_name(func).unwrap();
        let group = set.groups.get_mut(func).unwrap();
        Reconstructor::new(graph, depth_limit, mid_index, node_limit).run(entry, group)
    }

    #[test]
    fn resolves_direct_chain() {
        let graph = graph(CHAIN);
        let mut set = load("bar 250 150\n", 5, 2);
        let stats = resolve(&graph, &mut set, "bar", 5, 2, None);
        let info = set.groups["bar"].values().next().unwrap();
        assert!(info.matched);
        assert_eq!(info.hash_matches, 1);
        assert_eq!(info.incorrect_matches(), 0);
        assert_eq!(stats.visited, 3);
        assert!(!stats.truncated);
    }

    #[test]
    fn recursion_terminates_at_the_depth_bound() {
        let graph = graph(RECURSIVE);
        let mut set = load("bar 110 110 110 110 110\n", 5, 2);
        let stats = resolve(&graph, &mut set, "bar", 5, 2, None);
        let info = set.groups["bar"].values().next().unwrap();
        assert!(info.matched);
        // One chain of depth five: the root plus one node per frame.
        assert_eq!(stats.visited, 6);
        assert_eq!(stats.pruned, 0);
    }

    #[test]
    fn indirect_fan_out_resolves_every_target() {
        let graph = graph(INDIRECT);
        let mut set = load("foo 160\nbar 160\n", 5, 2);
        for func in ["foo", "bar"] {
            resolve(&graph, &mut set, func, 5, 2, None);
            let info = set.groups[func].values().next().unwrap();
            assert!(info.matched, "{func} should resolve");
            assert_eq!(info.hash_matches, 1);
        }
    }

    #[test]
    fn foreign_prefixes_are_pruned() {
        let graph = graph(CHAIN);
        // Neither trace starts with a call site reachable from bar.
        let mut set = load("bar 999 888\nbar 777 666\n", 3, 1);
        let stats = resolve(&graph, &mut set, "bar", 3, 1, None);
        assert_eq!(stats.pruned, 1);
        assert!(set.groups["bar"].values().all(|info| !info.matched));
    }

    #[test]
    fn planted_collision_counts_as_incorrect_match() {
        let graph = graph(CHAIN);
        // The walk will construct [250, 150]; plant its fingerprint with a
        // different stored trace.
        let planted = hash::fingerprint(&[0x250, 0x150], 2);
        let mut group = StInfoSet::default();
        group.insert(planted, StInfo::new(vec![0x999, 0x888], planted));
        let entry = graph.entry_by_name("bar").unwrap();
        Reconstructor::new(&graph, 5, 2, None).run(entry, &mut group);
        let info = &group[&planted];
        assert_eq!(info.hash_matches, 1);
        assert!(!info.matched);
        assert_eq!(info.incorrect_matches(), 1);
    }

    #[test]
    fn duplicate_edges_produce_duplicate_hits() {
        let graph = graph("DIRECT CALL SITES\n100 150 200\n100 150 200\n\nFUNCTION SYMBOLS\n200 foo\n");
        let mut set = load("foo 150\n", 2, 1);
        resolve(&graph, &mut set, "foo", 2, 1, None);
        let info = set.groups["foo"].values().next().unwrap();
        assert!(info.matched);
        assert_eq!(info.hash_matches, 2);
        assert_eq!(info.incorrect_matches(), 1);
    }

    #[test]
    fn node_limit_cuts_the_walk_short() {
        let graph = graph(RECURSIVE);
        let mut set = load("bar 110 110 110 110 110\n", 5, 2);
        let stats = resolve(&graph, &mut set, "bar", 5, 2, Some(3));
        assert!(stats.truncated);
        assert_eq!(stats.visited, 3);
        assert!(!set.groups["bar"].values().next().unwrap().matched);
    }

    #[test]
    fn root_without_callers_visits_one_node() {
        let graph = graph(CHAIN);
        let mut set = load("main 150\n", 5, 2);
        let stats = resolve(&graph, &mut set, "main", 5, 2, None);
        assert_eq!(stats.visited, 1);
        assert!(!set.groups["main"].values().next().unwrap().matched);
    }
}
