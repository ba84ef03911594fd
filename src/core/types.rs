//! Core types used throughout hashtrace: program counters, stack traces, and
//! per-fingerprint bookkeeping.

use rustc_hash::FxHashMap;

/// A program counter: a function entry address, a call-site address, or one
/// frame of a recorded stack. Nothing beyond equality is ever computed on
/// these.
pub type Pc = u64;

/// Type tag assigned by the instrumenting compiler. Call sites and candidate
/// targets carrying the same tag are compatible for indirect dispatch.
pub type TypeId = u64;

/// A recorded call stack, innermost call site first.
pub type StackTrace = Vec<Pc>;

/// One predecessor edge in the reverse call graph: `caller` may transfer
/// control to the edge's target from the call instruction at `site`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub caller: Pc,
    pub site: Pc,
}

/// Bookkeeping for one recorded fingerprint. The trace and fingerprint are
/// inputs; the match fields are filled in by the reconstruction walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StInfo {
    /// The original stack trace, kept for verifying candidate matches.
    pub trace: StackTrace,
    pub fingerprint: u64,
    /// Hash hits seen during the walk, correct and incorrect alike.
    pub hash_matches: u64,
    /// Whether any hit reproduced the original trace exactly.
    pub matched: bool,
}

impl StInfo {
    pub fn new(trace: StackTrace, fingerprint: u64) -> Self {
        StInfo {
            trace,
            fingerprint,
            hash_matches: 0,
            matched: false,
        }
    }

    /// Hash hits that turned out to be a different stack trace.
    pub fn incorrect_matches(&self) -> u64 {
        self.hash_matches - self.matched as u64
    }
}

/// The fingerprints to resolve for one innermost function, keyed by
/// fingerprint value.
pub type StInfoSet = FxHashMap<u64, StInfo>;
