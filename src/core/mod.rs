pub mod callgraph;
pub mod hash;
pub mod reconstruct;
pub mod trace_set;
pub mod types;
