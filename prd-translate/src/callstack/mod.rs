//! Call-stack reconstruction
//!
//! - [`time_range`]: inclusive ranges that order by overlap
//! - [`builder`]: per-thread pairing of kernel and user fragments
//! - [`call_graph`]: completed stacks folded per process

pub mod builder;
pub mod call_graph;
pub mod time_range;

pub use builder::{
    BuilderCounters, CallStackBuilder, CallStackConfig, DEFAULT_MAX_STACK_DEPTH,
    DEFAULT_PARTIAL_COMPLETION_SAMPLES,
};
pub use call_graph::{CallGraph, CompletedChain, Leaf, LeafKey, StackNode};
pub use time_range::TimeRange;
