//! Sample aggregation, derived IBS/CLU events and stage statistics

pub mod aggregator;
pub mod clu;
pub mod ibs;
pub mod stats;

pub use aggregator::{SampleAggregator, SampleKey};
pub use clu::{CluAnalyzer, CluEvent, CluSite, DEFAULT_CLU_SETS};
pub use stats::{PrdTranslationStats, SharedTranslationStats, StatKind, StatValue};
