//! Translation settings
//!
//! Plain data consumed by [`crate::translation::PrdTranslator`]. The binary
//! builds it from command-line arguments; library users fill it directly.

use std::path::PathBuf;
use std::time::Duration;

use crate::aggregation::DEFAULT_CLU_SETS;
use crate::callstack::{CallStackConfig, DEFAULT_MAX_STACK_DEPTH, DEFAULT_PARTIAL_COMPLETION_SAMPLES};
use crate::domain::Pid;
use crate::registry::DEFAULT_LOCK_TIMEOUT;

/// How records are split between workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionMode {
    /// Every worker scans the whole trace and handles the pids hashed to it
    #[default]
    ByProcess,
    /// Worker `i` handles byte partition `i` after a full registry preload
    ByteRange,
}

#[derive(Debug, Clone)]
pub struct TranslateConfig {
    /// Worker threads; 0 picks the available parallelism
    pub workers: usize,
    /// Use `workers` as given instead of capping it at the available parallelism
    pub exact_workers: bool,
    pub partition: PartitionMode,
    /// Executable names to translate (case-insensitive); empty means all
    pub process_filters: Vec<String>,
    /// Pids translated regardless of `process_filters`
    pub target_pids: Vec<Pid>,
    /// Modules whose samples are dropped, by full path or file name
    /// (case-insensitive); meant for the profiling driver itself
    pub excluded_modules: Vec<String>,
    pub call_stacks: bool,
    /// Cache-line utilization analysis
    pub clu: bool,
    pub clu_sets: usize,
    /// Derive load/store events from IBS op samples
    pub ld_st: bool,
    /// Time translation stages
    pub collect_stats: bool,
    pub max_stack_depth: usize,
    pub partial_completion_samples: u32,
    pub lock_timeout: Duration,
    /// Task-info file; `None` uses the trace path with extension `ti` if present
    pub task_info_path: Option<PathBuf>,
}

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            exact_workers: false,
            partition: PartitionMode::default(),
            process_filters: Vec::new(),
            target_pids: Vec::new(),
            excluded_modules: Vec::new(),
            call_stacks: true,
            clu: false,
            clu_sets: DEFAULT_CLU_SETS,
            ld_st: false,
            collect_stats: false,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            partial_completion_samples: DEFAULT_PARTIAL_COMPLETION_SAMPLES,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            task_info_path: None,
        }
    }
}

impl TranslateConfig {
    /// Worker count actually used: configured value bounded by the hardware
    /// unless `exact_workers` is set
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        let available = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        match self.workers {
            0 => available,
            n if self.exact_workers => n,
            n => n.min(available),
        }
        .max(1)
    }

    #[must_use]
    pub fn call_stack_config(&self) -> CallStackConfig {
        CallStackConfig {
            partial_completion_samples: self.partial_completion_samples,
            max_stack_depth: self.max_stack_depth,
        }
    }

    /// Whether any process filtering is configured
    #[must_use]
    pub fn has_filters(&self) -> bool {
        !self.process_filters.is_empty() || !self.target_pids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TranslateConfig::default();
        assert_eq!(config.partition, PartitionMode::ByProcess);
        assert!(config.call_stacks);
        assert!(!config.clu);
        assert!(!config.has_filters());
        assert_eq!(config.call_stack_config().partial_completion_samples, 64);
    }

    #[test]
    fn test_effective_workers_bounded() {
        let config = TranslateConfig { workers: 10_000, ..TranslateConfig::default() };
        let workers = config.effective_workers();
        assert!(workers >= 1);
        assert!(workers < 10_000);
        let single = TranslateConfig { workers: 1, ..TranslateConfig::default() };
        assert_eq!(single.effective_workers(), 1);
    }

    #[test]
    fn test_exact_workers_are_not_capped() {
        let config = TranslateConfig { workers: 512, exact_workers: true, ..TranslateConfig::default() };
        assert_eq!(config.effective_workers(), 512);
        let auto = TranslateConfig { workers: 0, exact_workers: true, ..TranslateConfig::default() };
        assert!(auto.effective_workers() >= 1);
    }
}
