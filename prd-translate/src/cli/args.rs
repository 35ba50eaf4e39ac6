//! CLI argument definitions

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::callstack::{DEFAULT_MAX_STACK_DEPTH, DEFAULT_PARTIAL_COMPLETION_SAMPLES};
use crate::config::{PartitionMode, TranslateConfig};
use crate::domain::Pid;

#[derive(Parser, Debug)]
#[command(
    name = "prd-translate",
    about = "Translate raw PRD sampling traces into normalized profiles",
    after_help = "\
EXAMPLES:
    prd-translate run.prd                          Write run.profile.json
    prd-translate run.prd -o out.json --elf-symbols
    prd-translate run.prd --process app --pid 4242 Only translate app and PID 4242
    prd-translate run.prd -j 8 --partition bytes   Eight workers over byte ranges"
)]
pub struct Args {
    /// Raw trace file
    #[arg(value_name = "TRACE")]
    pub trace: PathBuf,

    /// Output profile (default: <TRACE>.profile.json)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Task-info file (default: <TRACE>.ti if present)
    #[arg(long, value_name = "FILE")]
    pub task_info: Option<PathBuf>,

    /// JSON symbol table
    #[arg(long, value_name = "FILE", conflicts_with = "elf_symbols")]
    pub symbols: Option<PathBuf>,

    /// Read function symbols from the module files themselves
    #[arg(long)]
    pub elf_symbols: bool,

    /// Directory module paths are resolved against with --elf-symbols
    #[arg(long, value_name = "DIR", requires = "elf_symbols")]
    pub sysroot: Option<PathBuf>,

    /// Worker threads (0 = one per CPU)
    #[arg(short = 'j', long, default_value = "0")]
    pub jobs: usize,

    /// How records are split between workers
    #[arg(long, value_enum, default_value = "process")]
    pub partition: PartitionArg,

    /// Only translate processes with this executable name (repeatable)
    #[arg(long = "process", value_name = "NAME")]
    pub processes: Vec<String>,

    /// Always translate this process ID (repeatable)
    #[arg(long = "pid", value_name = "PID")]
    pub pids: Vec<u32>,

    /// Drop samples that land in this module, e.g. the profiling driver (repeatable)
    #[arg(long = "exclude-module", value_name = "NAME")]
    pub excluded_modules: Vec<String>,

    /// Skip call-stack reconstruction
    #[arg(long)]
    pub no_callstacks: bool,

    /// Cache-line utilization analysis of IBS loads and stores
    #[arg(long)]
    pub clu: bool,

    /// Derive load/store events from IBS op samples
    #[arg(long)]
    pub ld_st: bool,

    /// Time translation stages and include them in the profile
    #[arg(long)]
    pub stats: bool,

    /// Maximum frames kept per call stack
    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_STACK_DEPTH)]
    pub max_depth: usize,

    /// Samples after which a waiting call stack completes without its user part
    #[arg(long, value_name = "N", default_value_t = DEFAULT_PARTIAL_COMPLETION_SAMPLES)]
    pub partial_after: u32,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionArg {
    /// Workers own process ids
    Process,
    /// Workers own byte ranges of the trace
    Bytes,
}

impl Args {
    /// Translation settings described by the arguments
    #[must_use]
    pub fn to_config(&self) -> TranslateConfig {
        TranslateConfig {
            workers: self.jobs,
            partition: match self.partition {
                PartitionArg::Process => PartitionMode::ByProcess,
                PartitionArg::Bytes => PartitionMode::ByteRange,
            },
            process_filters: self.processes.clone(),
            target_pids: self.pids.iter().copied().map(Pid).collect(),
            excluded_modules: self.excluded_modules.clone(),
            call_stacks: !self.no_callstacks,
            clu: self.clu,
            ld_st: self.ld_st,
            collect_stats: self.stats,
            max_stack_depth: self.max_depth,
            partial_completion_samples: self.partial_after,
            task_info_path: self.task_info.clone(),
            ..TranslateConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let args = Args::try_parse_from(["prd-translate", "run.prd"]).unwrap();
        assert_eq!(args.trace, PathBuf::from("run.prd"));
        assert_eq!(args.partition, PartitionArg::Process);
        let config = args.to_config();
        assert!(config.call_stacks);
        assert_eq!(config.workers, 0);
        assert_eq!(config.max_stack_depth, DEFAULT_MAX_STACK_DEPTH);
    }

    #[test]
    fn test_parse_filters_and_flags() {
        let args = Args::try_parse_from([
            "prd-translate",
            "run.prd",
            "--process",
            "app",
            "--process",
            "other",
            "--pid",
            "42",
            "--partition",
            "bytes",
            "-j",
            "4",
            "--no-callstacks",
            "--clu",
            "--partial-after",
            "8",
            "--exclude-module",
            "pcore.sys",
        ])
        .unwrap();
        let config = args.to_config();
        assert_eq!(config.process_filters, vec!["app".to_string(), "other".to_string()]);
        assert_eq!(config.target_pids, vec![Pid(42)]);
        assert_eq!(config.partition, PartitionMode::ByteRange);
        assert_eq!(config.workers, 4);
        assert!(!config.call_stacks);
        assert!(config.clu);
        assert_eq!(config.partial_completion_samples, 8);
        assert_eq!(config.excluded_modules, vec!["pcore.sys".to_string()]);
    }

    #[test]
    fn test_symbols_conflict() {
        let result = Args::try_parse_from([
            "prd-translate",
            "run.prd",
            "--symbols",
            "s.json",
            "--elf-symbols",
        ]);
        assert!(result.is_err());
    }
}
