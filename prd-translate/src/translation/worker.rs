//! # Record Processing
//!
//! One [`RecordProcessor`] runs per worker thread. It walks its byte range
//! and routes every record it owns to the registry, the call-stack builder
//! and the sample aggregator.
//!
//! ## Record Routing
//!
//! - `Sample`, `IbsFetch`, `IbsOp` → sample aggregator (+ CLU model, builder age)
//! - `KernelCallStack`, `UserCallStack` → call-stack builder
//! - `ModuleLoad`, `ModuleUnload` → registry, then builder retry
//! - `ProcessStart`, `ProcessExit` → registry, then builder/CLU flush
//!
//! ## Ownership
//!
//! In by-process mode every worker reads the whole trace and owns the pids
//! with `pid % workers == index`; only worker 0 counts undecodable records
//! and skipped bytes.
//! In byte-range mode a worker owns every record of its range, and registry
//! records were already applied by the preload scan.

use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::progress::{CancellationToken, ProgressReporter};
use crate::aggregation::ibs::{derived_event_mask, fetch_events, is_tracked_access, op_events};
use crate::aggregation::{
    CluAnalyzer, CluSite, SampleAggregator, SharedTranslationStats, StatKind,
};
use crate::callstack::{BuilderCounters, CallStackBuilder};
use crate::config::{PartitionMode, TranslateConfig};
use crate::domain::{FunctionKey, ModuleId, Pid, TranslateError};
use crate::prd::{ByteRange, PrdReader, Record, RecordBody, RecordHeader};
use crate::registry::{ModuleInfo, Registry, TaskInfo};
use crate::symbolization::{FunctionDesc, Site, SiteResolver, SymbolProvider};

/// Shared, read-only dependencies of every worker
pub(crate) struct WorkerContext<'a> {
    pub registry: &'a Registry,
    pub config: &'a TranslateConfig,
    pub task_info: &'a dyn TaskInfo,
    pub symbols: Arc<dyn SymbolProvider>,
    pub cancel: &'a CancellationToken,
    /// Set when any worker failed; the others stop early
    pub abort: &'a AtomicBool,
    pub progress: &'a ProgressReporter,
    pub shared_stats: &'a SharedTranslationStats,
}

/// Per-record conditions counted by one worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MissedCounts {
    pub decode_errors: u64,
    pub skipped_bytes: u64,
    pub inconsistent_unloads: u64,
    pub filtered_samples: u64,
    pub excluded_samples: u64,
}

/// Everything a worker hands back to the driver
pub(crate) struct WorkerOutput {
    pub index: usize,
    pub samples: SampleAggregator,
    pub functions: HashMap<FunctionKey, FunctionDesc>,
    pub missed: MissedCounts,
    pub counters: BuilderCounters,
    pub records_processed: u64,
    pub bytes_processed: u64,
    pub cancelled: bool,
}

/// Encapsulates the per-worker translation state
pub(crate) struct RecordProcessor<'a> {
    index: usize,
    workers: usize,
    mode: PartitionMode,
    ctx: &'a WorkerContext<'a>,

    // Mutable state
    resolver: SiteResolver<'a>,
    builder: CallStackBuilder,
    samples: SampleAggregator,
    clu: Option<CluAnalyzer>,
    /// Process filter decisions, dropped when a process (re)starts
    selected: HashMap<Pid, bool>,
    /// Whether a module is on the exclusion list
    excluded: HashMap<ModuleId, bool>,
    missed: MissedCounts,
    records_processed: u64,
}

impl<'a> RecordProcessor<'a> {
    #[must_use]
    pub(crate) fn new(index: usize, workers: usize, ctx: &'a WorkerContext<'a>) -> Self {
        let config = ctx.config;
        let stats = if config.collect_stats {
            crate::aggregation::PrdTranslationStats::timed()
        } else {
            crate::aggregation::PrdTranslationStats::default()
        };
        Self {
            index,
            workers: workers.max(1),
            mode: config.partition,
            ctx,
            resolver: SiteResolver::new(ctx.registry, Arc::clone(&ctx.symbols), stats),
            builder: CallStackBuilder::new(config.call_stack_config()),
            samples: SampleAggregator::default(),
            clu: config.clu.then(|| CluAnalyzer::new(config.clu_sets)),
            selected: HashMap::new(),
            excluded: HashMap::new(),
            missed: MissedCounts::default(),
            records_processed: 0,
        }
    }

    /// Translate every owned record of `range`
    ///
    /// # Errors
    /// Returns fatal registry errors (lock timeout)
    pub(crate) fn run(
        mut self,
        reader: &PrdReader,
        range: ByteRange,
    ) -> Result<WorkerOutput, TranslateError> {
        debug!("worker {}: bytes {}..{}", self.index, range.start, range.end);
        let mut records = reader.records_in(range);
        let mut consumed = 0u64;
        let mut cancelled = false;

        loop {
            if self.ctx.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if self.ctx.abort.load(Ordering::Relaxed) {
                break;
            }
            let before = records.position();
            let Some(item) = records.next() else {
                break;
            };
            match item {
                Ok(at) => {
                    if self.owns(at.record.header.pid) {
                        self.records_processed += 1;
                        self.process_record(&at.record)?;
                    }
                }
                Err(err) => {
                    if self.counts_decode_errors() {
                        self.missed.decode_errors += 1;
                        warn!("skipping record: {err}");
                    }
                }
            }
            let step = records.position() - before;
            consumed += step;
            self.ctx.progress.advance(step);
        }

        if self.counts_decode_errors() && records.skipped_bytes() > 0 {
            self.missed.skipped_bytes = records.skipped_bytes();
            warn!("worker {}: {} unreadable bytes skipped", self.index, self.missed.skipped_bytes);
        }
        if !cancelled {
            self.ctx.progress.advance(range.len().saturating_sub(consumed));
            consumed = range.len();
        }
        if !self.ctx.abort.load(Ordering::Relaxed) {
            self.finish_pending()?;
        }

        let counters = self.builder.counters();
        let (functions, stats) = self.resolver.finish();
        self.ctx.shared_stats.merge(&stats);
        debug!(
            "worker {}: {} records, {} samples{}",
            self.index,
            self.records_processed,
            self.samples.total(),
            if cancelled { " (cancelled)" } else { "" }
        );

        Ok(WorkerOutput {
            index: self.index,
            samples: self.samples,
            functions,
            missed: self.missed,
            counters,
            records_processed: self.records_processed,
            bytes_processed: consumed,
            cancelled,
        })
    }

    fn owns(&self, pid: Pid) -> bool {
        match self.mode {
            PartitionMode::ByProcess => pid.0 as usize % self.workers == self.index,
            PartitionMode::ByteRange => true,
        }
    }

    fn counts_decode_errors(&self) -> bool {
        self.mode == PartitionMode::ByteRange || self.index == 0
    }

    /// Registry records already applied by the preload scan
    fn preloaded(&self, pid: Pid) -> bool {
        self.mode == PartitionMode::ByteRange || pid.is_system()
    }

    // ========================================================================
    // Record routing
    // ========================================================================

    /// Process a single record
    fn process_record(&mut self, record: &Record) -> Result<(), TranslateError> {
        let header = &record.header;
        trace!("{} {} {}: {:?}", header.timestamp, header.pid, header.tid, record.body);

        match &record.body {
            RecordBody::Sample { event_mask, ip, weight } => {
                let weight = u64::from((*weight).max(1));
                if !self.is_selected(header.pid)? {
                    self.missed.filtered_samples += weight;
                    return Ok(());
                }
                let site = self.resolver.resolve_or_unknown(header.pid, *ip, header.timestamp)?;
                if self.is_excluded(&site) {
                    self.missed.excluded_samples += weight;
                    return Ok(());
                }
                self.samples.add_sample(header.pid, header.tid, header.core, *event_mask, site, weight);
                self.note_sample(header)?;
            }
            RecordBody::IbsFetch { ip, fetch_ctl, latency } => {
                if !self.is_selected(header.pid)? {
                    self.missed.filtered_samples += 1;
                    return Ok(());
                }
                let site = self.resolver.resolve_or_unknown(header.pid, *ip, header.timestamp)?;
                if self.is_excluded(&site) {
                    self.missed.excluded_samples += 1;
                    return Ok(());
                }
                for (select, weight) in fetch_events(*fetch_ctl, *latency) {
                    let event = derived_event_mask(select);
                    self.samples.add_sample(header.pid, header.tid, header.core, event, site, weight);
                }
                self.note_sample(header)?;
            }
            RecordBody::IbsOp(op) => {
                if !self.is_selected(header.pid)? {
                    self.missed.filtered_samples += 1;
                    return Ok(());
                }
                let site = self.resolver.resolve_or_unknown(header.pid, op.ip, header.timestamp)?;
                if self.is_excluded(&site) {
                    self.missed.excluded_samples += 1;
                    return Ok(());
                }
                for (select, weight) in op_events(op, self.ctx.config.ld_st) {
                    let event = derived_event_mask(select);
                    self.samples.add_sample(header.pid, header.tid, header.core, event, site, weight);
                }
                if let Some(clu) = &mut self.clu {
                    if is_tracked_access(op) {
                        let who = CluSite { tid: header.tid, core: header.core, site };
                        clu.record_access(header.pid, op.dc_lin_addr, op.op_size, who);
                        self.drain_clu();
                    }
                }
                self.note_sample(header)?;
            }
            RecordBody::KernelCallStack { event_mask, sample_ip, frames, user_pending } => {
                if self.ctx.config.call_stacks && self.is_selected(header.pid)? {
                    self.builder.add_kernel_fragment(
                        header,
                        *event_mask,
                        *sample_ip,
                        frames,
                        *user_pending,
                        &mut self.resolver,
                    )?;
                    self.fold_chains()?;
                }
            }
            RecordBody::UserCallStack { range_end, frames, .. } => {
                if self.ctx.config.call_stacks && self.is_selected(header.pid)? {
                    self.builder.add_user_fragment(header, *range_end, frames, &mut self.resolver)?;
                    self.fold_chains()?;
                }
            }
            RecordBody::ModuleLoad { load_addr, size, flags, path } => {
                if !self.preloaded(header.pid) {
                    let registry = self.ctx.registry;
                    self.resolver.stats_mut().time(StatKind::AddWorkingSetModule, || {
                        registry.load_module(
                            header.pid,
                            *load_addr,
                            *size,
                            *flags,
                            path,
                            header.timestamp,
                        )
                    })?;
                }
                if self.ctx.config.call_stacks {
                    self.builder.on_module_load(header.pid, &mut self.resolver)?;
                }
            }
            RecordBody::ModuleUnload { load_addr } => {
                if !self.preloaded(header.pid) {
                    let unload =
                        self.ctx.registry.unload_module(header.pid, *load_addr, header.timestamp)?;
                    if let Err(inconsistent) = unload {
                        warn!("{inconsistent}");
                        self.missed.inconsistent_unloads += 1;
                    }
                }
            }
            RecordBody::ProcessStart { parent, is_32bit, name } => {
                if !self.preloaded(header.pid) {
                    self.ctx.registry.start_process(
                        header.pid,
                        *parent,
                        name,
                        *is_32bit,
                        header.timestamp,
                    )?;
                }
                self.selected.remove(&header.pid);
            }
            RecordBody::ProcessExit { exit_code } => {
                if !self.preloaded(header.pid) {
                    self.ctx.registry.exit_process(header.pid, *exit_code, header.timestamp)?;
                }
                if self.ctx.config.call_stacks {
                    self.builder.on_process_exit(header.pid, &mut self.resolver)?;
                    self.fold_chains()?;
                }
                if let Some(clu) = &mut self.clu {
                    clu.flush_process(header.pid);
                    self.drain_clu();
                }
            }
        }
        Ok(())
    }

    fn note_sample(&mut self, header: &RecordHeader) -> Result<(), TranslateError> {
        if !self.ctx.config.call_stacks {
            return Ok(());
        }
        self.builder.note_sample(header.pid, header.tid, &mut self.resolver)?;
        self.fold_chains()
    }

    /// Whether samples of `pid` pass the process filter
    fn is_selected(&mut self, pid: Pid) -> Result<bool, TranslateError> {
        let config = self.ctx.config;
        if !config.has_filters() {
            return Ok(true);
        }
        if let Some(selected) = self.selected.get(&pid) {
            return Ok(*selected);
        }

        let selected = if config.target_pids.contains(&pid) {
            true
        } else {
            let name = self
                .ctx
                .registry
                .read_process(pid, |p| p.executable_name().map(str::to_string))?
                .flatten()
                .or_else(|| self.ctx.task_info.process_name(pid).map(|n| file_name(&n).to_string()));
            name.is_some_and(|name| {
                config.process_filters.iter().any(|f| file_name(f).eq_ignore_ascii_case(&name))
            })
        };
        debug!("{pid}: {}", if selected { "selected" } else { "filtered out" });
        self.selected.insert(pid, selected);
        Ok(selected)
    }

    /// Whether `site` lies in a module on the exclusion list, such as the
    /// profiling driver itself
    fn is_excluded(&mut self, site: &Site) -> bool {
        let excluded = &self.ctx.config.excluded_modules;
        if excluded.is_empty() {
            return false;
        }
        let Some(module) = site.function.module else {
            return false;
        };
        if let Some(hit) = self.excluded.get(&module) {
            return *hit;
        }
        let hit = match self.ctx.registry.module_info(module) {
            Some(info) if names_module(excluded, &info) => {
                debug!("worker {}: dropping samples in {}", self.index, info.path);
                true
            }
            _ => false,
        };
        self.excluded.insert(module, hit);
        hit
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Fold completed call chains into the process call graphs
    fn fold_chains(&mut self) -> Result<(), TranslateError> {
        let chains = self.builder.drain_completed();
        if chains.is_empty() {
            return Ok(());
        }
        let registry = self.ctx.registry;
        self.resolver.stats_mut().time(StatKind::TraverseCss, || {
            for chain in chains {
                registry.write_process(chain.pid, |p| p.call_graph.add_chain(chain))?;
            }
            Ok(())
        })
    }

    fn drain_clu(&mut self) {
        let Some(clu) = &mut self.clu else {
            return;
        };
        for event in clu.drain_events() {
            self.samples.add_sample(
                event.pid,
                event.at.tid,
                event.at.core,
                derived_event_mask(event.select),
                event.at.site,
                event.weight,
            );
        }
    }

    /// Complete pending stacks and flush the cache models
    fn finish_pending(&mut self) -> Result<(), TranslateError> {
        if self.ctx.config.call_stacks {
            self.builder.flush(&mut self.resolver)?;
            self.fold_chains()?;
        }
        if let Some(clu) = &mut self.clu {
            clu.flush_all();
            self.drain_clu();
        }
        Ok(())
    }
}

/// Last path component of a process name, filter or module path
fn file_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Whether any of `names` is the full path or the file name of `module`
fn names_module(names: &[String], module: &ModuleInfo) -> bool {
    names.iter().any(|name| {
        *name == module.path || file_name(name).eq_ignore_ascii_case(module.file_name())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("/usr/bin/app"), "app");
        assert_eq!(file_name("C:\\bin\\app.exe"), "app.exe");
        assert_eq!(file_name("app"), "app");
    }

    #[test]
    fn test_names_module() {
        let driver = ModuleInfo {
            path: "C:\\Windows\\System32\\drivers\\PCORE.sys".to_string(),
            size: 0x1000,
            flags: crate::prd::ModuleFlags::default(),
        };
        assert!(names_module(&["pcore.sys".to_string()], &driver));
        assert!(names_module(&["/any/dir/PCore.SYS".to_string()], &driver));
        assert!(!names_module(&["pcore".to_string()], &driver));
        assert!(!names_module(&[], &driver));
    }
}
