//! Translation driver
//!
//! ```text
//!   PrdReader ──► preload scan (registry records of pid 0, or all in
//!       │         byte-range mode)
//!       │
//!       ├──► worker 0 ─┐   RecordProcessor: registry, builder, aggregator
//!       ├──► worker 1 ─┼──► crossbeam channel ──► merge ──► normalize ──► sink
//!       └──► worker N ─┘
//! ```
//!
//! Workers are scoped threads that borrow the reader and the registry. Each
//! sends one [`WorkerOutput`] back; the merge and normalization run on the
//! calling thread.

use crossbeam_channel::unbounded;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::normalize::{normalize, NormalizeInput};
use super::progress::{CancellationToken, ProgressReporter, ProgressSink};
use super::worker::{RecordProcessor, WorkerContext, WorkerOutput};
use crate::aggregation::{PrdTranslationStats, SampleAggregator, SharedTranslationStats};
use crate::config::{PartitionMode, TranslateConfig};
use crate::domain::{FunctionKey, Pid, TranslateError};
use crate::export::{MissedInfo, NormalizedProfile, ProfileSink, ProfileStatus};
use crate::prd::{PrdReader, RecordBody};
use crate::registry::{JsonTaskInfo, NoTaskInfo, Registry, TaskInfo};
use crate::symbolization::{FunctionDesc, NullSymbolProvider, SymbolProvider};

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationOutcome {
    Complete,
    /// Cancelled; counts cover the records processed until then
    Partial,
}

/// Summary of a finished run
#[derive(Debug, Clone)]
pub struct TranslationReport {
    pub outcome: TranslationOutcome,
    pub missed: MissedInfo,
    pub stats: PrdTranslationStats,
    /// Records handled by their owning worker
    pub records_processed: u64,
    pub bytes_processed: u64,
    pub workers: usize,
}

impl TranslationReport {
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.outcome == TranslationOutcome::Partial
    }

    /// Complete, with every byte of the trace decoded
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.outcome == TranslationOutcome::Complete
            && self.missed.missed_count == 0
            && self.missed.skipped_bytes == 0
    }
}

/// Translates PRD traces into normalized profiles
///
/// Owns everything a run shares between workers; nothing is global.
pub struct PrdTranslator {
    config: TranslateConfig,
    symbols: Arc<dyn SymbolProvider>,
    task_info: Option<Arc<dyn TaskInfo>>,
    progress: Option<Arc<dyn ProgressSink>>,
    cancel: CancellationToken,
}

impl PrdTranslator {
    #[must_use]
    pub fn new(config: TranslateConfig) -> Self {
        Self {
            config,
            symbols: Arc::new(NullSymbolProvider),
            task_info: None,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_symbols(mut self, symbols: Arc<dyn SymbolProvider>) -> Self {
        self.symbols = symbols;
        self
    }

    #[must_use]
    pub fn with_task_info(mut self, task_info: Arc<dyn TaskInfo>) -> Self {
        self.task_info = Some(task_info);
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Token that cancels a running translation
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn config(&self) -> &TranslateConfig {
        &self.config
    }

    /// Open `path` and translate it into `sink`
    ///
    /// Loads the task-info file when configured, or the trace's companion
    /// `.ti` file when one exists.
    ///
    /// # Errors
    /// Returns `FileFormat`/`Open` errors for unreadable traces, task-info
    /// errors, fatal registry errors and sink errors
    pub fn translate_file(
        &self,
        path: impl AsRef<Path>,
        sink: &mut dyn ProfileSink,
    ) -> Result<TranslationReport, TranslateError> {
        let path = path.as_ref();
        let reader = PrdReader::open(path)?;
        info!(
            "{}: {} bytes of records, {} cpus",
            path.display(),
            reader.data_range().len(),
            reader.header().cpu_count
        );

        if self.task_info.is_some() {
            return self.translate(&reader, sink);
        }
        let task_info_path = match &self.config.task_info_path {
            Some(configured) => Some(configured.clone()),
            None => Some(JsonTaskInfo::default_path(path)).filter(|p| p.exists()),
        };
        match task_info_path {
            Some(ti) => {
                debug!("task info: {}", ti.display());
                let task_info: Arc<dyn TaskInfo> = Arc::new(JsonTaskInfo::load(&ti)?);
                self.run(&reader, task_info, sink)
            }
            None => self.translate(&reader, sink),
        }
    }

    /// Translate an opened trace into `sink`
    ///
    /// # Errors
    /// Returns fatal registry errors and sink errors; nothing is written to
    /// the sink on a fatal error
    pub fn translate(
        &self,
        reader: &PrdReader,
        sink: &mut dyn ProfileSink,
    ) -> Result<TranslationReport, TranslateError> {
        let task_info = self.task_info.clone().unwrap_or_else(|| Arc::new(NoTaskInfo));
        self.run(reader, task_info, sink)
    }

    /// Translate an opened trace and return the profile
    ///
    /// # Errors
    /// Returns fatal registry errors
    pub fn translate_to_profile(
        &self,
        reader: &PrdReader,
    ) -> Result<(TranslationReport, NormalizedProfile), TranslateError> {
        let task_info = self.task_info.clone().unwrap_or_else(|| Arc::new(NoTaskInfo));
        self.translate_inner(reader, task_info.as_ref())
    }

    fn run(
        &self,
        reader: &PrdReader,
        task_info: Arc<dyn TaskInfo>,
        sink: &mut dyn ProfileSink,
    ) -> Result<TranslationReport, TranslateError> {
        let (report, profile) = self.translate_inner(reader, task_info.as_ref())?;
        sink.write_profile(&profile)?;
        Ok(report)
    }

    fn translate_inner(
        &self,
        reader: &PrdReader,
        task_info: &dyn TaskInfo,
    ) -> Result<(TranslationReport, NormalizedProfile), TranslateError> {
        let config = &self.config;
        let workers = config.effective_workers();
        let registry = Registry::new(config.lock_timeout);

        let preload_unloads = preload(reader, &registry, config.partition)?;

        let data_len = reader.data_range().len();
        let total = match config.partition {
            PartitionMode::ByProcess => data_len.saturating_mul(workers as u64),
            PartitionMode::ByteRange => data_len,
        };
        let progress = ProgressReporter::new(self.progress.clone(), total);
        let shared_stats = SharedTranslationStats::default();
        let abort = AtomicBool::new(false);
        let ctx = WorkerContext {
            registry: &registry,
            config,
            task_info,
            symbols: Arc::clone(&self.symbols),
            cancel: &self.cancel,
            abort: &abort,
            progress: &progress,
            shared_stats: &shared_stats,
        };

        let outputs = run_workers(reader, &ctx, workers)?;
        let cancelled = outputs.iter().any(|o| o.cancelled) || self.cancel.is_cancelled();
        if !cancelled {
            progress.finish();
        }

        // Single-threaded merge
        let mut samples = SampleAggregator::default();
        let mut functions: HashMap<FunctionKey, FunctionDesc> = HashMap::new();
        let mut missed = MissedInfo { inconsistent_unloads: preload_unloads, ..MissedInfo::default() };
        let mut records_processed = 0;
        let mut bytes_processed = 0;
        for output in outputs {
            samples.merge(output.samples);
            functions.extend(output.functions);
            missed.missed_count += output.missed.decode_errors;
            missed.skipped_bytes += output.missed.skipped_bytes;
            missed.inconsistent_unloads += output.missed.inconsistent_unloads;
            missed.filtered_samples += output.missed.filtered_samples;
            missed.excluded_samples += output.missed.excluded_samples;
            missed.orphan_call_stacks += output.counters.orphan;
            records_processed += output.records_processed;
            bytes_processed += output.bytes_processed;
        }
        missed.unresolved_samples = samples.unresolved();
        missed.worst_event = samples.worst_event();

        let outcome =
            if cancelled { TranslationOutcome::Partial } else { TranslationOutcome::Complete };
        let stats = shared_stats.snapshot();
        let profile = normalize(&NormalizeInput {
            header: reader.header(),
            registry: &registry,
            task_info,
            samples: &samples,
            functions: &functions,
            status: match outcome {
                TranslationOutcome::Complete => ProfileStatus::Complete,
                TranslationOutcome::Partial => ProfileStatus::Partial,
            },
            missed,
            stats: config.collect_stats.then_some(&stats),
        })?;

        if missed.missed_count > 0 {
            warn!(
                "{} undecodable records skipped ({} bytes unreadable)",
                missed.missed_count, missed.skipped_bytes
            );
        }
        info!(
            "translated {} records: {} samples, {} functions, {} call stacks{}",
            records_processed,
            profile.total_samples(),
            profile.functions.len(),
            profile.call_stacks.len(),
            if cancelled { " (cancelled)" } else { "" }
        );

        let report = TranslationReport {
            outcome,
            missed,
            stats,
            records_processed,
            bytes_processed,
            workers,
        };
        Ok((report, profile))
    }
}

/// Apply registry records before the workers start
///
/// Returns the number of inconsistent unloads seen. Undecodable records are
/// left for the workers to count.
fn preload(
    reader: &PrdReader,
    registry: &Registry,
    mode: PartitionMode,
) -> Result<u64, TranslateError> {
    let mut inconsistent = 0;
    let mut applied = 0u64;
    for item in reader.records() {
        let Ok(at) = item else {
            continue;
        };
        let record = at.record;
        let header = record.header;
        if !record.is_registry_event() {
            continue;
        }
        if mode == PartitionMode::ByProcess && header.pid != Pid::SYSTEM {
            continue;
        }
        applied += 1;
        match record.body {
            RecordBody::ModuleLoad { load_addr, size, flags, path } => {
                registry.load_module(header.pid, load_addr, size, flags, &path, header.timestamp)?;
            }
            RecordBody::ModuleUnload { load_addr } => {
                if let Err(e) = registry.unload_module(header.pid, load_addr, header.timestamp)? {
                    warn!("{e}");
                    inconsistent += 1;
                }
            }
            RecordBody::ProcessStart { parent, is_32bit, name } => {
                registry.start_process(header.pid, parent, &name, is_32bit, header.timestamp)?;
            }
            RecordBody::ProcessExit { exit_code } => {
                registry.exit_process(header.pid, exit_code, header.timestamp)?;
            }
            _ => {}
        }
    }
    debug!("preload applied {applied} registry records");
    Ok(inconsistent)
}

fn run_workers(
    reader: &PrdReader,
    ctx: &WorkerContext<'_>,
    workers: usize,
) -> Result<Vec<WorkerOutput>, TranslateError> {
    let ranges = match ctx.config.partition {
        PartitionMode::ByProcess => vec![reader.data_range(); workers],
        PartitionMode::ByteRange => reader.partitions(workers),
    };
    let (tx, rx) = unbounded();

    let joined = std::thread::scope(|s| {
        let handles: Vec<_> = ranges
            .into_iter()
            .enumerate()
            .map(|(index, range)| {
                let tx = tx.clone();
                s.spawn(move || {
                    let result = RecordProcessor::new(index, workers, ctx).run(reader, range);
                    if result.is_err() {
                        ctx.abort.store(true, Ordering::Relaxed);
                    }
                    // The receiver outlives the scope
                    let _ = tx.send(result);
                })
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(index, handle)| handle.join().map_err(|_| index))
            .collect::<Vec<_>>()
    });
    drop(tx);

    if let Some(Err(index)) = joined.into_iter().find(Result::is_err) {
        return Err(TranslateError::WorkerPanicked(index));
    }

    let mut outputs = Vec::with_capacity(workers);
    for result in rx.try_iter() {
        outputs.push(result?);
    }
    outputs.sort_by_key(|o| o.index);
    Ok(outputs)
}
