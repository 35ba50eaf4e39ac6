//! Per-thread call-stack reconstruction
//!
//! Kernel and user portions of a call stack are written as separate records:
//! the kernel fragment at sample time, the user fragment later and covering a
//! time range of the thread. The builder pairs them up.
//!
//! ## Pending stack states
//!
//! ```text
//!                  kernel fragment (user pending)
//!   Idle ───────────────────────────────────────────► AwaitingUser
//!     │                                                   │
//!     │ kernel fragment                user fragment,     │ gap, threshold,
//!     │ (complete)                     all modules known  │ process exit
//!     ▼                                                   ▼
//!   Resolved ◄────────────────────────────────────  PartiallyResolved
//!            user fragment resolves / module load retry
//! ```
//!
//! Per thread, pending stacks are kept sorted and pairwise disjoint by
//! [`TimeRange`]; a new fragment merges every pending stack it overlaps.
//! Resolved stacks stay pending until a strictly later fragment, the sample
//! threshold, process exit or the final flush, so late overlapping fragments
//! can still join them.

use std::collections::HashMap;

use super::call_graph::{CompletedChain, Leaf};
use super::time_range::TimeRange;
use crate::aggregation::stats::StatKind;
use crate::domain::{Pid, Tid, Timestamp, TranslateError};
use crate::prd::RecordHeader;
use crate::symbolization::{Site, SiteResolver};

/// Default number of samples after which pending stacks are force-completed
pub const DEFAULT_PARTIAL_COMPLETION_SAMPLES: u32 = 64;

/// Default maximum number of frames kept per stack
pub const DEFAULT_MAX_STACK_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStackConfig {
    /// Samples of a thread after which its pending stacks complete (0 = never)
    pub partial_completion_samples: u32,
    pub max_stack_depth: usize,
}

impl Default for CallStackConfig {
    fn default() -> Self {
        Self {
            partial_completion_samples: DEFAULT_PARTIAL_COMPLETION_SAMPLES,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
        }
    }
}

/// Chains emitted so far, by outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuilderCounters {
    pub complete: u64,
    pub partial: u64,
    /// User stacks without any sample attached
    pub orphan: u64,
}

#[derive(Debug, Clone)]
struct KernelPart {
    leaf: Leaf,
    frames: Vec<Site>,
}

#[derive(Debug, Clone)]
enum UserPortion {
    /// Not received yet
    Missing,
    /// Received, but some frame was outside every loaded module at `at`
    Unresolved { frames: Vec<u64>, at: Timestamp },
    Resolved(Vec<Site>),
}

#[derive(Debug, Clone)]
struct PendingStack {
    range: TimeRange,
    kernel: Vec<KernelPart>,
    user: UserPortion,
    /// Samples of the thread seen since the stack became pending
    age: u32,
}

impl PendingStack {
    fn is_resolved(&self) -> bool {
        matches!(self.user, UserPortion::Resolved(_))
    }
}

/// Collects finished chains
#[derive(Debug, Default)]
struct ChainSink {
    completed: Vec<CompletedChain>,
    counters: BuilderCounters,
}

impl ChainSink {
    fn emit(&mut self, chain: CompletedChain) {
        if chain.leaf.is_none() {
            self.counters.orphan += 1;
        }
        if chain.partial {
            self.counters.partial += 1;
        } else {
            self.counters.complete += 1;
        }
        self.completed.push(chain);
    }
}

/// Call-stack reconstruction state of one worker
#[derive(Debug, Default)]
pub struct CallStackBuilder {
    config: CallStackConfig,
    threads: HashMap<(Pid, Tid), Vec<PendingStack>>,
    sink: ChainSink,
}

impl CallStackBuilder {
    #[must_use]
    pub fn new(config: CallStackConfig) -> Self {
        Self { config, threads: HashMap::new(), sink: ChainSink::default() }
    }

    /// Add a kernel fragment
    ///
    /// # Errors
    /// Returns fatal registry errors from address resolution
    pub fn add_kernel_fragment(
        &mut self,
        header: &RecordHeader,
        event_mask: u64,
        sample_ip: u64,
        frames: &[u64],
        user_pending: bool,
        resolver: &mut SiteResolver<'_>,
    ) -> Result<(), TranslateError> {
        let (pid, tid, at) = (header.pid, header.tid, header.timestamp);
        let max_depth = self.config.max_stack_depth;

        let started = std::time::Instant::now();
        let site = resolver.resolve_or_unknown(pid, sample_ip, at)?;
        let frames = frames
            .iter()
            .take(max_depth)
            .map(|&ip| resolver.resolve_or_unknown(pid, ip, at))
            .collect::<Result<Vec<_>, _>>()?;
        record_elapsed(resolver, StatKind::AnalyzeCss, started);

        let part = KernelPart {
            leaf: Leaf { tid, core: header.core, event: event_mask, site },
            frames,
        };
        let range = TimeRange::at(at);
        self.complete_before(pid, tid, range, false, resolver)?;

        if !user_pending {
            resolver.stats_mut().time(StatKind::FinalizeKernelCss, || {
                self.sink.emit(CompletedChain {
                    pid,
                    tid,
                    frames: part.frames,
                    leaf: Some(part.leaf),
                    partial: false,
                });
            });
            return Ok(());
        }

        let pending = self.threads.entry((pid, tid)).or_default();
        match pending.binary_search_by(|p| p.range.position(&range)) {
            Ok(i) => pending[i].kernel.push(part),
            Err(i) => pending.insert(
                i,
                PendingStack { range, kernel: vec![part], user: UserPortion::Missing, age: 0 },
            ),
        }
        Ok(())
    }

    /// Add a user fragment covering `[header.timestamp, range_end]`
    ///
    /// # Errors
    /// Returns fatal registry errors from address resolution
    pub fn add_user_fragment(
        &mut self,
        header: &RecordHeader,
        range_end: Timestamp,
        frames: &[u64],
        resolver: &mut SiteResolver<'_>,
    ) -> Result<(), TranslateError> {
        let (pid, tid) = (header.pid, header.tid);
        let range = TimeRange::new(header.timestamp, range_end);
        self.complete_before(pid, tid, range, true, resolver)?;

        let started = std::time::Instant::now();
        let raw: Vec<u64> = frames.iter().take(self.config.max_stack_depth).copied().collect();
        let user = match resolve_all(pid, &raw, range.end, resolver)? {
            Some(sites) => UserPortion::Resolved(sites),
            None => UserPortion::Unresolved { frames: raw, at: range.end },
        };
        record_elapsed(resolver, StatKind::AnalyzeUserCss, started);

        let started = std::time::Instant::now();
        let pending = self.threads.entry((pid, tid)).or_default();
        let start = pending.partition_point(|p| p.range.is_before(&range));
        let end = pending.partition_point(|p| !range.is_before(&p.range));
        let mut merged = PendingStack { range, kernel: Vec::new(), user, age: 0 };
        for old in pending.drain(start..end) {
            merged.range = merged.range.union(&old.range);
            merged.kernel.extend(old.kernel);
            merged.age = merged.age.max(old.age);
        }
        pending.insert(start, merged);
        record_elapsed(resolver, StatKind::BuildCss, started);
        Ok(())
    }

    /// Count one sample of the thread; stacks pending for too long complete
    ///
    /// # Errors
    /// Returns fatal registry errors from address resolution
    pub fn note_sample(
        &mut self,
        pid: Pid,
        tid: Tid,
        resolver: &mut SiteResolver<'_>,
    ) -> Result<(), TranslateError> {
        let threshold = self.config.partial_completion_samples;
        let Some(pending) = self.threads.get_mut(&(pid, tid)) else {
            return Ok(());
        };
        if threshold == 0 {
            return Ok(());
        }
        let mut expired = Vec::new();
        let mut kept = Vec::with_capacity(pending.len());
        for mut stack in pending.drain(..) {
            stack.age += 1;
            if stack.age >= threshold {
                expired.push(stack);
            } else {
                kept.push(stack);
            }
        }
        *pending = kept;
        for stack in expired {
            self.finalize(pid, tid, stack, resolver)?;
        }
        Ok(())
    }

    /// Retry user stacks of `pid` that were waiting for a module
    ///
    /// # Errors
    /// Returns fatal registry errors from address resolution
    pub fn on_module_load(
        &mut self,
        pid: Pid,
        resolver: &mut SiteResolver<'_>,
    ) -> Result<(), TranslateError> {
        for ((stack_pid, _), pending) in &mut self.threads {
            if *stack_pid != pid {
                continue;
            }
            for stack in pending.iter_mut() {
                let UserPortion::Unresolved { frames, at } = &stack.user else {
                    continue;
                };
                if let Some(sites) = resolve_all(pid, frames, *at, resolver)? {
                    stack.user = UserPortion::Resolved(sites);
                }
            }
        }
        Ok(())
    }

    /// Complete every pending stack of `pid`
    ///
    /// # Errors
    /// Returns fatal registry errors from address resolution
    pub fn on_process_exit(
        &mut self,
        pid: Pid,
        resolver: &mut SiteResolver<'_>,
    ) -> Result<(), TranslateError> {
        let mut keys: Vec<(Pid, Tid)> =
            self.threads.keys().filter(|(p, _)| *p == pid).copied().collect();
        keys.sort_unstable();
        for key in keys {
            if let Some(pending) = self.threads.remove(&key) {
                for stack in pending {
                    self.finalize(key.0, key.1, stack, resolver)?;
                }
            }
        }
        Ok(())
    }

    /// Complete every pending stack
    ///
    /// # Errors
    /// Returns fatal registry errors from address resolution
    pub fn flush(&mut self, resolver: &mut SiteResolver<'_>) -> Result<(), TranslateError> {
        let mut threads: Vec<_> = self.threads.drain().collect();
        threads.sort_unstable_by_key(|(key, _)| *key);
        for ((pid, tid), pending) in threads {
            for stack in pending {
                self.finalize(pid, tid, stack, resolver)?;
            }
        }
        Ok(())
    }

    /// Take the chains completed since the last call
    pub fn drain_completed(&mut self) -> Vec<CompletedChain> {
        std::mem::take(&mut self.sink.completed)
    }

    #[must_use]
    pub fn counters(&self) -> BuilderCounters {
        self.sink.counters
    }

    /// Stacks still waiting for a fragment
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.threads.values().map(Vec::len).sum()
    }

    /// Complete the stacks of the thread that lie strictly before `range`
    ///
    /// Resolved stacks always complete. Stacks still waiting for their user
    /// portion complete partially when a user fragment arrives after them,
    /// since that fragment can no longer cover them.
    fn complete_before(
        &mut self,
        pid: Pid,
        tid: Tid,
        range: TimeRange,
        user_fragment: bool,
        resolver: &mut SiteResolver<'_>,
    ) -> Result<(), TranslateError> {
        let Some(pending) = self.threads.get_mut(&(pid, tid)) else {
            return Ok(());
        };
        let split = pending.partition_point(|p| p.range.is_before(&range));
        if split == 0 {
            return Ok(());
        }
        let mut done = Vec::new();
        let mut kept = Vec::new();
        for stack in pending.drain(..split) {
            let gap = user_fragment && matches!(stack.user, UserPortion::Missing);
            if stack.is_resolved() || gap {
                done.push(stack);
            } else {
                kept.push(stack);
            }
        }
        kept.append(pending);
        *pending = kept;
        for stack in done {
            self.finalize(pid, tid, stack, resolver)?;
        }
        Ok(())
    }

    fn finalize(
        &mut self,
        pid: Pid,
        tid: Tid,
        stack: PendingStack,
        resolver: &mut SiteResolver<'_>,
    ) -> Result<(), TranslateError> {
        let max_depth = self.config.max_stack_depth;
        let started = std::time::Instant::now();
        let (user, partial, kind) = match stack.user {
            UserPortion::Resolved(sites) => (sites, false, StatKind::FinalizeUserCss),
            UserPortion::Missing => (Vec::new(), true, StatKind::FinalizePartialUserCss),
            UserPortion::Unresolved { frames, at } => {
                let sites = frames
                    .iter()
                    .map(|&ip| resolver.resolve_or_unknown(pid, ip, at))
                    .collect::<Result<Vec<_>, _>>()?;
                (sites, true, StatKind::FinalizePartialUserCss)
            }
        };

        if stack.kernel.is_empty() {
            if !user.is_empty() {
                let mut frames = user;
                frames.truncate(max_depth);
                self.sink.emit(CompletedChain { pid, tid, frames, leaf: None, partial });
            }
        } else {
            for part in stack.kernel {
                let mut frames = part.frames;
                frames.extend(user.iter().copied());
                frames.truncate(max_depth);
                let leaf = Some(part.leaf);
                self.sink.emit(CompletedChain { pid, tid, frames, leaf, partial });
            }
        }
        record_elapsed(resolver, kind, started);
        Ok(())
    }
}

/// Resolve every frame, or `None` if any frame is outside all loaded modules
fn resolve_all(
    pid: Pid,
    frames: &[u64],
    at: Timestamp,
    resolver: &mut SiteResolver<'_>,
) -> Result<Option<Vec<Site>>, TranslateError> {
    let mut sites = Vec::with_capacity(frames.len());
    for &ip in frames {
        match resolver.resolve(pid, ip, at)? {
            Some(site) => sites.push(site),
            None => return Ok(None),
        }
    }
    Ok(Some(sites))
}

fn record_elapsed(resolver: &mut SiteResolver<'_>, kind: StatKind, started: std::time::Instant) {
    let micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
    resolver.stats_mut().record(kind, micros);
}
