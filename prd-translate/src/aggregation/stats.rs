//! Translation stage statistics
//!
//! Every stage keeps a [`StatValue`]: how often it ran and, when collection
//! is enabled, how many microseconds it took in total. Workers fill a local
//! [`PrdTranslationStats`] and fold it into the run-wide
//! [`SharedTranslationStats`] when they finish.

use serde::Serialize;
use std::fmt;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Translation stages that are counted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatKind {
    FindModuleInfo,
    AddWorkingSetModule,
    QuerySymbolEngine,
    AnalyzeCss,
    AnalyzeUserCss,
    BuildCss,
    TraverseCss,
    FinalizeKernelCss,
    FinalizeUserCss,
    FinalizePartialUserCss,
}

impl StatKind {
    pub const COUNT: usize = 10;

    pub const ALL: [StatKind; Self::COUNT] = [
        Self::FindModuleInfo,
        Self::AddWorkingSetModule,
        Self::QuerySymbolEngine,
        Self::AnalyzeCss,
        Self::AnalyzeUserCss,
        Self::BuildCss,
        Self::TraverseCss,
        Self::FinalizeKernelCss,
        Self::FinalizeUserCss,
        Self::FinalizePartialUserCss,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for StatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatValue {
    /// Elapsed microseconds (0 unless timing is enabled)
    pub value: u64,
    pub count: u64,
}

impl AddAssign for StatValue {
    fn add_assign(&mut self, other: Self) {
        self.value += other.value;
        self.count += other.count;
    }
}

/// Worker-local stage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrdTranslationStats {
    timing: bool,
    values: [StatValue; StatKind::COUNT],
}

impl PrdTranslationStats {
    /// Statistics that also time every stage
    #[must_use]
    pub fn timed() -> Self {
        Self { timing: true, ..Self::default() }
    }

    #[must_use]
    pub fn get(&self, kind: StatKind) -> StatValue {
        self.values[kind.index()]
    }

    /// Count one occurrence of `kind` taking `micros`
    pub fn record(&mut self, kind: StatKind, micros: u64) {
        self.values[kind.index()] += StatValue { value: micros, count: 1 };
    }

    /// Run `f` as one occurrence of `kind`
    pub fn time<R>(&mut self, kind: StatKind, f: impl FnOnce() -> R) -> R {
        if !self.timing {
            self.record(kind, 0);
            return f();
        }
        let started = Instant::now();
        let result = f();
        let micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.record(kind, micros);
        result
    }

    pub fn iter(&self) -> impl Iterator<Item = (StatKind, StatValue)> + '_ {
        StatKind::ALL.iter().map(|kind| (*kind, self.values[kind.index()]))
    }
}

impl AddAssign<&PrdTranslationStats> for PrdTranslationStats {
    fn add_assign(&mut self, other: &PrdTranslationStats) {
        for (mine, theirs) in self.values.iter_mut().zip(other.values.iter()) {
            *mine += *theirs;
        }
        self.timing |= other.timing;
    }
}

/// Run-wide statistics updated concurrently by all workers
#[derive(Debug, Default)]
pub struct SharedTranslationStats {
    values: [AtomicU64; StatKind::COUNT],
    counts: [AtomicU64; StatKind::COUNT],
}

impl SharedTranslationStats {
    pub fn add(&self, kind: StatKind, value: StatValue) {
        self.values[kind.index()].fetch_add(value.value, Ordering::Relaxed);
        self.counts[kind.index()].fetch_add(value.count, Ordering::Relaxed);
    }

    pub fn merge(&self, local: &PrdTranslationStats) {
        for (kind, value) in local.iter() {
            self.add(kind, value);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> PrdTranslationStats {
        let mut stats = PrdTranslationStats::default();
        for kind in StatKind::ALL {
            stats.values[kind.index()] = StatValue {
                value: self.values[kind.index()].load(Ordering::Relaxed),
                count: self.counts[kind.index()].load(Ordering::Relaxed),
            };
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_adds_values() {
        let mut a = PrdTranslationStats::default();
        a.record(StatKind::BuildCss, 5);
        let mut b = PrdTranslationStats::default();
        b.record(StatKind::BuildCss, 7);
        b.record(StatKind::TraverseCss, 1);
        a += &b;
        assert_eq!(a.get(StatKind::BuildCss), StatValue { value: 12, count: 2 });
        assert_eq!(a.get(StatKind::TraverseCss).count, 1);
    }

    #[test]
    fn test_untimed_counts_only() {
        let mut stats = PrdTranslationStats::default();
        let out = stats.time(StatKind::AnalyzeCss, || 41 + 1);
        assert_eq!(out, 42);
        assert_eq!(stats.get(StatKind::AnalyzeCss), StatValue { value: 0, count: 1 });
    }

    #[test]
    fn test_shared_stats_no_lost_updates() {
        let shared = SharedTranslationStats::default();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let mut local = PrdTranslationStats::default();
                    for _ in 0..1000 {
                        local.record(StatKind::FindModuleInfo, 2);
                    }
                    shared.merge(&local);
                });
            }
        });
        let total = shared.snapshot().get(StatKind::FindModuleInfo);
        assert_eq!(total, StatValue { value: 16_000, count: 8_000 });
    }

    #[test]
    fn test_kind_indices_match_table() {
        for (i, kind) in StatKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }
}
