//! Sample aggregation.
//!
//! Folds attributed samples into additive counters keyed by
//! `(process, thread, core, event, module instance, function, offset)`.
//!
//! # Architecture
//!
//! - **`SampleAggregator`** - one per worker, fed record by record
//! - **`SampleAggregator::merge()`** - single-threaded fold of worker states
//!
//! ```text
//! worker 0 ──► SampleAggregator ─┐
//! worker 1 ──► SampleAggregator ─┼──► merge() ──► normalization
//! worker N ──► SampleAggregator ─┘
//! ```
//!
//! Counts only ever add, so merging worker states in any order gives the
//! same totals.

use std::collections::HashMap;

use crate::domain::{CoreId, Pid, Tid};
use crate::symbolization::Site;

// =============================================================================
// KEYS
// =============================================================================

/// Natural key of one aggregated counter
///
/// `event` is the sampling configuration (event mask) the sample was taken
/// with; together with `core` it forms the core sampling configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SampleKey {
    pub pid: Pid,
    pub tid: Tid,
    pub core: CoreId,
    pub event: u64,
    pub site: Site,
}

// =============================================================================
// AGGREGATOR
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleAggregator {
    counts: HashMap<SampleKey, u64>,
    /// Samples that fell outside every module, per event
    unresolved: HashMap<u64, u64>,
}

impl SampleAggregator {
    /// Add `weight` samples of `event` taken at `site`
    pub fn add_sample(
        &mut self,
        pid: Pid,
        tid: Tid,
        core: CoreId,
        event: u64,
        site: Site,
        weight: u64,
    ) {
        if weight == 0 {
            return;
        }
        if !site.is_resolved() {
            *self.unresolved.entry(event).or_insert(0) += weight;
        }
        let key = SampleKey { pid, tid, core, event, site };
        *self.counts.entry(key).or_insert(0) += weight;
    }

    /// Fold another aggregator into this one
    pub fn merge(&mut self, other: SampleAggregator) {
        for (key, count) in other.counts {
            *self.counts.entry(key).or_insert(0) += count;
        }
        for (event, count) in other.unresolved {
            *self.unresolved.entry(event).or_insert(0) += count;
        }
    }

    #[must_use]
    pub fn get(&self, key: &SampleKey) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SampleKey, u64)> {
        self.counts.iter().map(|(key, count)| (key, *count))
    }

    /// Number of distinct counters
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Sum of all counters
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Samples attributed to no module
    #[must_use]
    pub fn unresolved(&self) -> u64 {
        self.unresolved.values().sum()
    }

    /// Event with the most unresolved samples (lowest mask on ties)
    #[must_use]
    pub fn worst_event(&self) -> Option<u64> {
        self.unresolved
            .iter()
            .max_by(|(ea, ca), (eb, cb)| ca.cmp(cb).then(eb.cmp(ea)))
            .map(|(event, _)| *event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FunctionKey, ModuleId, ModuleInstanceId};

    fn site(offset: u64) -> Site {
        Site {
            instance: Some(ModuleInstanceId(0)),
            function: FunctionKey { module: Some(ModuleId(0)), start: Some(0) },
            offset,
        }
    }

    fn add(agg: &mut SampleAggregator, tid: u32, event: u64, site: Site, weight: u64) {
        agg.add_sample(Pid(1), Tid(tid), CoreId(0), event, site, weight);
    }

    #[test]
    fn test_same_key_accumulates() {
        let mut agg = SampleAggregator::default();
        add(&mut agg, 1, 7, site(0x10), 1);
        add(&mut agg, 1, 7, site(0x10), 2);
        add(&mut agg, 2, 7, site(0x10), 1);
        assert_eq!(agg.len(), 2);
        assert_eq!(agg.total(), 4);
        assert_eq!(agg.unresolved(), 0);
    }

    #[test]
    fn test_merge_order_independent() {
        let mut parts = Vec::new();
        for i in 0..4u64 {
            let mut agg = SampleAggregator::default();
            add(&mut agg, 1, 7, site(i % 2), i + 1);
            add(&mut agg, 1, 9, Site::unknown(0xdead), 1);
            parts.push(agg);
        }
        let mut forward = SampleAggregator::default();
        for part in parts.iter().cloned() {
            forward.merge(part);
        }
        let mut backward = SampleAggregator::default();
        for part in parts.into_iter().rev() {
            backward.merge(part);
        }
        assert_eq!(forward, backward);
        assert_eq!(forward.total(), 14);
        assert_eq!(forward.worst_event(), Some(9));
    }

    #[test]
    fn test_zero_weight_ignored() {
        let mut agg = SampleAggregator::default();
        add(&mut agg, 1, 7, site(0), 0);
        assert!(agg.is_empty());
        assert_eq!(agg.worst_event(), None);
    }
}
