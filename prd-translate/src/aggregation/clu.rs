//! Cache-line utilization
//!
//! Models a direct-mapped data cache per process, fed with the linear
//! addresses of IBS loads and stores. Each resident line records which of its
//! bytes were touched and which instruction brought it in. When the line is
//! evicted (or at flush) the line's statistics are charged to that
//! instruction.
//!
//! ```text
//! addr ──► line = addr / 64 ──► set = line % sets
//!                                   │
//!           ┌───────────────────────┴──────────────┐
//!           │ tag │ touched (64-bit mask) │ accesses │ first site
//!           └──────────────────────────────────────┘
//! ```

use prd_common::{DE_CLU_ACCESSES, DE_CLU_BYTES_ACCESSED, DE_CLU_EVICTIONS, DE_CLU_UTILIZATION};
use std::collections::HashMap;

use crate::domain::{CoreId, Pid, Tid};
use crate::symbolization::Site;

pub const CACHE_LINE_SIZE: u64 = 64;

/// Number of sets in the modelled cache (32 KiB of 64-byte lines)
pub const DEFAULT_CLU_SETS: usize = 512;

/// Instruction a cache line is charged to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CluSite {
    pub tid: Tid,
    pub core: CoreId,
    pub site: Site,
}

/// A derived CLU event ready for aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CluEvent {
    pub pid: Pid,
    pub at: CluSite,
    pub select: u16,
    pub weight: u64,
}

#[derive(Debug, Clone, Copy)]
struct Line {
    tag: u64,
    touched: u64,
    accesses: u64,
    first: CluSite,
}

/// Direct-mapped cache model of one process
#[derive(Debug)]
pub struct CacheLineModel {
    sets: Vec<Option<Line>>,
}

impl CacheLineModel {
    #[must_use]
    pub fn new(sets: usize) -> Self {
        Self { sets: vec![None; sets.max(1)] }
    }

    /// Record an access of `size` bytes at `addr`, splitting it at line
    /// boundaries
    pub fn access(&mut self, pid: Pid, addr: u64, size: u8, who: CluSite, out: &mut Vec<CluEvent>) {
        let end = addr.saturating_add(u64::from(size.max(1)));
        let mut cursor = addr;
        while cursor < end {
            let line = cursor / CACHE_LINE_SIZE;
            let line_end = (line + 1).saturating_mul(CACHE_LINE_SIZE).min(end);
            self.touch(pid, line, cursor % CACHE_LINE_SIZE, line_end - cursor, who, out);
            cursor = line_end;
        }
    }

    /// Charge every resident line and empty the cache
    pub fn flush(&mut self, pid: Pid, out: &mut Vec<CluEvent>) {
        for slot in &mut self.sets {
            if let Some(line) = slot.take() {
                charge(pid, &line, false, out);
            }
        }
    }

    fn touch(
        &mut self,
        pid: Pid,
        line: u64,
        first_byte: u64,
        len: u64,
        who: CluSite,
        out: &mut Vec<CluEvent>,
    ) {
        let index = usize::try_from(line % self.sets.len() as u64).unwrap_or(0);
        let slot = &mut self.sets[index];
        if let Some(resident) = slot {
            if resident.tag != line {
                charge(pid, resident, true, out);
                *slot = None;
            }
        }
        let resident =
            slot.get_or_insert(Line { tag: line, touched: 0, accesses: 0, first: who });
        let mask = if len >= 64 { u64::MAX } else { ((1u64 << len) - 1) << first_byte };
        resident.touched |= mask;
        resident.accesses += 1;
    }
}

fn charge(pid: Pid, line: &Line, evicted: bool, out: &mut Vec<CluEvent>) {
    let bytes = u64::from(line.touched.count_ones());
    let mut push = |select, weight| {
        if weight > 0 {
            out.push(CluEvent { pid, at: line.first, select, weight });
        }
    };
    if evicted {
        push(DE_CLU_EVICTIONS, 1);
    }
    push(DE_CLU_UTILIZATION, bytes * 100 / CACHE_LINE_SIZE);
    push(DE_CLU_ACCESSES, line.accesses);
    push(DE_CLU_BYTES_ACCESSED, bytes);
}

/// Cache models of all processes handled by one worker
#[derive(Debug)]
pub struct CluAnalyzer {
    sets: usize,
    processes: HashMap<Pid, CacheLineModel>,
    pending: Vec<CluEvent>,
}

impl CluAnalyzer {
    #[must_use]
    pub fn new(sets: usize) -> Self {
        Self { sets, processes: HashMap::new(), pending: Vec::new() }
    }

    pub fn record_access(&mut self, pid: Pid, addr: u64, size: u8, who: CluSite) {
        let sets = self.sets;
        let model = self.processes.entry(pid).or_insert_with(|| CacheLineModel::new(sets));
        model.access(pid, addr, size, who, &mut self.pending);
    }

    pub fn flush_process(&mut self, pid: Pid) {
        if let Some(mut model) = self.processes.remove(&pid) {
            model.flush(pid, &mut self.pending);
        }
    }

    pub fn flush_all(&mut self) {
        let mut pids: Vec<Pid> = self.processes.keys().copied().collect();
        pids.sort_unstable();
        for pid in pids {
            self.flush_process(pid);
        }
    }

    /// Take the events produced since the last call
    pub fn drain_events(&mut self) -> Vec<CluEvent> {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn who(offset: u64) -> CluSite {
        CluSite { tid: Tid(1), core: CoreId(0), site: Site::unknown(offset) }
    }

    fn weight_of(events: &[CluEvent], select: u16) -> u64 {
        events.iter().filter(|e| e.select == select).map(|e| e.weight).sum()
    }

    #[test]
    fn test_eviction_charges_first_toucher() {
        let mut model = CacheLineModel::new(4);
        let mut out = Vec::new();
        model.access(Pid(1), 0x1000, 8, who(1), &mut out);
        model.access(Pid(1), 0x1008, 8, who(2), &mut out);
        assert!(out.is_empty());

        // same set (4 sets of 64 bytes), different tag
        model.access(Pid(1), 0x1000 + 4 * 64, 4, who(3), &mut out);
        assert_eq!(weight_of(&out, DE_CLU_EVICTIONS), 1);
        assert_eq!(weight_of(&out, DE_CLU_BYTES_ACCESSED), 16);
        assert_eq!(weight_of(&out, DE_CLU_ACCESSES), 2);
        assert_eq!(weight_of(&out, DE_CLU_UTILIZATION), 25);
        assert!(out.iter().all(|e| e.at == who(1)));
    }

    #[test]
    fn test_access_split_across_lines() {
        let mut model = CacheLineModel::new(8);
        let mut out = Vec::new();
        model.access(Pid(1), 60, 8, who(1), &mut out);
        model.flush(Pid(1), &mut out);
        assert_eq!(weight_of(&out, DE_CLU_EVICTIONS), 0);
        assert_eq!(weight_of(&out, DE_CLU_BYTES_ACCESSED), 8);
        assert_eq!(weight_of(&out, DE_CLU_ACCESSES), 2);
    }

    #[test]
    fn test_analyzer_keeps_processes_apart() {
        let mut clu = CluAnalyzer::new(1);
        clu.record_access(Pid(1), 0x0, 1, who(1));
        clu.record_access(Pid(2), 0x40, 1, who(2));
        assert!(clu.drain_events().is_empty());
        clu.flush_all();
        let events = clu.drain_events();
        assert_eq!(weight_of(&events, DE_CLU_BYTES_ACCESSED), 2);
        assert_eq!(weight_of(&events, DE_CLU_EVICTIONS), 0);
    }
}
