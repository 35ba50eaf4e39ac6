//! Derived events of IBS samples
//!
//! One IBS fetch or op sample stands for several countable events. The
//! derived events get their own selects (`0xF0xx` fetch, `0xF1xx` op) so each
//! becomes a separate sampling configuration in the profile.

use prd_common::{
    encode_event_mask, IbsOpSample, DE_IBS_DC_L1_TLB_MISS, DE_IBS_DC_L2_TLB_MISS, DE_IBS_DC_MISS,
    DE_IBS_FETCH_ABORTED, DE_IBS_FETCH_ALL, DE_IBS_FETCH_ATTEMPTED, DE_IBS_FETCH_COMPLETED,
    DE_IBS_FETCH_KILLED, DE_IBS_FETCH_LATENCY, DE_IBS_IC_HIT, DE_IBS_IC_MISS, DE_IBS_ITLB_L1M_L2H,
    DE_IBS_ITLB_L1M_L2M, DE_IBS_L1_ITLB_HIT, DE_IBS_LOCKED, DE_IBS_MISALIGNED, DE_IBS_OP_ALL,
    DE_IBS_OP_BRANCH, DE_IBS_OP_BRANCH_TAKEN, DE_IBS_OP_LOAD, DE_IBS_OP_LOAD_STORE,
    DE_IBS_OP_MISPREDICT, DE_IBS_OP_RESYNC, DE_IBS_OP_RETURN, DE_IBS_OP_STORE, IBS_DC_L1_TLB_MISS,
    IBS_DC_L2_TLB_MISS, IBS_DC_LOAD, IBS_DC_LOCKED, IBS_DC_MISALIGNED, IBS_DC_MISS, IBS_DC_STORE,
    IBS_FETCH_ABORTED, IBS_FETCH_COMPLETED, IBS_FETCH_IC_MISS, IBS_FETCH_KILLED,
    IBS_FETCH_L1_TLB_MISS, IBS_FETCH_L2_TLB_MISS, IBS_OP_BRANCH_MISPREDICT, IBS_OP_BRANCH_RETIRED,
    IBS_OP_BRANCH_TAKEN, IBS_OP_RESYNC, IBS_OP_RETURN,
};

/// Event mask of a derived event
#[must_use]
pub fn derived_event_mask(select: u16) -> u64 {
    encode_event_mask(select, 0, true, true)
}

/// Derived events of one IBS fetch sample as `(select, weight)`
///
/// Killed fetches only count toward "all" and "killed".
#[must_use]
pub fn fetch_events(fetch_ctl: u64, latency: u32) -> Vec<(u16, u64)> {
    let mut events = vec![(DE_IBS_FETCH_ALL, 1)];
    if fetch_ctl & IBS_FETCH_KILLED != 0 {
        events.push((DE_IBS_FETCH_KILLED, 1));
        return events;
    }

    events.push((DE_IBS_FETCH_ATTEMPTED, 1));
    if fetch_ctl & IBS_FETCH_COMPLETED != 0 {
        events.push((DE_IBS_FETCH_COMPLETED, 1));
    }
    if fetch_ctl & IBS_FETCH_ABORTED != 0 {
        events.push((DE_IBS_FETCH_ABORTED, 1));
    }

    let itlb = if fetch_ctl & IBS_FETCH_L1_TLB_MISS == 0 {
        DE_IBS_L1_ITLB_HIT
    } else if fetch_ctl & IBS_FETCH_L2_TLB_MISS == 0 {
        DE_IBS_ITLB_L1M_L2H
    } else {
        DE_IBS_ITLB_L1M_L2M
    };
    events.push((itlb, 1));

    if fetch_ctl & IBS_FETCH_IC_MISS != 0 {
        events.push((DE_IBS_IC_MISS, 1));
    } else {
        events.push((DE_IBS_IC_HIT, 1));
    }
    if latency > 0 {
        events.push((DE_IBS_FETCH_LATENCY, u64::from(latency)));
    }
    events
}

/// Derived events of one IBS op sample as `(select, weight)`
///
/// Load/store events are only derived when `load_store` is set.
#[must_use]
pub fn op_events(op: &IbsOpSample, load_store: bool) -> Vec<(u16, u64)> {
    let mut events = vec![(DE_IBS_OP_ALL, 1)];
    let data = op.op_data;

    if data & IBS_OP_BRANCH_RETIRED != 0 {
        events.push((DE_IBS_OP_BRANCH, 1));
        if data & IBS_OP_BRANCH_MISPREDICT != 0 {
            events.push((DE_IBS_OP_MISPREDICT, 1));
        }
        if data & IBS_OP_BRANCH_TAKEN != 0 {
            events.push((DE_IBS_OP_BRANCH_TAKEN, 1));
        }
    }
    if data & IBS_OP_RETURN != 0 {
        events.push((DE_IBS_OP_RETURN, 1));
    }
    if data & IBS_OP_RESYNC != 0 {
        events.push((DE_IBS_OP_RESYNC, 1));
    }

    let dc = op.dc_data;
    if !load_store || dc & (IBS_DC_LOAD | IBS_DC_STORE) == 0 {
        return events;
    }
    events.push((DE_IBS_OP_LOAD_STORE, 1));
    let flags = [
        (IBS_DC_LOAD, DE_IBS_OP_LOAD),
        (IBS_DC_STORE, DE_IBS_OP_STORE),
        (IBS_DC_MISS, DE_IBS_DC_MISS),
        (IBS_DC_L1_TLB_MISS, DE_IBS_DC_L1_TLB_MISS),
        (IBS_DC_L2_TLB_MISS, DE_IBS_DC_L2_TLB_MISS),
        (IBS_DC_LOCKED, DE_IBS_LOCKED),
        (IBS_DC_MISALIGNED, DE_IBS_MISALIGNED),
    ];
    events.extend(flags.iter().filter(|(bit, _)| dc & bit != 0).map(|(_, select)| (*select, 1)));
    events
}

/// Whether an op sample is a memory access with a valid linear address
#[must_use]
pub fn is_tracked_access(op: &IbsOpSample) -> bool {
    op.dc_data & (IBS_DC_LOAD | IBS_DC_STORE) != 0
        && op.dc_data & prd_common::IBS_DC_LIN_ADDR_VALID != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selects(events: &[(u16, u64)]) -> Vec<u16> {
        events.iter().map(|(s, _)| *s).collect()
    }

    #[test]
    fn test_killed_fetch() {
        let events = fetch_events(IBS_FETCH_KILLED | IBS_FETCH_IC_MISS, 30);
        assert_eq!(selects(&events), vec![DE_IBS_FETCH_ALL, DE_IBS_FETCH_KILLED]);
    }

    #[test]
    fn test_completed_fetch_with_itlb_miss() {
        let events = fetch_events(IBS_FETCH_COMPLETED | IBS_FETCH_L1_TLB_MISS | IBS_FETCH_IC_MISS, 12);
        let s = selects(&events);
        assert!(s.contains(&DE_IBS_FETCH_COMPLETED));
        assert!(s.contains(&DE_IBS_ITLB_L1M_L2H));
        assert!(s.contains(&DE_IBS_IC_MISS));
        assert!(events.contains(&(DE_IBS_FETCH_LATENCY, 12)));
    }

    #[test]
    fn test_op_load_store_gated() {
        let op = IbsOpSample {
            ip: 0x1000,
            op_data: IBS_OP_BRANCH_RETIRED | IBS_OP_BRANCH_MISPREDICT,
            dc_data: IBS_DC_LOAD | IBS_DC_MISS,
            dc_lin_addr: 0,
            op_size: 8,
        };
        let without = selects(&op_events(&op, false));
        assert_eq!(without, vec![DE_IBS_OP_ALL, DE_IBS_OP_BRANCH, DE_IBS_OP_MISPREDICT]);

        let with = selects(&op_events(&op, true));
        assert!(with.contains(&DE_IBS_OP_LOAD_STORE));
        assert!(with.contains(&DE_IBS_OP_LOAD));
        assert!(with.contains(&DE_IBS_DC_MISS));
        assert!(!with.contains(&DE_IBS_OP_STORE));
    }
}
