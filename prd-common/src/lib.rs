//! # Shared PRD Layout (Driver ↔ Translator)
//!
//! Defines the byte layout of PRD sampling-trace files: the file header, the
//! common record header, record tags, flag bits and the event-mask encoding.
//! Both sides of the format use these definitions: the translator when it
//! decodes a trace, and [`TraceWriter`] when tests and tooling produce one.
//!
//! All multi-byte fields are little-endian.
//!
//! ## File Structure
//!
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ FileHeader (64 bytes)        │
//! ├──────────────────────────────┤ 64
//! │ event table  (16 B / entry)  │  event_mask u64, interval u64
//! ├──────────────────────────────┤
//! │ topology     (8 B / entry)   │  core u32, processor u16, numa u16
//! ├──────────────────────────────┤ data_offset
//! │ records ...                  │  RecordHeader (24 B) + payload
//! └──────────────────────────────┘ EOF
//! ```
//!
//! ## Key Types
//!
//! - [`FileHeader`] - Decoded/encodable file header
//! - [`EventConfig`] - One sampled event and its sampling interval
//! - [`CoreTopology`] - Core → processor / NUMA node mapping
//! - [`TraceWriter`] - Record encoder

mod writer;

pub use writer::{encode_header, IbsOpSample, RecordStamp, TraceWriter};

// ============================================================================
// File Header
// ============================================================================

/// Magic bytes at offset 0 of every PRD file
pub const PRD_MAGIC: [u8; 4] = *b"CPRD";

/// Format version written by [`TraceWriter`] and accepted by the translator
pub const PRD_VERSION: u16 = 3;

/// Size of the fixed file header in bytes
pub const FILE_HEADER_SIZE: usize = 64;

/// Size of one event table entry (`event_mask u64`, `interval u64`)
pub const EVENT_ENTRY_SIZE: usize = 16;

/// Size of one topology entry (`core u32`, `processor u16`, `numa u16`)
pub const TOPOLOGY_ENTRY_SIZE: usize = 8;

/// The trace was captured on a 64-bit operating system
pub const HEADER_FLAG_64BIT_SYSTEM: u32 = 1 << 0;

/// Call-stack sampling was enabled during capture
pub const HEADER_FLAG_CALL_STACKS: u32 = 1 << 1;

/// IBS fetch sampling was enabled during capture
pub const HEADER_FLAG_IBS_FETCH: u32 = 1 << 2;

/// IBS op sampling was enabled during capture
pub const HEADER_FLAG_IBS_OP: u32 = 1 << 3;

/// Decoded file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u16,
    pub flags: u32,
    pub cpu_count: u32,
    pub cpu_family: u32,
    pub cpu_model: u32,
    /// Counter ticks per second of the timestamp source
    pub tick_frequency: u64,
    pub start_tick: u64,
    pub events: Vec<EventConfig>,
    pub topology: Vec<CoreTopology>,
    /// Byte offset of the first record
    pub data_offset: u64,
}

impl FileHeader {
    /// Header for a 64-bit system with `cpu_count` cores and no event table
    #[must_use]
    pub fn new(cpu_count: u32) -> Self {
        Self {
            version: PRD_VERSION,
            flags: HEADER_FLAG_64BIT_SYSTEM | HEADER_FLAG_CALL_STACKS,
            cpu_count,
            cpu_family: 0x19,
            cpu_model: 0x01,
            tick_frequency: 1_000_000_000,
            start_tick: 0,
            events: Vec::new(),
            topology: Vec::new(),
            data_offset: 0,
        }
    }

    /// Byte offset right after the header tables
    #[must_use]
    pub fn tables_end(&self) -> u64 {
        (FILE_HEADER_SIZE
            + self.events.len() * EVENT_ENTRY_SIZE
            + self.topology.len() * TOPOLOGY_ENTRY_SIZE) as u64
    }

    #[must_use]
    pub fn is_64bit_system(&self) -> bool {
        self.flags & HEADER_FLAG_64BIT_SYSTEM != 0
    }
}

/// Sampled event and its sampling interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventConfig {
    pub event_mask: u64,
    pub interval: u64,
}

/// Core → processor / NUMA node mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreTopology {
    pub core: u32,
    pub processor: u16,
    pub numa_node: u16,
}

// ============================================================================
// Records
// ============================================================================

/// Size of the common record header
///
/// `tag u8, flags u8, length u16, core u32, timestamp u64, pid u32, tid u32`
pub const RECORD_HEADER_SIZE: usize = 24;

/// Periodic counter or timer sample
pub const TAG_SAMPLE: u8 = 1;
/// IBS fetch sample
pub const TAG_IBS_FETCH: u8 = 2;
/// IBS op sample
pub const TAG_IBS_OP: u8 = 3;
/// Kernel-mode call-stack fragment, written at sample time
pub const TAG_KERNEL_CALL_STACK: u8 = 4;
/// User-mode call-stack fragment covering a time range of a thread
pub const TAG_USER_CALL_STACK: u8 = 5;
/// Module mapped into a process
pub const TAG_MODULE_LOAD: u8 = 6;
/// Module unmapped from a process
pub const TAG_MODULE_UNLOAD: u8 = 7;
/// Process created
pub const TAG_PROCESS_START: u8 = 8;
/// Process terminated
pub const TAG_PROCESS_EXIT: u8 = 9;

/// Payload sizes of the fixed-size records (excluding the record header)
pub const SAMPLE_PAYLOAD_SIZE: usize = 24;
pub const IBS_FETCH_PAYLOAD_SIZE: usize = 24;
pub const IBS_OP_PAYLOAD_SIZE: usize = 40;
pub const MODULE_UNLOAD_PAYLOAD_SIZE: usize = 8;
pub const PROCESS_EXIT_PAYLOAD_SIZE: usize = 8;

/// Fixed parts of the variable-size records
pub const KERNEL_CSS_FIXED_SIZE: usize = 24;
pub const USER_CSS_FIXED_SIZE: usize = 16;
pub const MODULE_LOAD_FIXED_SIZE: usize = 24;
pub const PROCESS_START_FIXED_SIZE: usize = 16;

/// Record flag (kernel call stack): a user-mode stack walk follows later
pub const RECORD_FLAG_USER_PENDING: u8 = 1 << 1;

/// Process id used for kernel and other system-wide modules
pub const SYSTEM_PID: u32 = 0;

/// Module flag: 32-bit image
pub const MODULE_FLAG_32BIT: u32 = 1 << 0;
/// Module flag: system module (OS-provided)
pub const MODULE_FLAG_SYSTEM: u32 = 1 << 1;
/// Module flag: kernel-space image (driver or kernel)
pub const MODULE_FLAG_KERNEL: u32 = 1 << 2;

/// Process flag: 32-bit process on a 64-bit system
pub const PROCESS_FLAG_32BIT: u32 = 1 << 0;

// ============================================================================
// Event Masks
// ============================================================================

/// OS-mode counting bit of an event mask
pub const EVENT_MASK_OS: u64 = 1 << 24;
/// User-mode counting bit of an event mask
pub const EVENT_MASK_USR: u64 = 1 << 25;

/// Event select of the timer (time-based profiling) event
pub const TIMER_EVENT_SELECT: u16 = 0x0FFF;

/// Encode an event select, unit mask and mode bits into an event mask
#[must_use]
pub const fn encode_event_mask(select: u16, unit_mask: u8, os: bool, usr: bool) -> u64 {
    let mut mask = select as u64 | ((unit_mask as u64) << 16);
    if os {
        mask |= EVENT_MASK_OS;
    }
    if usr {
        mask |= EVENT_MASK_USR;
    }
    mask
}

/// Event select of an event mask
#[must_use]
pub const fn event_select(mask: u64) -> u16 {
    (mask & 0xFFFF) as u16
}

/// Event mask of the timer event (OS and USR)
pub const TIMER_EVENT_MASK: u64 = encode_event_mask(TIMER_EVENT_SELECT, 0, true, true);

// ============================================================================
// IBS Bits and Derived Events
// ============================================================================

/// IBS fetch control bits (`IbsFetch::fetch_ctl`)
pub const IBS_FETCH_COMPLETED: u64 = 1 << 0;
pub const IBS_FETCH_KILLED: u64 = 1 << 1;
pub const IBS_FETCH_ABORTED: u64 = 1 << 2;
pub const IBS_FETCH_IC_MISS: u64 = 1 << 3;
pub const IBS_FETCH_L1_TLB_MISS: u64 = 1 << 4;
pub const IBS_FETCH_L2_TLB_MISS: u64 = 1 << 5;

/// IBS op data bits (`IbsOp::op_data`)
pub const IBS_OP_BRANCH_RETIRED: u64 = 1 << 0;
pub const IBS_OP_BRANCH_MISPREDICT: u64 = 1 << 1;
pub const IBS_OP_BRANCH_TAKEN: u64 = 1 << 2;
pub const IBS_OP_RETURN: u64 = 1 << 3;
pub const IBS_OP_RESYNC: u64 = 1 << 4;

/// IBS data-cache bits (`IbsOp::dc_data`)
pub const IBS_DC_LOAD: u64 = 1 << 0;
pub const IBS_DC_STORE: u64 = 1 << 1;
pub const IBS_DC_MISS: u64 = 1 << 2;
pub const IBS_DC_L1_TLB_MISS: u64 = 1 << 3;
pub const IBS_DC_L2_TLB_MISS: u64 = 1 << 4;
pub const IBS_DC_LOCKED: u64 = 1 << 5;
pub const IBS_DC_MISALIGNED: u64 = 1 << 6;
pub const IBS_DC_LIN_ADDR_VALID: u64 = 1 << 7;

/// Derived IBS fetch event selects
pub const DE_IBS_FETCH_ALL: u16 = 0xF000;
pub const DE_IBS_FETCH_KILLED: u16 = 0xF001;
pub const DE_IBS_FETCH_ATTEMPTED: u16 = 0xF002;
pub const DE_IBS_FETCH_COMPLETED: u16 = 0xF003;
pub const DE_IBS_FETCH_ABORTED: u16 = 0xF004;
pub const DE_IBS_L1_ITLB_HIT: u16 = 0xF005;
pub const DE_IBS_ITLB_L1M_L2H: u16 = 0xF006;
pub const DE_IBS_ITLB_L1M_L2M: u16 = 0xF007;
pub const DE_IBS_IC_MISS: u16 = 0xF008;
pub const DE_IBS_IC_HIT: u16 = 0xF009;
pub const DE_IBS_FETCH_LATENCY: u16 = 0xF00A;

/// Derived IBS op event selects
pub const DE_IBS_OP_ALL: u16 = 0xF100;
pub const DE_IBS_OP_BRANCH: u16 = 0xF102;
pub const DE_IBS_OP_MISPREDICT: u16 = 0xF103;
pub const DE_IBS_OP_BRANCH_TAKEN: u16 = 0xF104;
pub const DE_IBS_OP_RETURN: u16 = 0xF105;
pub const DE_IBS_OP_RESYNC: u16 = 0xF106;
pub const DE_IBS_OP_LOAD_STORE: u16 = 0xF107;
pub const DE_IBS_OP_LOAD: u16 = 0xF108;
pub const DE_IBS_OP_STORE: u16 = 0xF109;
pub const DE_IBS_DC_MISS: u16 = 0xF10A;
pub const DE_IBS_DC_L1_TLB_MISS: u16 = 0xF10B;
pub const DE_IBS_DC_L2_TLB_MISS: u16 = 0xF10C;
pub const DE_IBS_LOCKED: u16 = 0xF10D;
pub const DE_IBS_MISALIGNED: u16 = 0xF10E;

/// Cache-line-utilization event selects
pub const DE_CLU_EVICTIONS: u16 = 0xF200;
pub const DE_CLU_UTILIZATION: u16 = 0xF201;
pub const DE_CLU_ACCESSES: u16 = 0xF202;
pub const DE_CLU_BYTES_ACCESSED: u16 = 0xF203;

/// Maximum number of frames a call-stack record may carry
pub const MAX_RECORD_FRAMES: usize = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_mask_encoding() {
        let mask = encode_event_mask(0x76, 0x03, true, false);
        assert_eq!(event_select(mask), 0x76);
        assert_eq!((mask >> 16) & 0xFF, 0x03);
        assert_ne!(mask & EVENT_MASK_OS, 0);
        assert_eq!(mask & EVENT_MASK_USR, 0);
    }

    #[test]
    fn test_timer_mask() {
        assert_eq!(event_select(TIMER_EVENT_MASK), TIMER_EVENT_SELECT);
    }

    #[test]
    fn test_tables_end() {
        let mut header = FileHeader::new(4);
        header.events.push(EventConfig { event_mask: TIMER_EVENT_MASK, interval: 1_000_000 });
        header.topology.push(CoreTopology { core: 0, processor: 0, numa_node: 0 });
        assert_eq!(header.tables_end(), 64 + 16 + 8);
    }
}
