//! Record decoding
//!
//! Each record is a 24-byte [`RecordHeader`] followed by a tag-specific
//! payload; see `prd_common` for the byte layout. Decoding is split in two
//! steps so that the reader can skip a record it cannot interpret:
//!
//! 1. [`record_extent`] validates the length field (a short length makes the
//!    reader resync, a record past the end of the file ends the partition)
//! 2. [`decode_record`] interprets the payload (failure skips the record)

use byteorder::{LittleEndian, ReadBytesExt};
use prd_common::{
    IbsOpSample, IBS_FETCH_PAYLOAD_SIZE, IBS_OP_PAYLOAD_SIZE, KERNEL_CSS_FIXED_SIZE,
    MAX_RECORD_FRAMES, MODULE_FLAG_32BIT, MODULE_FLAG_KERNEL, MODULE_FLAG_SYSTEM,
    MODULE_LOAD_FIXED_SIZE, MODULE_UNLOAD_PAYLOAD_SIZE, PROCESS_EXIT_PAYLOAD_SIZE,
    PROCESS_FLAG_32BIT, PROCESS_START_FIXED_SIZE, RECORD_FLAG_USER_PENDING, RECORD_HEADER_SIZE,
    SAMPLE_PAYLOAD_SIZE, TAG_IBS_FETCH, TAG_IBS_OP, TAG_KERNEL_CALL_STACK, TAG_MODULE_LOAD,
    TAG_MODULE_UNLOAD, TAG_PROCESS_EXIT, TAG_PROCESS_START, TAG_SAMPLE, TAG_USER_CALL_STACK,
    USER_CSS_FIXED_SIZE,
};

use crate::domain::{CoreId, Pid, RecordDecodeError, Tid, Timestamp};

/// Common header of every record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub timestamp: Timestamp,
    pub core: CoreId,
    pub pid: Pid,
    pub tid: Tid,
}

/// Flags of a loaded module image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ModuleFlags {
    pub is_32bit: bool,
    pub is_system: bool,
    pub is_kernel: bool,
}

impl ModuleFlags {
    #[must_use]
    pub fn from_bits(bits: u32) -> Self {
        Self {
            is_32bit: bits & MODULE_FLAG_32BIT != 0,
            is_system: bits & MODULE_FLAG_SYSTEM != 0,
            is_kernel: bits & MODULE_FLAG_KERNEL != 0,
        }
    }
}

/// Decoded record payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    Sample { event_mask: u64, ip: u64, weight: u32 },
    IbsFetch { ip: u64, fetch_ctl: u64, latency: u32 },
    IbsOp(IbsOpSample),
    /// Kernel frames are the callers of `sample_ip`, innermost first
    KernelCallStack { event_mask: u64, sample_ip: u64, frames: Vec<u64>, user_pending: bool },
    /// Covers `[header.timestamp, range_end]`
    UserCallStack { range_end: Timestamp, frames: Vec<u64>, is_32bit: bool },
    ModuleLoad { load_addr: u64, size: u64, flags: ModuleFlags, path: String },
    ModuleUnload { load_addr: u64 },
    ProcessStart { parent: Pid, is_32bit: bool, name: String },
    ProcessExit { exit_code: u32 },
}

/// One decoded trace record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub header: RecordHeader,
    pub body: RecordBody,
}

impl Record {
    /// Process and module bookkeeping, as opposed to sample or stack data
    #[must_use]
    pub fn is_registry_event(&self) -> bool {
        matches!(
            self.body,
            RecordBody::ModuleLoad { .. }
                | RecordBody::ModuleUnload { .. }
                | RecordBody::ProcessStart { .. }
                | RecordBody::ProcessExit { .. }
        )
    }
}

/// Length of the record starting at `bytes[0]`
///
/// `bytes` runs to the end of the file. `offset` is only used for error
/// reporting.
///
/// # Errors
/// Returns an unrecoverable error when the header does not fit, the length
/// field is smaller than the header, or the record runs past the end of file.
pub fn record_extent(bytes: &[u8], offset: u64) -> Result<usize, RecordDecodeError> {
    if bytes.len() < RECORD_HEADER_SIZE {
        return Err(RecordDecodeError::Truncated {
            offset,
            needed: RECORD_HEADER_SIZE,
            available: bytes.len(),
        });
    }
    let length = u16::from_le_bytes([bytes[2], bytes[3]]);
    let len = usize::from(length);
    if len < RECORD_HEADER_SIZE {
        return Err(RecordDecodeError::BadLength { offset, length });
    }
    if len > bytes.len() {
        return Err(RecordDecodeError::Truncated { offset, needed: len, available: bytes.len() });
    }
    Ok(len)
}

/// Decode one complete record (`bytes` is exactly the record's extent)
///
/// # Errors
/// Returns a recoverable error for unknown tags and inconsistent payloads.
pub fn decode_record(bytes: &[u8], offset: u64) -> Result<Record, RecordDecodeError> {
    let tag = bytes[0];
    let flags = bytes[1];
    let malformed = |what| RecordDecodeError::Malformed { offset, tag, what };

    let mut cur = &bytes[4..RECORD_HEADER_SIZE];
    let core = cur.read_u32::<LittleEndian>().map_err(|_| malformed("short header"))?;
    let timestamp = cur.read_u64::<LittleEndian>().map_err(|_| malformed("short header"))?;
    let pid = cur.read_u32::<LittleEndian>().map_err(|_| malformed("short header"))?;
    let tid = cur.read_u32::<LittleEndian>().map_err(|_| malformed("short header"))?;
    let header = RecordHeader {
        timestamp: Timestamp(timestamp),
        core: CoreId(core),
        pid: Pid(pid),
        tid: Tid(tid),
    };

    let payload = &bytes[RECORD_HEADER_SIZE..];
    let body = match tag {
        TAG_SAMPLE => decode_sample(payload).ok_or_else(|| malformed("bad sample payload"))?,
        TAG_IBS_FETCH => {
            decode_ibs_fetch(payload).ok_or_else(|| malformed("bad IBS fetch payload"))?
        }
        TAG_IBS_OP => decode_ibs_op(payload).ok_or_else(|| malformed("bad IBS op payload"))?,
        TAG_KERNEL_CALL_STACK => decode_kernel_css(payload, flags & RECORD_FLAG_USER_PENDING != 0)
            .ok_or_else(|| malformed("bad kernel call-stack payload"))?,
        TAG_USER_CALL_STACK => {
            decode_user_css(payload).ok_or_else(|| malformed("bad user call-stack payload"))?
        }
        TAG_MODULE_LOAD => {
            decode_module_load(payload).ok_or_else(|| malformed("bad module-load payload"))?
        }
        TAG_MODULE_UNLOAD => {
            if payload.len() != MODULE_UNLOAD_PAYLOAD_SIZE {
                return Err(malformed("bad module-unload payload"));
            }
            let mut cur = payload;
            let load_addr =
                cur.read_u64::<LittleEndian>().map_err(|_| malformed("bad module-unload payload"))?;
            RecordBody::ModuleUnload { load_addr }
        }
        TAG_PROCESS_START => {
            decode_process_start(payload).ok_or_else(|| malformed("bad process-start payload"))?
        }
        TAG_PROCESS_EXIT => {
            if payload.len() != PROCESS_EXIT_PAYLOAD_SIZE {
                return Err(malformed("bad process-exit payload"));
            }
            let mut cur = payload;
            let exit_code =
                cur.read_u32::<LittleEndian>().map_err(|_| malformed("bad process-exit payload"))?;
            RecordBody::ProcessExit { exit_code }
        }
        _ => return Err(RecordDecodeError::UnknownTag { offset, tag }),
    };

    Ok(Record { header, body })
}

// ============================================================================
// Payload decoders (None = inconsistent payload)
// ============================================================================

fn decode_sample(payload: &[u8]) -> Option<RecordBody> {
    if payload.len() != SAMPLE_PAYLOAD_SIZE {
        return None;
    }
    let mut cur = payload;
    let event_mask = cur.read_u64::<LittleEndian>().ok()?;
    let ip = cur.read_u64::<LittleEndian>().ok()?;
    let weight = cur.read_u32::<LittleEndian>().ok()?;
    Some(RecordBody::Sample { event_mask, ip, weight })
}

fn decode_ibs_fetch(payload: &[u8]) -> Option<RecordBody> {
    if payload.len() != IBS_FETCH_PAYLOAD_SIZE {
        return None;
    }
    let mut cur = payload;
    let ip = cur.read_u64::<LittleEndian>().ok()?;
    let fetch_ctl = cur.read_u64::<LittleEndian>().ok()?;
    let latency = cur.read_u32::<LittleEndian>().ok()?;
    Some(RecordBody::IbsFetch { ip, fetch_ctl, latency })
}

fn decode_ibs_op(payload: &[u8]) -> Option<RecordBody> {
    if payload.len() != IBS_OP_PAYLOAD_SIZE {
        return None;
    }
    let mut cur = payload;
    Some(RecordBody::IbsOp(IbsOpSample {
        ip: cur.read_u64::<LittleEndian>().ok()?,
        op_data: cur.read_u64::<LittleEndian>().ok()?,
        dc_data: cur.read_u64::<LittleEndian>().ok()?,
        dc_lin_addr: cur.read_u64::<LittleEndian>().ok()?,
        op_size: cur.read_u8().ok()?,
    }))
}

fn decode_kernel_css(payload: &[u8], user_pending: bool) -> Option<RecordBody> {
    if payload.len() < KERNEL_CSS_FIXED_SIZE {
        return None;
    }
    let mut cur = payload;
    let event_mask = cur.read_u64::<LittleEndian>().ok()?;
    let sample_ip = cur.read_u64::<LittleEndian>().ok()?;
    let depth = usize::from(cur.read_u16::<LittleEndian>().ok()?);
    if depth > MAX_RECORD_FRAMES || payload.len() != KERNEL_CSS_FIXED_SIZE + depth * 8 {
        return None;
    }
    let mut frames = &payload[KERNEL_CSS_FIXED_SIZE..];
    let frames =
        (0..depth).map(|_| frames.read_u64::<LittleEndian>()).collect::<Result<Vec<_>, _>>().ok()?;
    Some(RecordBody::KernelCallStack { event_mask, sample_ip, frames, user_pending })
}

fn decode_user_css(payload: &[u8]) -> Option<RecordBody> {
    if payload.len() < USER_CSS_FIXED_SIZE {
        return None;
    }
    let mut cur = payload;
    let range_end = cur.read_u64::<LittleEndian>().ok()?;
    let depth = usize::from(cur.read_u16::<LittleEndian>().ok()?);
    let is_32bit = cur.read_u8().ok()? != 0;
    let width = if is_32bit { 4 } else { 8 };
    if depth > MAX_RECORD_FRAMES || payload.len() != USER_CSS_FIXED_SIZE + depth * width {
        return None;
    }
    let mut raw = &payload[USER_CSS_FIXED_SIZE..];
    let frames = (0..depth)
        .map(|_| {
            if is_32bit {
                raw.read_u32::<LittleEndian>().map(u64::from)
            } else {
                raw.read_u64::<LittleEndian>()
            }
        })
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    Some(RecordBody::UserCallStack { range_end: Timestamp(range_end), frames, is_32bit })
}

fn decode_module_load(payload: &[u8]) -> Option<RecordBody> {
    if payload.len() < MODULE_LOAD_FIXED_SIZE {
        return None;
    }
    let mut cur = payload;
    let load_addr = cur.read_u64::<LittleEndian>().ok()?;
    let size = cur.read_u64::<LittleEndian>().ok()?;
    let flags = ModuleFlags::from_bits(cur.read_u32::<LittleEndian>().ok()?);
    let name_len = usize::from(cur.read_u16::<LittleEndian>().ok()?);
    if size == 0 || payload.len() != MODULE_LOAD_FIXED_SIZE + name_len {
        return None;
    }
    let path = String::from_utf8_lossy(&payload[MODULE_LOAD_FIXED_SIZE..]).into_owned();
    Some(RecordBody::ModuleLoad { load_addr, size, flags, path })
}

fn decode_process_start(payload: &[u8]) -> Option<RecordBody> {
    if payload.len() < PROCESS_START_FIXED_SIZE {
        return None;
    }
    let mut cur = payload;
    let parent = Pid(cur.read_u32::<LittleEndian>().ok()?);
    let flags = cur.read_u32::<LittleEndian>().ok()?;
    let name_len = usize::from(cur.read_u16::<LittleEndian>().ok()?);
    if payload.len() != PROCESS_START_FIXED_SIZE + name_len {
        return None;
    }
    let name = String::from_utf8_lossy(&payload[PROCESS_START_FIXED_SIZE..]).into_owned();
    Some(RecordBody::ProcessStart { parent, is_32bit: flags & PROCESS_FLAG_32BIT != 0, name })
}

#[cfg(test)]
mod tests {
    use super::*;
    use prd_common::{FileHeader, RecordStamp, TraceWriter, TIMER_EVENT_MASK};

    fn encoded(build: impl FnOnce(&mut TraceWriter)) -> Vec<u8> {
        let header = FileHeader::new(1);
        let skip = usize::try_from(header.tables_end()).unwrap();
        let mut writer = TraceWriter::new(header);
        build(&mut writer);
        writer.finish()[skip..].to_vec()
    }

    #[test]
    fn test_decode_sample() {
        let bytes = encoded(|w| {
            w.sample(RecordStamp::new(5, 2, 100, 101), TIMER_EVENT_MASK, 0x40_1000, 3);
        });
        let len = record_extent(&bytes, 0).unwrap();
        let record = decode_record(&bytes[..len], 0).unwrap();
        assert_eq!(record.header.pid, Pid(100));
        assert_eq!(record.header.core, CoreId(2));
        assert_eq!(
            record.body,
            RecordBody::Sample { event_mask: TIMER_EVENT_MASK, ip: 0x40_1000, weight: 3 }
        );
    }

    #[test]
    fn test_decode_user_css_32bit() {
        let bytes = encoded(|w| {
            w.user_call_stack(RecordStamp::new(10, 0, 1, 1), 20, &[0x1000, 0x2000], true);
        });
        let len = record_extent(&bytes, 0).unwrap();
        match decode_record(&bytes[..len], 0).unwrap().body {
            RecordBody::UserCallStack { range_end, frames, is_32bit } => {
                assert_eq!(range_end, Timestamp(20));
                assert_eq!(frames, vec![0x1000, 0x2000]);
                assert!(is_32bit);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn test_kernel_css_user_pending_flag() {
        let bytes = encoded(|w| {
            w.kernel_call_stack(RecordStamp::new(1, 0, 1, 1), TIMER_EVENT_MASK, 0x10, &[0x20], true);
        });
        let len = record_extent(&bytes, 0).unwrap();
        let record = decode_record(&bytes[..len], 0).unwrap();
        assert!(matches!(record.body, RecordBody::KernelCallStack { user_pending: true, .. }));
    }

    #[test]
    fn test_extent_errors() {
        assert!(matches!(record_extent(&[1, 0, 0], 7), Err(RecordDecodeError::Truncated { .. })));

        let mut bytes = encoded(|w| {
            w.process_exit(RecordStamp::new(1, 0, 1, 1), 0);
        });
        bytes[2] = 4;
        bytes[3] = 0;
        assert_eq!(
            record_extent(&bytes, 64),
            Err(RecordDecodeError::BadLength { offset: 64, length: 4 })
        );
    }

    #[test]
    fn test_unknown_tag_is_recoverable() {
        let mut bytes = encoded(|w| {
            w.process_exit(RecordStamp::new(1, 0, 1, 1), 0);
        });
        bytes[0] = 0x7F;
        let len = record_extent(&bytes, 0).unwrap();
        let err = decode_record(&bytes[..len], 0).unwrap_err();
        assert!(err.is_recoverable());
    }
}
