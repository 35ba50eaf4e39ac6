//! PRD encoder
//!
//! Produces byte-exact PRD files from typed calls. Used by the integration
//! tests of the translator and by `cargo run -p xtask -- synth-trace`.

use byteorder::{ByteOrder, LittleEndian};
use std::io;
use std::path::Path;

use crate::{
    FileHeader, EVENT_ENTRY_SIZE, FILE_HEADER_SIZE, IBS_FETCH_PAYLOAD_SIZE, IBS_OP_PAYLOAD_SIZE,
    KERNEL_CSS_FIXED_SIZE, MODULE_LOAD_FIXED_SIZE, MODULE_UNLOAD_PAYLOAD_SIZE, PRD_MAGIC,
    PROCESS_EXIT_PAYLOAD_SIZE, PROCESS_START_FIXED_SIZE, RECORD_FLAG_USER_PENDING,
    RECORD_HEADER_SIZE, SAMPLE_PAYLOAD_SIZE, TAG_IBS_FETCH, TAG_IBS_OP, TAG_KERNEL_CALL_STACK,
    TAG_MODULE_LOAD, TAG_MODULE_UNLOAD, TAG_PROCESS_EXIT, TAG_PROCESS_START, TAG_SAMPLE,
    TAG_USER_CALL_STACK, TOPOLOGY_ENTRY_SIZE, USER_CSS_FIXED_SIZE,
};

/// Where and when a record was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordStamp {
    pub timestamp: u64,
    pub core: u32,
    pub pid: u32,
    pub tid: u32,
}

impl RecordStamp {
    #[must_use]
    pub fn new(timestamp: u64, core: u32, pid: u32, tid: u32) -> Self {
        Self { timestamp, core, pid, tid }
    }
}

/// Register values of one IBS op sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IbsOpSample {
    pub ip: u64,
    pub op_data: u64,
    pub dc_data: u64,
    pub dc_lin_addr: u64,
    /// Access size in bytes for loads and stores
    pub op_size: u8,
}

/// Incremental PRD file builder
///
/// Records are appended in call order; [`TraceWriter::finish`] prepends the
/// header with the correct data offset.
pub struct TraceWriter {
    header: FileHeader,
    records: Vec<u8>,
    record_count: usize,
}

impl TraceWriter {
    #[must_use]
    pub fn new(header: FileHeader) -> Self {
        Self { header, records: Vec::new(), record_count: 0 }
    }

    /// Number of records appended so far (raw byte chunks included)
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Append a periodic sample
    pub fn sample(&mut self, at: RecordStamp, event_mask: u64, ip: u64, weight: u32) -> &mut Self {
        let mut payload = [0u8; SAMPLE_PAYLOAD_SIZE];
        LittleEndian::write_u64(&mut payload[0..8], event_mask);
        LittleEndian::write_u64(&mut payload[8..16], ip);
        LittleEndian::write_u32(&mut payload[16..20], weight);
        self.push(TAG_SAMPLE, 0, at, &payload)
    }

    /// Append an IBS fetch sample
    pub fn ibs_fetch(&mut self, at: RecordStamp, ip: u64, fetch_ctl: u64, latency: u32) -> &mut Self {
        let mut payload = [0u8; IBS_FETCH_PAYLOAD_SIZE];
        LittleEndian::write_u64(&mut payload[0..8], ip);
        LittleEndian::write_u64(&mut payload[8..16], fetch_ctl);
        LittleEndian::write_u32(&mut payload[16..20], latency);
        self.push(TAG_IBS_FETCH, 0, at, &payload)
    }

    /// Append an IBS op sample
    pub fn ibs_op(&mut self, at: RecordStamp, op: IbsOpSample) -> &mut Self {
        let mut payload = [0u8; IBS_OP_PAYLOAD_SIZE];
        LittleEndian::write_u64(&mut payload[0..8], op.ip);
        LittleEndian::write_u64(&mut payload[8..16], op.op_data);
        LittleEndian::write_u64(&mut payload[16..24], op.dc_data);
        LittleEndian::write_u64(&mut payload[24..32], op.dc_lin_addr);
        payload[32] = op.op_size;
        self.push(TAG_IBS_OP, 0, at, &payload)
    }

    /// Append a kernel call-stack fragment
    ///
    /// `frames` are the callers of `sample_ip`, innermost first.
    pub fn kernel_call_stack(
        &mut self,
        at: RecordStamp,
        event_mask: u64,
        sample_ip: u64,
        frames: &[u64],
        user_pending: bool,
    ) -> &mut Self {
        let mut payload = vec![0u8; KERNEL_CSS_FIXED_SIZE + frames.len() * 8];
        LittleEndian::write_u64(&mut payload[0..8], event_mask);
        LittleEndian::write_u64(&mut payload[8..16], sample_ip);
        LittleEndian::write_u16(&mut payload[16..18], frame_count(frames.len()));
        for (i, frame) in frames.iter().enumerate() {
            let at = KERNEL_CSS_FIXED_SIZE + i * 8;
            LittleEndian::write_u64(&mut payload[at..at + 8], *frame);
        }
        let flags = if user_pending { RECORD_FLAG_USER_PENDING } else { 0 };
        self.push(TAG_KERNEL_CALL_STACK, flags, at, &payload)
    }

    /// Append a user call-stack fragment covering `[at.timestamp, range_end]`
    ///
    /// 32-bit stacks store each frame in four bytes; higher bits are dropped.
    pub fn user_call_stack(
        &mut self,
        at: RecordStamp,
        range_end: u64,
        frames: &[u64],
        is_32bit: bool,
    ) -> &mut Self {
        let width = if is_32bit { 4 } else { 8 };
        let mut payload = vec![0u8; USER_CSS_FIXED_SIZE + frames.len() * width];
        LittleEndian::write_u64(&mut payload[0..8], range_end);
        LittleEndian::write_u16(&mut payload[8..10], frame_count(frames.len()));
        payload[10] = u8::from(is_32bit);
        for (i, frame) in frames.iter().enumerate() {
            let at = USER_CSS_FIXED_SIZE + i * width;
            if is_32bit {
                #[allow(clippy::cast_possible_truncation)]
                LittleEndian::write_u32(&mut payload[at..at + 4], *frame as u32);
            } else {
                LittleEndian::write_u64(&mut payload[at..at + 8], *frame);
            }
        }
        self.push(TAG_USER_CALL_STACK, 0, at, &payload)
    }

    /// Append a module load
    pub fn module_load(
        &mut self,
        at: RecordStamp,
        load_addr: u64,
        size: u64,
        module_flags: u32,
        path: &str,
    ) -> &mut Self {
        let name = path.as_bytes();
        let mut payload = vec![0u8; MODULE_LOAD_FIXED_SIZE + name.len()];
        LittleEndian::write_u64(&mut payload[0..8], load_addr);
        LittleEndian::write_u64(&mut payload[8..16], size);
        LittleEndian::write_u32(&mut payload[16..20], module_flags);
        LittleEndian::write_u16(&mut payload[20..22], name_len(name.len()));
        payload[MODULE_LOAD_FIXED_SIZE..].copy_from_slice(name);
        self.push(TAG_MODULE_LOAD, 0, at, &payload)
    }

    /// Append a module unload
    pub fn module_unload(&mut self, at: RecordStamp, load_addr: u64) -> &mut Self {
        let mut payload = [0u8; MODULE_UNLOAD_PAYLOAD_SIZE];
        LittleEndian::write_u64(&mut payload, load_addr);
        self.push(TAG_MODULE_UNLOAD, 0, at, &payload)
    }

    /// Append a process start
    pub fn process_start(
        &mut self,
        at: RecordStamp,
        parent_pid: u32,
        process_flags: u32,
        name: &str,
    ) -> &mut Self {
        let name = name.as_bytes();
        let mut payload = vec![0u8; PROCESS_START_FIXED_SIZE + name.len()];
        LittleEndian::write_u32(&mut payload[0..4], parent_pid);
        LittleEndian::write_u32(&mut payload[4..8], process_flags);
        LittleEndian::write_u16(&mut payload[8..10], name_len(name.len()));
        payload[PROCESS_START_FIXED_SIZE..].copy_from_slice(name);
        self.push(TAG_PROCESS_START, 0, at, &payload)
    }

    /// Append a process exit
    pub fn process_exit(&mut self, at: RecordStamp, exit_code: u32) -> &mut Self {
        let mut payload = [0u8; PROCESS_EXIT_PAYLOAD_SIZE];
        LittleEndian::write_u32(&mut payload[0..4], exit_code);
        self.push(TAG_PROCESS_EXIT, 0, at, &payload)
    }

    /// Append arbitrary bytes as one record slot (for corrupt-input tests)
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.records.extend_from_slice(bytes);
        self.record_count += 1;
        self
    }

    /// Encode the header and all records into a complete file image
    #[must_use]
    pub fn finish(&self) -> Vec<u8> {
        let mut header = self.header.clone();
        header.data_offset = header.tables_end();
        let mut out = encode_header(&header);
        out.extend_from_slice(&self.records);
        out
    }

    /// Encode and write the file image to `path`
    ///
    /// # Errors
    /// Returns an error if the file cannot be written
    pub fn write_to(&self, path: impl AsRef<Path>) -> io::Result<()> {
        std::fs::write(path, self.finish())
    }

    fn push(&mut self, tag: u8, flags: u8, at: RecordStamp, payload: &[u8]) -> &mut Self {
        let total = RECORD_HEADER_SIZE + payload.len();
        let mut header = [0u8; RECORD_HEADER_SIZE];
        header[0] = tag;
        header[1] = flags;
        // Oversized records are clamped; the decoder then reports them as malformed.
        LittleEndian::write_u16(&mut header[2..4], u16::try_from(total).unwrap_or(u16::MAX));
        LittleEndian::write_u32(&mut header[4..8], at.core);
        LittleEndian::write_u64(&mut header[8..16], at.timestamp);
        LittleEndian::write_u32(&mut header[16..20], at.pid);
        LittleEndian::write_u32(&mut header[20..24], at.tid);
        self.records.extend_from_slice(&header);
        self.records.extend_from_slice(payload);
        self.record_count += 1;
        self
    }
}

/// Encode a file header including its event and topology tables
#[must_use]
pub fn encode_header(header: &FileHeader) -> Vec<u8> {
    let mut out = vec![0u8; FILE_HEADER_SIZE];
    out[0..4].copy_from_slice(&PRD_MAGIC);
    LittleEndian::write_u16(&mut out[4..6], header.version);
    #[allow(clippy::cast_possible_truncation)]
    LittleEndian::write_u16(&mut out[6..8], FILE_HEADER_SIZE as u16);
    LittleEndian::write_u32(&mut out[8..12], header.flags);
    LittleEndian::write_u32(&mut out[12..16], header.cpu_count);
    LittleEndian::write_u32(&mut out[16..20], header.cpu_family);
    LittleEndian::write_u32(&mut out[20..24], header.cpu_model);
    LittleEndian::write_u64(&mut out[24..32], header.tick_frequency);
    LittleEndian::write_u64(&mut out[32..40], header.start_tick);
    LittleEndian::write_u32(&mut out[40..44], table_len(header.events.len()));
    LittleEndian::write_u32(&mut out[44..48], table_len(header.topology.len()));
    LittleEndian::write_u64(&mut out[48..56], header.data_offset);

    for event in &header.events {
        let mut entry = [0u8; EVENT_ENTRY_SIZE];
        LittleEndian::write_u64(&mut entry[0..8], event.event_mask);
        LittleEndian::write_u64(&mut entry[8..16], event.interval);
        out.extend_from_slice(&entry);
    }
    for core in &header.topology {
        let mut entry = [0u8; TOPOLOGY_ENTRY_SIZE];
        LittleEndian::write_u32(&mut entry[0..4], core.core);
        LittleEndian::write_u16(&mut entry[4..6], core.processor);
        LittleEndian::write_u16(&mut entry[6..8], core.numa_node);
        out.extend_from_slice(&entry);
    }
    out
}

fn frame_count(len: usize) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}

fn name_len(len: usize) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}

fn table_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventConfig, TIMER_EVENT_MASK};

    #[test]
    fn test_finish_sets_data_offset() {
        let mut header = FileHeader::new(2);
        header.events.push(EventConfig { event_mask: TIMER_EVENT_MASK, interval: 1000 });
        let mut writer = TraceWriter::new(header);
        writer.sample(RecordStamp::new(1, 0, 10, 11), TIMER_EVENT_MASK, 0x1000, 1);

        let bytes = writer.finish();
        let data_offset = LittleEndian::read_u64(&bytes[48..56]);
        assert_eq!(data_offset, 64 + 16);
        assert_eq!(bytes.len() as u64, data_offset + 48);
        assert_eq!(bytes[data_offset as usize], TAG_SAMPLE);
    }

    #[test]
    fn test_record_length_field() {
        let mut writer = TraceWriter::new(FileHeader::new(1));
        writer.module_load(RecordStamp::new(0, 0, 1, 1), 0x40_0000, 0x1000, 0, "a.exe");
        let bytes = writer.finish();
        let len = LittleEndian::read_u16(&bytes[64 + 2..64 + 4]);
        assert_eq!(usize::from(len), RECORD_HEADER_SIZE + MODULE_LOAD_FIXED_SIZE + 5);
        assert_eq!(writer.record_count(), 1);
    }
}
