//! PRD file access
//!
//! The reader validates the file header once, then hands out record
//! iterators over the whole record area or over one byte partition of it.
//!
//! ## Partitioning
//!
//! ```text
//! data_offset                                              EOF
//! │ rec │ rec │ rec │ rec │ rec │ rec │ rec │ rec │ rec │ rec │
//! └───── partition 0 ─────┴──── partition 1 ────┴─ part. 2 ─┘
//!        (boundaries snapped forward to the next record start)
//! ```
//!
//! A record belongs to the partition holding its first byte, so each record
//! is decoded exactly once across all partitions.
//!
//! ## Resynchronization
//!
//! A length field shorter than the record header gives no way to step over
//! the record. The reader then scans forward byte by byte to the next offset
//! holding a decodable record ([`resync`]) and counts the bytes in between
//! as skipped. Partition boundaries are snapped with the same scan, so a
//! partition never starts inside the skipped bytes.

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use memmap2::Mmap;
use prd_common::{
    CoreTopology, EventConfig, FileHeader, EVENT_ENTRY_SIZE, FILE_HEADER_SIZE, PRD_MAGIC,
    PRD_VERSION, TOPOLOGY_ENTRY_SIZE,
};
use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use super::record::{decode_record, record_extent, Record};
use crate::domain::{FormatError, RecordDecodeError, TranslateError};

/// Half-open byte range `[start, end)` of the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

enum TraceBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for TraceBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(map) => map,
            Self::Owned(bytes) => bytes,
        }
    }
}

/// Validated PRD trace
pub struct PrdReader {
    path: Option<PathBuf>,
    bytes: TraceBytes,
    header: FileHeader,
}

impl PrdReader {
    /// Memory-map and validate a trace file
    ///
    /// # Errors
    /// Returns `TranslateError::Open` if the file cannot be opened or mapped and
    /// `TranslateError::FileFormat` if the header is invalid
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TranslateError> {
        let path = path.as_ref();
        let open_err = |source| TranslateError::Open { path: path.to_path_buf(), source };
        let file = File::open(path).map_err(open_err)?;
        // SAFETY: the mapping is read-only and the trace is not modified while translating
        #[allow(unsafe_code)]
        let map = unsafe { Mmap::map(&file) }.map_err(open_err)?;
        let header = parse_header(&map).map_err(|source| TranslateError::FileFormat {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(
            "{}: {} bytes, {} events, {} cores",
            path.display(),
            map.len(),
            header.events.len(),
            header.cpu_count
        );
        Ok(Self { path: Some(path.to_path_buf()), bytes: TraceBytes::Mapped(map), header })
    }

    /// Validate an in-memory trace image
    ///
    /// # Errors
    /// Returns a [`FormatError`] if the header is invalid
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, FormatError> {
        let header = parse_header(&bytes)?;
        Ok(Self { path: None, bytes: TraceBytes::Owned(bytes), header })
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Byte range of the record area
    #[must_use]
    pub fn data_range(&self) -> ByteRange {
        ByteRange { start: self.header.data_offset, end: self.bytes.len() as u64 }
    }

    /// Iterate over every record in file order
    #[must_use]
    pub fn records(&self) -> RecordIter<'_> {
        self.records_in(self.data_range())
    }

    /// Iterate over the records that start inside `range`
    #[must_use]
    pub fn records_in(&self, range: ByteRange) -> RecordIter<'_> {
        RecordIter { bytes: &self.bytes, pos: range.start, end: range.end, done: false, skipped: 0 }
    }

    /// Split the record area into `n` contiguous partitions
    ///
    /// Boundaries are snapped forward to record starts. Partitions may be
    /// empty when records are large relative to the file. A too-short length
    /// field is stepped over with [`resync`]; a record running past the end
    /// of the file stops snapping and leaves the rest to the partition that
    /// contains it.
    #[must_use]
    pub fn partitions(&self, n: usize) -> Vec<ByteRange> {
        let data = self.data_range();
        let n = n.max(1) as u64;
        let mut boundaries = Vec::with_capacity(usize::try_from(n).unwrap_or(1) + 1);
        boundaries.push(data.start);

        let mut pos = data.start;
        let mut walk_ok = true;
        for i in 1..n {
            let target = data.start + data.len() * i / n;
            while walk_ok && pos < target {
                match record_extent(&self.bytes[offset_to_index(pos)..], pos) {
                    Ok(len) => pos += len as u64,
                    Err(RecordDecodeError::BadLength { .. }) => {
                        pos = resync(&self.bytes, pos, data.end);
                    }
                    Err(_) => walk_ok = false,
                }
            }
            let boundary = if walk_ok { pos.min(data.end) } else { data.end };
            boundaries.push(boundary);
        }
        boundaries.push(data.end);

        boundaries.windows(2).map(|w| ByteRange { start: w[0], end: w[1] }).collect()
    }
}

fn offset_to_index(offset: u64) -> usize {
    usize::try_from(offset).unwrap_or(usize::MAX)
}

/// First offset in `(from, end)` where a decodable record starts, or `end`
///
/// `end` must not exceed `bytes.len()`.
#[must_use]
pub fn resync(bytes: &[u8], from: u64, end: u64) -> u64 {
    (from + 1..end)
        .find(|&pos| {
            let rest = &bytes[offset_to_index(pos)..];
            record_extent(rest, pos).is_ok_and(|len| decode_record(&rest[..len], pos).is_ok())
        })
        .unwrap_or(end)
}

/// A decoded record and where it sits in the file
#[derive(Debug, Clone)]
pub struct RecordAt {
    pub offset: u64,
    pub len: usize,
    pub record: Record,
}

/// Iterator over the records that start inside one byte range
///
/// Yields `Err` for undecodable records. A bad length field is followed by a
/// [`resync`]; a record running past the end of the file exhausts the
/// iterator.
pub struct RecordIter<'a> {
    bytes: &'a [u8],
    pos: u64,
    end: u64,
    done: bool,
    skipped: u64,
}

impl RecordIter<'_> {
    /// Offset of the next record to be read
    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Bytes of the range not yet consumed
    #[must_use]
    pub fn remaining(&self) -> u64 {
        if self.done {
            0
        } else {
            self.end.saturating_sub(self.pos)
        }
    }

    /// Bytes passed over without yielding a record: resync gaps and an
    /// abandoned tail
    #[must_use]
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }
}

impl Iterator for RecordIter<'_> {
    type Item = Result<RecordAt, RecordDecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.end {
            return None;
        }
        let offset = self.pos;
        let rest = &self.bytes[offset_to_index(offset)..];
        let len = match record_extent(rest, offset) {
            Ok(len) => len,
            Err(err @ RecordDecodeError::BadLength { .. }) => {
                self.pos = resync(self.bytes, offset, self.end);
                self.skipped += self.pos - offset;
                return Some(Err(err));
            }
            Err(err) => {
                self.skipped += self.end.saturating_sub(offset);
                self.done = true;
                return Some(Err(err));
            }
        };
        self.pos += len as u64;
        Some(decode_record(&rest[..len], offset).map(|record| RecordAt { offset, len, record }))
    }
}

/// Parse and validate the file header and its tables
///
/// # Errors
/// Returns a [`FormatError`] describing the first violated constraint
pub fn parse_header(bytes: &[u8]) -> Result<FileHeader, FormatError> {
    if bytes.len() < FILE_HEADER_SIZE {
        return Err(FormatError::TruncatedHeader(bytes.len()));
    }
    let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if magic != PRD_MAGIC {
        return Err(FormatError::BadMagic(magic));
    }
    let version = LittleEndian::read_u16(&bytes[4..6]);
    if version != PRD_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    let header_size = LittleEndian::read_u16(&bytes[6..8]);
    if usize::from(header_size) != FILE_HEADER_SIZE {
        return Err(FormatError::BadHeaderSize(header_size));
    }

    let event_count = LittleEndian::read_u32(&bytes[40..44]) as usize;
    let topology_count = LittleEndian::read_u32(&bytes[44..48]) as usize;
    let file_len = bytes.len() as u64;
    let tables_end = (FILE_HEADER_SIZE as u64)
        .saturating_add((event_count as u64).saturating_mul(EVENT_ENTRY_SIZE as u64))
        .saturating_add((topology_count as u64).saturating_mul(TOPOLOGY_ENTRY_SIZE as u64));
    if tables_end > file_len {
        return Err(FormatError::TruncatedTables { tables_end, file_len });
    }
    let data_offset = LittleEndian::read_u64(&bytes[48..56]);
    if data_offset < tables_end || data_offset > file_len {
        return Err(FormatError::DataOffsetOutOfRange { data_offset, tables_end, file_len });
    }

    let events = bytes[FILE_HEADER_SIZE..]
        .chunks_exact(EVENT_ENTRY_SIZE)
        .take(event_count)
        .map(|entry| EventConfig {
            event_mask: LittleEndian::read_u64(&entry[0..8]),
            interval: LittleEndian::read_u64(&entry[8..16]),
        })
        .collect();
    let topology_start = FILE_HEADER_SIZE + event_count * EVENT_ENTRY_SIZE;
    let topology = bytes[topology_start..]
        .chunks_exact(TOPOLOGY_ENTRY_SIZE)
        .take(topology_count)
        .map(|entry| CoreTopology {
            core: LittleEndian::read_u32(&entry[0..4]),
            processor: LittleEndian::read_u16(&entry[4..6]),
            numa_node: LittleEndian::read_u16(&entry[6..8]),
        })
        .collect();

    Ok(FileHeader {
        version,
        flags: LittleEndian::read_u32(&bytes[8..12]),
        cpu_count: LittleEndian::read_u32(&bytes[12..16]),
        cpu_family: LittleEndian::read_u32(&bytes[16..20]),
        cpu_model: LittleEndian::read_u32(&bytes[20..24]),
        tick_frequency: LittleEndian::read_u64(&bytes[24..32]),
        start_tick: LittleEndian::read_u64(&bytes[32..40]),
        events,
        topology,
        data_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use prd_common::{RecordStamp, TraceWriter, TIMER_EVENT_MASK};

    fn trace_with_samples(count: u64) -> Vec<u8> {
        let mut writer = TraceWriter::new(FileHeader::new(2));
        for i in 0..count {
            writer.sample(RecordStamp::new(i, 0, 1, 1), TIMER_EVENT_MASK, 0x1000 + i, 1);
        }
        writer.finish()
    }

    #[test]
    fn test_header_roundtrip_fields() {
        let mut header = FileHeader::new(8);
        header.events.push(EventConfig { event_mask: TIMER_EVENT_MASK, interval: 250_000 });
        header.topology.push(CoreTopology { core: 3, processor: 1, numa_node: 0 });
        let bytes = TraceWriter::new(header).finish();

        let parsed = parse_header(&bytes).unwrap();
        assert_eq!(parsed.cpu_count, 8);
        assert_eq!(parsed.events[0].interval, 250_000);
        assert_eq!(parsed.topology[0].core, 3);
        assert_eq!(parsed.data_offset, 64 + 16 + 8);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = trace_with_samples(1);
        bytes[0] = b'X';
        assert!(matches!(parse_header(&bytes), Err(FormatError::BadMagic(_))));
    }

    #[test]
    fn test_partitions_cover_every_record_once() {
        let reader = PrdReader::from_bytes(trace_with_samples(37)).unwrap();
        for n in [1, 2, 3, 5, 8, 64] {
            let parts = reader.partitions(n);
            assert_eq!(parts.len(), n);
            assert_eq!(parts[0].start, reader.data_range().start);
            assert_eq!(parts[n - 1].end, reader.data_range().end);
            let total: usize =
                parts.iter().map(|p| reader.records_in(*p).filter(Result::is_ok).count()).sum();
            assert_eq!(total, 37, "partition count {n}");
        }
    }

    #[test]
    fn test_truncated_tail_ends_iteration() {
        let mut bytes = trace_with_samples(3);
        bytes.truncate(bytes.len() - 5);
        let reader = PrdReader::from_bytes(bytes).unwrap();
        let results: Vec<_> = reader.records().collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(RecordDecodeError::Truncated { .. })));
    }

    #[test]
    fn test_short_length_resyncs_to_next_record() {
        let mut writer = TraceWriter::new(FileHeader::new(1));
        writer.sample(RecordStamp::new(1, 0, 1, 1), TIMER_EVENT_MASK, 0x10, 1);
        let mut bogus = [0u8; 32];
        bogus[0] = 1;
        bogus[2] = 4;
        writer.raw(&bogus);
        for i in 0..3 {
            writer.sample(RecordStamp::new(2 + i, 0, 1, 1), TIMER_EVENT_MASK, 0x20 + i, 1);
        }
        let reader = PrdReader::from_bytes(writer.finish()).unwrap();
        let bad_at = reader.data_range().start + 48;

        let mut records = reader.records();
        let results: Vec<_> = records.by_ref().collect();
        assert_eq!(results.len(), 5);
        assert!(matches!(
            results[1],
            Err(RecordDecodeError::BadLength { offset, length: 4 }) if offset == bad_at
        ));
        assert_eq!(results[2].as_ref().map(|at| at.offset), Ok(bad_at + 32));
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 4);
        assert_eq!(records.skipped_bytes(), 32);

        for n in [2, 3, 4] {
            let total: usize = reader
                .partitions(n)
                .iter()
                .map(|p| reader.records_in(*p).filter(Result::is_ok).count())
                .sum();
            assert_eq!(total, 4, "partition count {n}");
        }
    }

    #[test]
    fn test_resync_without_later_record_skips_to_end() {
        let mut writer = TraceWriter::new(FileHeader::new(1));
        writer.sample(RecordStamp::new(1, 0, 1, 1), TIMER_EVENT_MASK, 0x10, 1);
        writer.raw(&[2, 0, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 9, 9]);
        let reader = PrdReader::from_bytes(writer.finish()).unwrap();

        let mut records = reader.records();
        assert!(records.next().unwrap().is_ok());
        assert!(matches!(records.next(), Some(Err(RecordDecodeError::BadLength { length: 3, .. }))));
        assert!(records.next().is_none());
        assert_eq!(records.skipped_bytes(), 26);
    }
}
