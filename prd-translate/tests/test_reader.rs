mod common;

use prd_common::{encode_header, FileHeader, RecordStamp, TraceWriter, TIMER_EVENT_MASK};
use prd_translate::domain::{FormatError, RecordDecodeError, TranslateError};
use prd_translate::prd::{PrdReader, RecordBody};

fn sample_trace(count: u64) -> Vec<u8> {
    let mut writer = TraceWriter::new(common::header(2));
    for i in 0..count {
        let pid = 10 + (i % 3) as u32;
        writer.sample(RecordStamp::new(i, 0, pid, pid), TIMER_EVENT_MASK, 0x1000 + i, 1);
    }
    writer.finish()
}

#[test]
fn test_open_reads_header_and_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.prd");
    std::fs::write(&path, sample_trace(5)).unwrap();

    let reader = PrdReader::open(&path).unwrap();
    assert_eq!(reader.path(), Some(path.as_path()));
    assert_eq!(reader.header().cpu_count, 2);
    assert_eq!(reader.header().events[0].event_mask, TIMER_EVENT_MASK);

    let ips: Vec<u64> = reader
        .records()
        .map(|r| match r.unwrap().record.body {
            RecordBody::Sample { ip, .. } => ip,
            other => panic!("unexpected record {other:?}"),
        })
        .collect();
    assert_eq!(ips, vec![0x1000, 0x1001, 0x1002, 0x1003, 0x1004]);
}

#[test]
fn test_open_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = PrdReader::open(dir.path().join("absent.prd"));
    assert!(matches!(result, Err(TranslateError::Open { .. })));
}

#[test]
fn test_open_rejects_bad_magic() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.prd");
    let mut bytes = sample_trace(1);
    bytes[..4].copy_from_slice(b"NOPE");
    std::fs::write(&path, bytes).unwrap();

    match PrdReader::open(&path) {
        Err(TranslateError::FileFormat { source, .. }) => {
            assert_eq!(source, FormatError::BadMagic(*b"NOPE"));
        }
        other => panic!("expected a format error, got {:?}", other.err()),
    }
}

#[test]
fn test_rejects_unsupported_version() {
    let mut header = FileHeader::new(1);
    header.version = 99;
    let bytes = encode_header(&FileHeader { data_offset: 64, ..header });
    assert_eq!(PrdReader::from_bytes(bytes).err(), Some(FormatError::UnsupportedVersion(99)));
}

#[test]
fn test_rejects_truncated_header() {
    let bytes = sample_trace(0)[..40].to_vec();
    assert_eq!(PrdReader::from_bytes(bytes).err(), Some(FormatError::TruncatedHeader(40)));
}

#[test]
fn test_rejects_data_offset_past_end() {
    let mut header = common::header(1);
    header.data_offset = 4096;
    let bytes = encode_header(&header);
    assert!(matches!(
        PrdReader::from_bytes(bytes),
        Err(FormatError::DataOffsetOutOfRange { data_offset: 4096, .. })
    ));
}

#[test]
fn test_empty_trace_has_no_records() {
    let reader = PrdReader::from_bytes(sample_trace(0)).unwrap();
    assert!(reader.data_range().is_empty());
    assert_eq!(reader.records().count(), 0);
    assert!(reader.partitions(4).iter().all(|p| p.is_empty()));
}

#[test]
fn test_partitions_cover_every_record_once() {
    let reader = PrdReader::from_bytes(sample_trace(101)).unwrap();
    let all: Vec<u64> = reader.records().map(|r| r.unwrap().offset).collect();

    for n in [1, 2, 3, 7, 16] {
        let parts = reader.partitions(n);
        assert_eq!(parts.len(), n);
        assert_eq!(parts[0].start, reader.data_range().start);
        assert_eq!(parts[n - 1].end, reader.data_range().end);
        for pair in parts.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }

        let mut seen: Vec<u64> = parts
            .iter()
            .flat_map(|p| reader.records_in(*p).map(|r| r.unwrap().offset).collect::<Vec<_>>())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, all, "{n} partitions");
    }
}

#[test]
fn test_unknown_tag_is_skipped() {
    let mut writer = TraceWriter::new(common::header(1));
    writer.sample(RecordStamp::new(1, 0, 5, 5), TIMER_EVENT_MASK, 0x10, 1);
    let mut bogus = [0u8; 24];
    bogus[0] = 0xee;
    bogus[2] = 24;
    writer.raw(&bogus);
    writer.sample(RecordStamp::new(2, 0, 5, 5), TIMER_EVENT_MASK, 0x20, 1);
    let reader = PrdReader::from_bytes(writer.finish()).unwrap();

    let items: Vec<_> = reader.records().collect();
    assert_eq!(items.len(), 3);
    assert!(items[0].is_ok());
    match &items[1] {
        Err(err @ RecordDecodeError::UnknownTag { tag: 0xee, .. }) => assert!(err.is_recoverable()),
        other => panic!("expected unknown tag, got {other:?}"),
    }
    assert!(items[2].is_ok());
}

#[test]
fn test_truncated_tail_ends_iteration() {
    let mut bytes = sample_trace(3);
    bytes.truncate(bytes.len() - 5);
    let reader = PrdReader::from_bytes(bytes).unwrap();

    let mut records = reader.records();
    assert!(records.next().unwrap().is_ok());
    assert!(records.next().unwrap().is_ok());
    assert!(matches!(records.next(), Some(Err(RecordDecodeError::Truncated { .. }))));
    assert!(records.next().is_none());
    assert_eq!(records.remaining(), 0);
}
