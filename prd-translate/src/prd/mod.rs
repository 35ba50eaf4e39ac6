//! PRD trace reading: header validation, partitioning and record decoding

pub mod reader;
pub mod record;

pub use reader::{parse_header, resync, ByteRange, PrdReader, RecordAt, RecordIter};
pub use record::{decode_record, record_extent, ModuleFlags, Record, RecordBody, RecordHeader};
