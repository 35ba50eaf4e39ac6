//! Trace builders shared by the integration tests

#![allow(dead_code)]

use prd_common::{
    EventConfig, FileHeader, RecordStamp, TraceWriter, TIMER_EVENT_MASK,
};
use prd_translate::config::{PartitionMode, TranslateConfig};
use prd_translate::prd::PrdReader;
use prd_translate::symbolization::JsonSymbolTable;
use std::sync::Arc;

pub const APP_PATH: &str = "/usr/bin/app";
pub const APP_BASE: u64 = 0x40_0000;
pub const APP_SIZE: u64 = 0x1_0000;
pub const LIB_PATH: &str = "/usr/lib/libwork.so";
pub const LIB_BASE: u64 = 0x7f00_0000;
pub const LIB_SIZE: u64 = 0x8000;
pub const TIMER_INTERVAL: u64 = 250_000;

/// `main` at 0x1000, `compute` at 0x2000 in the app; `work` at 0x100 in the library
pub fn symbols() -> Arc<JsonSymbolTable> {
    let json = r#"{
        "modules": [
            { "path": "/usr/bin/app",
              "functions": [
                { "name": "main", "start": 4096, "size": 256 },
                { "name": "compute", "start": 8192, "size": 512 }
              ] },
            { "path": "/usr/lib/libwork.so",
              "functions": [ { "name": "work", "start": 256, "size": 128 } ] }
        ]
    }"#;
    Arc::new(JsonSymbolTable::from_json(json).unwrap())
}

pub fn header(cpus: u32) -> FileHeader {
    let mut header = FileHeader::new(cpus);
    header.events.push(EventConfig { event_mask: TIMER_EVENT_MASK, interval: TIMER_INTERVAL });
    header
}

pub fn stamp(t: u64, pid: u32, tid: u32) -> RecordStamp {
    RecordStamp::new(t, tid % 4, pid, tid)
}

/// Start `pid` and map the app and the library into it at time `t`
pub fn start_app(writer: &mut TraceWriter, t: u64, pid: u32, name: &str) {
    writer
        .process_start(stamp(t, pid, pid), 1, 0, name)
        .module_load(stamp(t, pid, pid), APP_BASE, APP_SIZE, 0, APP_PATH)
        .module_load(stamp(t, pid, pid), LIB_BASE, LIB_SIZE, 0, LIB_PATH);
}

/// Several processes and threads sampling in `main`, `compute` and `work`
pub fn multi_process_trace(processes: u32, samples_per_thread: u64) -> Vec<u8> {
    let mut writer = TraceWriter::new(header(4));
    let mut t = 1;
    for p in 0..processes {
        start_app(&mut writer, t, 100 + p, "app");
        t += 1;
    }
    let ips = [APP_BASE + 0x1010, APP_BASE + 0x2040, LIB_BASE + 0x110, 0xdead_0000];
    for i in 0..samples_per_thread {
        for p in 0..processes {
            let pid = 100 + p;
            for tid in [pid, pid + 1000] {
                let ip = ips[((i + u64::from(tid)) % 4) as usize];
                writer.sample(stamp(t, pid, tid), TIMER_EVENT_MASK, ip, 1);
                t += 1;
            }
        }
    }
    for p in 0..processes {
        writer.process_exit(stamp(t, 100 + p, 100 + p), 0);
        t += 1;
    }
    writer.finish()
}

pub fn reader(bytes: Vec<u8>) -> PrdReader {
    PrdReader::from_bytes(bytes).unwrap()
}

/// Exactly `workers` workers, even on machines with fewer CPUs
pub fn config(workers: usize, partition: PartitionMode) -> TranslateConfig {
    TranslateConfig { workers, exact_workers: true, partition, ..TranslateConfig::default() }
}
