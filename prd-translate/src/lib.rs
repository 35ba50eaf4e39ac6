//! # prd-translate - Raw PRD Trace Translator
//!
//! Turns the raw sampling traces written by the CPU profiling driver (PRD
//! files) into a normalized profile: per-function sample counts per process,
//! thread, module instance and core sampling configuration, plus the
//! reconstructed call stacks the samples were taken on.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     PRD trace (memory mapped)                   │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ records, partitioned by pid or byte range
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Translation workers (scoped threads)           │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │   Registry   │◀──│  Call-Stack  │   │    Sample    │         │
//! │  │ (shared,     │   │   Builder    │   │  Aggregator  │         │
//! │  │  per-pid     │   └──────┬───────┘   └──────┬───────┘         │
//! │  │  RwLocks)    │◀─────────┴── SiteResolver ──┘                 │
//! │  └──────────────┘            (SymbolProvider)                   │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ WorkerOutput over crossbeam channel
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │        Driver: merge ──► normalize ──► ProfileSink (JSON)        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`prd`]: header validation, record decoding, byte partitions
//! - [`registry`]: processes and module instances over time, task info
//! - [`callstack`]: per-thread pairing of kernel and user stack fragments
//! - [`aggregation`]: sample counters, IBS/CLU derived events, stage stats
//! - [`symbolization`]: function lookup inside modules (JSON, ELF/PE)
//! - [`translation`]: driver, workers, progress, cancellation
//! - [`export`]: normalized profile rows and sinks
//! - [`config`]: run settings
//! - [`cli`]: command-line arguments of the `prd-translate` binary
//! - [`domain`]: newtypes and error types
//!
//! ## Typical Usage
//!
//! ```no_run
//! use prd_translate::config::TranslateConfig;
//! use prd_translate::export::JsonProfileWriter;
//! use prd_translate::translation::PrdTranslator;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let translator = PrdTranslator::new(TranslateConfig::default());
//! let mut sink = JsonProfileWriter::create("run.profile.json")?;
//! let report = translator.translate_file("run.prd", &mut sink)?;
//! println!("{} records, {} missed", report.records_processed, report.missed.missed_count);
//! # Ok(())
//! # }
//! ```

pub mod aggregation;
pub mod callstack;
pub mod cli;
pub mod config;
pub mod domain;
pub mod export;
pub mod prd;
pub mod registry;
pub mod symbolization;
pub mod translation;
