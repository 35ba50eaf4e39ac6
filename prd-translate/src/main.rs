//! # prd-translate - Main Entry Point
//!
//! Translates one trace on a blocking task while the async side watches for
//! Ctrl+C. An interrupt cancels the translation, which then finishes with a
//! partial profile (exit code 3) instead of discarding the work done so far.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;

use prd_translate::cli::Args;
use prd_translate::export::{default_output_path, JsonProfileWriter, MemoryProfileSink, ProfileSink};
use prd_translate::symbolization::{
    ElfSymbolProvider, JsonSymbolTable, NullSymbolProvider, SymbolProvider,
};
use prd_translate::translation::{PrdTranslator, ProgressSink, TranslationReport};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_PARTIAL: i32 = 3;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            EXIT_ERROR
        }
    });
}

fn symbol_provider(args: &Args) -> Result<Arc<dyn SymbolProvider>> {
    if let Some(path) = &args.symbols {
        let table = JsonSymbolTable::load(path)
            .with_context(|| format!("Failed to load symbol table {}", path.display()))?;
        return Ok(Arc::new(table));
    }
    if args.elf_symbols {
        let mut provider = ElfSymbolProvider::new();
        if let Some(root) = &args.sysroot {
            provider = provider.with_root(root);
        }
        return Ok(Arc::new(provider));
    }
    Ok(Arc::new(NullSymbolProvider))
}

fn print_summary(report: &TranslationReport, output: &Path, show_stats: bool) {
    let missed = &report.missed;
    let status = if report.is_partial() {
        "cancelled"
    } else if report.is_clean() {
        "done"
    } else {
        "done with errors"
    };
    eprintln!(
        "{status}: {} records on {} worker(s), {} undecodable ({} bytes skipped), {} unresolved samples, {} filtered, {} excluded, {} inconsistent unloads",
        report.records_processed,
        report.workers,
        missed.missed_count,
        missed.skipped_bytes,
        missed.unresolved_samples,
        missed.filtered_samples,
        missed.excluded_samples,
        missed.inconsistent_unloads,
    );
    if let Some(event) = missed.worst_event {
        eprintln!("most unresolved samples: event 0x{event:x}");
    }
    if show_stats {
        for (stage, value) in report.stats.iter().filter(|(_, v)| v.count > 0) {
            eprintln!("  {stage:<24} {:>10} calls {:>12} us", value.count, value.value);
        }
    }
    println!("saved: {}", output.display());
}

#[tokio::main]
async fn run() -> Result<i32> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_USAGE } else { EXIT_SUCCESS };
            e.print().context("Failed to print usage")?;
            return Ok(code);
        }
    };
    let quiet = args.quiet;
    let output = args.output.clone().unwrap_or_else(|| default_output_path(&args.trace));

    let mut translator = PrdTranslator::new(args.to_config()).with_symbols(symbol_provider(&args)?);
    if !quiet {
        eprintln!("prd-translate v{}", env!("CARGO_PKG_VERSION"));
        let progress: Arc<dyn ProgressSink> = Arc::new(|done: u64, total: u64| {
            eprint!("\rtranslating {:>3}%", done * 100 / total.max(1));
        });
        translator = translator.with_progress(progress);
    }
    let token = translator.cancellation_token();

    let trace = args.trace.clone();
    let task = tokio::task::spawn_blocking(move || {
        let mut sink = MemoryProfileSink::default();
        let report = translator.translate_file(&trace, &mut sink)?;
        Ok::<_, anyhow::Error>((report, sink.profile))
    });
    tokio::pin!(task);

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    let (report, profile) = loop {
        tokio::select! {
            joined = &mut task => {
                break joined
                    .context("Translation task failed")?
                    .with_context(|| format!("Failed to translate {}", args.trace.display()))?;
            }
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                warn!("interrupted, finishing with a partial profile");
                token.cancel();
            }
        }
    };
    if !quiet {
        eprintln!();
    }

    let profile = profile.context("Translation produced no profile")?;
    let mut writer = JsonProfileWriter::create(&output).context("Failed to create profile output file")?;
    writer.write_profile(&profile).context("Failed to export profile")?;
    info!("wrote {} samples to {}", profile.total_samples(), output.display());

    if !quiet {
        print_summary(&report, &output, args.stats);
    }
    Ok(if report.is_partial() { EXIT_PARTIAL } else { EXIT_SUCCESS })
}
