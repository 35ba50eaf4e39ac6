//! Progress reporting and cancellation
//!
//! Workers add the bytes they consume to one atomic counter. A report is sent
//! only when the counter crosses a 1% step, and reports are serialized so the
//! sink never sees a smaller value after a larger one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Receiver of progress updates
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, bytes_processed: u64, total_bytes: u64);
}

impl<F> ProgressSink for F
where
    F: Fn(u64, u64) + Send + Sync,
{
    fn on_progress(&self, bytes_processed: u64, total_bytes: u64) {
        self(bytes_processed, total_bytes);
    }
}

/// Cooperative cancellation flag shared with the workers
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reports per run
const REPORT_STEPS: u64 = 100;

pub(crate) struct ProgressReporter {
    sink: Option<Arc<dyn ProgressSink>>,
    total: u64,
    step: u64,
    consumed: AtomicU64,
    last_reported: Mutex<u64>,
}

impl ProgressReporter {
    pub(crate) fn new(sink: Option<Arc<dyn ProgressSink>>, total: u64) -> Self {
        Self {
            sink,
            total,
            step: (total / REPORT_STEPS).max(1),
            consumed: AtomicU64::new(0),
            last_reported: Mutex::new(0),
        }
    }

    /// Count `bytes` more as consumed
    pub(crate) fn advance(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let before = self.consumed.fetch_add(bytes, Ordering::Relaxed);
        let now = (before + bytes).min(self.total);
        if now / self.step > before / self.step || now == self.total {
            self.report(now);
        }
    }

    /// Report the total once everything was consumed
    pub(crate) fn finish(&self) {
        self.report(self.total);
    }

    fn report(&self, value: u64) {
        let Some(sink) = &self.sink else {
            return;
        };
        // A poisoned lock means a sink panicked; stop reporting
        let Ok(mut last) = self.last_reported.lock() else {
            return;
        };
        if value > *last {
            *last = value;
            sink.on_progress(value, self.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<u64>>>, Arc<dyn ProgressSink>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: Arc<dyn ProgressSink> =
            Arc::new(move |done: u64, _total: u64| sink_seen.lock().unwrap().push(done));
        (seen, sink)
    }

    #[test]
    fn test_reports_are_coalesced() {
        let (seen, sink) = recorder();
        let reporter = ProgressReporter::new(Some(sink), 10_000);
        for _ in 0..10_000 {
            reporter.advance(1);
        }
        reporter.finish();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 100);
        assert_eq!(*seen.last().unwrap(), 10_000);
    }

    #[test]
    fn test_concurrent_reports_monotonic() {
        let (seen, sink) = recorder();
        let reporter = ProgressReporter::new(Some(sink), 4 * 5_000);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1_000 {
                        reporter.advance(5);
                    }
                });
            }
        });
        reporter.finish();
        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*seen.last().unwrap(), 20_000);
    }

    #[test]
    fn test_cancellation_token_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
