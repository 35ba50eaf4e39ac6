//! Translation driver, workers, progress and normalization

pub mod driver;
mod normalize;
pub mod progress;
mod worker;

pub use driver::{PrdTranslator, TranslationOutcome, TranslationReport};
pub use progress::{CancellationToken, ProgressSink};
