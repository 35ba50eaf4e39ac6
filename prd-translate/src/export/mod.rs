//! Profile export
//!
//! The translator hands one [`NormalizedProfile`] to a [`ProfileSink`]. The
//! JSON writer stands in for the profile database; the memory sink is used by
//! tests and library callers that post-process the result.

pub mod json_writer;
pub mod profile;

pub use json_writer::{default_output_path, JsonProfileWriter, MemoryProfileSink};
pub use profile::{MissedInfo, NormalizedProfile, ProfileStatus, UNKNOWN_ID, UNKNOWN_NAME};

use crate::domain::ExportError;

/// Consumer of a finished translation
pub trait ProfileSink {
    /// # Errors
    /// Returns an `ExportError` if the profile cannot be stored
    fn write_profile(&mut self, profile: &NormalizedProfile) -> Result<(), ExportError>;
}
