use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::profile::NormalizedProfile;
use super::ProfileSink;
use crate::domain::ExportError;

/// Writes the profile as pretty-printed JSON
///
/// Accepts any `Write`, so tests can export into a `Vec<u8>`.
pub struct JsonProfileWriter<W: Write> {
    writer: W,
}

impl JsonProfileWriter<BufWriter<File>> {
    /// Create (or truncate) `path`
    ///
    /// # Errors
    /// Returns `ExportError::WriteFailed` if the file cannot be created
    pub fn create(path: impl AsRef<Path>) -> Result<Self, ExportError> {
        let path = path.as_ref();
        let file = File::create(path)
            .map_err(|e| ExportError::WriteFailed(format!("{}: {e}", path.display())))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> JsonProfileWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ProfileSink for JsonProfileWriter<W> {
    fn write_profile(&mut self, profile: &NormalizedProfile) -> Result<(), ExportError> {
        profile.validate_references()?;
        serde_json::to_writer_pretty(&mut self.writer, profile)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps the last written profile in memory
#[derive(Debug, Default)]
pub struct MemoryProfileSink {
    pub profile: Option<NormalizedProfile>,
}

impl ProfileSink for MemoryProfileSink {
    fn write_profile(&mut self, profile: &NormalizedProfile) -> Result<(), ExportError> {
        self.profile = Some(profile.clone());
        Ok(())
    }
}

/// Where `prd-translate` writes when no output path is given
#[must_use]
pub fn default_output_path(trace: &Path) -> PathBuf {
    trace.with_extension("profile.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::profile::{ProfileStatus, UNKNOWN_NAME};

    #[test]
    fn test_export_to_buffer() {
        let profile = NormalizedProfile { status: ProfileStatus::Partial, ..Default::default() };
        let mut writer = JsonProfileWriter::new(Vec::new());
        writer.write_profile(&profile).unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();
        assert!(text.contains("\"status\": \"partial\""));

        let back: NormalizedProfile = serde_json::from_str(&text).unwrap();
        assert_eq!(back, profile);
    }

    #[test]
    fn test_invalid_profile_not_written() {
        let mut profile = NormalizedProfile::default();
        profile.functions.push(crate::export::profile::FunctionRow {
            id: 0,
            module_id: 5,
            name: UNKNOWN_NAME.into(),
            start_offset: 0,
            size: 0,
        });
        let mut writer = JsonProfileWriter::new(Vec::new());
        assert!(writer.write_profile(&profile).is_err());
        assert!(writer.into_inner().is_empty());
    }

    #[test]
    fn test_default_output_path() {
        assert_eq!(
            default_output_path(Path::new("/tmp/run.prd")),
            PathBuf::from("/tmp/run.profile.json")
        );
    }
}
