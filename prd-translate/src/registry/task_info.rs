//! Task-info companion file
//!
//! The profiler driver writes process names it learned outside the trace
//! into a JSON file next to the trace (same stem, extension `ti`):
//!
//! ```json
//! { "processes": [ { "pid": 4242, "name": "/usr/bin/app", "is_32bit": false } ] }
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::domain::{Pid, TranslateError};

/// Source of process names for pids without a process-start record
pub trait TaskInfo: Send + Sync {
    fn process_name(&self, pid: Pid) -> Option<String>;

    fn is_32bit(&self, _pid: Pid) -> Option<bool> {
        None
    }
}

/// Task info that knows nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTaskInfo;

impl TaskInfo for NoTaskInfo {
    fn process_name(&self, _pid: Pid) -> Option<String> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct TaskInfoFile {
    processes: Vec<TaskEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct TaskEntry {
    pid: u32,
    name: String,
    #[serde(default)]
    is_32bit: bool,
}

/// Task info loaded from a JSON companion file
#[derive(Debug, Default)]
pub struct JsonTaskInfo {
    processes: HashMap<Pid, (String, bool)>,
}

impl JsonTaskInfo {
    /// Default companion path of a trace (`run.prd` → `run.ti`)
    #[must_use]
    pub fn default_path(trace: &Path) -> PathBuf {
        trace.with_extension("ti")
    }

    /// Load a task-info file
    ///
    /// # Errors
    /// Returns `TranslateError::TaskInfo` if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TranslateError> {
        let path = path.as_ref();
        let err = |message: String| TranslateError::TaskInfo { path: path.to_path_buf(), message };
        let text = std::fs::read_to_string(path).map_err(|e| err(e.to_string()))?;
        Self::from_json(&text).map_err(|e| err(e.to_string()))
    }

    /// Parse task info from JSON text
    ///
    /// # Errors
    /// Returns the JSON error if the text does not match the expected shape
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let file: TaskInfoFile = serde_json::from_str(text)?;
        let processes =
            file.processes.into_iter().map(|e| (Pid(e.pid), (e.name, e.is_32bit))).collect();
        Ok(Self { processes })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

impl TaskInfo for JsonTaskInfo {
    fn process_name(&self, pid: Pid) -> Option<String> {
        self.processes.get(&pid).map(|(name, _)| name.clone())
    }

    fn is_32bit(&self, pid: Pid) -> Option<bool> {
        self.processes.get(&pid).map(|(_, is_32bit)| *is_32bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_task_info() {
        let info = JsonTaskInfo::from_json(
            r#"{"processes":[{"pid":7,"name":"C:\\app\\game.exe","is_32bit":true},{"pid":8,"name":"svc"}]}"#,
        )
        .unwrap();
        assert_eq!(info.len(), 2);
        assert_eq!(info.process_name(Pid(7)).as_deref(), Some("C:\\app\\game.exe"));
        assert_eq!(info.is_32bit(Pid(7)), Some(true));
        assert_eq!(info.is_32bit(Pid(8)), Some(false));
        assert_eq!(info.process_name(Pid(9)), None);
    }

    #[test]
    fn test_default_path() {
        assert_eq!(
            JsonTaskInfo::default_path(Path::new("/tmp/session/run.prd")),
            PathBuf::from("/tmp/session/run.ti")
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = JsonTaskInfo::load("/nonexistent/run.ti").unwrap_err();
        assert!(matches!(err, TranslateError::TaskInfo { .. }));
    }
}
