//! Per-process state held by the registry

use super::module_map::ModuleMap;
use crate::callstack::CallGraph;
use crate::domain::{Pid, Timestamp};

/// Everything the translator knows about one process
///
/// Created on the first record that references the pid and guarded by its
/// own lock inside the registry.
#[derive(Debug)]
pub struct ProcessInfo {
    pub pid: Pid,
    /// Executable name or path from the process-start record or task info
    pub name: Option<String>,
    pub parent: Option<Pid>,
    pub is_32bit: bool,
    pub started_at: Option<Timestamp>,
    pub exited_at: Option<Timestamp>,
    pub exit_code: Option<u32>,
    pub modules: ModuleMap,
    /// Completed call stacks of all threads of the process
    pub call_graph: CallGraph,
}

impl ProcessInfo {
    #[must_use]
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            name: None,
            parent: None,
            is_32bit: false,
            started_at: None,
            exited_at: None,
            exit_code: None,
            modules: ModuleMap::default(),
            call_graph: CallGraph::default(),
        }
    }

    /// Executable file name, without directories
    #[must_use]
    pub fn executable_name(&self) -> Option<&str> {
        let name = self.name.as_deref()?;
        name.rsplit(['/', '\\']).next()
    }
}
