//! Normalized profile handed to a [`super::ProfileSink`]
//!
//! Every table row is keyed by a dense id. Id 0 of modules, module instances
//! and functions is the "unknown" entry that unattributed samples point at.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::domain::ExportError;

pub const UNKNOWN_ID: u32 = 0;

/// Name of unknown modules and functions
pub const UNKNOWN_NAME: &str = "<unknown>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileStatus {
    #[default]
    Complete,
    /// The run was cancelled; counts cover the records read until then
    Partial,
}

/// What could not be translated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MissedInfo {
    /// Records dropped as undecodable
    pub missed_count: u64,
    /// Bytes passed over while resynchronizing after a bad record length,
    /// plus an unreadable tail
    #[serde(default)]
    pub skipped_bytes: u64,
    /// Event with the most samples attributed to no module
    pub worst_event: Option<u64>,
    pub unresolved_samples: u64,
    pub inconsistent_unloads: u64,
    /// Samples of processes excluded by the process filter
    pub filtered_samples: u64,
    /// Samples inside excluded modules (the profiling driver)
    #[serde(default)]
    pub excluded_samples: u64,
    /// User call stacks no sample attached to
    pub orphan_call_stacks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CpuInfo {
    pub cpu_count: u32,
    pub cpu_family: u32,
    pub cpu_model: u32,
    pub tick_frequency: u64,
    pub start_tick: u64,
    pub is_64bit_system: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyRow {
    pub core_id: u32,
    pub processor: u16,
    pub numa_node: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingConfigRow {
    pub id: u32,
    pub event_mask: u64,
    /// 0 for events derived during translation
    pub interval: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreSamplingConfigRow {
    pub id: u32,
    pub core_id: u32,
    pub sampling_config_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRow {
    pub pid: u32,
    pub name: String,
    pub is_32bit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessThreadRow {
    pub id: u32,
    pub pid: u32,
    pub tid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRow {
    pub id: u32,
    pub path: String,
    pub size: u64,
    pub is_system: bool,
    pub is_32bit: bool,
    pub is_kernel: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInstanceRow {
    pub id: u32,
    pub module_id: u32,
    pub pid: u32,
    pub load_addr: u64,
    pub loaded_at: u64,
    pub unloaded_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRow {
    pub id: u32,
    pub module_id: u32,
    pub name: String,
    pub start_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRow {
    pub process_thread_id: u32,
    pub module_instance_id: u32,
    pub core_sampling_config_id: u32,
    pub function_id: u32,
    /// Offset inside the module, or the raw address for unknown modules
    pub offset: u64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRow {
    pub depth: u32,
    pub module_instance_id: u32,
    pub function_id: u32,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStackRow {
    pub id: u32,
    pub pid: u32,
    /// Some user frames were never resolved
    pub partial: bool,
    /// Chains folded into this stack
    pub observations: u64,
    pub frames: Vec<FrameRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStackLeafRow {
    pub call_stack_id: u32,
    pub process_thread_id: u32,
    pub sampling_config_id: u32,
    pub module_instance_id: u32,
    pub function_id: u32,
    pub offset: u64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatRow {
    pub stage: String,
    /// Elapsed microseconds
    pub value: u64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NormalizedProfile {
    pub status: ProfileStatus,
    pub missed: MissedInfo,
    pub cpu: CpuInfo,
    pub topology: Vec<TopologyRow>,
    pub sampling_configs: Vec<SamplingConfigRow>,
    pub core_sampling_configs: Vec<CoreSamplingConfigRow>,
    pub processes: Vec<ProcessRow>,
    pub process_threads: Vec<ProcessThreadRow>,
    pub modules: Vec<ModuleRow>,
    pub module_instances: Vec<ModuleInstanceRow>,
    pub functions: Vec<FunctionRow>,
    pub samples: Vec<SampleRow>,
    pub call_stacks: Vec<CallStackRow>,
    pub call_stack_leaves: Vec<CallStackLeafRow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stats: Vec<StatRow>,
}

impl NormalizedProfile {
    /// Total sample count
    #[must_use]
    pub fn total_samples(&self) -> u64 {
        self.samples.iter().map(|s| s.count).sum()
    }

    /// Sum of the sample counts of one function
    #[must_use]
    pub fn function_count(&self, function_id: u32) -> u64 {
        self.samples.iter().filter(|s| s.function_id == function_id).map(|s| s.count).sum()
    }

    #[must_use]
    pub fn function_by_name(&self, name: &str) -> Option<&FunctionRow> {
        self.functions.iter().find(|f| f.name == name)
    }

    #[must_use]
    pub fn sampling_config_by_mask(&self, event_mask: u64) -> Option<&SamplingConfigRow> {
        self.sampling_configs.iter().find(|c| c.event_mask == event_mask)
    }

    /// Check that every foreign key resolves in its table
    ///
    /// # Errors
    /// Returns `ExportError::InvalidReference` naming the first dangling key
    pub fn validate_references(&self) -> Result<(), ExportError> {
        let modules = ids(self.modules.iter().map(|m| m.id), "module")?;
        let instances = ids(self.module_instances.iter().map(|m| m.id), "module instance")?;
        let functions = ids(self.functions.iter().map(|f| f.id), "function")?;
        let configs = ids(self.sampling_configs.iter().map(|c| c.id), "sampling config")?;
        let core_configs =
            ids(self.core_sampling_configs.iter().map(|c| c.id), "core sampling config")?;
        let threads = ids(self.process_threads.iter().map(|t| t.id), "process thread")?;
        let stacks = ids(self.call_stacks.iter().map(|c| c.id), "call stack")?;
        let pids: HashSet<u32> = self.processes.iter().map(|p| p.pid).collect();

        for instance in &self.module_instances {
            check(&modules, instance.module_id, "module", "module instance", instance.id)?;
        }
        for function in &self.functions {
            check(&modules, function.module_id, "module", "function", function.id)?;
        }
        for config in &self.core_sampling_configs {
            check(&configs, config.sampling_config_id, "sampling config", "core config", config.id)?;
        }
        for thread in &self.process_threads {
            check(&pids, thread.pid, "process", "process thread", thread.id)?;
        }
        for (i, sample) in self.samples.iter().enumerate() {
            let row = u32::try_from(i).unwrap_or(u32::MAX);
            check(&threads, sample.process_thread_id, "process thread", "sample", row)?;
            check(&instances, sample.module_instance_id, "module instance", "sample", row)?;
            check(&core_configs, sample.core_sampling_config_id, "core config", "sample", row)?;
            check(&functions, sample.function_id, "function", "sample", row)?;
        }
        for stack in &self.call_stacks {
            check(&pids, stack.pid, "process", "call stack", stack.id)?;
            for frame in &stack.frames {
                check(&instances, frame.module_instance_id, "module instance", "call stack", stack.id)?;
                check(&functions, frame.function_id, "function", "call stack", stack.id)?;
            }
        }
        for leaf in &self.call_stack_leaves {
            let id = leaf.call_stack_id;
            check(&stacks, id, "call stack", "call stack leaf", id)?;
            check(&threads, leaf.process_thread_id, "process thread", "call stack leaf", id)?;
            check(&configs, leaf.sampling_config_id, "sampling config", "call stack leaf", id)?;
            check(&instances, leaf.module_instance_id, "module instance", "call stack leaf", id)?;
            check(&functions, leaf.function_id, "function", "call stack leaf", id)?;
        }
        Ok(())
    }
}

fn ids(iter: impl Iterator<Item = u32>, table: &str) -> Result<HashSet<u32>, ExportError> {
    let mut set = HashSet::new();
    for id in iter {
        if !set.insert(id) {
            return Err(ExportError::InvalidReference(format!("duplicate {table} id {id}")));
        }
    }
    Ok(set)
}

fn check(
    set: &HashSet<u32>,
    id: u32,
    target: &str,
    referrer: &str,
    referrer_id: u32,
) -> Result<(), ExportError> {
    if set.contains(&id) {
        Ok(())
    } else {
        Err(ExportError::InvalidReference(format!(
            "{referrer} {referrer_id} references missing {target} {id}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> NormalizedProfile {
        NormalizedProfile {
            sampling_configs: vec![SamplingConfigRow { id: 0, event_mask: 1, interval: 100 }],
            core_sampling_configs: vec![CoreSamplingConfigRow {
                id: 0,
                core_id: 0,
                sampling_config_id: 0,
            }],
            processes: vec![ProcessRow { pid: 7, name: "app".into(), is_32bit: false }],
            process_threads: vec![ProcessThreadRow { id: 0, pid: 7, tid: 8 }],
            modules: vec![ModuleRow {
                id: UNKNOWN_ID,
                path: UNKNOWN_NAME.into(),
                size: 0,
                is_system: false,
                is_32bit: false,
                is_kernel: false,
            }],
            module_instances: vec![ModuleInstanceRow {
                id: UNKNOWN_ID,
                module_id: UNKNOWN_ID,
                pid: 0,
                load_addr: 0,
                loaded_at: 0,
                unloaded_at: None,
            }],
            functions: vec![FunctionRow {
                id: UNKNOWN_ID,
                module_id: UNKNOWN_ID,
                name: UNKNOWN_NAME.into(),
                start_offset: 0,
                size: 0,
            }],
            samples: vec![SampleRow {
                process_thread_id: 0,
                module_instance_id: 0,
                core_sampling_config_id: 0,
                function_id: 0,
                offset: 0x1234,
                count: 3,
            }],
            ..NormalizedProfile::default()
        }
    }

    #[test]
    fn test_valid_profile() {
        let profile = minimal();
        assert!(profile.validate_references().is_ok());
        assert_eq!(profile.total_samples(), 3);
        assert_eq!(profile.function_count(UNKNOWN_ID), 3);
    }

    #[test]
    fn test_dangling_function_rejected() {
        let mut profile = minimal();
        profile.samples[0].function_id = 9;
        let err = profile.validate_references().unwrap_err();
        assert!(err.to_string().contains("missing function 9"));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut profile = minimal();
        let dup = profile.functions[0].clone();
        profile.functions.push(dup);
        assert!(profile.validate_references().is_err());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&ProfileStatus::Partial).unwrap();
        assert_eq!(json, "\"partial\"");
    }
}
