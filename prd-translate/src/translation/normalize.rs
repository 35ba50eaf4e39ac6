//! Normalization of merged worker results into a [`NormalizedProfile`]
//!
//! Workers key everything by natural keys (pid, module id, instance id,
//! function start). Dense output ids are assigned here, on the driver thread,
//! in sorted key order so the profile does not depend on how records were
//! spread over workers.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use prd_common::FileHeader;

use crate::aggregation::{PrdTranslationStats, SampleAggregator};
use crate::callstack::StackNode;
use crate::domain::{FunctionKey, ModuleInstanceId, Pid, Tid, TranslateError};
use crate::export::profile::{
    CallStackLeafRow, CallStackRow, CoreSamplingConfigRow, CpuInfo, FrameRow, FunctionRow,
    MissedInfo, ModuleInstanceRow, ModuleRow, NormalizedProfile, ProcessRow, ProcessThreadRow,
    ProfileStatus, SampleRow, SamplingConfigRow, StatRow, TopologyRow, UNKNOWN_ID, UNKNOWN_NAME,
};
use crate::registry::{ModuleInstance, Registry, TaskInfo, WorkingSetQuery};
use crate::symbolization::{FunctionDesc, Site};

pub(crate) struct NormalizeInput<'a> {
    pub header: &'a FileHeader,
    pub registry: &'a Registry,
    pub task_info: &'a dyn TaskInfo,
    pub samples: &'a SampleAggregator,
    pub functions: &'a HashMap<FunctionKey, FunctionDesc>,
    pub status: ProfileStatus,
    pub missed: MissedInfo,
    pub stats: Option<&'a PrdTranslationStats>,
}

struct StackData {
    pid: Pid,
    frames: Vec<Site>,
    node: StackNode,
}

/// Site mapped to output ids: `(module instance, function, offset)`
type SiteIds = (u32, u32, u64);

struct IdMaps {
    instances: HashMap<ModuleInstanceId, u32>,
    functions: HashMap<FunctionKey, u32>,
}

impl IdMaps {
    fn site(&self, site: &Site) -> SiteIds {
        let instance = site.instance.and_then(|i| self.instances.get(&i)).copied();
        let function = self.functions.get(&site.function).copied().unwrap_or(UNKNOWN_ID);
        (instance.unwrap_or(UNKNOWN_ID), function, site.offset)
    }
}

pub(crate) fn normalize(input: &NormalizeInput<'_>) -> Result<NormalizedProfile, TranslateError> {
    let registry = input.registry;

    // ------------------------------------------------------------------
    // Gather
    // ------------------------------------------------------------------
    let mut module_list = registry.modules();
    module_list.sort_by(|(_, a), (_, b)| {
        (&a.path, a.size, a.flags.is_32bit, a.flags.is_system, a.flags.is_kernel).cmp(&(
            &b.path,
            b.size,
            b.flags.is_32bit,
            b.flags.is_system,
            b.flags.is_kernel,
        ))
    });

    let pids = registry.pids();
    let mut instance_list: Vec<ModuleInstance> = Vec::new();
    for pid in &pids {
        registry.foreach_module(*pid, &mut |instance: &ModuleInstance| {
            instance_list.push(instance.clone());
        })?;
    }
    instance_list.sort_by_key(|m| (m.pid, m.load_addr, m.loaded_at, m.id));

    let mut stacks: Vec<StackData> = Vec::new();
    for pid in &pids {
        registry.read_process(*pid, |p| {
            for (frames, node) in p.call_graph.stacks() {
                stacks.push(StackData { pid: *pid, frames: frames.to_vec(), node: node.clone() });
            }
        })?;
    }

    // ------------------------------------------------------------------
    // Modules, instances, functions
    // ------------------------------------------------------------------
    let mut modules = vec![ModuleRow {
        id: UNKNOWN_ID,
        path: UNKNOWN_NAME.to_string(),
        size: 0,
        is_system: false,
        is_32bit: false,
        is_kernel: false,
    }];
    let mut module_ids = HashMap::new();
    for (module, info) in &module_list {
        let id = next_id(modules.len());
        module_ids.insert(*module, id);
        modules.push(ModuleRow {
            id,
            path: info.path.clone(),
            size: info.size,
            is_system: info.flags.is_system,
            is_32bit: info.flags.is_32bit,
            is_kernel: info.flags.is_kernel,
        });
    }

    let mut module_instances = vec![ModuleInstanceRow {
        id: UNKNOWN_ID,
        module_id: UNKNOWN_ID,
        pid: Pid::SYSTEM.0,
        load_addr: 0,
        loaded_at: 0,
        unloaded_at: None,
    }];
    let mut instance_ids = HashMap::new();
    for instance in &instance_list {
        let id = next_id(module_instances.len());
        instance_ids.insert(instance.id, id);
        module_instances.push(ModuleInstanceRow {
            id,
            module_id: module_ids.get(&instance.module).copied().unwrap_or(UNKNOWN_ID),
            pid: instance.pid.0,
            load_addr: instance.load_addr,
            loaded_at: instance.loaded_at.0,
            unloaded_at: instance.unloaded_at.map(|t| t.0),
        });
    }

    let mut function_keys: BTreeSet<(u32, Option<u64>, FunctionKey)> = BTreeSet::new();
    let mut add_key = |key: FunctionKey| {
        if key != FunctionKey::UNKNOWN {
            let module = key.module.and_then(|m| module_ids.get(&m)).copied().unwrap_or(UNKNOWN_ID);
            function_keys.insert((module, key.start, key));
        }
    };
    input.functions.keys().copied().for_each(&mut add_key);
    for (key, _) in input.samples.iter() {
        add_key(key.site.function);
    }
    for stack in &stacks {
        stack.frames.iter().for_each(|site| add_key(site.function));
        stack.node.leaves.keys().for_each(|leaf| add_key(leaf.site.function));
    }

    let mut functions = vec![FunctionRow {
        id: UNKNOWN_ID,
        module_id: UNKNOWN_ID,
        name: UNKNOWN_NAME.to_string(),
        start_offset: 0,
        size: 0,
    }];
    let mut function_ids = HashMap::new();
    function_ids.insert(FunctionKey::UNKNOWN, UNKNOWN_ID);
    for (module_id, start, key) in function_keys {
        let id = next_id(functions.len());
        function_ids.insert(key, id);
        let (name, size) = match (start, input.functions.get(&key)) {
            (Some(_), Some(desc)) => (desc.name.clone(), desc.size),
            (Some(start), None) => (format!("0x{start:x}"), 0),
            (None, _) => (UNKNOWN_NAME.to_string(), 0),
        };
        functions.push(FunctionRow {
            id,
            module_id,
            name,
            start_offset: start.unwrap_or(0),
            size,
        });
    }

    let ids = IdMaps { instances: instance_ids, functions: function_ids };

    // ------------------------------------------------------------------
    // Sampling configurations and threads
    // ------------------------------------------------------------------
    let mut events: BTreeMap<u64, u64> = BTreeMap::new();
    for event in &input.header.events {
        events.entry(event.event_mask).or_insert(event.interval);
    }
    let mut threads: BTreeSet<(Pid, Tid)> = BTreeSet::new();
    for (key, _) in input.samples.iter() {
        events.entry(key.event).or_insert(0);
        threads.insert((key.pid, key.tid));
    }
    for stack in &stacks {
        for leaf in stack.node.leaves.keys() {
            events.entry(leaf.event).or_insert(0);
            threads.insert((stack.pid, leaf.tid));
        }
    }

    let sampling_configs: Vec<SamplingConfigRow> = events
        .iter()
        .enumerate()
        .map(|(i, (mask, interval))| SamplingConfigRow {
            id: next_id(i),
            event_mask: *mask,
            interval: *interval,
        })
        .collect();
    let config_ids: HashMap<u64, u32> =
        sampling_configs.iter().map(|c| (c.event_mask, c.id)).collect();

    let process_threads: Vec<ProcessThreadRow> = threads
        .iter()
        .enumerate()
        .map(|(i, (pid, tid))| ProcessThreadRow { id: next_id(i), pid: pid.0, tid: tid.0 })
        .collect();
    let thread_ids: HashMap<(u32, u32), u32> =
        process_threads.iter().map(|t| ((t.pid, t.tid), t.id)).collect();

    let core_configs: BTreeSet<(u32, u32)> = input
        .samples
        .iter()
        .map(|(key, _)| (key.core.0, config_ids.get(&key.event).copied().unwrap_or(UNKNOWN_ID)))
        .collect();
    let core_sampling_configs: Vec<CoreSamplingConfigRow> = core_configs
        .iter()
        .enumerate()
        .map(|(i, (core, config))| CoreSamplingConfigRow {
            id: next_id(i),
            core_id: *core,
            sampling_config_id: *config,
        })
        .collect();
    let core_config_ids: HashMap<(u32, u32), u32> = core_sampling_configs
        .iter()
        .map(|c| ((c.core_id, c.sampling_config_id), c.id))
        .collect();

    // ------------------------------------------------------------------
    // Samples
    // ------------------------------------------------------------------
    let mut sample_counts: BTreeMap<(u32, u32, u32, u32, u64), u64> = BTreeMap::new();
    for (key, count) in input.samples.iter() {
        let thread = thread_ids.get(&(key.pid.0, key.tid.0)).copied().unwrap_or(UNKNOWN_ID);
        let config = config_ids.get(&key.event).copied().unwrap_or(UNKNOWN_ID);
        let core_config = core_config_ids.get(&(key.core.0, config)).copied().unwrap_or(UNKNOWN_ID);
        let (instance, function, offset) = ids.site(&key.site);
        *sample_counts.entry((thread, instance, core_config, function, offset)).or_insert(0) +=
            count;
    }
    let samples = sample_counts
        .into_iter()
        .map(|((thread, instance, core_config, function, offset), count)| SampleRow {
            process_thread_id: thread,
            module_instance_id: instance,
            core_sampling_config_id: core_config,
            function_id: function,
            offset,
            count,
        })
        .collect();

    // ------------------------------------------------------------------
    // Call stacks
    // ------------------------------------------------------------------
    let mut mapped: Vec<(u32, Vec<SiteIds>, &StackData)> = stacks
        .iter()
        .map(|s| (s.pid.0, s.frames.iter().map(|f| ids.site(f)).collect(), s))
        .collect();
    mapped.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

    let mut call_stacks = Vec::with_capacity(mapped.len());
    let mut call_stack_leaves = Vec::new();
    for (i, (pid, frames, stack)) in mapped.into_iter().enumerate() {
        let id = next_id(i);
        let mut leaves: Vec<CallStackLeafRow> = stack
            .node
            .leaves
            .iter()
            .map(|(leaf, count)| {
                let (instance, function, offset) = ids.site(&leaf.site);
                CallStackLeafRow {
                    call_stack_id: id,
                    process_thread_id: thread_ids
                        .get(&(pid, leaf.tid.0))
                        .copied()
                        .unwrap_or(UNKNOWN_ID),
                    sampling_config_id: config_ids.get(&leaf.event).copied().unwrap_or(UNKNOWN_ID),
                    module_instance_id: instance,
                    function_id: function,
                    offset,
                    count: *count,
                }
            })
            .collect();
        leaves.sort_by_key(|l| {
            (l.process_thread_id, l.sampling_config_id, l.module_instance_id, l.function_id, l.offset)
        });
        call_stack_leaves.extend(leaves);

        call_stacks.push(CallStackRow {
            id,
            pid,
            partial: stack.node.partial,
            observations: stack.node.observations,
            frames: frames
                .into_iter()
                .enumerate()
                .map(|(depth, (instance, function, offset))| FrameRow {
                    depth: next_id(depth),
                    module_instance_id: instance,
                    function_id: function,
                    offset,
                })
                .collect(),
        });
    }

    // ------------------------------------------------------------------
    // Processes
    // ------------------------------------------------------------------
    let mut all_pids: BTreeSet<Pid> = pids.iter().copied().collect();
    all_pids.extend(threads.iter().map(|(pid, _)| *pid));
    all_pids.extend(stacks.iter().map(|s| s.pid));
    let mut processes = Vec::with_capacity(all_pids.len());
    for pid in all_pids {
        let known = registry.read_process(pid, |p| (p.name.clone(), p.is_32bit))?;
        let (name, is_32bit) = match known {
            Some((Some(name), is_32bit)) => (name, is_32bit),
            Some((None, is_32bit)) => (
                input.task_info.process_name(pid).unwrap_or_default(),
                is_32bit || input.task_info.is_32bit(pid).unwrap_or(false),
            ),
            None => (
                input.task_info.process_name(pid).unwrap_or_default(),
                input.task_info.is_32bit(pid).unwrap_or(false),
            ),
        };
        processes.push(ProcessRow { pid: pid.0, name, is_32bit });
    }

    let header = input.header;
    Ok(NormalizedProfile {
        status: input.status,
        missed: input.missed,
        cpu: CpuInfo {
            cpu_count: header.cpu_count,
            cpu_family: header.cpu_family,
            cpu_model: header.cpu_model,
            tick_frequency: header.tick_frequency,
            start_tick: header.start_tick,
            is_64bit_system: header.is_64bit_system(),
        },
        topology: header
            .topology
            .iter()
            .map(|t| TopologyRow { core_id: t.core, processor: t.processor, numa_node: t.numa_node })
            .collect(),
        sampling_configs,
        core_sampling_configs,
        processes,
        process_threads,
        modules,
        module_instances,
        functions,
        samples,
        call_stacks,
        call_stack_leaves,
        stats: input
            .stats
            .map(|stats| {
                stats
                    .iter()
                    .map(|(kind, value)| StatRow {
                        stage: kind.to_string(),
                        value: value.value,
                        count: value.count,
                    })
                    .collect()
            })
            .unwrap_or_default(),
    })
}

fn next_id(index: usize) -> u32 {
    u32::try_from(index).unwrap_or(u32::MAX)
}
