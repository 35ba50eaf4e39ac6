//! Module identities and per-process module instance maps

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{ModuleId, ModuleInstanceId, Pid, Timestamp};
use crate::prd::ModuleFlags;

/// Identity of a module image, shared by all of its instances
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleInfo {
    pub path: String,
    pub size: u64,
    pub flags: ModuleFlags,
}

impl ModuleInfo {
    /// File name component of the path (either separator)
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.path.rsplit(['/', '\\']).next().unwrap_or(&self.path)
    }
}

/// Arena of module identities
#[derive(Debug, Default)]
pub struct ModuleTable {
    modules: Vec<Arc<ModuleInfo>>,
    by_identity: HashMap<Arc<ModuleInfo>, ModuleId>,
}

impl ModuleTable {
    /// Return the id of `info`, adding it on first sight
    pub fn intern(&mut self, info: ModuleInfo) -> ModuleId {
        if let Some(id) = self.by_identity.get(&info) {
            return *id;
        }
        let id = ModuleId(u32::try_from(self.modules.len()).unwrap_or(u32::MAX));
        let info = Arc::new(info);
        self.modules.push(Arc::clone(&info));
        self.by_identity.insert(info, id);
        id
    }

    #[must_use]
    pub fn get(&self, id: ModuleId) -> Option<&Arc<ModuleInfo>> {
        self.modules.get(id.0 as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ModuleId, &Arc<ModuleInfo>)> {
        self.modules
            .iter()
            .enumerate()
            .map(|(i, m)| (ModuleId(u32::try_from(i).unwrap_or(u32::MAX)), m))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// One load of a module into one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInstance {
    pub id: ModuleInstanceId,
    pub module: ModuleId,
    pub pid: Pid,
    pub load_addr: u64,
    pub size: u64,
    pub loaded_at: Timestamp,
    /// `None` while still loaded
    pub unloaded_at: Option<Timestamp>,
}

impl ModuleInstance {
    #[must_use]
    pub fn contains(&self, vaddr: u64) -> bool {
        vaddr >= self.load_addr && vaddr - self.load_addr < self.size
    }

    /// Whether the instance was mapped at `at` (`loaded_at <= at < unloaded_at`)
    #[must_use]
    pub fn is_live_at(&self, at: Timestamp) -> bool {
        self.loaded_at <= at && self.unloaded_at.map_or(true, |end| at < end)
    }
}

/// Result of applying a module load to a [`ModuleMap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Inserted,
    /// The same load was applied before
    AlreadyLoaded(ModuleInstanceId),
    /// Inserted after closing a still-loaded instance at the same address
    Replaced { closed: ModuleInstanceId },
}

/// Result of applying a module unload to a [`ModuleMap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    Unloaded(ModuleInstanceId),
    /// The matching instance was already closed at this timestamp
    AlreadyUnloaded(ModuleInstanceId),
    NoMatch,
}

/// Module instances of one process, sorted by load address
///
/// ```text
/// instances: [0x1000 a.so t0..t5] [0x1000 b.so t5..] [0x8000 c.so t2..]
///                                                  ▲
///              lookup(0x8123, t3): upper bound on load address, then scan
///              backwards while load_addr + max_size > vaddr
/// ```
#[derive(Debug, Default)]
pub struct ModuleMap {
    instances: Vec<ModuleInstance>,
    max_size: u64,
}

impl ModuleMap {
    /// Find the instance covering `vaddr` at time `at`
    #[must_use]
    pub fn lookup(&self, vaddr: u64, at: Timestamp) -> Option<&ModuleInstance> {
        let upper = self.instances.partition_point(|m| m.load_addr <= vaddr);
        self.instances[..upper]
            .iter()
            .rev()
            .take_while(|m| vaddr - m.load_addr < self.max_size)
            .find(|m| m.contains(vaddr) && m.is_live_at(at))
    }

    /// Apply a load
    ///
    /// `new_id` is only called when a new instance is inserted.
    pub fn load(
        &mut self,
        module: ModuleId,
        pid: Pid,
        load_addr: u64,
        size: u64,
        at: Timestamp,
        new_id: impl FnOnce() -> ModuleInstanceId,
    ) -> LoadOutcome {
        let same_addr = self.same_address(load_addr);

        let duplicate = same_addr.clone().find(|&i| {
            let m = &self.instances[i];
            m.loaded_at == at && m.module == module
        });
        if let Some(existing) = duplicate {
            return LoadOutcome::AlreadyLoaded(self.instances[existing].id);
        }

        let mut closed = None;
        for i in same_addr {
            let instance = &mut self.instances[i];
            if instance.loaded_at <= at && instance.unloaded_at.map_or(true, |end| end > at) {
                instance.unloaded_at = Some(at);
                closed = Some(instance.id);
            }
        }

        let instance = ModuleInstance {
            id: new_id(),
            module,
            pid,
            load_addr,
            size,
            loaded_at: at,
            unloaded_at: None,
        };
        let pos = self
            .instances
            .partition_point(|m| (m.load_addr, m.loaded_at) <= (load_addr, at));
        self.instances.insert(pos, instance);
        self.max_size = self.max_size.max(size);

        match closed {
            Some(closed) => LoadOutcome::Replaced { closed },
            None => LoadOutcome::Inserted,
        }
    }

    /// Apply an unload of the module loaded at `load_addr`
    pub fn unload(&mut self, load_addr: u64, at: Timestamp) -> UnloadOutcome {
        let latest = self
            .same_address(load_addr)
            .filter(|&i| self.instances[i].loaded_at <= at)
            .max_by_key(|&i| self.instances[i].loaded_at);
        let Some(i) = latest else {
            return UnloadOutcome::NoMatch;
        };
        let instance = &mut self.instances[i];
        match instance.unloaded_at {
            None => {
                instance.unloaded_at = Some(at);
                UnloadOutcome::Unloaded(instance.id)
            }
            Some(end) if end == at => UnloadOutcome::AlreadyUnloaded(instance.id),
            Some(_) => UnloadOutcome::NoMatch,
        }
    }

    /// Instances that were live at `at`, in load-address order
    pub fn live_at(&self, at: Timestamp) -> impl Iterator<Item = &ModuleInstance> {
        self.instances.iter().filter(move |m| m.is_live_at(at))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleInstance> {
        self.instances.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn same_address(&self, load_addr: u64) -> std::ops::Range<usize> {
        let start = self.instances.partition_point(|m| m.load_addr < load_addr);
        let end = self.instances.partition_point(|m| m.load_addr <= load_addr);
        start..end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> impl FnMut() -> ModuleInstanceId {
        let mut next = 0;
        move || {
            next += 1;
            ModuleInstanceId(next)
        }
    }

    #[test]
    fn test_lookup_respects_time_window() {
        let mut map = ModuleMap::default();
        let mut next = ids();
        map.load(ModuleId(0), Pid(1), 0x1000, 0x100, Timestamp(10), &mut next);
        assert_eq!(map.unload(0x1000, Timestamp(20)), UnloadOutcome::Unloaded(ModuleInstanceId(1)));

        assert!(map.lookup(0x1050, Timestamp(9)).is_none());
        assert!(map.lookup(0x1050, Timestamp(10)).is_some());
        assert!(map.lookup(0x1050, Timestamp(19)).is_some());
        assert!(map.lookup(0x1050, Timestamp(20)).is_none());
        assert!(map.lookup(0x1100, Timestamp(15)).is_none());
    }

    #[test]
    fn test_load_over_live_instance_closes_it() {
        let mut map = ModuleMap::default();
        let mut next = ids();
        map.load(ModuleId(0), Pid(1), 0x1000, 0x100, Timestamp(1), &mut next);
        let outcome = map.load(ModuleId(1), Pid(1), 0x1000, 0x200, Timestamp(5), &mut next);
        assert_eq!(outcome, LoadOutcome::Replaced { closed: ModuleInstanceId(1) });
        assert_eq!(map.lookup(0x1010, Timestamp(3)).map(|m| m.module), Some(ModuleId(0)));
        assert_eq!(map.lookup(0x1010, Timestamp(6)).map(|m| m.module), Some(ModuleId(1)));
        assert_eq!(map.lookup(0x1150, Timestamp(6)).map(|m| m.module), Some(ModuleId(1)));
    }

    #[test]
    fn test_load_and_unload_are_idempotent() {
        let mut map = ModuleMap::default();
        let mut next = ids();
        map.load(ModuleId(0), Pid(1), 0x1000, 0x100, Timestamp(1), &mut next);
        assert_eq!(
            map.load(ModuleId(0), Pid(1), 0x1000, 0x100, Timestamp(1), &mut next),
            LoadOutcome::AlreadyLoaded(ModuleInstanceId(1))
        );
        map.unload(0x1000, Timestamp(4));
        assert_eq!(
            map.unload(0x1000, Timestamp(4)),
            UnloadOutcome::AlreadyUnloaded(ModuleInstanceId(1))
        );
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_unload_without_load() {
        let mut map = ModuleMap::default();
        assert_eq!(map.unload(0x5000, Timestamp(3)), UnloadOutcome::NoMatch);
        let mut next = ids();
        map.load(ModuleId(0), Pid(1), 0x5000, 0x100, Timestamp(10), &mut next);
        assert_eq!(map.unload(0x5000, Timestamp(3)), UnloadOutcome::NoMatch);
    }

    #[test]
    fn test_large_module_below_small_ones() {
        let mut map = ModuleMap::default();
        let mut next = ids();
        map.load(ModuleId(0), Pid(1), 0x1000, 0x10_0000, Timestamp(0), &mut next);
        map.load(ModuleId(1), Pid(1), 0x2000, 0x100, Timestamp(0), &mut next);
        assert_eq!(map.lookup(0x9000, Timestamp(1)).map(|m| m.module), Some(ModuleId(0)));
    }

    #[test]
    fn test_module_file_name() {
        let info = ModuleInfo {
            path: "C:\\Windows\\System32\\ntdll.dll".to_string(),
            size: 1,
            flags: ModuleFlags::default(),
        };
        assert_eq!(info.file_name(), "ntdll.dll");
    }
}
