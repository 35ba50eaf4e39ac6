//! # Process/Module Registry
//!
//! Shared, concurrently accessed record of every process seen in the trace
//! and the modules loaded into it over time.
//!
//! ## Locking
//!
//! ```text
//! Registry
//!  ├── processes: RwLock<HashMap<Pid, Arc<RwLock<ProcessInfo>>>>   (map lock)
//!  │                                       └── per-process lock
//!  └── modules:   RwLock<ModuleTable>                              (table lock)
//! ```
//!
//! - The map lock is held only to find or insert a process entry.
//! - At most one process lock is held at a time; module resolution checks
//!   the process first and the system process (pid 0) second, releasing
//!   the first lock before taking the second.
//! - Process locks are acquired with `try_read_for`/`try_write_for`; a
//!   worker that waits past the configured timeout fails the run with
//!   `LockTimeout`.
//!
//! Module loads and unloads are idempotent, so the same record may be applied
//! by the preload scan and again by a worker.

pub mod module_map;
pub mod process;
pub mod task_info;

pub use module_map::{LoadOutcome, ModuleInfo, ModuleInstance, ModuleMap, ModuleTable, UnloadOutcome};
pub use process::ProcessInfo;
pub use task_info::{JsonTaskInfo, NoTaskInfo, TaskInfo};

use log::{debug, warn};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{
    InconsistentUnload, ModuleId, ModuleInstanceId, Pid, Timestamp, TranslateError,
};
use crate::prd::ModuleFlags;

/// Default time a worker waits for a process lock before giving up
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// A virtual address resolved to a module instance
#[derive(Debug, Clone)]
pub struct ResolvedModule {
    pub instance: ModuleInstanceId,
    pub module: ModuleId,
    pub info: Arc<ModuleInfo>,
    pub load_addr: u64,
    /// Offset of the address inside the module image
    pub offset: u64,
}

/// Module lookups as seen by call-stack resolution
pub trait WorkingSetQuery: Send + Sync {
    /// Module instance of `pid` (or of the system process) covering `vaddr` at `at`
    ///
    /// # Errors
    /// Returns fatal registry errors (lock timeout)
    fn find_module(
        &self,
        pid: Pid,
        vaddr: u64,
        at: Timestamp,
    ) -> Result<Option<ResolvedModule>, TranslateError>;

    /// Visit every instance ever loaded into `pid`, in load-address order
    ///
    /// # Errors
    /// Returns fatal registry errors (lock timeout)
    fn foreach_module(
        &self,
        pid: Pid,
        f: &mut dyn FnMut(&ModuleInstance),
    ) -> Result<(), TranslateError>;
}

type ProcessHandle = Arc<RwLock<ProcessInfo>>;

pub struct Registry {
    processes: RwLock<HashMap<Pid, ProcessHandle>>,
    modules: RwLock<ModuleTable>,
    next_instance: AtomicU32,
    lock_timeout: Duration,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl Registry {
    #[must_use]
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            processes: RwLock::new(HashMap::new()),
            modules: RwLock::new(ModuleTable::default()),
            next_instance: AtomicU32::new(0),
            lock_timeout,
        }
    }

    // ========================================================================
    // Processes
    // ========================================================================

    /// Get the entry of `pid`, creating it on first use
    ///
    /// Concurrent callers for the same pid all receive the same entry.
    pub fn acquire_process_info(&self, pid: Pid) -> ProcessHandle {
        if let Some(handle) = self.process(pid) {
            return handle;
        }
        let mut map = self.processes.write();
        let handle =
            map.entry(pid).or_insert_with(|| Arc::new(RwLock::new(ProcessInfo::new(pid))));
        Arc::clone(handle)
    }

    /// Get the entry of `pid` if it exists
    #[must_use]
    pub fn process(&self, pid: Pid) -> Option<ProcessHandle> {
        self.processes.read().get(&pid).map(Arc::clone)
    }

    /// All known pids, sorted
    #[must_use]
    pub fn pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.processes.read().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Run `f` on the process under its read lock; `None` if the pid is unknown
    ///
    /// # Errors
    /// Returns `LockTimeout` if the process lock is not acquired in time
    pub fn read_process<R>(
        &self,
        pid: Pid,
        f: impl FnOnce(&ProcessInfo) -> R,
    ) -> Result<Option<R>, TranslateError> {
        let Some(handle) = self.process(pid) else {
            return Ok(None);
        };
        let guard = read_with_deadline(&handle, pid, self.lock_timeout)?;
        Ok(Some(f(&guard)))
    }

    /// Run `f` on the process under its write lock, creating the entry if needed
    ///
    /// # Errors
    /// Returns `LockTimeout` if the process lock is not acquired in time
    pub fn write_process<R>(
        &self,
        pid: Pid,
        f: impl FnOnce(&mut ProcessInfo) -> R,
    ) -> Result<R, TranslateError> {
        let handle = self.acquire_process_info(pid);
        let mut guard = write_with_deadline(&handle, pid, self.lock_timeout)?;
        Ok(f(&mut guard))
    }

    /// Apply a process-start record
    ///
    /// # Errors
    /// Returns `LockTimeout` if the process lock is not acquired in time
    pub fn start_process(
        &self,
        pid: Pid,
        parent: Pid,
        name: &str,
        is_32bit: bool,
        at: Timestamp,
    ) -> Result<(), TranslateError> {
        self.write_process(pid, |p| {
            p.name = Some(name.to_string());
            p.parent = Some(parent);
            p.is_32bit = is_32bit;
            p.started_at = Some(at);
        })
    }

    /// Apply a process-exit record
    ///
    /// # Errors
    /// Returns `LockTimeout` if the process lock is not acquired in time
    pub fn exit_process(&self, pid: Pid, exit_code: u32, at: Timestamp) -> Result<(), TranslateError> {
        self.write_process(pid, |p| {
            p.exited_at = Some(at);
            p.exit_code = Some(exit_code);
        })
    }

    // ========================================================================
    // Modules
    // ========================================================================

    /// Apply a module-load record and return the instance it describes
    ///
    /// # Errors
    /// Returns `LockTimeout` or `Resource` errors
    pub fn load_module(
        &self,
        pid: Pid,
        load_addr: u64,
        size: u64,
        flags: ModuleFlags,
        path: &str,
        at: Timestamp,
    ) -> Result<ModuleInstanceId, TranslateError> {
        let module = self.modules.write().intern(ModuleInfo { path: path.to_string(), size, flags });

        let mut assigned = None;
        let outcome = self.write_process(pid, |p| {
            p.modules.load(module, pid, load_addr, size, at, || {
                let id = ModuleInstanceId(self.next_instance.fetch_add(1, Ordering::Relaxed));
                assigned = Some(id);
                id
            })
        })?;

        match outcome {
            LoadOutcome::AlreadyLoaded(id) => Ok(id),
            LoadOutcome::Inserted => {
                debug!("{pid}: loaded {path} at 0x{load_addr:x} ({at})");
                assigned.ok_or_else(unassigned)
            }
            LoadOutcome::Replaced { closed } => {
                warn!(
                    "{pid}: {path} loaded at 0x{load_addr:x} over still-loaded {closed}; closed it at {at}"
                );
                assigned.ok_or_else(unassigned)
            }
        }
    }

    /// Apply a module-unload record
    ///
    /// The inner error reports an unload that matches no loaded module.
    ///
    /// # Errors
    /// Returns `LockTimeout` if the process lock is not acquired in time
    pub fn unload_module(
        &self,
        pid: Pid,
        load_addr: u64,
        at: Timestamp,
    ) -> Result<Result<(), InconsistentUnload>, TranslateError> {
        let outcome = self.read_process(pid, |_| ())?;
        if outcome.is_none() {
            return Ok(Err(InconsistentUnload { pid, load_addr, timestamp: at }));
        }
        match self.write_process(pid, |p| p.modules.unload(load_addr, at))? {
            UnloadOutcome::Unloaded(_) | UnloadOutcome::AlreadyUnloaded(_) => Ok(Ok(())),
            UnloadOutcome::NoMatch => Ok(Err(InconsistentUnload { pid, load_addr, timestamp: at })),
        }
    }

    /// Resolve `vaddr` in `pid` at `at`, falling back to the system process
    ///
    /// # Errors
    /// Returns `LockTimeout` or `Resource` errors
    pub fn resolve_module(
        &self,
        pid: Pid,
        vaddr: u64,
        at: Timestamp,
    ) -> Result<Option<ResolvedModule>, TranslateError> {
        let lookup = |p: &ProcessInfo| {
            p.modules.lookup(vaddr, at).map(|m| (m.id, m.module, m.load_addr))
        };
        let mut found = self.read_process(pid, lookup)?.flatten();
        if found.is_none() && !pid.is_system() {
            found = self.read_process(Pid::SYSTEM, lookup)?.flatten();
        }
        let Some((instance, module, load_addr)) = found else {
            return Ok(None);
        };
        let info = self.module_info(module).ok_or_else(|| unknown_module(module))?;
        Ok(Some(ResolvedModule { instance, module, info, load_addr, offset: vaddr - load_addr }))
    }

    /// Identity of a module
    #[must_use]
    pub fn module_info(&self, id: ModuleId) -> Option<Arc<ModuleInfo>> {
        self.modules.read().get(id).map(Arc::clone)
    }

    /// All module identities
    #[must_use]
    pub fn modules(&self) -> Vec<(ModuleId, Arc<ModuleInfo>)> {
        self.modules.read().iter().map(|(id, info)| (id, Arc::clone(info))).collect()
    }
}

impl WorkingSetQuery for Registry {
    fn find_module(
        &self,
        pid: Pid,
        vaddr: u64,
        at: Timestamp,
    ) -> Result<Option<ResolvedModule>, TranslateError> {
        self.resolve_module(pid, vaddr, at)
    }

    fn foreach_module(
        &self,
        pid: Pid,
        f: &mut dyn FnMut(&ModuleInstance),
    ) -> Result<(), TranslateError> {
        self.read_process(pid, |p| {
            for instance in p.modules.iter() {
                f(instance);
            }
        })?;
        Ok(())
    }
}

// ============================================================================
// Lock acquisition with deadline
// ============================================================================

fn unknown_module(id: ModuleId) -> TranslateError {
    TranslateError::Resource(format!("module {id:?} missing from the module table"))
}

fn unassigned() -> TranslateError {
    TranslateError::Resource("module instance id was not assigned".to_string())
}

fn timed_out(pid: Pid, timeout: Duration) -> TranslateError {
    TranslateError::LockTimeout { pid, waited_ms: timeout.as_millis() }
}

fn read_with_deadline(
    lock: &RwLock<ProcessInfo>,
    pid: Pid,
    timeout: Duration,
) -> Result<RwLockReadGuard<'_, ProcessInfo>, TranslateError> {
    lock.try_read_for(timeout).ok_or_else(|| timed_out(pid, timeout))
}

fn write_with_deadline(
    lock: &RwLock<ProcessInfo>,
    pid: Pid,
    timeout: Duration,
) -> Result<RwLockWriteGuard<'_, ProcessInfo>, TranslateError> {
    lock.try_write_for(timeout).ok_or_else(|| timed_out(pid, timeout))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags() -> ModuleFlags {
        ModuleFlags::default()
    }

    #[test]
    fn test_acquire_returns_same_entry() {
        let registry = Registry::default();
        let a = registry.acquire_process_info(Pid(5));
        let b = registry.acquire_process_info(Pid(5));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.pids(), vec![Pid(5)]);
    }

    #[test]
    fn test_concurrent_acquire_creates_once() {
        let registry = Registry::default();
        let handles: Vec<_> = std::thread::scope(|s| {
            let workers: Vec<_> =
                (0..8).map(|_| s.spawn(|| registry.acquire_process_info(Pid(9)))).collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_resolve_falls_back_to_system_process() {
        let registry = Registry::default();
        registry
            .load_module(Pid::SYSTEM, 0xffff_8000_0000_0000, 0x10_0000, flags(), "vmlinux", Timestamp(0))
            .unwrap();
        registry.load_module(Pid(3), 0x40_0000, 0x1000, flags(), "/bin/app", Timestamp(0)).unwrap();

        let user = registry.resolve_module(Pid(3), 0x40_0010, Timestamp(1)).unwrap().unwrap();
        assert_eq!(user.info.path, "/bin/app");
        assert_eq!(user.offset, 0x10);

        let kernel =
            registry.resolve_module(Pid(3), 0xffff_8000_0000_1000, Timestamp(1)).unwrap().unwrap();
        assert_eq!(kernel.info.path, "vmlinux");
        assert!(registry.resolve_module(Pid(4), 0x40_0010, Timestamp(1)).unwrap().is_none());
    }

    #[test]
    fn test_resolve_is_never_stale() {
        let registry = Registry::default();
        registry.load_module(Pid(3), 0x1000, 0x100, flags(), "a.so", Timestamp(10)).unwrap();
        registry.unload_module(Pid(3), 0x1000, Timestamp(20)).unwrap().unwrap();
        registry.load_module(Pid(3), 0x1000, 0x100, flags(), "b.so", Timestamp(30)).unwrap();

        let at = |t| {
            registry.resolve_module(Pid(3), 0x1010, Timestamp(t)).unwrap().map(|m| m.info.path.clone())
        };
        assert_eq!(at(5), None);
        assert_eq!(at(15).as_deref(), Some("a.so"));
        assert_eq!(at(25), None);
        assert_eq!(at(35).as_deref(), Some("b.so"));
    }

    #[test]
    fn test_inconsistent_unload() {
        let registry = Registry::default();
        let err = registry.unload_module(Pid(3), 0x1000, Timestamp(5)).unwrap().unwrap_err();
        assert_eq!(err.pid, Pid(3));

        registry.load_module(Pid(3), 0x1000, 0x100, flags(), "a.so", Timestamp(1)).unwrap();
        assert!(registry.unload_module(Pid(3), 0x2000, Timestamp(5)).unwrap().is_err());
        assert!(registry.unload_module(Pid(3), 0x1000, Timestamp(5)).unwrap().is_ok());
    }

    #[test]
    fn test_reapplied_load_keeps_instance_id() {
        let registry = Registry::default();
        let first = registry.load_module(Pid(3), 0x1000, 0x100, flags(), "a.so", Timestamp(1)).unwrap();
        let again = registry.load_module(Pid(3), 0x1000, 0x100, flags(), "a.so", Timestamp(1)).unwrap();
        assert_eq!(first, again);
        let mut count = 0;
        registry.foreach_module(Pid(3), &mut |_| count += 1).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_lock_timeout() {
        let registry = Registry::new(Duration::from_millis(20));
        let handle = registry.acquire_process_info(Pid(1));
        let _held = handle.write();
        let err = registry.read_process(Pid(1), |p| p.pid).unwrap_err();
        assert!(matches!(err, TranslateError::LockTimeout { pid: Pid(1), waited_ms: 20 }));
    }

    #[test]
    fn test_waiter_gets_lock_released_before_timeout() {
        let registry = Registry::new(Duration::from_secs(5));
        let handle = registry.acquire_process_info(Pid(1));
        let held = handle.write();
        let name = std::thread::scope(|s| {
            let reader = s.spawn(|| registry.read_process(Pid(1), |p| p.name.clone()));
            std::thread::sleep(Duration::from_millis(20));
            drop(held);
            reader.join().unwrap()
        });
        assert_eq!(name.unwrap(), Some(None));
    }
}
