//! Domain types providing compile-time safety and self-documentation
//!
//! Newtype wrappers keep process ids, thread ids, cores and timestamps from
//! being mixed up in the many `u32`/`u64` heavy signatures of the translator.

use std::fmt;

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Pid(pub u32);

impl Pid {
    /// Process that owns kernel and other system-wide modules
    pub const SYSTEM: Pid = Pid(prd_common::SYSTEM_PID);

    #[must_use]
    pub fn is_system(self) -> bool {
        self == Self::SYSTEM
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Thread ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// CPU core the record was produced on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CoreId(pub u32);

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU:{}", self.0)
    }
}

/// Trace timestamp in counter ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Timestamp(pub u64);

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t={}", self.0)
    }
}

/// Arena index of a module identity (path + flags) in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

/// Arena index of one load of a module into one process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleInstanceId(pub u32);

impl fmt::Display for ModuleInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instance#{}", self.0)
    }
}

/// Natural identity of a function: its module and start offset
///
/// `start == None` is the module's unknown function; `module == None` is the
/// function of code outside any known module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionKey {
    pub module: Option<ModuleId>,
    pub start: Option<u64>,
}

impl FunctionKey {
    pub const UNKNOWN: FunctionKey = FunctionKey { module: None, start: None };

    #[must_use]
    pub fn unknown_in(module: ModuleId) -> Self {
        Self { module: Some(module), start: None }
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.start.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Pid(42).to_string(), "PID:42");
        assert_eq!(Tid(7).to_string(), "TID:7");
        assert_eq!(CoreId(3).to_string(), "CPU:3");
        assert_eq!(Timestamp(100).to_string(), "t=100");
    }

    #[test]
    fn test_unknown_function_keys() {
        assert!(FunctionKey::UNKNOWN.is_unknown());
        assert!(FunctionKey::unknown_in(ModuleId(1)).is_unknown());
        assert!(!FunctionKey { module: Some(ModuleId(1)), start: Some(0x10) }.is_unknown());
        assert!(Pid::SYSTEM.is_system());
    }
}
