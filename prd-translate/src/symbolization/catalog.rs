//! Per-worker function catalog and address-to-site resolution
//!
//! ```text
//! (pid, vaddr, t) ──► WorkingSetQuery ──► module instance + offset
//!                                              │
//!                     FunctionCatalog ◄────────┘  cached ranges per module,
//!                          │                      SymbolProvider on a miss
//!                          ▼
//!                        Site { instance, function, offset }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::provider::SymbolProvider;
use crate::aggregation::stats::{PrdTranslationStats, StatKind};
use crate::domain::{FunctionKey, ModuleId, ModuleInstanceId, Pid, Timestamp, TranslateError};
use crate::registry::{ModuleInfo, WorkingSetQuery};

/// Where an instruction address landed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Site {
    pub instance: Option<ModuleInstanceId>,
    pub function: FunctionKey,
    /// Offset inside the module, or the raw address outside any module
    pub offset: u64,
}

impl Site {
    /// Site of an address outside every known module
    #[must_use]
    pub fn unknown(vaddr: u64) -> Self {
        Self { instance: None, function: FunctionKey::UNKNOWN, offset: vaddr }
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.instance.is_some()
    }
}

/// Name and size of a catalogued function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDesc {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Default)]
struct ModuleFunctions {
    /// Known functions as `(start, end, name)`, sorted by start
    ranges: Vec<(u64, u64, String)>,
    /// Offsets the provider had no function for
    misses: HashSet<u64>,
}

impl ModuleFunctions {
    fn find(&self, offset: u64) -> Option<u64> {
        let idx = self.ranges.partition_point(|(start, _, _)| *start <= offset).checked_sub(1)?;
        let (start, end, _) = &self.ranges[idx];
        (offset < *end).then_some(*start)
    }
}

/// Interns functions per module, asking the symbol provider only once per
/// function range
pub struct FunctionCatalog {
    provider: Arc<dyn SymbolProvider>,
    modules: HashMap<ModuleId, ModuleFunctions>,
}

impl FunctionCatalog {
    #[must_use]
    pub fn new(provider: Arc<dyn SymbolProvider>) -> Self {
        Self { provider, modules: HashMap::new() }
    }

    /// Function of `module` containing `offset`; the module's unknown
    /// function if the provider has none
    pub fn resolve(
        &mut self,
        module: ModuleId,
        info: &ModuleInfo,
        offset: u64,
        stats: &mut PrdTranslationStats,
    ) -> FunctionKey {
        let functions = self.modules.entry(module).or_default();
        if let Some(start) = functions.find(offset) {
            return FunctionKey { module: Some(module), start: Some(start) };
        }
        if functions.misses.contains(&offset) {
            return FunctionKey::unknown_in(module);
        }

        let provider = &self.provider;
        let found = stats.time(StatKind::QuerySymbolEngine, || provider.find_function(info, offset));
        match found {
            Some(symbol) if symbol.start <= offset => {
                // A symbol without a size runs to the end of the module
                let end = if symbol.size > 0 {
                    symbol.start.saturating_add(symbol.size)
                } else {
                    info.size.max(offset.saturating_add(1))
                };
                let pos = functions.ranges.partition_point(|(s, _, _)| *s < symbol.start);
                if functions.ranges.get(pos).map(|(s, _, _)| *s) != Some(symbol.start) {
                    functions.ranges.insert(pos, (symbol.start, end, symbol.name));
                }
                FunctionKey { module: Some(module), start: Some(symbol.start) }
            }
            _ => {
                functions.misses.insert(offset);
                FunctionKey::unknown_in(module)
            }
        }
    }

    /// Every function seen so far
    #[must_use]
    pub fn into_functions(self) -> HashMap<FunctionKey, FunctionDesc> {
        let mut out = HashMap::new();
        for (module, functions) in self.modules {
            for (start, end, name) in functions.ranges {
                out.insert(
                    FunctionKey { module: Some(module), start: Some(start) },
                    FunctionDesc { name, size: end - start },
                );
            }
        }
        out
    }
}

/// Resolves instruction addresses to [`Site`]s for one worker
pub struct SiteResolver<'a> {
    working_set: &'a dyn WorkingSetQuery,
    catalog: FunctionCatalog,
    stats: PrdTranslationStats,
}

impl<'a> SiteResolver<'a> {
    #[must_use]
    pub fn new(
        working_set: &'a dyn WorkingSetQuery,
        provider: Arc<dyn SymbolProvider>,
        stats: PrdTranslationStats,
    ) -> Self {
        Self { working_set, catalog: FunctionCatalog::new(provider), stats }
    }

    /// Site of `vaddr` in `pid` at `at`; `None` if no loaded module covers it
    ///
    /// # Errors
    /// Returns fatal registry errors
    pub fn resolve(
        &mut self,
        pid: Pid,
        vaddr: u64,
        at: Timestamp,
    ) -> Result<Option<Site>, TranslateError> {
        let working_set = self.working_set;
        let Some(module) =
            self.stats.time(StatKind::FindModuleInfo, || working_set.find_module(pid, vaddr, at))?
        else {
            return Ok(None);
        };
        let function =
            self.catalog.resolve(module.module, &module.info, module.offset, &mut self.stats);
        Ok(Some(Site { instance: Some(module.instance), function, offset: module.offset }))
    }

    /// Like [`SiteResolver::resolve`], mapping misses to [`Site::unknown`]
    ///
    /// # Errors
    /// Returns fatal registry errors
    pub fn resolve_or_unknown(
        &mut self,
        pid: Pid,
        vaddr: u64,
        at: Timestamp,
    ) -> Result<Site, TranslateError> {
        Ok(self.resolve(pid, vaddr, at)?.unwrap_or_else(|| Site::unknown(vaddr)))
    }

    pub fn stats_mut(&mut self) -> &mut PrdTranslationStats {
        &mut self.stats
    }

    /// Split into the catalogued functions and the collected statistics
    #[must_use]
    pub fn finish(self) -> (HashMap<FunctionKey, FunctionDesc>, PrdTranslationStats) {
        (self.catalog.into_functions(), self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prd::ModuleFlags;
    use crate::registry::Registry;
    use crate::symbolization::provider::FunctionSymbol;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
    }

    impl SymbolProvider for CountingProvider {
        fn find_function(&self, _module: &ModuleInfo, offset: u64) -> Option<FunctionSymbol> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            (offset < 0x100).then(|| FunctionSymbol { name: "hot".into(), start: 0x40, size: 0x40 })
        }
    }

    #[test]
    fn test_catalog_caches_function_ranges() {
        let provider = Arc::new(CountingProvider { calls: AtomicUsize::new(0) });
        let mut catalog = FunctionCatalog::new(provider.clone());
        let mut stats = PrdTranslationStats::default();
        let info =
            ModuleInfo { path: "a.so".into(), size: 0x1000, flags: ModuleFlags::default() };

        let first = catalog.resolve(ModuleId(0), &info, 0x44, &mut stats);
        let second = catalog.resolve(ModuleId(0), &info, 0x7F, &mut stats);
        assert_eq!(first, second);
        assert_eq!(first.start, Some(0x40));
        assert_eq!(provider.calls.load(Ordering::Relaxed), 1);

        let miss = catalog.resolve(ModuleId(0), &info, 0x800, &mut stats);
        assert!(miss.is_unknown());
        catalog.resolve(ModuleId(0), &info, 0x800, &mut stats);
        assert_eq!(provider.calls.load(Ordering::Relaxed), 2);
        assert_eq!(stats.get(StatKind::QuerySymbolEngine).count, 2);

        let functions = catalog.into_functions();
        assert_eq!(functions[&first].name, "hot");
        assert_eq!(functions[&first].size, 0x40);
    }

    struct TailSymbolProvider {
        calls: AtomicUsize,
    }

    impl SymbolProvider for TailSymbolProvider {
        fn find_function(&self, _module: &ModuleInfo, offset: u64) -> Option<FunctionSymbol> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            (offset >= 0x200).then(|| FunctionSymbol { name: "tail".into(), start: 0x200, size: 0 })
        }
    }

    #[test]
    fn test_unsized_symbol_is_cached_to_module_end() {
        let provider = Arc::new(TailSymbolProvider { calls: AtomicUsize::new(0) });
        let mut catalog = FunctionCatalog::new(provider.clone());
        let mut stats = PrdTranslationStats::default();
        let info =
            ModuleInfo { path: "b.so".into(), size: 0x1000, flags: ModuleFlags::default() };

        let keys: Vec<_> = [0x204, 0x205, 0x300, 0xfff]
            .into_iter()
            .map(|offset| catalog.resolve(ModuleId(1), &info, offset, &mut stats))
            .collect();
        assert!(keys.iter().all(|k| k.start == Some(0x200)));
        assert_eq!(provider.calls.load(Ordering::Relaxed), 1);

        let functions = catalog.into_functions();
        assert_eq!(functions[&keys[0]].size, 0xe00);
    }

    #[test]
    fn test_site_resolver_outside_modules() {
        let registry = Registry::default();
        registry
            .load_module(Pid(1), 0x1000, 0x1000, ModuleFlags::default(), "a.so", Timestamp(0))
            .unwrap();
        let mut resolver = SiteResolver::new(
            &registry,
            Arc::new(crate::symbolization::NullSymbolProvider),
            PrdTranslationStats::default(),
        );
        let inside = resolver.resolve(Pid(1), 0x1010, Timestamp(1)).unwrap().unwrap();
        assert_eq!(inside.offset, 0x10);
        assert!(inside.function.is_unknown());
        let outside = resolver.resolve_or_unknown(Pid(1), 0x9000, Timestamp(1)).unwrap();
        assert_eq!(outside, Site::unknown(0x9000));
    }
}
