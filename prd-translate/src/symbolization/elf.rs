//! Symbol tables read from module images on disk
//!
//! Uses the image's static and dynamic symbol tables (no DWARF); symbol
//! addresses are rebased to module-relative offsets and demangled.

use log::{debug, warn};
use object::{Object, ObjectSymbol, SymbolKind};
use parking_lot::Mutex;
use rustc_demangle::demangle;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::provider::{FunctionSymbol, SymbolProvider, SymbolTable};
use crate::registry::ModuleInfo;

/// Reads ELF (and PE/COFF) images named by module paths
///
/// Images are parsed outside the cache lock, so two workers may parse the
/// same image concurrently; the first table inserted wins. Images that are
/// missing or unparsable are remembered as empty so they are not retried.
pub struct ElfSymbolProvider {
    /// Prefix for module paths (e.g. a copy of the target's root filesystem)
    root: Option<PathBuf>,
    tables: Mutex<HashMap<String, Arc<SymbolTable>>>,
}

impl ElfSymbolProvider {
    #[must_use]
    pub fn new() -> Self {
        Self { root: None, tables: Mutex::new(HashMap::new()) }
    }

    /// Resolve module paths below `root` instead of `/`
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    fn image_path(&self, module_path: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(module_path.trim_start_matches('/')),
            None => PathBuf::from(module_path),
        }
    }

    fn table(&self, module: &ModuleInfo) -> Arc<SymbolTable> {
        if let Some(table) = self.tables.lock().get(&module.path) {
            return Arc::clone(table);
        }

        let path = self.image_path(&module.path);
        let parsed = match load_symbol_table(&path) {
            Ok(table) => {
                debug!("{}: {} functions", path.display(), table.len());
                Arc::new(table)
            }
            Err(e) => {
                warn!("No symbols for {}: {e}", path.display());
                Arc::new(SymbolTable::default())
            }
        };
        Arc::clone(self.tables.lock().entry(module.path.clone()).or_insert(parsed))
    }
}

impl Default for ElfSymbolProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolProvider for ElfSymbolProvider {
    fn find_function(&self, module: &ModuleInfo, offset: u64) -> Option<FunctionSymbol> {
        self.table(module).find(offset)
    }
}

/// Parse the function symbols of an image file
///
/// # Errors
/// Returns an error if the file cannot be read or is not a supported object file
pub fn load_symbol_table(path: &Path) -> io::Result<SymbolTable> {
    let data = std::fs::read(path)?;
    let file =
        object::File::parse(&*data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let base = file.relative_address_base();

    let functions = file
        .symbols()
        .chain(file.dynamic_symbols())
        .filter(|s| s.kind() == SymbolKind::Text && s.is_definition() && s.address() >= base)
        .filter_map(|s| {
            let name = s.name().ok()?;
            if name.is_empty() {
                return None;
            }
            Some(FunctionSymbol {
                name: demangle_symbol(name),
                start: s.address() - base,
                size: s.size(),
            })
        })
        .collect();

    Ok(SymbolTable::new(functions))
}

/// Demangle a Rust symbol name, leaving other names unchanged
#[must_use]
pub fn demangle_symbol(symbol: &str) -> String {
    format!("{:#}", demangle(symbol))
}
