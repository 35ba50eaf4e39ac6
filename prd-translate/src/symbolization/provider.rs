//! Function lookup inside module images
//!
//! A [`SymbolProvider`] maps a module-relative offset to the function that
//! contains it. The translator only needs the function's name, start offset
//! and size; everything else about executables stays behind this trait.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::domain::TranslateError;
use crate::registry::ModuleInfo;

/// A function inside a module image
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FunctionSymbol {
    pub name: String,
    /// Offset from the module load address
    pub start: u64,
    /// Size in bytes; 0 means "up to the next symbol", or to the end of the
    /// module for the last symbol
    #[serde(default)]
    pub size: u64,
}

impl FunctionSymbol {
    #[must_use]
    pub fn contains(&self, offset: u64, next_start: Option<u64>) -> bool {
        if offset < self.start {
            return false;
        }
        if self.size > 0 {
            offset - self.start < self.size
        } else {
            next_start.map_or(true, |next| offset < next)
        }
    }
}

pub trait SymbolProvider: Send + Sync {
    /// Function of `module` containing `offset`, if known
    fn find_function(&self, module: &ModuleInfo, offset: u64) -> Option<FunctionSymbol>;
}

/// Provider that knows no functions; every sample lands on its module
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSymbolProvider;

impl SymbolProvider for NullSymbolProvider {
    fn find_function(&self, _module: &ModuleInfo, _offset: u64) -> Option<FunctionSymbol> {
        None
    }
}

/// Functions of one module, sorted by start offset
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    functions: Vec<FunctionSymbol>,
}

impl SymbolTable {
    #[must_use]
    pub fn new(mut functions: Vec<FunctionSymbol>) -> Self {
        functions.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| b.size.cmp(&a.size)));
        functions.dedup_by_key(|f| f.start);
        Self { functions }
    }

    #[must_use]
    pub fn lookup(&self, offset: u64) -> Option<&FunctionSymbol> {
        self.locate(offset).map(|(function, _)| function)
    }

    /// Owned copy of the function containing `offset`
    ///
    /// A zero size is replaced by the distance to the next symbol, so only
    /// the last symbol of a table is reported without a size.
    #[must_use]
    pub fn find(&self, offset: u64) -> Option<FunctionSymbol> {
        let (function, next) = self.locate(offset)?;
        let mut found = function.clone();
        if found.size == 0 {
            if let Some(next) = next {
                found.size = next - found.start;
            }
        }
        Some(found)
    }

    fn locate(&self, offset: u64) -> Option<(&FunctionSymbol, Option<u64>)> {
        let idx = self.functions.partition_point(|f| f.start <= offset).checked_sub(1)?;
        let next = self.functions.get(idx + 1).map(|f| f.start);
        let function = &self.functions[idx];
        function.contains(offset, next).then_some((function, next))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct SymbolFile {
    modules: Vec<SymbolFileModule>,
}

#[derive(Debug, Deserialize)]
struct SymbolFileModule {
    path: String,
    functions: Vec<FunctionSymbol>,
}

/// Symbol tables loaded from a JSON file
///
/// ```json
/// { "modules": [ { "path": "/usr/bin/app",
///                  "functions": [ { "name": "main", "start": 4096, "size": 64 } ] } ] }
/// ```
///
/// Modules are matched by full path first, then by file name.
#[derive(Debug, Default)]
pub struct JsonSymbolTable {
    by_path: HashMap<String, SymbolTable>,
    by_file_name: HashMap<String, String>,
}

impl JsonSymbolTable {
    /// Load a symbol-table file
    ///
    /// # Errors
    /// Returns `TranslateError::SymbolTable` if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TranslateError> {
        let path = path.as_ref();
        let err = |message: String| TranslateError::SymbolTable { path: path.to_path_buf(), message };
        let text = std::fs::read_to_string(path).map_err(|e| err(e.to_string()))?;
        Self::from_json(&text).map_err(|e| err(e.to_string()))
    }

    /// Parse symbol tables from JSON text
    ///
    /// # Errors
    /// Returns the JSON error if the text does not match the expected shape
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let file: SymbolFile = serde_json::from_str(text)?;
        let mut table = Self::default();
        for module in file.modules {
            let file_name = module.path.rsplit(['/', '\\']).next().unwrap_or(&module.path);
            table.by_file_name.insert(file_name.to_lowercase(), module.path.clone());
            table.by_path.insert(module.path, SymbolTable::new(module.functions));
        }
        Ok(table)
    }

    fn table_for(&self, module: &ModuleInfo) -> Option<&SymbolTable> {
        self.by_path.get(&module.path).or_else(|| {
            let path = self.by_file_name.get(&module.file_name().to_lowercase())?;
            self.by_path.get(path)
        })
    }
}

impl SymbolProvider for JsonSymbolTable {
    fn find_function(&self, module: &ModuleInfo, offset: u64) -> Option<FunctionSymbol> {
        self.table_for(module)?.find(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prd::ModuleFlags;

    fn module(path: &str) -> ModuleInfo {
        ModuleInfo { path: path.to_string(), size: 0x10000, flags: ModuleFlags::default() }
    }

    #[test]
    fn test_symbol_table_lookup() {
        let table = SymbolTable::new(vec![
            FunctionSymbol { name: "b".into(), start: 0x200, size: 0 },
            FunctionSymbol { name: "a".into(), start: 0x100, size: 0x20 },
        ]);
        assert_eq!(table.lookup(0x110).map(|f| f.name.as_str()), Some("a"));
        assert!(table.lookup(0x130).is_none());
        assert_eq!(table.lookup(0x5000).map(|f| f.name.as_str()), Some("b"));
        assert!(table.lookup(0x50).is_none());
    }

    #[test]
    fn test_find_sizes_open_ended_symbols() {
        let table = SymbolTable::new(vec![
            FunctionSymbol { name: "a".into(), start: 0x100, size: 0 },
            FunctionSymbol { name: "b".into(), start: 0x180, size: 0 },
        ]);
        assert_eq!(table.find(0x120).map(|f| f.size), Some(0x80));
        assert_eq!(table.find(0x900).map(|f| f.size), Some(0));
    }

    #[test]
    fn test_json_symbols_match_by_file_name() {
        let symbols = JsonSymbolTable::from_json(
            r#"{"modules":[{"path":"C:\\bin\\App.exe","functions":[{"name":"main","start":4096,"size":64}]}]}"#,
        )
        .unwrap();
        let hit = symbols.find_function(&module("/mnt/traces/app.exe"), 4100).unwrap();
        assert_eq!(hit.name, "main");
        assert!(symbols.find_function(&module("other.dll"), 4100).is_none());
    }
}
