//! Symbolization: module-relative function lookup
//!
//! - [`provider`]: the [`SymbolProvider`] seam plus the null and JSON providers
//! - [`elf`]: provider reading symbol tables from module images on disk
//! - [`catalog`]: per-worker caching of functions and address resolution

pub mod catalog;
pub mod elf;
pub mod provider;

pub use catalog::{FunctionCatalog, FunctionDesc, Site, SiteResolver};
pub use elf::{demangle_symbol, ElfSymbolProvider};
pub use provider::{FunctionSymbol, JsonSymbolTable, NullSymbolProvider, SymbolProvider, SymbolTable};
