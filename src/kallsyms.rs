//! Kernel symbol catalog built from `/proc/kallsyms`.
//!
//! The catalog is loaded once at startup and never rebuilt: kernel text does
//! not move while the tracer runs. Symbols are sorted by address at load time
//! so that [`SymbolCatalog::find_nearest`], which runs once per decoded task
//! event, is a binary search.

use std::fs;
use std::path::Path;

use thiserror::Error;

/// Returned by [`SymbolCatalog::find_nearest`] for addresses below every
/// known symbol.
pub const UNKNOWN_SYMBOL: &str = "[unknown]";

#[derive(Debug, Error)]
pub enum SymbolError {
    #[error("failed to read symbol table {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub address: u64,
}

#[derive(Debug, Default)]
pub struct SymbolCatalog {
    symbols: Vec<Symbol>,
}

impl SymbolCatalog {
    /// Load and index the symbol table at `path`.
    pub fn load(path: &Path) -> Result<Self, SymbolError> {
        let contents = fs::read_to_string(path).map_err(|source| SymbolError::Load {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::parse(&contents))
    }

    /// Build a catalog from kallsyms-formatted text.
    ///
    /// Each line is `<hex address> <type> <name> [module]`. Lines that do not
    /// parse and zeroed addresses (what unprivileged readers see under
    /// `kptr_restrict`) are skipped.
    pub fn parse(contents: &str) -> Self {
        let symbols = contents
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let address = u64::from_str_radix(fields.next()?, 16).ok()?;
                let _kind = fields.next()?;
                let name = fields.next()?;
                (address != 0).then(|| Symbol {
                    name: name.to_string(),
                    address,
                })
            })
            .collect();
        Self::from_symbols(symbols)
    }

    pub fn from_symbols(mut symbols: Vec<Symbol>) -> Self {
        symbols.sort_by_key(|sym| sym.address);
        Self { symbols }
    }

    /// Name of the symbol with the greatest address `<= addr`.
    pub fn find_nearest(&self, addr: u64) -> &str {
        let idx = self.symbols.partition_point(|sym| sym.address <= addr);
        if idx == 0 {
            return UNKNOWN_SYMBOL;
        }
        &self.symbols[idx - 1].name
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
