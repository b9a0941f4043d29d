use std::collections::HashSet;
use std::fs;
use std::path::Path;
use volscan_domain::value_objects::symbol::Symbol;

/// Immutable symbol set a scheduler works on. Built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolCatalog {
    symbols: Vec<Symbol>,
}

impl SymbolCatalog {
    /// Drops duplicates, keeping the first occurrence. An empty list is rejected.
    pub fn new(symbols: Vec<Symbol>) -> Result<Self, String> {
        let mut seen = HashSet::with_capacity(symbols.len());
        let symbols: Vec<Symbol> = symbols
            .into_iter()
            .filter(|symbol| seen.insert(symbol.clone()))
            .collect();
        if symbols.is_empty() {
            return Err("symbol list is empty".to_string());
        }
        Ok(Self { symbols })
    }

    /// One symbol per line; blank lines and `#` comments are skipped.
    pub fn parse(contents: &str) -> Result<Self, String> {
        let mut symbols = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let symbol = Symbol::new(line).map_err(|err| format!("line {}: {err}", idx + 1))?;
            symbols.push(symbol);
        }
        Self::new(symbols)
    }

    pub fn load_file(path: &Path) -> Result<Self, String> {
        let contents = fs::read_to_string(path)
            .map_err(|err| format!("failed to read symbols file {}: {}", path.display(), err))?;
        Self::parse(&contents).map_err(|err| format!("{}: {err}", path.display()))
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// File body accepted by [`SymbolCatalog::parse`].
pub fn render_symbol_file(symbols: &[Symbol]) -> String {
    let mut out = String::new();
    for symbol in symbols {
        out.push_str(symbol.as_str());
        out.push('\n');
    }
    out
}
