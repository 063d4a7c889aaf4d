//! Symbol interning.
//!
//! One [`StringInterner`] lives for the whole compilation and is shared
//! by the reader and every analysis pass, so every method takes `&self`.
//! Two tables sit behind one lock: a hash map from text to [`Name`] for
//! interning, and a dense vector from name index to text for lookup.
//!
//! Interned text is never dropped. That is a deliberate one-way door:
//! symbol text must stay readable for the lifetime of every table that
//! holds a `Name`, and the compiler is a batch process whose symbol set
//! is tiny next to its ASTs, so [`lookup`](StringInterner::lookup) can
//! hand out `'static` text instead of threading guard lifetimes through
//! the passes.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::Name;

/// Error when the symbol table is out of indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InternError {
    /// The unit interned more than `u32::MAX` distinct symbols.
    TableFull { count: usize },
}

impl std::fmt::Display for InternError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InternError::TableFull { count } => {
                write!(f, "symbol table full: {count} distinct symbols")
            }
        }
    }
}

impl std::error::Error for InternError {}

/// The two views of the symbol table, updated together.
struct Tables {
    /// Text → name, for interning.
    by_text: FxHashMap<&'static str, Name>,
    /// Name index → text, for lookup.
    by_index: Vec<&'static str>,
}

/// Compilation-wide symbol table.
pub struct StringInterner {
    tables: RwLock<Tables>,
}

impl StringInterner {
    /// Create an interner with [`Name::EMPTY`] already resolvable.
    pub fn new() -> Self {
        let mut tables = Tables {
            by_text: FxHashMap::default(),
            by_index: Vec::with_capacity(128),
        };
        tables.by_index.push("");
        tables.by_text.insert("", Name::EMPTY);
        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Intern a symbol, returning an error when the index space is
    /// exhausted.
    pub fn try_intern(&self, text: &str) -> Result<Name, InternError> {
        // Most interning hits an existing entry; a read lock suffices.
        if let Some(&name) = self.tables.read().by_text.get(text) {
            return Ok(name);
        }

        let mut tables = self.tables.write();
        // A writer may have beaten us between the two locks.
        if let Some(&name) = tables.by_text.get(text) {
            return Ok(name);
        }

        let raw = u32::try_from(tables.by_index.len()).map_err(|_| InternError::TableFull {
            count: tables.by_index.len(),
        })?;
        let name = Name::from_raw(raw);
        // Text enters the table once and stays for the compilation.
        let stored: &'static str = Box::leak(text.to_owned().into_boxed_str());
        tables.by_index.push(stored);
        tables.by_text.insert(stored, name);
        Ok(name)
    }

    /// Intern a symbol.
    ///
    /// # Panics
    /// Panics when the index space is exhausted; use
    /// [`try_intern`](Self::try_intern) to handle that case.
    #[inline]
    pub fn intern(&self, text: &str) -> Name {
        self.try_intern(text).unwrap_or_else(|e| panic!("{}", e))
    }

    /// The text behind a name.
    ///
    /// The result is `'static` because interned text is never dropped.
    pub fn lookup(&self, name: Name) -> &'static str {
        self.tables.read().by_index[name.index()]
    }

    /// Number of distinct symbols interned so far.
    pub fn len(&self) -> usize {
        self.tables.read().by_index.len()
    }

    /// Whether only the pre-interned empty string is present.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn intern_lookup_round_trip() {
        let interner = StringInterner::new();
        let name = interner.intern("for-each");
        assert_eq!(interner.lookup(name), "for-each");
    }

    #[test]
    fn interning_is_idempotent() {
        let interner = StringInterner::new();
        let a = interner.intern("x");
        let b = interner.intern("x");
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_strings_get_distinct_names() {
        let interner = StringInterner::new();
        let a = interner.intern("head");
        let b = interner.intern("tail");
        assert_ne!(a, b);
    }

    #[test]
    fn empty_string_is_preinterned() {
        let interner = StringInterner::new();
        assert_eq!(interner.intern(""), Name::EMPTY);
        assert_eq!(interner.lookup(Name::EMPTY), "");
        assert!(interner.is_empty());
    }

    #[test]
    fn names_are_dense_table_indices() {
        let interner = StringInterner::new();
        let a = interner.intern("a");
        let b = interner.intern("b");
        assert_eq!(a.index(), 1);
        assert_eq!(b.index(), 2);
    }

    #[test]
    fn len_counts_distinct_symbols() {
        let interner = StringInterner::new();
        assert_eq!(interner.len(), 1); // the empty string
        interner.intern("a");
        interner.intern("b");
        interner.intern("a"); // duplicate, not counted
        assert_eq!(interner.len(), 3);
    }
}
