//! Concurrent string interning.
//!
//! [`SymbolTable`] maps strings to dense [`Symbol`]s and back. It is shared
//! between threads: lookups of already-interned strings take one shard read
//! lock, first-time interning takes that shard's write lock plus a short
//! lock on the reverse table.
//!
//! String bytes are copied into a [`GlobalArena`] owned by the table, so
//! [`resolve`](SymbolTable::resolve) hands out `&str` borrowed from the table
//! without reference counting.
//!
//! ```
//! use oxobj_mem::SymbolTable;
//!
//! let table = SymbolTable::new();
//! let a = table.intern("alloc");
//! let b = table.intern("alloc");
//!
//! assert_eq!(a, b);
//! assert_eq!(table.resolve(a), Some("alloc"));
//! assert_eq!(table.get("dealloc"), None);
//! ```

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::RwLock;

use hashbrown::HashMap;
use hashbrown::hash_map::DefaultHashBuilder;

use crate::arena::GlobalArena;
use crate::symbol::Symbol;

/// Number of shards. Must be a power of two.
const SHARD_COUNT: usize = 16;

/// Chunk size of the backing string arena.
const STRING_CHUNK_SIZE: usize = 16 * 1024;

/// Concurrent bidirectional string ⇄ [`Symbol`] table.
///
/// Symbols are assigned densely in first-intern order, starting at zero.
pub struct SymbolTable {
    /// Owns the string bytes referenced by `shards` and `strings`.
    arena: GlobalArena,
    /// Forward maps, sharded by string hash.
    shards: [RwLock<HashMap<&'static str, Symbol>>; SHARD_COUNT],
    /// Reverse map, indexed by symbol id.
    strings: RwLock<Vec<&'static str>>,
    hasher: DefaultHashBuilder,
}

impl SymbolTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            arena: GlobalArena::new(STRING_CHUNK_SIZE),
            shards: std::array::from_fn(|_| RwLock::new(HashMap::new())),
            strings: RwLock::new(Vec::new()),
            hasher: DefaultHashBuilder::default(),
        }
    }

    #[inline]
    fn shard(&self, s: &str) -> &RwLock<HashMap<&'static str, Symbol>> {
        let mut h = self.hasher.build_hasher();
        s.hash(&mut h);
        &self.shards[(h.finish() as usize) & (SHARD_COUNT - 1)]
    }

    /// Returns the symbol for `s`, interning it on first use.
    ///
    /// # Panics
    ///
    /// Panics if the table already holds `Symbol::MAX_ID + 1` strings.
    pub fn intern(&self, s: &str) -> Symbol {
        let shard = self.shard(s);
        if let Some(&sym) = shard.read().unwrap().get(s) {
            return sym;
        }

        let mut map = shard.write().unwrap();
        if let Some(&sym) = map.get(s) {
            return sym;
        }

        let stored = self.arena.alloc_str(s);
        // SAFETY: the arena lives as long as self and never frees or moves
        // its strings; the 'static is never exposed past &self.
        let stored: &'static str = unsafe { &*std::ptr::from_ref::<str>(stored) };

        let sym = {
            let mut strings = self.strings.write().unwrap();
            let id = u32::try_from(strings.len())
                .ok()
                .filter(|&id| id <= Symbol::MAX_ID)
                .unwrap_or_else(|| panic!("Symbol table overflow"));
            strings.push(stored);
            Symbol::new(id)
        };
        map.insert(stored, sym);
        sym
    }

    /// Returns the symbol for `s` if it has been interned.
    #[must_use]
    pub fn get(&self, s: &str) -> Option<Symbol> {
        self.shard(s).read().unwrap().get(s).copied()
    }

    /// Returns the string for `sym`.
    #[must_use]
    pub fn resolve(&self, sym: Symbol) -> Option<&str> {
        self.strings.read().unwrap().get(sym.as_usize()).copied()
    }

    /// Number of interned strings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.read().unwrap().len()
    }

    /// Returns true if nothing has been interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolTable").field("len", &self.len()).finish()
    }
}
