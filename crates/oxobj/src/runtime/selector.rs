//! Selector interning.
//!
//! A selector is a message name, optionally paired with a type signature,
//! mapped to a small dense token ([`Sel`]). Tokens key the per-class
//! dispatch tries, so they are bounded by the trie key space (2²⁴).
//!
//! # Thread Safety
//!
//! Interning is idempotent and safe under concurrent first use: names go
//! through the sharded [`SymbolTable`], signatures through one `RwLock`'d
//! map whose check-and-insert is atomic.
//!
//! # Signatures
//!
//! - An untyped intern never checks or records a signature.
//! - The first typed intern of a name records its signature.
//! - A later typed intern with a different signature is fatal.

use std::fmt;
use std::sync::RwLock;

use fxhash::FxHashMap;
use oxobj_mem::{GlobalArena, SymbolTable};

use crate::error::{Result, fatal};
use crate::runtime::encoding::{self, ReturnKind};
use crate::runtime::trie::KEY_SPACE;
use crate::runtime::{read, write};

/// Interned selector token.
///
/// Tokens are only meaningful within the [`Runtime`](crate::Runtime) that
/// interned them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Sel(u32);

impl Sel {
    /// Raw token value.
    #[must_use]
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub(crate) const fn from_u32(raw: u32) -> Self {
        Self(raw)
    }

    /// Rebuilds a selector from a raw token, as passed through `usize`
    /// message arguments. `None` outside the token space.
    #[must_use]
    pub fn from_raw(raw: usize) -> Option<Self> {
        u32::try_from(raw).ok().filter(|&raw| raw < KEY_SPACE).map(Self)
    }
}

impl fmt::Debug for Sel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sel({})", self.0)
    }
}

/// Name ⇄ token table with optional signatures.
pub(crate) struct SelectorTable {
    names: SymbolTable,
    signatures: RwLock<FxHashMap<Sel, &'static str>>,
    /// Owns the signature strings referenced by `signatures`.
    arena: GlobalArena,
}

impl SelectorTable {
    pub(crate) fn new() -> Self {
        Self {
            names: SymbolTable::new(),
            signatures: RwLock::new(FxHashMap::default()),
            arena: GlobalArena::new(8 * 1024),
        }
    }

    /// Interns `name` without a signature.
    pub(crate) fn intern(&self, name: &str) -> Sel {
        let sym = self.names.intern(name);
        if sym.as_u32() >= KEY_SPACE {
            fatal!("selector space exhausted interning '{name}'");
        }
        Sel(sym.as_u32())
    }

    /// Interns `name` with `types`, validating the signature.
    pub(crate) fn intern_typed(&self, name: &str, types: &str) -> Result<Sel> {
        encoding::validate_signature(types)?;
        let sel = self.intern(name);

        if let Some(existing) = read(&self.signatures).get(&sel) {
            if *existing != types {
                fatal!("conflicting selector signature for '{name}': '{existing}' vs '{types}'");
            }
            return Ok(sel);
        }

        let mut signatures = write(&self.signatures);
        match signatures.get(&sel) {
            Some(existing) if *existing != types => {
                let existing = *existing;
                drop(signatures);
                fatal!("conflicting selector signature for '{name}': '{existing}' vs '{types}'");
            }
            Some(_) => {}
            None => {
                let stored = self.arena.alloc_str(types);
                // SAFETY: the arena is owned by self and never frees or moves
                // its strings; the 'static never escapes past &self.
                let stored: &'static str = unsafe { &*std::ptr::from_ref::<str>(stored) };
                signatures.insert(sel, stored);
            }
        }
        Ok(sel)
    }

    /// Returns the token for `name` if it was interned.
    pub(crate) fn lookup(&self, name: &str) -> Option<Sel> {
        self.names.get(name).map(|sym| Sel(sym.as_u32()))
    }

    pub(crate) fn name(&self, sel: Sel) -> Option<&str> {
        self.names.resolve(oxobj_mem::Symbol::new(sel.0))
    }

    pub(crate) fn signature(&self, sel: Sel) -> Option<&str> {
        read(&self.signatures).get(&sel).copied()
    }

    pub(crate) fn return_kind(&self, sel: Sel) -> ReturnKind {
        self.signature(sel)
            .map_or(ReturnKind::Word, encoding::return_kind)
    }

    pub(crate) fn len(&self) -> usize {
        self.names.len()
    }
}

/// Selectors the runtime itself sends or looks up.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WellKnown {
    pub(crate) initialize: Sel,
    pub(crate) load: Sel,
    pub(crate) dealloc: Sel,
    pub(crate) retain: Sel,
    pub(crate) release: Sel,
    pub(crate) autorelease: Sel,
    pub(crate) copy: Sel,
}

impl WellKnown {
    pub(crate) fn intern(table: &SelectorTable) -> Self {
        Self {
            initialize: table.intern("initialize"),
            load: table.intern("load"),
            dealloc: table.intern("dealloc"),
            retain: table.intern("retain"),
            release: table.intern("release"),
            autorelease: table.intern("autorelease"),
            copy: table.intern("copy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_intern_is_idempotent() {
        let table = SelectorTable::new();
        let a = table.intern("count");
        let b = table.intern("count");
        let c = table.intern("length");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.name(a), Some("count"));
        assert_eq!(table.lookup("length"), Some(c));
        assert_eq!(table.lookup("missing"), None);
    }

    #[test]
    fn test_raw_tokens_are_bounded() {
        let table = SelectorTable::new();
        let sel = table.intern("count");
        assert_eq!(Sel::from_raw(sel.as_u32() as usize), Some(sel));
        assert_eq!(Sel::from_raw(KEY_SPACE as usize), None);
        assert_eq!(Sel::from_raw(usize::MAX), None);
    }

    #[test]
    fn test_untyped_then_typed_upgrades() {
        let table = SelectorTable::new();
        let sel = table.intern("width");
        assert_eq!(table.signature(sel), None);
        assert_eq!(table.intern_typed("width", "d@:").unwrap(), sel);
        assert_eq!(table.signature(sel), Some("d@:"));
        assert_eq!(table.intern("width"), sel);
        assert_eq!(table.return_kind(sel), ReturnKind::Float);
    }

    #[test]
    fn test_same_signature_is_fine() {
        let table = SelectorTable::new();
        let a = table.intern_typed("setX:", "v@:i").unwrap();
        let b = table.intern_typed("setX:", "v@:i").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    #[should_panic(expected = "conflicting selector signature")]
    fn test_conflicting_signature_is_fatal() {
        let table = SelectorTable::new();
        table.intern_typed("size", "q@:").unwrap();
        let _ = table.intern_typed("size", "d@:");
    }

    #[test]
    fn test_invalid_signature_is_error() {
        let table = SelectorTable::new();
        assert!(table.intern_typed("bad", "v@").is_err());
        assert_eq!(table.lookup("bad"), None);
    }

    #[test]
    fn test_concurrent_first_intern() {
        let table = Arc::new(SelectorTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    (0..100)
                        .map(|i| table.intern_typed(&format!("m{i}:"), "v@:@").unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(table.len(), 100);
    }
}
