//! Dense identifiers for interned strings.
//!
//! A [`Symbol`] is handed out by a [`SymbolTable`](crate::SymbolTable) in
//! insertion order starting at zero, so it can index side arrays directly.
//!
//! ```
//! use oxobj_mem::Symbol;
//!
//! let a = Symbol::new(3);
//! assert_eq!(a.as_usize(), 3);
//! assert!(Symbol::NONE.is_none());
//! ```

use std::fmt;

/// A 32-bit identifier for an interned string.
///
/// Equality and hashing are on the id only. `u32::MAX` is reserved as
/// [`Symbol::NONE`] and is never produced by a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(u32);

impl Symbol {
    /// Reserved "no symbol" value.
    pub const NONE: Symbol = Symbol(u32::MAX);

    /// Largest id a table may assign.
    pub const MAX_ID: u32 = u32::MAX - 1;

    /// Creates a symbol from a raw id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the raw id as an index.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Returns true for [`Symbol::NONE`].
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "#none")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}
