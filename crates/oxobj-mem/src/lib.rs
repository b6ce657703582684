//! `OxObj` memory management infrastructure
//!
//! This crate provides the memory primitives the `OxObj` runtime builds its
//! metadata on:
//!
//! - **Arena allocator**: thread-safe bump allocation for records that live as
//!   long as their owning runtime (`global-arena` feature)
//! - **Symbols**: dense 32-bit identifiers for interned strings
//! - **Symbol table**: a concurrent, sharded string interner backed by the
//!   arena (`symbols` feature)

#[cfg(feature = "global-arena")]
pub mod arena;
pub mod symbol;
#[cfg(feature = "symbols")]
pub mod interner;

pub use symbol::Symbol;

#[cfg(feature = "global-arena")]
pub use arena::{ArenaStats, GlobalArena};
#[cfg(feature = "symbols")]
pub use interner::SymbolTable;
