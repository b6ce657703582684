//! The `OxObj` runtime.
//!
//! Every registry and table lives in a [`Runtime`] value. A program normally
//! uses the lazily created process-wide instance ([`Runtime::global`]);
//! tests and embedders create independent instances with [`Runtime::new`].
//!
//! # Architecture
//!
//! - [`selector`]: selector interning ([`Sel`])
//! - [`trie`]: persistent copy-on-write dispatch trie
//! - [`class`]: class records, registry and resolution
//! - [`dispatch`]: dispatch table building and the initialize protocol
//! - [`message`]: message resolution, substitution and forwarding
//! - [`object`]: object identities, allocation and reference counting
//! - [`pool`]: thread-local autorelease pools
//! - [`weak`]: zeroing weak references
//! - [`associated`]: side-table storage for any object or class
//! - [`category`], [`protocol`]: runtime extension of classes
//! - [`module`]: loading static metadata emitted by a compiler
//! - [`introspection`]: read-only queries over the class graph
//!
//! # Locking
//!
//! One runtime-wide read/write lock (the registry) serializes structural
//! edits: class registration, method addition and replacement, categories,
//! table publication. It is never held while user code runs (initializers,
//! `load`, `dealloc`, hooks). Message sends on initialized classes take no
//! lock at all.
//!
//! # Example
//!
//! ```
//! use oxobj::{Id, Runtime, RuntimeConfig, Sel};
//!
//! fn answer(_: &Runtime, _: Id, _: Sel, _: &[usize]) -> usize {
//!     42
//! }
//!
//! let rt = Runtime::new(RuntimeConfig::default());
//! let root = rt.create_class(None, "Root").unwrap();
//! let sel = rt.selector("answer");
//! rt.add_method(root, sel, answer);
//! rt.register_class(root);
//!
//! let obj = rt.new_object(root);
//! assert_eq!(obj.send(sel, &[]), 42);
//! ```

pub mod associated;
pub mod category;
pub mod class;
pub mod dispatch;
pub mod encoding;
pub mod introspection;
pub mod message;
pub mod module;
pub mod object;
pub mod pool;
pub mod protocol;
pub mod selector;
pub mod trie;
pub mod weak;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    Weak,
};

use fxhash::FxHashMap;
use oxobj_log::debug;
use oxobj_mem::GlobalArena;

use crate::config::RuntimeConfig;
use crate::error::Result;

pub use associated::{AssociationKey, AssociationPolicy};
pub use category::CategoryBuilder;
pub use class::{Class, ClassId, ClassState, Ivar, Method};
pub use message::{ForwardHook, SubstitutionHook};
pub use module::{
    CategoryDescriptor, ClassDescriptor, IvarDescriptor, MethodDescriptor, ModuleDescriptor,
    ModuleHandle, ProtocolDescriptor, SelectorReference,
};
pub use object::{Id, IvarScalar, Object};
pub use pool::{AutoreleasePool, PoolMark};
pub use protocol::Protocol;
pub use selector::Sel;
pub use weak::WeakSlot;

use associated::AssociationMap;
use class::Registry;
use dispatch::DispatchTable;
use selector::{SelectorTable, WellKnown};
use weak::WeakTable;

/// A method implementation.
///
/// Receives the runtime, the receiver, the selector that was sent and the
/// explicit arguments as machine words. The return value is a machine word
/// (an object identity, an integer, or the bits of a float).
pub type Imp = fn(&Runtime, Id, Sel, &[usize]) -> usize;

/// Number of tagged-class slots.
pub const TAGGED_CLASS_SLOTS: usize = 8;

/// Chunk size of the arena holding class records.
const CLASS_ARENA_CHUNK: usize = 64 * 1024;

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

/// A dynamic object runtime instance.
///
/// Owns the selector table, the class registry, the dispatch tables, the
/// weak-reference table and the side tables. Always held in an `Arc`.
pub struct Runtime {
    id: u64,
    this: Weak<Runtime>,
    config: RuntimeConfig,

    /// Backing store for class records.
    arena: GlobalArena,
    /// Every class record ever allocated, for teardown.
    records: Mutex<Vec<Class>>,
    next_class_id: AtomicU32,

    selectors: SelectorTable,
    pub(crate) sels: WellKnown,

    /// The structural lock.
    registry: RwLock<Registry>,
    /// Tables of classes whose initializer is running.
    lookaside: RwLock<FxHashMap<Class, Arc<DispatchTable>>>,
    tagged: [OnceLock<Class>; TAGGED_CLASS_SLOTS],

    substitution_hook: RwLock<Option<SubstitutionHook>>,
    forward_hook: RwLock<Option<ForwardHook>>,

    weak_refs: WeakTable,
    associations: AssociationMap,
    next_module_id: AtomicU32,
}

impl Runtime {
    /// Creates an independent runtime.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        if let Some(level) = config.log_level {
            oxobj_log::set_level(level);
        }

        let selectors = SelectorTable::new();
        let sels = WellKnown::intern(&selectors);
        let id = NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed);
        debug!("creating runtime {id}");

        Arc::new_cyclic(|this| Runtime {
            id,
            this: this.clone(),
            config,
            arena: GlobalArena::new(CLASS_ARENA_CHUNK),
            records: Mutex::new(Vec::new()),
            next_class_id: AtomicU32::new(0),
            selectors,
            sels,
            registry: RwLock::new(Registry::default()),
            lookaside: RwLock::new(FxHashMap::default()),
            tagged: std::array::from_fn(|_| OnceLock::new()),
            substitution_hook: RwLock::new(None),
            forward_hook: RwLock::new(None),
            weak_refs: WeakTable::default(),
            associations: AssociationMap::default(),
            next_module_id: AtomicU32::new(1),
        })
    }

    /// Returns the process-wide runtime, creating it on first use.
    ///
    /// Its configuration comes from [`RuntimeConfig::from_env`]; invalid
    /// variables fall back to the defaults with a warning.
    pub fn global() -> &'static Arc<Runtime> {
        static GLOBAL: OnceLock<Arc<Runtime>> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            oxobj_log::init_from_env();
            let config = RuntimeConfig::from_env().unwrap_or_else(|err| {
                oxobj_log::warn!("{err}; using default runtime configuration");
                RuntimeConfig::default()
            });
            Runtime::new(config)
        })
    }

    /// Process-unique id of this runtime.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The configuration this runtime was created with.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Interns a selector without a signature.
    ///
    /// # Panics
    ///
    /// Panics if the selector space (2²⁴ names) is exhausted.
    pub fn selector(&self, name: &str) -> Sel {
        self.selectors.intern(name)
    }

    /// Interns a selector with a type signature such as `"v@:i"`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEncoding`](crate::Error::InvalidEncoding) if
    /// the signature is malformed.
    ///
    /// # Panics
    ///
    /// Panics if `name` was already interned with a different signature.
    pub fn intern_selector(&self, name: &str, types: &str) -> Result<Sel> {
        self.selectors.intern_typed(name, types)
    }

    /// Returns the selector for `name` if it has been interned.
    #[must_use]
    pub fn lookup_selector(&self, name: &str) -> Option<Sel> {
        self.selectors.lookup(name)
    }

    /// Name of an interned selector.
    #[must_use]
    pub fn selector_name(&self, sel: Sel) -> Option<&str> {
        self.selectors.name(sel)
    }

    /// Signature of a selector, if one was recorded.
    #[must_use]
    pub fn selector_types(&self, sel: Sel) -> Option<&str> {
        self.selectors.signature(sel)
    }

    /// Number of interned selectors.
    #[must_use]
    pub fn selector_count(&self) -> usize {
        self.selectors.len()
    }

    pub(crate) fn sel_name(&self, sel: Sel) -> &str {
        self.selectors.name(sel).unwrap_or("<unknown selector>")
    }

    pub(crate) fn weak_self(&self) -> &Weak<Runtime> {
        &self.this
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        pool::forget_runtime(self.id);

        let records = std::mem::take(
            self.records
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for class in &records {
            // SAFETY: every record was placed in self.arena by
            // alloc_class_record and is dropped exactly once, here. No
            // handle is used after the runtime is gone.
            unsafe { class.drop_record() };
        }
        debug!("runtime {} dropped ({} class records)", self.id, records.len());
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("selectors", &self.selectors.len())
            .field("classes", &read(&self.registry).classes.len())
            .field("class_arena", &self.arena.stats())
            .finish_non_exhaustive()
    }
}

// Locks are taken through these helpers: a fault raised while a lock is held
// must not wedge teardown or later diagnostics.

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
