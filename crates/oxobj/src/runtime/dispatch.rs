//! Dispatch table construction and the initialize protocol.
//!
//! Each class record publishes its dispatch table through an `ArcSwap`.
//! A table is a [`DispatchTrie`] of [`Slot`]s: it starts as a clone of the
//! superclass's table (sharing every node) and then receives the class's own
//! methods. Tables are built when the class receives its first message; after
//! that they are replaced wholesale whenever a method is added, replaced or
//! merged in by a category.
//!
//! Before the tables of a class are published, its `initialize` class method
//! runs exactly once, superclass first. While it runs the new tables live in
//! the runtime's look-aside map, so the initializing thread can message the
//! class; other threads wait on the class's condition variable.

use std::sync::{Arc, LazyLock, PoisonError};
use std::thread;

use oxobj_log::trace;

use crate::error::fatal;
use crate::runtime::class::{Class, InitState, Method, flags};
use crate::runtime::object::Id;
use crate::runtime::selector::Sel;
use crate::runtime::trie::DispatchTrie;
use crate::runtime::{Imp, Runtime, lock, read, write};

/// A resolved method as seen from one class.
#[derive(Clone)]
pub(crate) struct Slot {
    /// The class whose method list supplied the method.
    pub(crate) owner: Class,
    pub(crate) imp: Imp,
    /// Method version when the slot was written.
    pub(crate) version: u64,
    pub(crate) method: Arc<Method>,
}

impl Slot {
    fn new(owner: Class, method: &Arc<Method>) -> Self {
        let (imp, version) = method.snapshot();
        Slot {
            owner,
            imp,
            version,
            method: Arc::clone(method),
        }
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("owner", &self.owner)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

pub(crate) type DispatchTable = DispatchTrie<Slot>;

static UNINSTALLED: LazyLock<Arc<DispatchTable>> = LazyLock::new(|| Arc::new(DispatchTrie::new()));

/// The shared empty table every class starts with.
pub(crate) fn uninstalled_table() -> Arc<DispatchTable> {
    Arc::clone(&UNINSTALLED)
}

/// Publishes tables and wakes waiters, also when the initializer unwinds.
struct InitGuard<'rt> {
    rt: &'rt Runtime,
    class: Class,
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        let class = self.class;
        {
            let _reg = read(&self.rt.registry);
            let mut lookaside = write(&self.rt.lookaside);
            for record in [class, class.metaclass()] {
                if let Some(table) = lookaside.remove(&record) {
                    record.inner().dtable.store(table);
                }
                record.set_flag(flags::INITIALIZED);
            }
        }

        let inner = class.inner();
        *lock(&inner.init) = InitState::Done;
        inner.init_done.notify_all();
        if thread::panicking() {
            oxobj_log::error!("+[{} initialize] unwound; tables published anyway", class.name());
        } else {
            trace!("initialized class '{}'", class.name());
        }
    }
}

impl Runtime {
    /// Table a lookup should use right now: the installed one, the
    /// look-aside one during initialization, or a freshly computed one.
    ///
    /// Callers computing tables must hold the registry lock.
    pub(crate) fn current_table(&self, class: Class) -> Arc<DispatchTable> {
        if class.is_initialized() {
            return class.inner().dtable.load_full();
        }
        if let Some(table) = read(&self.lookaside).get(&class) {
            return Arc::clone(table);
        }
        Arc::new(self.compute_table(class))
    }

    /// Superclass table plus own methods, newest list first.
    fn compute_table(&self, class: Class) -> DispatchTable {
        let mut table = match class.superclass() {
            Some(sup) => DispatchTable::clone(&self.current_table(sup)),
            None => DispatchTable::new(),
        };
        for method in class.own_methods() {
            let key = method.selector().as_u32();
            if table.lookup(key).is_some_and(|slot| slot.owner == class) {
                continue;
            }
            table.insert(key, Slot::new(class, &method));
        }
        table
    }

    /// Runs the initialize protocol for `class` (or the class a metaclass
    /// describes). Returns once the tables are usable from this thread.
    ///
    /// # Panics
    ///
    /// Panics if the class cannot be resolved.
    pub(crate) fn ensure_initialized(&self, class: Class) {
        let class = class.instance_class();
        if class.is_initialized() {
            return;
        }
        if class.is_disposed() || !self.resolve_class(class) {
            fatal!("message sent to unresolved class '{}'", class.name());
        }
        if let Some(sup) = class.superclass() {
            self.ensure_initialized(sup);
        }

        let me = thread::current().id();
        {
            let inner = class.inner();
            let mut state = lock(&inner.init);
            loop {
                match *state {
                    InitState::Done => return,
                    // Re-entrant send from this thread's initializer.
                    InitState::Running(owner) if owner == me => return,
                    InitState::Running(_) => {
                        state = inner
                            .init_done
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    InitState::Idle => {
                        *state = InitState::Running(me);
                        break;
                    }
                }
            }
        }

        {
            let _reg = read(&self.registry);
            let table = Arc::new(self.compute_table(class));
            write(&self.lookaside).insert(class, table);
            let meta = class.metaclass();
            let table = Arc::new(self.compute_table(meta));
            write(&self.lookaside).insert(meta, table);
        }

        let guard = InitGuard { rt: self, class };
        if let Some(method) = class.metaclass().own_method(self.sels.initialize) {
            trace!("+[{} initialize]", class.name());
            (method.imp())(self, Id::from_class(class), self.sels.initialize, &[]);
        }
        drop(guard);
    }

    /// Rewrites the installed and look-aside tables of `class`.
    fn patch_tables(&self, class: Class, mut edit: impl FnMut(&mut DispatchTable)) {
        if class.is_initialized() {
            let mut table = DispatchTable::clone(&class.inner().dtable.load_full());
            edit(&mut table);
            class.inner().dtable.store(Arc::new(table));
        }
        if let Some(table) = write(&self.lookaside).get_mut(&class) {
            edit(Arc::make_mut(table));
        }
    }

    /// Makes `method` of `owner` the slot for its selector in `class` and
    /// every descendant that does not override it.
    ///
    /// Registry write lock must be held.
    pub(crate) fn install_down(&self, owner: Class, class: Class, method: &Arc<Method>) {
        let key = method.selector().as_u32();
        let slot = Slot::new(owner, method);
        self.patch_tables(class, |table| {
            table.insert(key, slot.clone());
        });
        for sub in class.subclasses() {
            if sub.own_method(method.selector()).is_none() {
                self.install_down(owner, sub, method);
            }
        }
    }

    /// Refreshes every slot in the subtree of `class` that caches `method`.
    ///
    /// Registry write lock must be held.
    pub(crate) fn refresh_slots(&self, class: Class, method: &Arc<Method>) {
        let key = method.selector().as_u32();
        self.patch_tables(class, |table| {
            let owner = match table.lookup(key) {
                Some(slot) if Arc::ptr_eq(&slot.method, method) => slot.owner,
                _ => return,
            };
            table.insert(key, Slot::new(owner, method));
        });
        for sub in class.subclasses() {
            self.refresh_slots(sub, method);
        }
    }

    /// Adds a method to `class`. For class methods pass the metaclass.
    ///
    /// Returns false if the class already has its own method for `sel`
    /// (use [`replace_method`](Self::replace_method)) or has been disposed.
    /// Subclasses that already built their tables see the method at once.
    pub fn add_method(&self, class: Class, sel: Sel, imp: Imp) -> bool {
        let _reg = write(&self.registry);
        if class.is_disposed() || class.own_method(sel).is_some() {
            return false;
        }
        let method = Arc::new(Method::new(sel, imp, None));
        class.push_method(Arc::clone(&method));
        self.install_down(class, class, &method);
        trace!("added {}[{} {}]", sign(class), class.name(), self.sel_name(sel));
        true
    }

    /// Replaces the implementation of the method `class` itself answers for
    /// `sel`, bumping its version. Adds the method if the class has none.
    ///
    /// Returns the previous implementation, if there was one.
    pub fn replace_method(&self, class: Class, sel: Sel, imp: Imp) -> Option<Imp> {
        let _reg = write(&self.registry);
        if class.is_disposed() {
            return None;
        }
        match class.own_method(sel) {
            Some(method) => {
                let old = method.replace(imp);
                self.refresh_slots(class, &method);
                trace!(
                    "replaced {}[{} {}] (version {})",
                    sign(class),
                    class.name(),
                    self.sel_name(sel),
                    method.version()
                );
                Some(old)
            }
            None => {
                let method = Arc::new(Method::new(sel, imp, None));
                class.push_method(Arc::clone(&method));
                self.install_down(class, class, &method);
                None
            }
        }
    }

    /// Implementation `class` would run for `sel`, without sending a message
    /// or running the initializer.
    #[must_use]
    pub fn method_implementation(&self, class: Class, sel: Sel) -> Option<Imp> {
        self.lookup_slot(class, sel).map(|slot| slot.imp)
    }

    /// The method `class` would run for `sel`.
    #[must_use]
    pub fn lookup_method(&self, class: Class, sel: Sel) -> Option<Arc<Method>> {
        self.lookup_slot(class, sel).map(|slot| slot.method)
    }

    /// Class whose method list supplies `class`'s implementation of `sel`.
    #[must_use]
    pub fn method_provider(&self, class: Class, sel: Sel) -> Option<Class> {
        self.lookup_slot(class, sel).map(|slot| slot.owner)
    }

    pub(crate) fn lookup_slot(&self, class: Class, sel: Sel) -> Option<Slot> {
        if !class.is_resolved() || class.is_disposed() {
            return None;
        }
        let _reg = read(&self.registry);
        self.current_table(class).lookup(sel.as_u32()).cloned()
    }

    /// Full table of `class`, computed if needed.
    pub(crate) fn table_snapshot(&self, class: Class) -> Arc<DispatchTable> {
        let _reg = read(&self.registry);
        self.current_table(class)
    }
}

/// `+` for class methods, `-` for instance methods.
pub(crate) fn sign(class: Class) -> char {
    if class.is_metaclass() { '+' } else { '-' }
}
