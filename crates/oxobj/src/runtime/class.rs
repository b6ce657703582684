//! Class records, the class registry and resolution.
//!
//! A class is a pair of records: the class itself, describing instances, and
//! its metaclass, describing the class object. Records are allocated in the
//! owning runtime's arena and referred to through the copyable [`Class`]
//! handle.
//!
//! # Lifecycle
//!
//! ```text
//! CONSTRUCTING ──register──▶ REGISTERED_UNRESOLVED ──resolve──▶ RESOLVED
//! ```
//!
//! - [`Runtime::create_class`] builds a pair in `Constructing`; ivars may only
//!   be added in this state.
//! - [`Runtime::register_class`] enters the name table and resolves.
//! - Resolution links the superclass, freezes the instance size, marks the
//!   pair resolved and fires the class's `load` method once, superclass
//!   first. Classes whose superclass is not registered yet wait on a pending
//!   list that is retried (to a fixpoint) whenever any class registers.
//!
//! # Hierarchy
//!
//! The metaclass of `C` has the metaclass of `C`'s superclass as its
//! superclass. The root metaclass's superclass is the root class itself, so
//! class objects also answer the root's instance methods. Every metaclass's
//! own metaclass is the root metaclass.
//!
//! # Thread Safety
//!
//! Structural edits (registration, resolution, method additions) happen
//! under the runtime's registry write lock. Per-record fields carry their own
//! locks or are write-once (`OnceLock`).

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock};
use std::thread::ThreadId;

use arc_swap::ArcSwap;
use fxhash::FxHashMap;
use oxobj_log::{debug, trace, warn};

use crate::error::{Error, Result, fatal};
use crate::runtime::associated::AssociationTable;
use crate::runtime::dispatch::{DispatchTable, uninstalled_table};
use crate::runtime::message::SubstitutionHook;
use crate::runtime::module::{ModuleId, PendingCategory};
use crate::runtime::object::Id;
use crate::runtime::protocol::Protocol;
use crate::runtime::selector::Sel;
use crate::runtime::{Imp, Runtime, TAGGED_CLASS_SLOTS, lock, read, write};

/// Class record flags.
pub(crate) mod flags {
    pub const META: u32 = 1 << 0;
    pub const RESOLVED: u32 = 1 << 1;
    pub const INITIALIZED: u32 = 1 << 2;
    pub const USER_CREATED: u32 = 1 << 3;
    pub const CUSTOM_RC: u32 = 1 << 4;
    pub const LOADED: u32 = 1 << 5;
    pub const DISPOSED: u32 = 1 << 6;
    pub const REGISTERED: u32 = 1 << 7;
}

/// Largest ivar alignment the object layout supports.
pub(crate) const MAX_IVAR_ALIGN: usize = 16;

/// Runtime-unique class record id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassId(u32);

impl ClassId {
    /// Raw id value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Resolution state of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClassState {
    /// Created through the API and not registered yet.
    Constructing = 0,
    /// In the name table, superclass not linked yet.
    RegisteredUnresolved = 1,
    /// Linked, sized and ready to receive messages.
    Resolved = 2,
}

impl ClassState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => ClassState::Constructing,
            1 => ClassState::RegisteredUnresolved,
            _ => ClassState::Resolved,
        }
    }
}

/// One-time initialization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InitState {
    Idle,
    Running(ThreadId),
    Done,
}

/// An instance variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ivar {
    /// Variable name.
    pub name: String,
    /// Size in bytes.
    pub size: usize,
    /// Alignment in bytes (power of two, at most 16).
    pub align: usize,
    /// Byte offset inside instance storage; valid once the class resolved.
    pub offset: usize,
}

#[derive(Clone, Copy)]
struct MethodState {
    imp: Imp,
    version: u64,
}

/// A method: selector, current implementation and replacement version.
pub struct Method {
    selector: Sel,
    state: RwLock<MethodState>,
    module: Option<ModuleId>,
}

impl Method {
    pub(crate) fn new(selector: Sel, imp: Imp, module: Option<ModuleId>) -> Self {
        Self {
            selector,
            state: RwLock::new(MethodState { imp, version: 0 }),
            module,
        }
    }

    /// The selector this method answers.
    #[must_use]
    pub fn selector(&self) -> Sel {
        self.selector
    }

    /// Current implementation.
    #[must_use]
    pub fn imp(&self) -> Imp {
        read(&self.state).imp
    }

    /// Number of times the implementation has been replaced.
    #[must_use]
    pub fn version(&self) -> u64 {
        read(&self.state).version
    }

    pub(crate) fn snapshot(&self) -> (Imp, u64) {
        let state = *read(&self.state);
        (state.imp, state.version)
    }

    /// Swaps the implementation and bumps the version. Returns the old one.
    pub(crate) fn replace(&self, imp: Imp) -> Imp {
        let mut state = write(&self.state);
        let old = state.imp;
        state.imp = imp;
        state.version += 1;
        old
    }

    pub(crate) fn module(&self) -> Option<ModuleId> {
        self.module
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("selector", &self.selector)
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

/// Where a method list came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ListSource {
    Class,
    Category(Box<str>),
}

pub(crate) struct MethodList {
    pub(crate) source: ListSource,
    pub(crate) methods: Vec<Arc<Method>>,
}

/// A class record. Lives in the runtime arena.
pub(crate) struct ClassInner {
    id: ClassId,
    name: Box<str>,
    flags: AtomicU32,
    state: AtomicU8,
    superclass: OnceLock<Class>,
    /// Superclass named by module metadata, linked at resolution.
    superclass_name: Option<Box<str>>,
    isa: OnceLock<Class>,
    /// For metaclasses: the class they describe.
    instance_class: OnceLock<Class>,
    pub(crate) subclasses: RwLock<Vec<Class>>,
    pub(crate) dtable: ArcSwap<DispatchTable>,
    /// Newest first; the class body list is last.
    pub(crate) method_lists: RwLock<Vec<MethodList>>,
    pub(crate) protocols: RwLock<Vec<Protocol>>,
    ivars: RwLock<Vec<Ivar>>,
    instance_size: AtomicUsize,
    pub(crate) init: Mutex<InitState>,
    pub(crate) init_done: Condvar,
    pub(crate) substitution: RwLock<Option<SubstitutionHook>>,
    /// Class-level side table.
    pub(crate) extra: OnceLock<AssociationTable>,
    module: Option<ModuleId>,
}

/// Handle to a class or metaclass record.
///
/// Handles are plain pointers into the owning runtime's arena: they are
/// `Copy`, compare by identity, and must not be used after that runtime has
/// been dropped.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Class {
    ptr: NonNull<ClassInner>,
}

// SAFETY: ClassInner is only mutated through atomics, locks and OnceLocks;
// the record itself never moves while the runtime lives.
unsafe impl Send for Class {}
unsafe impl Sync for Class {}

impl Class {
    #[inline]
    pub(crate) fn inner<'a>(self) -> &'a ClassInner {
        // SAFETY: handles are only created by alloc_class_record and the
        // record lives until the runtime drops it, so the borrow may outlive
        // the handle it was read through.
        unsafe { self.ptr.as_ref() }
    }

    pub(crate) fn addr(self) -> usize {
        self.ptr.as_ptr().expose_provenance()
    }

    /// # Safety
    ///
    /// `addr` must come from [`Class::addr`] of a live record.
    pub(crate) unsafe fn from_addr(addr: usize) -> Self {
        // SAFETY: caller guarantees addr names a live record.
        unsafe {
            Class {
                ptr: NonNull::new_unchecked(std::ptr::with_exposed_provenance_mut(addr)),
            }
        }
    }

    /// # Safety
    ///
    /// Must be called once per record, with no handle used afterwards.
    pub(crate) unsafe fn drop_record(self) {
        // SAFETY: upheld by the caller.
        unsafe { std::ptr::drop_in_place(self.ptr.as_ptr()) }
    }

    /// Runtime-unique id of this record.
    #[must_use]
    pub fn id(&self) -> ClassId {
        self.inner().id
    }

    /// Class name. A metaclass has the name of its class.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner().name
    }

    /// Superclass, or `None` for a root class or an unlinked class.
    ///
    /// The root metaclass answers the root class.
    #[must_use]
    pub fn superclass(&self) -> Option<Class> {
        self.inner().superclass.get().copied()
    }

    /// The metaclass describing this class object.
    ///
    /// # Panics
    ///
    /// Panics for a metaclass whose chain has not been linked yet.
    #[must_use]
    pub fn metaclass(&self) -> Class {
        match self.inner().isa.get() {
            Some(meta) => *meta,
            None => fatal!("metaclass of unresolved class '{}' requested", self.name()),
        }
    }

    /// For a metaclass, the class it describes; otherwise `self`.
    #[must_use]
    pub fn instance_class(&self) -> Class {
        self.inner().instance_class.get().copied().unwrap_or(*self)
    }

    /// Returns true for metaclass records.
    #[must_use]
    pub fn is_metaclass(&self) -> bool {
        self.has_flag(flags::META)
    }

    /// Current resolution state.
    #[must_use]
    pub fn state(&self) -> ClassState {
        ClassState::from_u8(self.inner().state.load(Ordering::Acquire))
    }

    /// Returns true once the class is resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.has_flag(flags::RESOLVED)
    }

    /// Returns true once the class's initializer has run.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.has_flag(flags::INITIALIZED)
    }

    /// Returns true for classes built through [`Runtime::create_class`].
    #[must_use]
    pub fn is_user_created(&self) -> bool {
        self.has_flag(flags::USER_CREATED)
    }

    /// Returns true if retain/release are sent as messages.
    #[must_use]
    pub fn has_custom_refcounting(&self) -> bool {
        self.has_flag(flags::CUSTOM_RC)
    }

    /// Returns true after [`Runtime::dispose_class`] or module unload.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.has_flag(flags::DISPOSED)
    }

    /// Bytes of instance storage: the superclass's plus own ivars, padded.
    /// Frozen at resolution; zero before.
    #[must_use]
    pub fn instance_size(&self) -> usize {
        self.inner().instance_size.load(Ordering::Acquire)
    }

    /// Own instance variables, in declaration order.
    #[must_use]
    pub fn ivars(&self) -> Vec<Ivar> {
        read(&self.inner().ivars).clone()
    }

    /// Finds an ivar by name on this class or its superclasses.
    #[must_use]
    pub fn ivar(&self, name: &str) -> Option<Ivar> {
        let mut current = Some(*self);
        while let Some(class) = current {
            if let Some(ivar) = read(&class.inner().ivars).iter().find(|i| i.name == name) {
                return Some(ivar.clone());
            }
            current = class.superclass();
        }
        None
    }

    /// Direct subclasses. For the root class this includes the root
    /// metaclass.
    #[must_use]
    pub fn subclasses(&self) -> Vec<Class> {
        read(&self.inner().subclasses).clone()
    }

    /// Protocols adopted directly by this class.
    #[must_use]
    pub fn protocols(&self) -> Vec<Protocol> {
        read(&self.inner().protocols).clone()
    }

    /// Returns true if `self` is `other` or inherits from it.
    #[must_use]
    pub fn is_subclass_of(&self, other: Class) -> bool {
        let mut current = Some(*self);
        while let Some(class) = current {
            if class == other {
                return true;
            }
            current = class.superclass();
        }
        false
    }

    #[inline]
    pub(crate) fn has_flag(&self, flag: u32) -> bool {
        self.inner().flags.load(Ordering::Acquire) & flag != 0
    }

    /// Sets `flag`, returning true if it was clear before.
    pub(crate) fn set_flag(&self, flag: u32) -> bool {
        self.inner().flags.fetch_or(flag, Ordering::AcqRel) & flag == 0
    }

    pub(crate) fn module(&self) -> Option<ModuleId> {
        self.inner().module
    }

    fn set_state(&self, state: ClassState) {
        self.inner().state.store(state as u8, Ordering::Release);
    }

    /// First own method for `sel`, newest list first.
    pub(crate) fn own_method(&self, sel: Sel) -> Option<Arc<Method>> {
        read(&self.inner().method_lists)
            .iter()
            .flat_map(|list| list.methods.iter())
            .find(|m| m.selector() == sel)
            .cloned()
    }

    /// Own methods in list order (newest list first).
    pub(crate) fn own_methods(&self) -> Vec<Arc<Method>> {
        read(&self.inner().method_lists)
            .iter()
            .flat_map(|list| list.methods.iter().cloned())
            .collect()
    }

    /// Appends `method` to the class body list.
    pub(crate) fn push_method(&self, method: Arc<Method>) {
        let mut lists = write(&self.inner().method_lists);
        match lists.last_mut() {
            Some(list) if list.source == ListSource::Class => list.methods.push(method),
            _ => lists.push(MethodList {
                source: ListSource::Class,
                methods: vec![method],
            }),
        }
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_metaclass() {
            write!(f, "Class(meta {})", self.name())
        } else {
            write!(f, "Class({})", self.name())
        }
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The name table and the resolution worklists.
#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) by_name: FxHashMap<Box<str>, Class>,
    /// Registered classes in registration order.
    pub(crate) classes: Vec<Class>,
    /// Registered but not yet resolved, in registration order.
    pub(crate) pending: Vec<Class>,
    pub(crate) pending_categories: Vec<PendingCategory>,
    pub(crate) protocols: FxHashMap<Box<str>, Protocol>,
}

/// How a new class pair finds its superclass.
pub(crate) enum Parent<'a> {
    Root,
    Class(Class),
    Named(&'a str),
}

enum LinkStatus {
    Ready(Option<Class>),
    Waiting,
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

impl Runtime {
    fn alloc_class_record(
        &self,
        name: &str,
        superclass_name: Option<&str>,
        initial_flags: u32,
        module: Option<ModuleId>,
    ) -> Class {
        let id = ClassId(self.next_class_id.fetch_add(1, Ordering::Relaxed));
        let inner = ClassInner {
            id,
            name: name.into(),
            flags: AtomicU32::new(initial_flags),
            state: AtomicU8::new(ClassState::Constructing as u8),
            superclass: OnceLock::new(),
            superclass_name: superclass_name.map(Into::into),
            isa: OnceLock::new(),
            instance_class: OnceLock::new(),
            subclasses: RwLock::new(Vec::new()),
            dtable: ArcSwap::new(uninstalled_table()),
            method_lists: RwLock::new(vec![MethodList {
                source: ListSource::Class,
                methods: Vec::new(),
            }]),
            protocols: RwLock::new(Vec::new()),
            ivars: RwLock::new(Vec::new()),
            instance_size: AtomicUsize::new(0),
            init: Mutex::new(InitState::Idle),
            init_done: Condvar::new(),
            substitution: RwLock::new(None),
            extra: OnceLock::new(),
            module,
        };
        let class = Class {
            ptr: NonNull::from(self.arena.alloc(inner)),
        };
        lock(&self.records).push(class);
        class
    }

    /// Allocates a class/metaclass pair. Links what is already known.
    pub(crate) fn new_class_pair(
        &self,
        name: &str,
        parent: Parent<'_>,
        extra_flags: u32,
        module: Option<ModuleId>,
    ) -> Class {
        let superclass_name = match parent {
            Parent::Named(n) => Some(n),
            _ => None,
        };
        let class = self.alloc_class_record(name, superclass_name, extra_flags, module);
        let meta = self.alloc_class_record(name, None, extra_flags | flags::META, module);
        let _ = class.inner().isa.set(meta);
        let _ = meta.inner().instance_class.set(class);

        match parent {
            Parent::Root => {
                let _ = meta.inner().superclass.set(class);
                let _ = meta.inner().isa.set(meta);
            }
            Parent::Class(sup) => {
                let sup_meta = sup.metaclass();
                let _ = class.inner().superclass.set(sup);
                let _ = meta.inner().superclass.set(sup_meta);
                let _ = meta.inner().isa.set(sup_meta.metaclass());
            }
            Parent::Named(_) => {}
        }
        class
    }

    /// Creates a new class pair in the `Constructing` state.
    ///
    /// `superclass` of `None` creates a root class.
    ///
    /// # Returns
    ///
    /// `None` if `superclass` is not resolved, is a metaclass, or a class
    /// named `name` is already registered.
    pub fn create_class(&self, superclass: Option<Class>, name: &str) -> Option<Class> {
        let reg = read(&self.registry);
        if reg.by_name.contains_key(name) {
            return None;
        }
        let parent = match superclass {
            None => Parent::Root,
            Some(sup) if sup.is_resolved() && !sup.is_metaclass() && !sup.is_disposed() => {
                Parent::Class(sup)
            }
            Some(_) => return None,
        };
        drop(reg);

        let class = self.new_class_pair(name, parent, flags::USER_CREATED, None);
        trace!("created class '{name}'");
        Some(class)
    }

    /// Adds an instance variable to a class under construction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIvar`] for a duplicate name, a zero or
    /// non-power-of-two alignment, or an alignment above 16.
    ///
    /// # Panics
    ///
    /// Panics if the class is not `Constructing`.
    pub fn add_ivar(&self, class: Class, name: &str, size: usize, align: usize) -> Result<()> {
        if class.is_metaclass() || class.state() != ClassState::Constructing {
            fatal!("add_ivar('{name}') on class '{}' outside construction", class.name());
        }
        let reject = |reason: &str| Error::InvalidIvar {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        if !align.is_power_of_two() || align > MAX_IVAR_ALIGN {
            return Err(reject("alignment must be a power of two no larger than 16"));
        }
        if class.ivar(name).is_some() {
            return Err(reject("name already used in this class or a superclass"));
        }

        write(&class.inner().ivars).push(Ivar {
            name: name.to_string(),
            size,
            align,
            offset: 0,
        });
        Ok(())
    }

    /// Marks a class under construction as using message-based reference
    /// counting. Subclasses inherit the flag at resolution.
    ///
    /// # Panics
    ///
    /// Panics if the class is not `Constructing`.
    pub fn set_custom_refcounting(&self, class: Class) {
        if class.state() != ClassState::Constructing {
            fatal!("set_custom_refcounting on class '{}' outside construction", class.name());
        }
        class.set_flag(flags::CUSTOM_RC);
        class.metaclass().set_flag(flags::CUSTOM_RC);
    }

    /// Registers a class built with [`create_class`](Self::create_class)
    /// and resolves it.
    ///
    /// Returns false (with a warning) if another class with the same name is
    /// already registered; the first registration wins.
    pub fn register_class(&self, class: Class) -> bool {
        let resolved = {
            let mut reg = write(&self.registry);
            if class.state() != ClassState::Constructing || class.is_disposed() {
                warn!("class '{}' is already registered", class.name());
                return false;
            }
            if !self.enter_name_table(&mut reg, class) {
                return false;
            }
            self.settle(&mut reg)
        };
        self.run_loads(&resolved);
        true
    }

    /// Puts `class` in the name table and the pending list.
    pub(crate) fn enter_name_table(&self, reg: &mut Registry, class: Class) -> bool {
        if reg.by_name.contains_key(class.name()) {
            warn!("duplicate class name '{}' ignored; keeping the first registration", class.name());
            return false;
        }
        reg.by_name.insert(class.name().into(), class);
        reg.classes.push(class);
        reg.pending.push(class);
        class.set_flag(flags::REGISTERED);
        class.set_state(ClassState::RegisteredUnresolved);
        debug!("registered class '{}'", class.name());
        true
    }

    /// Resolves what can be resolved, then retries buffered categories.
    /// Returns the newly resolved classes, superclasses first.
    pub(crate) fn settle(&self, reg: &mut Registry) -> Vec<Class> {
        let resolved = self.resolve_pending(reg);
        self.retry_pending_categories(reg);
        resolved
    }

    /// Resolves `class` if its superclass chain is available.
    ///
    /// Idempotent. Returns whether the class is resolved afterwards.
    ///
    /// # Panics
    ///
    /// Panics on a cyclic superclass chain.
    pub fn resolve_class(&self, class: Class) -> bool {
        if class.is_resolved() {
            return true;
        }
        let resolved = {
            let mut reg = write(&self.registry);
            self.settle(&mut reg)
        };
        self.run_loads(&resolved);
        class.is_resolved()
    }

    /// Fixpoint over the pending list.
    fn resolve_pending(&self, reg: &mut Registry) -> Vec<Class> {
        let mut resolved = Vec::new();
        loop {
            let mut progress = false;
            let mut i = 0;
            while i < reg.pending.len() {
                let class = reg.pending[i];
                match Self::link_status(reg, class) {
                    LinkStatus::Ready(sup) => {
                        reg.pending.remove(i);
                        Self::link(class, sup);
                        resolved.push(class);
                        progress = true;
                    }
                    LinkStatus::Waiting => i += 1,
                }
            }
            if !progress {
                break;
            }
        }
        resolved
    }

    fn link_status(reg: &Registry, class: Class) -> LinkStatus {
        if let Some(sup) = class.superclass() {
            return if sup.is_resolved() {
                LinkStatus::Ready(Some(sup))
            } else {
                LinkStatus::Waiting
            };
        }
        let Some(name) = class.inner().superclass_name.as_deref() else {
            return LinkStatus::Ready(None);
        };
        let Some(&sup) = reg.by_name.get(name) else {
            return LinkStatus::Waiting;
        };
        if sup.is_resolved() {
            return LinkStatus::Ready(Some(sup));
        }

        // Walk the unresolved chain above; meeting `class` again is a cycle.
        let mut current = sup;
        for _ in 0..=reg.by_name.len() {
            if current == class {
                fatal!("cyclic superclass chain through class '{}'", class.name());
            }
            let next = current
                .superclass()
                .or_else(|| {
                    current
                        .inner()
                        .superclass_name
                        .as_deref()
                        .and_then(|n| reg.by_name.get(n).copied())
                });
            match next {
                Some(next) if !next.is_resolved() => current = next,
                _ => return LinkStatus::Waiting,
            }
        }
        fatal!("malformed superclass chain above class '{}'", class.name());
    }

    fn link(class: Class, sup: Option<Class>) {
        let meta = class.metaclass();
        match sup {
            Some(sup) => {
                let sup_meta = sup.metaclass();
                let _ = class.inner().superclass.set(sup);
                let _ = meta.inner().superclass.set(sup_meta);
                let _ = meta.inner().isa.set(sup_meta.metaclass());
                write(&sup.inner().subclasses).push(class);
                write(&sup_meta.inner().subclasses).push(meta);
                if sup.has_custom_refcounting() {
                    class.set_flag(flags::CUSTOM_RC);
                    meta.set_flag(flags::CUSTOM_RC);
                }
            }
            None => {
                let _ = meta.inner().superclass.set(class);
                let _ = meta.inner().isa.set(meta);
                write(&class.inner().subclasses).push(meta);
            }
        }

        let mut size = sup.map_or(0, |s| s.instance_size());
        for ivar in write(&class.inner().ivars).iter_mut() {
            ivar.offset = align_up(size, ivar.align);
            size = ivar.offset + ivar.size;
        }
        class.inner().instance_size.store(size, Ordering::Release);

        class.set_state(ClassState::Resolved);
        meta.set_state(ClassState::Resolved);
        class.set_flag(flags::RESOLVED);
        meta.set_flag(flags::RESOLVED);
        debug!(
            "resolved class '{}' (superclass {}, instance size {size})",
            class.name(),
            sup.as_ref().map_or("none", Class::name)
        );
    }

    /// Sends each class its own `load` method once, in order.
    pub(crate) fn run_loads(&self, classes: &[Class]) {
        for &class in classes {
            if !class.set_flag(flags::LOADED) {
                continue;
            }
            if let Some(method) = class.metaclass().own_method(self.sels.load) {
                trace!("+[{} load]", class.name());
                (method.imp())(self, Id::from_class(class), self.sels.load, &[]);
            }
        }
    }

    /// Looks up a registered class by name.
    #[must_use]
    pub fn lookup_class(&self, name: &str) -> Option<Class> {
        read(&self.registry).by_name.get(name).copied()
    }

    /// Unregisters a class created through the runtime API and drops its
    /// methods. The record itself is reclaimed when the runtime is dropped.
    ///
    /// # Errors
    ///
    /// - [`Error::NotUserCreated`] for module-loaded classes
    /// - [`Error::ClassHasSubclasses`] while any subclass exists
    pub fn dispose_class(&self, class: Class) -> Result<()> {
        let class = class.instance_class();
        if !class.is_user_created() {
            return Err(Error::NotUserCreated {
                name: class.name().to_string(),
            });
        }
        let meta = class.metaclass();

        let mut reg = write(&self.registry);
        if class.is_disposed() {
            return Ok(());
        }
        if class.subclasses().iter().any(|&sub| sub != meta) {
            return Err(Error::ClassHasSubclasses {
                name: class.name().to_string(),
            });
        }
        self.unregister_locked(&mut reg, class);
        debug!("disposed class '{}'", class.name());
        Ok(())
    }

    /// Removes `class` from every registry structure and empties it.
    pub(crate) fn unregister_locked(&self, reg: &mut Registry, class: Class) {
        let meta = class.metaclass();
        if reg.by_name.get(class.name()) == Some(&class) {
            reg.by_name.remove(class.name());
        }
        reg.classes.retain(|&c| c != class);
        reg.pending.retain(|&c| c != class);

        if let Some(sup) = class.superclass() {
            write(&sup.inner().subclasses).retain(|&c| c != class);
            write(&sup.metaclass().inner().subclasses).retain(|&c| c != meta);
        }

        let mut lookaside = write(&self.lookaside);
        for record in [class, meta] {
            record.set_flag(flags::DISPOSED);
            write(&record.inner().method_lists).clear();
            record.inner().dtable.store(uninstalled_table());
            lookaside.remove(&record);
        }
    }

    /// Installs `class` as the class of tagged identities with `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTaggedIndex`] if `index` is out of range or
    /// the slot is taken.
    pub fn register_tagged_class(&self, index: u8, class: Class) -> Result<()> {
        let slot = self
            .tagged
            .get(usize::from(index))
            .ok_or(Error::InvalidTaggedIndex { index })?;
        slot.set(class.instance_class())
            .map_err(|_| Error::InvalidTaggedIndex { index })
    }

    /// Class registered for tagged identities with `index`.
    #[must_use]
    pub fn tagged_class(&self, index: u8) -> Option<Class> {
        self.tagged.get(usize::from(index))?.get().copied()
    }
}

const _: () = assert!(TAGGED_CLASS_SLOTS == 8);
