//! Zeroing weak references.
//!
//! A [`WeakSlot`] is storage for one weak reference. Slots are registered in
//! the runtime's weak table, keyed by their address, so they must stay put
//! while registered: every operation takes a `Pin<&WeakSlot>`. When the
//! referent starts deallocating, every slot pointing at it is set to nil
//! before `dealloc` runs.
//!
//! # Thread Safety
//!
//! The table is one read/write lock. Loading a weak reference takes the read
//! lock and retains the referent only if it is not deallocating; zeroing takes
//! the write lock, so a load either wins a reference or sees nil.

use std::marker::PhantomPinned;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{OnceLock, RwLock, Weak};

use fxhash::FxHashMap;

use crate::error::fatal;
use crate::runtime::object::{Id, Object};
use crate::runtime::{Runtime, read, write};

/// Storage for a weak object reference.
pub struct WeakSlot {
    value: AtomicUsize,
    owner: OnceLock<Weak<Runtime>>,
    _pin: PhantomPinned,
}

impl WeakSlot {
    /// An empty (nil) slot.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: AtomicUsize::new(0),
            owner: OnceLock::new(),
            _pin: PhantomPinned,
        }
    }

    fn addr(self: Pin<&Self>) -> usize {
        std::ptr::from_ref(self.get_ref()).expose_provenance()
    }

    fn raw(&self) -> Id {
        // SAFETY: slots only ever hold identities handed to store_weak.
        unsafe { Id::from_raw(self.value.load(Ordering::Acquire)) }
    }

    fn set_raw(&self, id: Id) {
        self.value.store(id.as_usize(), Ordering::Release);
    }

    fn bind(self: Pin<&Self>, rt: &Runtime) {
        let owner = self.owner.get_or_init(|| rt.weak_self().clone());
        if !Weak::ptr_eq(owner, rt.weak_self()) {
            fatal!("weak slot used with two runtimes");
        }
    }
}

impl Default for WeakSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WeakSlot {
    fn drop(&mut self) {
        let Some(rt) = self.owner.get().and_then(Weak::upgrade) else {
            return;
        };
        let addr = std::ptr::from_mut(self).expose_provenance();
        rt.weak_refs.unregister(addr);
    }
}

impl std::fmt::Debug for WeakSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WeakSlot").field(&self.raw()).finish()
    }
}

#[derive(Default)]
struct WeakEntries {
    by_slot: FxHashMap<usize, Id>,
    by_referent: FxHashMap<Id, Vec<usize>>,
}

impl WeakEntries {
    fn remove_slot(&mut self, addr: usize) {
        let Some(referent) = self.by_slot.remove(&addr) else {
            return;
        };
        if let Some(slots) = self.by_referent.get_mut(&referent) {
            slots.retain(|&a| a != addr);
            if slots.is_empty() {
                self.by_referent.remove(&referent);
            }
        }
    }
}

/// Slot address to referent, and back.
#[derive(Default)]
pub(crate) struct WeakTable {
    entries: RwLock<WeakEntries>,
}

impl WeakTable {
    fn unregister(&self, addr: usize) {
        write(&self.entries).remove_slot(addr);
    }
}

impl Runtime {
    /// Stores `value` into a weak slot and returns what was stored.
    ///
    /// Storing an object that is already deallocating stores nil. Immortal
    /// identities are stored without registration.
    pub fn store_weak(&self, slot: Pin<&WeakSlot>, value: Id) -> Id {
        slot.bind(self);
        let addr = slot.addr();
        let mut entries = write(&self.weak_refs.entries);
        entries.remove_slot(addr);

        if !value.is_heap() {
            slot.set_raw(value);
            return value;
        }
        if self.is_deallocating(value) {
            slot.set_raw(Id::NIL);
            return Id::NIL;
        }
        entries.by_slot.insert(addr, value);
        entries.by_referent.entry(value).or_default().push(addr);
        slot.set_raw(value);
        value
    }

    /// Loads a weak slot. A live referent is retained and autoreleased into
    /// the current pool; a deallocating or zeroed one reads as nil.
    pub fn load_weak(&self, slot: Pin<&WeakSlot>) -> Id {
        let id = self.load_weak_retained(slot);
        if id.is_heap() {
            self.root_autorelease(id);
        }
        id
    }

    /// Loads a weak slot into an owning handle, without touching the
    /// autorelease pool.
    #[must_use]
    pub fn load_weak_object(&self, slot: Pin<&WeakSlot>) -> Option<Object<'_>> {
        let id = self.load_weak_retained(slot);
        // SAFETY: load_weak_retained added the owner handed over here.
        (!id.is_nil()).then(|| unsafe { Object::from_raw(self, id) })
    }

    fn load_weak_retained(&self, slot: Pin<&WeakSlot>) -> Id {
        let _entries = read(&self.weak_refs.entries);
        let id = slot.raw();
        if !id.is_heap() || self.try_root_retain(id) {
            id
        } else {
            Id::NIL
        }
    }

    /// Clears a weak slot and removes its registration.
    pub fn destroy_weak(&self, slot: Pin<&WeakSlot>) {
        let mut entries = write(&self.weak_refs.entries);
        entries.remove_slot(slot.addr());
        slot.set_raw(Id::NIL);
    }

    /// Zeroes every weak slot pointing at `id`. Called during deallocation.
    pub fn delete_weak_refs(&self, id: Id) {
        let mut entries = write(&self.weak_refs.entries);
        let Some(slots) = entries.by_referent.remove(&id) else {
            return;
        };
        for addr in slots {
            entries.by_slot.remove(&addr);
            // SAFETY: registered slots are pinned and unregister themselves
            // on drop under this lock, so addr names a live slot.
            let slot = unsafe { &*std::ptr::with_exposed_provenance::<WeakSlot>(addr) };
            slot.set_raw(Id::NIL);
        }
    }

    /// Number of weak slots currently pointing at `id`.
    #[must_use]
    pub fn weak_ref_count(&self, id: Id) -> usize {
        read(&self.weak_refs.entries)
            .by_referent
            .get(&id)
            .map_or(0, Vec::len)
    }
}
