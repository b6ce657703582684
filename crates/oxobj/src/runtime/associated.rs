//! Side-table storage attached to objects and classes.
//!
//! Any receiver can carry key/value associations without changing its
//! layout. Each association remembers the [`AssociationPolicy`] it was stored
//! with; replacing or removing the value releases it according to that
//! policy, and deallocating the owner releases every remaining value.
//!
//! # Storage
//!
//! - class objects keep their table in the class record's extra slot
//! - every other receiver gets an out-of-line table in an address-sharded
//!   map: the shard lock guards "has a table yet", the table's own lock
//!   guards its entries
//!
//! Tables are fixed-capacity buckets chained through an overflow pointer.
//! Values are never released, and never retained through a message, while a
//! lock is held.

use std::pin::Pin;
use std::sync::{Arc, RwLock};

use fxhash::FxHashMap;

use crate::runtime::object::Id;
use crate::runtime::weak::WeakSlot;
use crate::runtime::{Runtime, read, write};

const BUCKET_CAPACITY: usize = 8;
const SHARD_COUNT: usize = 16;

/// Key of an association. Usually the address of a `static`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssociationKey(usize);

impl AssociationKey {
    #[must_use]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// A key unique to the given static item.
    #[must_use]
    pub fn from_static<T>(item: &'static T) -> Self {
        Self(std::ptr::from_ref(item).addr())
    }
}

/// Ownership rule of an associated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationPolicy {
    /// Unowned; the caller keeps the value alive.
    Assign,
    /// Retained while stored.
    Retain,
    /// Sent `copy`; the copy is owned while stored.
    Copy,
    /// As `Retain`; reads return a retained and autoreleased value.
    RetainAtomic,
    /// As `Copy`; reads return a retained and autoreleased value.
    CopyAtomic,
    /// Zeroing weak reference.
    Weak,
}

impl AssociationPolicy {
    const fn is_atomic(self) -> bool {
        matches!(self, Self::RetainAtomic | Self::CopyAtomic)
    }
}

enum Stored {
    Unowned(Id),
    Strong(Id),
    Weak(Pin<Box<WeakSlot>>),
}

struct Entry {
    key: AssociationKey,
    policy: AssociationPolicy,
    value: Stored,
}

#[derive(Default)]
struct Bucket {
    entries: Vec<Entry>,
    overflow: Option<Box<Bucket>>,
}

impl Bucket {
    fn find(&self, key: AssociationKey) -> Option<&Entry> {
        let mut bucket = Some(self);
        while let Some(b) = bucket {
            if let Some(entry) = b.entries.iter().find(|e| e.key == key) {
                return Some(entry);
            }
            bucket = b.overflow.as_deref();
        }
        None
    }

    /// Inserts or replaces; returns the replaced entry.
    fn put(&mut self, entry: Entry) -> Option<Entry> {
        let mut bucket = self;
        loop {
            if let Some(slot) = bucket.entries.iter_mut().find(|e| e.key == entry.key) {
                return Some(std::mem::replace(slot, entry));
            }
            if bucket.overflow.is_none() && bucket.entries.len() < BUCKET_CAPACITY {
                bucket.entries.push(entry);
                return None;
            }
            bucket = bucket.overflow.get_or_insert_with(|| {
                Box::new(Bucket {
                    entries: Vec::with_capacity(BUCKET_CAPACITY),
                    overflow: None,
                })
            });
        }
    }

    fn remove(&mut self, key: AssociationKey) -> Option<Entry> {
        let mut bucket = Some(self);
        while let Some(b) = bucket {
            if let Some(pos) = b.entries.iter().position(|e| e.key == key) {
                return Some(b.entries.swap_remove(pos));
            }
            bucket = b.overflow.as_deref_mut();
        }
        None
    }

    fn drain(&mut self) -> Vec<Entry> {
        let mut out = std::mem::take(&mut self.entries);
        let mut next = self.overflow.take();
        while let Some(mut b) = next {
            out.append(&mut b.entries);
            next = b.overflow.take();
        }
        out
    }

    fn len(&self) -> usize {
        self.entries.len() + self.overflow.as_ref().map_or(0, |b| b.len())
    }
}

/// One receiver's associations.
#[derive(Default)]
pub(crate) struct AssociationTable {
    buckets: RwLock<Bucket>,
}

/// Receiver identity to association table, for everything but classes.
pub(crate) struct AssociationMap {
    shards: [RwLock<FxHashMap<Id, Arc<AssociationTable>>>; SHARD_COUNT],
}

impl Default for AssociationMap {
    fn default() -> Self {
        Self {
            shards: std::array::from_fn(|_| RwLock::new(FxHashMap::default())),
        }
    }
}

impl AssociationMap {
    fn shard(&self, object: Id) -> &RwLock<FxHashMap<Id, Arc<AssociationTable>>> {
        &self.shards[(object.as_usize() >> 4) % SHARD_COUNT]
    }
}

enum TableRef<'a> {
    Class(&'a AssociationTable),
    Object(Arc<AssociationTable>),
}

impl std::ops::Deref for TableRef<'_> {
    type Target = AssociationTable;

    fn deref(&self) -> &AssociationTable {
        match self {
            TableRef::Class(table) => table,
            TableRef::Object(table) => table,
        }
    }
}

impl Runtime {
    fn association_table(&self, object: Id, create: bool) -> Option<TableRef<'_>> {
        if let Some(class) = object.as_class() {
            let extra = &class.inner().extra;
            return if create {
                Some(TableRef::Class(extra.get_or_init(AssociationTable::default)))
            } else {
                extra.get().map(TableRef::Class)
            };
        }

        let shard = self.associations.shard(object);
        if let Some(table) = read(shard).get(&object) {
            return Some(TableRef::Object(Arc::clone(table)));
        }
        if !create {
            return None;
        }
        let mut map = write(shard);
        Some(TableRef::Object(Arc::clone(map.entry(object).or_default())))
    }

    /// Associates `value` with `object` under `key`.
    ///
    /// A nil `value` removes the association. The previous value is released
    /// according to the policy it was stored with. Copy policies send `copy`
    /// to `value` and own the result.
    pub fn set_associated(&self, object: Id, key: AssociationKey, value: Id, policy: AssociationPolicy) {
        if object.is_nil() {
            return;
        }
        let old = if value.is_nil() {
            self.association_table(object, false)
                .and_then(|table| write(&table.buckets).remove(key))
        } else {
            let stored = self.make_stored(value, policy);
            let table = self.association_table(object, true);
            table.and_then(|table| {
                write(&table.buckets).put(Entry {
                    key,
                    policy,
                    value: stored,
                })
            })
        };
        if let Some(old) = old {
            self.release_entry(old);
        }
    }

    fn make_stored(&self, value: Id, policy: AssociationPolicy) -> Stored {
        match policy {
            AssociationPolicy::Assign => Stored::Unowned(value),
            AssociationPolicy::Retain | AssociationPolicy::RetainAtomic => {
                Stored::Strong(self.retain(value))
            }
            AssociationPolicy::Copy | AssociationPolicy::CopyAtomic => {
                // SAFETY: `copy` returns an owned object identity.
                Stored::Strong(unsafe { Id::from_raw(self.send(value, self.sels.copy, &[])) })
            }
            AssociationPolicy::Weak => {
                let slot = Box::pin(WeakSlot::new());
                self.store_weak(slot.as_ref(), value);
                Stored::Weak(slot)
            }
        }
    }

    fn release_entry(&self, entry: Entry) {
        match entry.value {
            Stored::Unowned(_) => {}
            Stored::Strong(id) => self.release(id),
            Stored::Weak(slot) => self.destroy_weak(slot.as_ref()),
        }
    }

    /// Value associated with `object` under `key`, or nil.
    ///
    /// Atomic policies and weak associations return a value retained and
    /// autoreleased into the current pool.
    #[must_use]
    pub fn get_associated(&self, object: Id, key: AssociationKey) -> Id {
        let Some(table) = self.association_table(object, false) else {
            return Id::NIL;
        };
        // Only built-in counting happens under the guard; messages to user
        // `retain`/`autorelease` wait until it drops.
        let (id, owned) = {
            let buckets = read(&table.buckets);
            match buckets.find(key) {
                None => (Id::NIL, false),
                Some(entry) => match &entry.value {
                    Stored::Unowned(id) => (*id, false),
                    Stored::Strong(id) if entry.policy.is_atomic() => {
                        (*id, self.try_root_retain(*id))
                    }
                    Stored::Strong(id) => (*id, false),
                    Stored::Weak(slot) => match self.load_weak_object(slot.as_ref()) {
                        Some(obj) => (obj.into_raw(), true),
                        None => (Id::NIL, false),
                    },
                },
            }
        };
        if !owned {
            return id;
        }
        if self.object_class(id).is_some_and(|class| class.has_custom_refcounting()) {
            // Trade the built-in owner for one the class counts itself.
            let retained = self.retain(id);
            self.root_release(id);
            return self.autorelease(retained);
        }
        self.autorelease(id)
    }

    /// Number of associations on `object`.
    #[must_use]
    pub fn association_count(&self, object: Id) -> usize {
        self.association_table(object, false)
            .map_or(0, |table| read(&table.buckets).len())
    }

    /// Removes and releases every association of `object`.
    pub fn remove_all_associations(&self, object: Id) {
        let entries = if let Some(class) = object.as_class() {
            match class.inner().extra.get() {
                Some(table) => write(&table.buckets).drain(),
                None => return,
            }
        } else {
            let shard = self.associations.shard(object);
            if !read(shard).contains_key(&object) {
                return;
            }
            let Some(table) = write(shard).remove(&object) else {
                return;
            };
            let entries = write(&table.buckets).drain();
            entries
        };
        for entry in entries {
            self.release_entry(entry);
        }
    }
}
