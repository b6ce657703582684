//! Object identities, allocation and reference counting.
//!
//! # Identities
//!
//! An [`Id`] is a machine word naming a receiver:
//!
//! | bits            | meaning                                          |
//! |-----------------|--------------------------------------------------|
//! | `0`             | nil                                              |
//! | `...xxx1`       | tagged immortal value: index in bits 1..4,       |
//! |                 | payload above bit 4                              |
//! | `...010`        | class object (address of the class record)       |
//! | `...0000`       | heap object (address of its header)              |
//!
//! Tagged values and class objects are immortal: retain and release ignore
//! them. The class of a tagged value comes from the runtime's tagged-class
//! table.
//!
//! # Heap objects
//!
//! A heap object is a 16-byte header (class handle and a signed atomic
//! reference count) followed by zeroed ivar storage. The count is the number
//! of extra owners: zero means one owner, negative means deallocating.
//! Classes with custom reference counting receive `retain`, `release` and
//! `autorelease` as ordinary messages.
//!
//! # Deallocation
//!
//! When the last owner releases: weak references are zeroed, the object is
//! sent `dealloc` if its class implements it, its side-table entries are
//! released, then its memory is freed.

use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicIsize, Ordering, fence};

use oxobj_log::trace;

use crate::error::{Error, Result, fatal};
use crate::runtime::class::Class;
use crate::runtime::selector::Sel;
use crate::runtime::{Runtime, TAGGED_CLASS_SLOTS};

const TAG_BIT: usize = 0b1;
const CLASS_TAG: usize = 0b010;
const LOW_MASK: usize = 0b1111;
const TAGGED_INDEX_SHIFT: usize = 1;
const TAGGED_PAYLOAD_SHIFT: usize = 4;

/// Largest payload a tagged identity can carry.
pub const MAX_TAGGED_PAYLOAD: usize = usize::MAX >> TAGGED_PAYLOAD_SHIFT;

/// A nullable object identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct Id(usize);

impl Id {
    /// The nil identity.
    pub const NIL: Id = Id(0);

    /// Reinterprets a word produced by [`Id::as_usize`] (for example a
    /// message return value).
    ///
    /// # Safety
    ///
    /// `raw` must be nil, a tagged value, or an identity handed out by a
    /// runtime that is still alive.
    #[must_use]
    pub const unsafe fn from_raw(raw: usize) -> Id {
        Id(raw)
    }

    /// The raw word, suitable as a message argument.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Builds a tagged immortal identity.
    ///
    /// Returns `None` if `index` is not below 8 or `payload` exceeds
    /// [`MAX_TAGGED_PAYLOAD`].
    #[must_use]
    pub const fn tagged(index: u8, payload: usize) -> Option<Id> {
        if index as usize >= TAGGED_CLASS_SLOTS || payload > MAX_TAGGED_PAYLOAD {
            return None;
        }
        Some(Id(
            (payload << TAGGED_PAYLOAD_SHIFT) | ((index as usize) << TAGGED_INDEX_SHIFT) | TAG_BIT,
        ))
    }

    /// The class object of `class`.
    #[must_use]
    pub fn from_class(class: Class) -> Id {
        Id(class.addr() | CLASS_TAG)
    }

    #[must_use]
    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn is_tagged(self) -> bool {
        self.0 & TAG_BIT != 0
    }

    /// Returns true for class-object identities.
    #[must_use]
    pub const fn is_class_object(self) -> bool {
        self.0 & 0b111 == CLASS_TAG
    }

    /// Tagged values and class objects ignore reference counting.
    #[must_use]
    pub const fn is_immortal(self) -> bool {
        self.is_tagged() || self.is_class_object()
    }

    /// Tagged-class index of a tagged identity.
    #[must_use]
    pub const fn tagged_index(self) -> Option<u8> {
        if self.is_tagged() {
            Some(((self.0 >> TAGGED_INDEX_SHIFT) & 0b111) as u8)
        } else {
            None
        }
    }

    /// Payload of a tagged identity.
    #[must_use]
    pub const fn tagged_payload(self) -> Option<usize> {
        if self.is_tagged() {
            Some(self.0 >> TAGGED_PAYLOAD_SHIFT)
        } else {
            None
        }
    }

    /// The class a class-object identity names.
    #[must_use]
    pub fn as_class(self) -> Option<Class> {
        if self.is_class_object() {
            // SAFETY: class-object identities are only built by from_class
            // (or from_raw, whose caller vouches for them).
            Some(unsafe { Class::from_addr(self.0 & !CLASS_TAG) })
        } else {
            None
        }
    }

    pub(crate) fn is_heap(self) -> bool {
        self.0 != 0 && self.0 & LOW_MASK == 0
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            f.write_str("nil")
        } else if let (Some(index), Some(payload)) = (self.tagged_index(), self.tagged_payload()) {
            write!(f, "Id(tagged {index}:{payload})")
        } else if let Some(class) = self.as_class() {
            write!(f, "Id(class {})", class.name())
        } else {
            write!(f, "Id({:#x})", self.0)
        }
    }
}

#[repr(C, align(16))]
pub(crate) struct ObjectHeader {
    class: Class,
    refcount: AtomicIsize,
}

const HEADER_SIZE: usize = size_of::<ObjectHeader>();
const OBJECT_ALIGN: usize = align_of::<ObjectHeader>();

fn object_layout(instance_size: usize) -> Layout {
    match Layout::from_size_align(HEADER_SIZE + instance_size, OBJECT_ALIGN) {
        Ok(layout) => layout,
        Err(_) => fatal!("instance size {instance_size} is too large"),
    }
}

fn header<'a>(id: Id) -> Option<&'a ObjectHeader> {
    if !id.is_heap() {
        return None;
    }
    let ptr = std::ptr::with_exposed_provenance::<ObjectHeader>(id.0);
    // SAFETY: heap identities come from alloc and stay valid while their
    // holder owns a reference.
    Some(unsafe { &*ptr })
}

fn ivar_base(id: Id) -> *mut u8 {
    std::ptr::with_exposed_provenance_mut::<u8>(id.0).wrapping_add(HEADER_SIZE)
}

mod sealed {
    pub trait Sealed {}
}

/// Plain values that can be stored in instance variables.
pub trait IvarScalar: sealed::Sealed + Copy {}

macro_rules! ivar_scalars {
    ($($ty:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}
            impl IvarScalar for $ty {}
        )*
    };
}

ivar_scalars!(u8, i8, u16, i16, u32, i32, u64, i64, usize, isize, f32, f64, Id);

impl Runtime {
    /// Allocates a zeroed instance of `class` with one owner.
    ///
    /// Runs the class's initializer first if it has not run yet.
    ///
    /// # Panics
    ///
    /// Panics for metaclasses and for unresolved or disposed classes.
    pub fn alloc(&self, class: Class) -> Id {
        if class.is_metaclass() {
            fatal!("cannot allocate an instance of metaclass '{}'", class.name());
        }
        if class.is_disposed() {
            fatal!("cannot allocate an instance of disposed class '{}'", class.name());
        }
        self.ensure_initialized(class);

        let layout = object_layout(class.instance_size());
        // SAFETY: layout has a non-zero size (the header).
        let raw = unsafe { alloc_zeroed(layout) }.cast::<ObjectHeader>();
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };
        // SAFETY: freshly allocated, properly aligned for the header.
        unsafe {
            ptr.as_ptr().write(ObjectHeader {
                class,
                refcount: AtomicIsize::new(0),
            });
        }
        Id(ptr.as_ptr().expose_provenance())
    }

    /// Allocates an instance wrapped in an owning [`Object`] handle.
    pub fn new_object(&self, class: Class) -> Object<'_> {
        Object {
            rt: self,
            id: self.alloc(class),
            _not_send: PhantomData,
        }
    }

    /// Class of `id`: the metaclass for class objects, the tagged-class
    /// entry for tagged values, `None` for nil.
    #[must_use]
    pub fn object_class(&self, id: Id) -> Option<Class> {
        if id.is_nil() {
            None
        } else if let Some(index) = id.tagged_index() {
            self.tagged_class(index)
        } else if let Some(class) = id.as_class() {
            Some(class.metaclass())
        } else {
            header(id).map(|h| h.class)
        }
    }

    /// Adds an owner. Returns `id` (or whatever a custom `retain` returned).
    pub fn retain(&self, id: Id) -> Id {
        let Some(h) = header(id) else {
            return id;
        };
        if h.class.has_custom_refcounting() {
            return Id(self.send(id, self.sels.retain, &[]));
        }
        self.root_retain(id)
    }

    /// Built-in retain, bypassing custom reference counting.
    ///
    /// Ignored for immortal and deallocating objects.
    ///
    /// # Panics
    ///
    /// Panics if the count would overflow.
    pub fn root_retain(&self, id: Id) -> Id {
        self.try_root_retain(id);
        id
    }

    /// Retains a heap object unless it is deallocating. Returns whether an
    /// owner was added.
    pub(crate) fn try_root_retain(&self, id: Id) -> bool {
        let Some(h) = header(id) else {
            return false;
        };
        let mut current = h.refcount.load(Ordering::Relaxed);
        loop {
            if current < 0 {
                return false;
            }
            if current == isize::MAX {
                fatal!("Reference count overflow on {id:?} ({})", h.class.name());
            }
            match h.refcount.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns true while a heap object runs its deallocation.
    pub(crate) fn is_deallocating(&self, id: Id) -> bool {
        header(id).is_some_and(|h| h.refcount.load(Ordering::Acquire) < 0)
    }

    /// Drops an owner, deallocating the object when it was the last one.
    pub fn release(&self, id: Id) {
        let Some(h) = header(id) else {
            return;
        };
        if h.class.has_custom_refcounting() {
            self.send(id, self.sels.release, &[]);
            return;
        }
        self.root_release(id);
    }

    /// Built-in release, bypassing custom reference counting.
    ///
    /// # Panics
    ///
    /// Panics when called on an object that is already deallocating.
    pub fn root_release(&self, id: Id) {
        let Some(h) = header(id) else {
            return;
        };
        let old = h.refcount.fetch_sub(1, Ordering::Release);
        if old > 0 {
            return;
        }
        if old < 0 {
            fatal!("double release of {id:?} ({}) during deallocation", h.class.name());
        }
        fence(Ordering::Acquire);
        self.dispose_object(id, h.class);
    }

    fn dispose_object(&self, id: Id, class: Class) {
        trace!("deallocating {id:?} ({})", class.name());
        self.delete_weak_refs(id);
        if let Some(imp) = self.method_implementation(class, self.sels.dealloc) {
            imp(self, id, self.sels.dealloc, &[]);
        }
        self.remove_all_associations(id);

        let layout = object_layout(class.instance_size());
        // SAFETY: id names a live allocation made by alloc with this layout;
        // the count went negative so no other owner remains.
        unsafe {
            std::ptr::drop_in_place(std::ptr::with_exposed_provenance_mut::<ObjectHeader>(id.0));
            dealloc(std::ptr::with_exposed_provenance_mut::<u8>(id.0), layout);
        }
    }

    /// Hands one owner of `id` to the innermost autorelease pool of this
    /// thread, or releases it at once when no pool is in place. Returns `id`.
    pub fn autorelease(&self, id: Id) -> Id {
        let Some(h) = header(id) else {
            return id;
        };
        if h.class.has_custom_refcounting() {
            return Id(self.send(id, self.sels.autorelease, &[]));
        }
        self.root_autorelease(id)
    }

    /// Built-in autorelease, bypassing custom reference counting.
    pub fn root_autorelease(&self, id: Id) -> Id {
        if id.is_heap() {
            crate::runtime::pool::pool_add(self, id);
        }
        id
    }

    /// Number of owners. `usize::MAX` for immortal identities, zero for nil
    /// and deallocating objects.
    #[must_use]
    pub fn retain_count(&self, id: Id) -> usize {
        if id.is_immortal() {
            return usize::MAX;
        }
        header(id).map_or(0, |h| {
            usize::try_from(h.refcount.load(Ordering::Relaxed) + 1).unwrap_or(0)
        })
    }

    /// Reference-counting hook for block objects.
    pub fn retain_block(&self, block: Id) -> Id {
        self.retain(block)
    }

    /// Reference-counting hook for block objects.
    pub fn release_block(&self, block: Id) {
        self.release(block);
    }

    /// Byte offset of ivar `name` inside instance storage of `class`.
    #[must_use]
    pub fn ivar_offset(&self, class: Class, name: &str) -> Option<usize> {
        class.is_resolved().then(|| class.ivar(name)).flatten().map(|ivar| ivar.offset)
    }

    fn ivar_slot<T: IvarScalar>(&self, obj: Id, name: &str) -> Result<*mut T> {
        let invalid = |reason: &str| Error::InvalidIvar {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        let h = header(obj).ok_or_else(|| invalid("receiver has no instance storage"))?;
        let ivar = h.class.ivar(name).ok_or_else(|| invalid("no such ivar"))?;
        if ivar.size != size_of::<T>() || ivar.align < align_of::<T>() {
            return Err(invalid("value type does not match the ivar's size and alignment"));
        }
        Ok(ivar_base(obj).wrapping_add(ivar.offset).cast::<T>())
    }

    /// Reads an instance variable of a heap object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIvar`] if the object has no such ivar or `T`
    /// does not match its size and alignment.
    pub fn read_ivar<T: IvarScalar>(&self, obj: Id, name: &str) -> Result<T> {
        let slot = self.ivar_slot::<T>(obj, name)?;
        // SAFETY: slot lies inside the object's ivar storage and is aligned
        // for T; storage is zero-initialised, a valid bit pattern for every
        // IvarScalar.
        Ok(unsafe { slot.read() })
    }

    /// Writes an instance variable of a heap object.
    ///
    /// Object-typed ivars hold plain identities; ownership is the caller's.
    ///
    /// # Errors
    ///
    /// Same as [`read_ivar`](Self::read_ivar).
    pub fn write_ivar<T: IvarScalar>(&self, obj: Id, name: &str, value: T) -> Result<()> {
        let slot = self.ivar_slot::<T>(obj, name)?;
        // SAFETY: as in read_ivar.
        unsafe { slot.write(value) };
        Ok(())
    }
}

/// An owning handle to a heap object.
///
/// Cloning retains, dropping releases. Immortal identities pass through
/// untouched.
pub struct Object<'rt> {
    rt: &'rt Runtime,
    id: Id,
    // Autorelease targets the current thread's pool.
    _not_send: PhantomData<*const ()>,
}

impl<'rt> Object<'rt> {
    /// Takes over one owner of `id`.
    ///
    /// # Safety
    ///
    /// The caller must own a reference to `id` and give it up.
    #[must_use]
    pub unsafe fn from_raw(rt: &'rt Runtime, id: Id) -> Self {
        Object {
            rt,
            id,
            _not_send: PhantomData,
        }
    }

    /// Retains `id` and wraps the new reference.
    #[must_use]
    pub fn retained(rt: &'rt Runtime, id: Id) -> Self {
        Object {
            rt,
            id: rt.retain(id),
            _not_send: PhantomData,
        }
    }

    #[must_use]
    pub fn id(&self) -> Id {
        self.id
    }

    #[must_use]
    pub fn class(&self) -> Option<Class> {
        self.rt.object_class(self.id)
    }

    #[must_use]
    pub fn retain_count(&self) -> usize {
        self.rt.retain_count(self.id)
    }

    /// Sends a message to the object.
    pub fn send(&self, sel: Sel, args: &[usize]) -> usize {
        self.rt.send(self.id, sel, args)
    }

    /// Gives up the handle without releasing.
    #[must_use]
    pub fn into_raw(self) -> Id {
        let id = self.id;
        std::mem::forget(self);
        id
    }

    /// Moves this reference into the current autorelease pool.
    pub fn autorelease(self) -> Id {
        let rt = self.rt;
        rt.autorelease(self.into_raw())
    }
}

impl Clone for Object<'_> {
    fn clone(&self) -> Self {
        Object::retained(self.rt, self.id)
    }
}

impl Drop for Object<'_> {
    fn drop(&mut self) {
        self.rt.release(self.id);
    }
}

impl PartialEq for Object<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Object<'_> {}

impl fmt::Debug for Object<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("class", &self.class().map(|c| c.name().to_string()))
            .finish()
    }
}
