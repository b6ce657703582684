//! Object lifetime: reference counts, autorelease pools, weak references,
//! associations and the order in which deallocation tears them down.

mod common;

use std::pin::{Pin, pin};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{root_class, runtime, subclass};
use oxobj::{AssociationKey, AssociationPolicy, AutoreleasePool, Id, Object, Runtime, Sel, WeakSlot};

#[test]
fn test_balanced_retains_free_object() {
    static DEALLOCS: AtomicUsize = AtomicUsize::new(0);
    fn dealloc(_: &Runtime, _: Id, _: Sel, _: &[usize]) -> usize {
        DEALLOCS.fetch_add(1, Ordering::SeqCst);
        0
    }

    let rt = runtime();
    let class = rt.create_class(None, "Counted").unwrap();
    rt.add_method(class, rt.selector("dealloc"), dealloc);
    rt.register_class(class);

    let slot = pin!(WeakSlot::new());
    let id = rt.alloc(class);
    rt.store_weak(slot.as_ref(), id);
    for _ in 0..10 {
        rt.retain(id);
    }
    assert_eq!(rt.retain_count(id), 11);
    for _ in 0..10 {
        rt.release(id);
    }
    assert_eq!(rt.retain_count(id), 1);
    assert_eq!(DEALLOCS.load(Ordering::SeqCst), 0);
    assert_eq!(rt.weak_ref_count(id), 1);
    assert_eq!(rt.load_weak_object(slot.as_ref()).map(|obj| obj.id()), Some(id));

    rt.release(id);
    assert_eq!(DEALLOCS.load(Ordering::SeqCst), 1);
    assert!(rt.load_weak_object(slot.as_ref()).is_none());

    // The zeroed slot stays zeroed; nothing else touches it.
    rt.destroy_weak(slot.as_ref());
    assert!(rt.load_weak_object(slot.as_ref()).is_none());
    assert_eq!(DEALLOCS.load(Ordering::SeqCst), 1);
}

#[test]
fn test_object_handles_track_owners() {
    let rt = runtime();
    let class = root_class(&rt, "Thing");

    let obj = rt.new_object(class);
    let copy = obj.clone();
    assert_eq!(obj.retain_count(), 2);
    assert_eq!(obj, copy);
    drop(copy);
    assert_eq!(obj.retain_count(), 1);

    let raw = obj.into_raw();
    assert_eq!(rt.retain_count(raw), 1);
    rt.release(raw);
}

#[test]
fn test_immortal_identities_ignore_counting() {
    let rt = runtime();
    let class = root_class(&rt, "Thing");
    let class_obj = Id::from_class(class);

    rt.retain(class_obj);
    rt.release(class_obj);
    rt.release(class_obj);
    assert_eq!(rt.retain_count(class_obj), usize::MAX);
    assert_eq!(rt.retain_count(Id::NIL), 0);
    rt.release(Id::NIL);
}

#[test]
fn test_autoreleased_object_lives_until_pool_pops() {
    static DEALLOCS: AtomicUsize = AtomicUsize::new(0);
    fn dealloc(_: &Runtime, _: Id, _: Sel, _: &[usize]) -> usize {
        DEALLOCS.fetch_add(1, Ordering::SeqCst);
        0
    }

    let rt = runtime();
    let class = rt.create_class(None, "Pooled").unwrap();
    rt.add_method(class, rt.selector("dealloc"), dealloc);
    rt.register_class(class);

    let outer = rt.pool_push();
    let kept = rt.alloc(class);
    rt.autorelease(kept);
    {
        let _inner = AutoreleasePool::new(&rt);
        for _ in 0..5 {
            rt.new_object(class).autorelease();
        }
        assert_eq!(rt.pool_pending(), 6);
    }
    assert_eq!(DEALLOCS.load(Ordering::SeqCst), 5);
    assert_eq!(rt.retain_count(kept), 1);

    rt.pool_pop(outer);
    assert_eq!(DEALLOCS.load(Ordering::SeqCst), 6);
    assert_eq!(rt.pool_pending(), 0);
}

#[test]
fn test_with_autorelease_pool_returns_value() {
    let rt = runtime();
    let class = root_class(&rt, "Thing");
    let holder = rt.new_object(class);

    let count = rt.with_autorelease_pool(|| {
        rt.retain(holder.id());
        rt.autorelease(holder.id());
        holder.retain_count()
    });
    assert_eq!(count, 2);
    assert_eq!(holder.retain_count(), 1);
}

#[test]
fn test_weak_reference_zeroed_on_dealloc() {
    let rt = runtime();
    let class = root_class(&rt, "Target");
    let slot = pin!(WeakSlot::new());

    let obj = rt.new_object(class);
    rt.store_weak(slot.as_ref(), obj.id());
    assert_eq!(rt.weak_ref_count(obj.id()), 1);

    let loaded = rt.load_weak_object(slot.as_ref()).unwrap();
    assert_eq!(loaded.id(), obj.id());
    assert_eq!(obj.retain_count(), 2);
    drop(loaded);

    drop(obj);
    assert!(rt.load_weak(slot.as_ref()).is_nil());
    assert!(rt.load_weak_object(slot.as_ref()).is_none());
}

#[test]
fn test_weak_slots_moved_between_referents() {
    let rt = runtime();
    let class = root_class(&rt, "Target");
    let first = rt.new_object(class);
    let second = rt.new_object(class);
    let slot = Box::pin(WeakSlot::new());

    rt.store_weak(slot.as_ref(), first.id());
    rt.store_weak(slot.as_ref(), second.id());
    assert_eq!(rt.weak_ref_count(first.id()), 0);
    assert_eq!(rt.weak_ref_count(second.id()), 1);

    drop(slot);
    assert_eq!(rt.weak_ref_count(second.id()), 0);
}

#[test]
fn test_dealloc_order() {
    static EVENTS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    static SLOT: WeakSlot = WeakSlot::new();
    static PAYLOAD_KEY: u8 = 0;

    fn owner_dealloc(rt: &Runtime, receiver: Id, _: Sel, _: &[usize]) -> usize {
        let mut events = EVENTS.lock().unwrap();
        if rt.weak_ref_count(receiver) == 0 && rt.load_weak(Pin::static_ref(&SLOT)).is_nil() {
            events.push("owner:weak-cleared");
        }
        if rt.association_count(receiver) == 1 {
            events.push("owner:associations-live");
        }
        0
    }
    fn payload_dealloc(_: &Runtime, _: Id, _: Sel, _: &[usize]) -> usize {
        EVENTS.lock().unwrap().push("payload");
        0
    }

    let rt = runtime();
    let owner = rt.create_class(None, "Owner").unwrap();
    rt.add_method(owner, rt.selector("dealloc"), owner_dealloc);
    rt.register_class(owner);
    let payload = rt.create_class(None, "Payload").unwrap();
    rt.add_method(payload, rt.selector("dealloc"), payload_dealloc);
    rt.register_class(payload);

    let obj = rt.new_object(owner);
    rt.store_weak(Pin::static_ref(&SLOT), obj.id());
    let value = rt.new_object(payload);
    rt.set_associated(
        obj.id(),
        AssociationKey::from_static(&PAYLOAD_KEY),
        value.id(),
        AssociationPolicy::Retain,
    );
    drop(value);
    assert!(EVENTS.lock().unwrap().is_empty());

    drop(obj);
    assert_eq!(
        *EVENTS.lock().unwrap(),
        vec!["owner:weak-cleared", "owner:associations-live", "payload"]
    );
}

#[test]
fn test_association_policies() {
    static NAME: u8 = 0;
    static CACHE: u8 = 0;
    static PARENT: u8 = 0;

    let rt = runtime();
    let class = root_class(&rt, "Node");
    let node = rt.new_object(class);
    let name = rt.new_object(class);
    let cache = rt.new_object(class);
    let parent = rt.new_object(class);

    let _pool = AutoreleasePool::new(&rt);
    rt.set_associated(node.id(), AssociationKey::from_static(&NAME), name.id(), AssociationPolicy::Retain);
    rt.set_associated(
        node.id(),
        AssociationKey::from_static(&CACHE),
        cache.id(),
        AssociationPolicy::RetainAtomic,
    );
    rt.set_associated(node.id(), AssociationKey::from_static(&PARENT), parent.id(), AssociationPolicy::Weak);
    assert_eq!(rt.association_count(node.id()), 3);
    assert_eq!(name.retain_count(), 2);
    assert_eq!(cache.retain_count(), 2);
    assert_eq!(parent.retain_count(), 1);

    assert_eq!(rt.get_associated(node.id(), AssociationKey::from_static(&NAME)), name.id());
    assert_eq!(rt.get_associated(node.id(), AssociationKey::from_static(&CACHE)), cache.id());
    assert_eq!(rt.get_associated(node.id(), AssociationKey::from_static(&PARENT)), parent.id());

    // Replacing with nil releases the old value.
    rt.set_associated(node.id(), AssociationKey::from_static(&NAME), Id::NIL, AssociationPolicy::Retain);
    assert_eq!(name.retain_count(), 1);
    assert_eq!(rt.association_count(node.id()), 2);
}

#[test]
fn test_weak_association_reads_nil_after_dealloc() {
    static KEY: u8 = 0;

    let rt = runtime();
    let class = root_class(&rt, "Node");
    let node = rt.new_object(class);
    let _pool = AutoreleasePool::new(&rt);

    let target = rt.new_object(class);
    rt.set_associated(node.id(), AssociationKey::from_static(&KEY), target.id(), AssociationPolicy::Weak);
    drop(target);
    assert!(rt.get_associated(node.id(), AssociationKey::from_static(&KEY)).is_nil());
}

#[test]
fn test_class_level_associations() {
    static KEY: u8 = 0;

    let rt = runtime();
    let base = root_class(&rt, "Base");
    let leaf = subclass(&rt, base, "Leaf");
    let value = rt.new_object(base);

    rt.set_associated(
        Id::from_class(base),
        AssociationKey::from_static(&KEY),
        value.id(),
        AssociationPolicy::Retain,
    );
    assert_eq!(rt.get_associated(Id::from_class(base), AssociationKey::from_static(&KEY)), value.id());
    assert!(rt.get_associated(Id::from_class(leaf), AssociationKey::from_static(&KEY)).is_nil());
    assert_eq!(value.retain_count(), 2);

    rt.remove_all_associations(Id::from_class(base));
    assert_eq!(value.retain_count(), 1);
}

#[test]
fn test_ivars_across_inheritance() {
    let rt = runtime();
    let base = rt.create_class(None, "Point").unwrap();
    rt.add_ivar(base, "x", 8, 8).unwrap();
    rt.add_ivar(base, "y", 8, 8).unwrap();
    rt.register_class(base);
    let tagged = rt.create_class(Some(base), "LabelledPoint").unwrap();
    rt.add_ivar(tagged, "flag", 1, 1).unwrap();
    rt.add_ivar(tagged, "label", size_of::<usize>(), align_of::<usize>()).unwrap();
    rt.register_class(tagged);

    assert_eq!(rt.ivar_offset(tagged, "y"), Some(8));
    assert_eq!(rt.ivar_offset(tagged, "flag"), Some(16));
    assert_eq!(rt.ivar_offset(tagged, "label"), Some(24));

    let label = rt.new_object(base);
    let obj: Object<'_> = rt.new_object(tagged);
    rt.write_ivar(obj.id(), "x", -4i64).unwrap();
    rt.write_ivar(obj.id(), "flag", 1u8).unwrap();
    rt.write_ivar(obj.id(), "label", label.id()).unwrap();
    assert_eq!(rt.read_ivar::<i64>(obj.id(), "x").unwrap(), -4);
    assert_eq!(rt.read_ivar::<i64>(obj.id(), "y").unwrap(), 0);
    assert_eq!(rt.read_ivar::<u8>(obj.id(), "flag").unwrap(), 1);
    assert_eq!(rt.read_ivar::<Id>(obj.id(), "label").unwrap(), label.id());
    assert!(rt.read_ivar::<u32>(obj.id(), "x").is_err());
    assert!(rt.read_ivar::<u8>(label.id(), "flag").is_err());
}
