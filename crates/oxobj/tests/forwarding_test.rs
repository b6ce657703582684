//! Receiver substitution, forwarding, tagged identities, custom reference
//! counting and the faults the runtime refuses to continue past.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{class_with_method, return_one, return_two, root_class, runtime, subclass};
use oxobj::{ClassDescriptor, Id, Imp, ModuleDescriptor, Runtime, RuntimeConfig, Sel};

fn payload_double(_: &Runtime, receiver: Id, _: Sel, _: &[usize]) -> usize {
    receiver.tagged_payload().unwrap_or(0) * 2
}

#[test]
fn test_proxy_substitutes_its_target() {
    let rt = runtime();
    let target_class = class_with_method(&rt, "Target", "value", return_two);
    let proxy_class = rt.create_class(None, "Proxy").unwrap();
    rt.add_ivar(proxy_class, "target", size_of::<usize>(), align_of::<usize>()).unwrap();
    rt.add_method(proxy_class, rt.selector("local"), return_one);
    rt.register_class(proxy_class);
    rt.set_class_substitution_hook(
        proxy_class,
        Some(Arc::new(|rt: &Runtime, receiver: Id, _: Sel| {
            rt.read_ivar::<Id>(receiver, "target").ok().filter(|t| !t.is_nil())
        })),
    );

    let target = rt.new_object(target_class);
    let proxy = rt.new_object(proxy_class);
    rt.write_ivar(proxy.id(), "target", target.id()).unwrap();

    assert_eq!(proxy.send(rt.selector("value"), &[]), 2);
    assert_eq!(proxy.send(rt.selector("local"), &[]), 1);
    assert!(!rt.responds_to(proxy.id(), rt.selector("value")));

    // resolve hands back the substituted receiver.
    let mut receiver = proxy.id();
    let imp = rt.resolve(&mut receiver, rt.selector("value"));
    assert_eq!(receiver, target.id());
    assert_eq!(imp(&rt, receiver, rt.selector("value"), &[]), 2);
}

#[test]
fn test_superclass_hook_serves_subclasses() {
    let rt = runtime();
    let target_class = class_with_method(&rt, "Target", "value", return_two);
    let base = root_class(&rt, "Base");
    let leaf = subclass(&rt, base, "Leaf");
    let target = rt.new_object(target_class);
    let target_id = target.id();
    rt.set_class_substitution_hook(base, Some(Arc::new(move |_: &Runtime, _: Id, _: Sel| Some(target_id))));

    let obj = rt.new_object(leaf);
    assert_eq!(obj.send(rt.selector("value"), &[]), 2);
}

#[test]
fn test_forward_hook_sees_original_receiver() {
    static SEEN: AtomicUsize = AtomicUsize::new(0);
    fn record(_: &Runtime, receiver: Id, _: Sel, args: &[usize]) -> usize {
        SEEN.store(receiver.as_usize(), Ordering::SeqCst);
        args.len()
    }

    let rt = runtime();
    let class = root_class(&rt, "Sink");
    rt.set_forward_hook(Some(Arc::new(|_: &Runtime, _: Id, _: Sel| record as Imp)));

    let obj = rt.new_object(class);
    assert_eq!(obj.send(rt.selector("whatever:with:"), &[1, 2]), 2);
    assert_eq!(SEEN.load(Ordering::SeqCst), obj.id().as_usize());
}

#[test]
fn test_tagged_identities_dispatch() {
    let rt = runtime();
    let small = class_with_method(&rt, "SmallInt", "doubled", payload_double);
    rt.register_tagged_class(3, small).unwrap();
    assert!(rt.register_tagged_class(3, small).is_err());
    assert!(rt.register_tagged_class(8, small).is_err());

    let id = Id::tagged(3, 21).unwrap();
    assert_eq!(rt.object_class(id), Some(small));
    assert_eq!(rt.send(id, rt.selector("doubled"), &[]), 42);
    assert!(rt.is_kind_of(id, small));

    // Tagged identities are immortal.
    rt.retain(id);
    rt.release(id);
    assert_eq!(rt.retain_count(id), usize::MAX);
}

#[test]
fn test_custom_refcounting_is_messaged() {
    static RETAINS: AtomicUsize = AtomicUsize::new(0);
    static RELEASES: AtomicUsize = AtomicUsize::new(0);
    fn retain(rt: &Runtime, receiver: Id, _: Sel, _: &[usize]) -> usize {
        RETAINS.fetch_add(1, Ordering::SeqCst);
        rt.root_retain(receiver).as_usize()
    }
    fn release(rt: &Runtime, receiver: Id, _: Sel, _: &[usize]) -> usize {
        RELEASES.fetch_add(1, Ordering::SeqCst);
        rt.root_release(receiver);
        0
    }

    let rt = runtime();
    let base = rt.create_class(None, "Managed").unwrap();
    rt.set_custom_refcounting(base);
    rt.add_method(base, rt.selector("retain"), retain);
    rt.add_method(base, rt.selector("release"), release);
    rt.register_class(base);
    let leaf = subclass(&rt, base, "ManagedLeaf");
    assert!(leaf.has_custom_refcounting());

    let obj = rt.new_object(leaf);
    let copy = obj.clone();
    assert_eq!(RETAINS.load(Ordering::SeqCst), 1);
    assert_eq!(obj.retain_count(), 2);
    drop(copy);
    drop(obj);
    assert_eq!(RELEASES.load(Ordering::SeqCst), 2);
}

#[test]
#[should_panic(expected = "-[Plain missing]: does not recognize selector")]
fn test_unrecognized_selector_is_fatal() {
    let rt = runtime();
    let class = root_class(&rt, "Plain");
    let obj = rt.new_object(class);
    obj.send(rt.selector("missing"), &[]);
}

#[test]
#[should_panic(expected = "+[Plain build]: does not recognize selector")]
fn test_unrecognized_class_selector_is_fatal() {
    let rt = runtime();
    let class = root_class(&rt, "Plain");
    rt.send(Id::from_class(class), rt.selector("build"), &[]);
}

#[test]
#[should_panic(expected = "forwarding loop")]
fn test_mutual_substitution_is_fatal() {
    let rt = Runtime::new(RuntimeConfig::default().with_max_forwarding_depth(8));
    let ping = root_class(&rt, "Ping");
    let pong = root_class(&rt, "Pong");
    let a = rt.alloc(ping);
    let b = rt.alloc(pong);
    rt.set_class_substitution_hook(ping, Some(Arc::new(move |_: &Runtime, _: Id, _: Sel| Some(b))));
    rt.set_class_substitution_hook(pong, Some(Arc::new(move |_: &Runtime, _: Id, _: Sel| Some(a))));
    rt.send(a, rt.selector("serve"), &[]);
}

#[test]
#[should_panic(expected = "sent to nil")]
fn test_float_selector_to_nil_is_fatal() {
    let rt = runtime();
    let area = rt.intern_selector("area", "d@:").unwrap();
    rt.send(Id::NIL, area, &[]);
}

#[test]
fn test_word_selector_to_nil_returns_zero() {
    let rt = runtime();
    let count = rt.intern_selector("count", "Q@:").unwrap();
    assert_eq!(rt.send(Id::NIL, count, &[]), 0);
    assert_eq!(rt.send(Id::NIL, rt.selector("anything"), &[1, 2, 3]), 0);
}

#[test]
#[should_panic(expected = "unresolved class")]
fn test_message_to_unresolved_class_is_fatal() {
    static ORPHANS: ModuleDescriptor = ModuleDescriptor {
        name: "orphans",
        classes: &[ClassDescriptor {
            name: "Orphan",
            superclass: Some("NeverLoaded"),
            ..ClassDescriptor::EMPTY
        }],
        ..ModuleDescriptor::EMPTY
    };

    let rt = runtime();
    rt.load_module(&ORPHANS).unwrap();
    let orphan = rt.lookup_class("Orphan").unwrap();
    rt.send(Id::from_class(orphan), rt.selector("new"), &[]);
}

#[test]
#[should_panic(expected = "disposed class")]
fn test_alloc_of_disposed_class_is_fatal() {
    let rt = runtime();
    let class = root_class(&rt, "Gone");
    rt.dispose_class(class).unwrap();
    rt.alloc(class);
}
