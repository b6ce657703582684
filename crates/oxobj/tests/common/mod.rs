// Shared fixtures for the integration tests.
//
// Every test builds its own runtime, so class names only need to be unique
// within a test.

#![allow(dead_code)]

use std::sync::Arc;

use oxobj::{Class, Id, Runtime, RuntimeConfig, Sel};

/// A fresh runtime with default configuration.
pub fn runtime() -> Arc<Runtime> {
    Runtime::new(RuntimeConfig::default())
}

/// Creates and registers a root class.
pub fn root_class(rt: &Runtime, name: &str) -> Class {
    let class = rt.create_class(None, name).expect("Failed to create root class");
    assert!(rt.register_class(class));
    class
}

/// Creates and registers a subclass of `superclass`.
pub fn subclass(rt: &Runtime, superclass: Class, name: &str) -> Class {
    let class = rt
        .create_class(Some(superclass), name)
        .expect("Failed to create subclass");
    assert!(rt.register_class(class));
    class
}

/// Creates a registered root class with a single instance method.
pub fn class_with_method(rt: &Runtime, name: &str, selector: &str, imp: oxobj::Imp) -> Class {
    let class = rt.create_class(None, name).expect("Failed to create class");
    rt.add_method(class, rt.selector(selector), imp);
    assert!(rt.register_class(class));
    class
}

pub fn return_one(_: &Runtime, _: Id, _: Sel, _: &[usize]) -> usize {
    1
}

pub fn return_two(_: &Runtime, _: Id, _: Sel, _: &[usize]) -> usize {
    2
}

pub fn return_three(_: &Runtime, _: Id, _: Sel, _: &[usize]) -> usize {
    3
}

/// Returns the receiver's raw identity.
pub fn return_self(_: &Runtime, receiver: Id, _: Sel, _: &[usize]) -> usize {
    receiver.as_usize()
}

/// Sums every argument.
pub fn sum_args(_: &Runtime, _: Id, _: Sel, args: &[usize]) -> usize {
    args.iter().sum()
}
