//! `OxObj`: a dynamic object runtime.
//!
//! `OxObj` gives compiled programs an Objective-C style object model:
//!
//! - **Class graph** with lazy, thread-safe resolution and one-time
//!   initialization
//! - **Message dispatch** through per-class copy-on-write tries, with
//!   receiver substitution and forwarding on a miss
//! - **Reference counting** with autorelease pools and zeroing weak
//!   references
//! - **Side tables** attaching key/value storage to any object or class
//! - **Runtime extension** through categories, protocols and statically
//!   described modules
//!
//! # Architecture
//!
//! - [`runtime`]: the [`Runtime`] context and everything it owns
//! - [`config`]: [`RuntimeConfig`], read from the environment or built in code
//! - [`error`]: recoverable errors; broken invariants panic with a diagnostic
//!
//! Logging goes through the `oxobj-log` crate; set `OXOBJ_LOG=debug` to see
//! class registration and resolution.
//!
//! # Example
//!
//! ```
//! use oxobj::{Id, Runtime, RuntimeConfig, Sel};
//!
//! fn describe(rt: &Runtime, receiver: Id, _: Sel, _: &[usize]) -> usize {
//!     rt.read_ivar::<u64>(receiver, "size").unwrap() as usize
//! }
//!
//! let rt = Runtime::new(RuntimeConfig::default());
//! let shape = rt.create_class(None, "Shape").unwrap();
//! rt.add_ivar(shape, "size", 8, 8).unwrap();
//! rt.add_method(shape, rt.selector("describe"), describe);
//! rt.register_class(shape);
//!
//! let obj = rt.new_object(shape);
//! rt.write_ivar(obj.id(), "size", 3u64).unwrap();
//! assert_eq!(obj.send(rt.selector("describe"), &[]), 3);
//! ```

pub mod config;
pub mod error;
pub mod runtime;

pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use runtime::{
    AssociationKey, AssociationPolicy, AutoreleasePool, CategoryBuilder, CategoryDescriptor,
    Class, ClassDescriptor, ClassId, ClassState, ForwardHook, Id, Imp, Ivar, IvarDescriptor,
    IvarScalar, Method, MethodDescriptor, ModuleDescriptor, ModuleHandle, Object, PoolMark,
    Protocol, ProtocolDescriptor, Runtime, Sel, SelectorReference, SubstitutionHook, WeakSlot,
};
