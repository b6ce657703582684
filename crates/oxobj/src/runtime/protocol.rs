//! Protocols: named sets of method requirements that classes adopt.
//!
//! Protocols do not take part in dispatch. A class declares that it adopts a
//! protocol; [`Runtime::conforms_to`] answers through superclasses and
//! protocol inheritance, and [`Runtime::validate_conformance`] checks that
//! every required method is actually implemented.
//!
//! # Thread Safety
//!
//! Protocol handles are `Arc`s. Requirement lists sit behind `RwLock`s and
//! may grow after registration.

use std::fmt;
use std::sync::{Arc, RwLock};

use oxobj_log::debug;

use crate::error::{Error, Result};
use crate::runtime::class::Class;
use crate::runtime::selector::Sel;
use crate::runtime::{Runtime, read, write};

struct ProtocolInner {
    name: Box<str>,
    parents: Vec<Protocol>,
    required: RwLock<Vec<Sel>>,
    optional: RwLock<Vec<Sel>>,
}

/// A registered protocol. Compares by identity.
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<ProtocolInner>,
}

impl Protocol {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Protocols this one inherits from.
    #[must_use]
    pub fn parents(&self) -> &[Protocol] {
        &self.inner.parents
    }

    /// Adds a required instance method.
    pub fn add_required(&self, sel: Sel) {
        let mut required = write(&self.inner.required);
        if !required.contains(&sel) {
            required.push(sel);
        }
    }

    /// Adds an optional instance method.
    pub fn add_optional(&self, sel: Sel) {
        let mut optional = write(&self.inner.optional);
        if !optional.contains(&sel) {
            optional.push(sel);
        }
    }

    /// Required methods declared by this protocol itself.
    #[must_use]
    pub fn required(&self) -> Vec<Sel> {
        read(&self.inner.required).clone()
    }

    #[must_use]
    pub fn optional(&self) -> Vec<Sel> {
        read(&self.inner.optional).clone()
    }

    /// Required methods including inherited ones, without duplicates.
    #[must_use]
    pub fn all_required(&self) -> Vec<Sel> {
        let mut out = Vec::new();
        self.collect_required(&mut out);
        out
    }

    fn collect_required(&self, out: &mut Vec<Sel>) {
        for parent in self.parents() {
            parent.collect_required(out);
        }
        for sel in read(&self.inner.required).iter() {
            if !out.contains(sel) {
                out.push(*sel);
            }
        }
    }

    /// Returns true if this protocol is `other` or inherits from it.
    #[must_use]
    pub fn includes(&self, other: &Protocol) -> bool {
        self == other || self.parents().iter().any(|p| p.includes(other))
    }
}

impl PartialEq for Protocol {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Protocol {}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name())
            .field("parents", &self.parents().iter().map(Protocol::name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Registers a new protocol.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolAlreadyExists`] if the name is taken.
    pub fn create_protocol(&self, name: &str, parents: &[Protocol]) -> Result<Protocol> {
        let mut reg = write(&self.registry);
        if reg.protocols.contains_key(name) {
            return Err(Error::ProtocolAlreadyExists {
                name: name.to_string(),
            });
        }
        let protocol = Protocol {
            inner: Arc::new(ProtocolInner {
                name: name.into(),
                parents: parents.to_vec(),
                required: RwLock::new(Vec::new()),
                optional: RwLock::new(Vec::new()),
            }),
        };
        reg.protocols.insert(name.into(), protocol.clone());
        debug!("registered protocol '{name}'");
        Ok(protocol)
    }

    /// Looks up a protocol by name.
    #[must_use]
    pub fn protocol(&self, name: &str) -> Option<Protocol> {
        read(&self.registry).protocols.get(name).cloned()
    }

    /// Every registered protocol, sorted by name.
    #[must_use]
    pub fn all_protocols(&self) -> Vec<Protocol> {
        let mut all: Vec<_> = read(&self.registry).protocols.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Declares that `class` adopts `protocol`. No methods are checked.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolAlreadyAdopted`] if the class itself already
    /// lists the protocol.
    pub fn add_protocol(&self, class: Class, protocol: &Protocol) -> Result<()> {
        let class = class.instance_class();
        let mut adopted = write(&class.inner().protocols);
        if adopted.contains(protocol) {
            return Err(Error::ProtocolAlreadyAdopted {
                class: class.name().to_string(),
                protocol: protocol.name().to_string(),
            });
        }
        adopted.push(protocol.clone());
        Ok(())
    }

    /// Returns true if `class` or a superclass adopts `protocol` or a
    /// protocol inheriting from it.
    #[must_use]
    pub fn conforms_to(&self, class: Class, protocol: &Protocol) -> bool {
        let mut current = Some(class.instance_class());
        while let Some(c) = current {
            if read(&c.inner().protocols).iter().any(|p| p.includes(protocol)) {
                return true;
            }
            current = c.superclass();
        }
        false
    }

    /// Checks that instances of `class` implement every required method of
    /// `protocol`, inherited requirements included. Methods may come from
    /// superclasses or categories.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingProtocolMethod`] naming the first missing
    /// selector.
    pub fn validate_conformance(&self, class: Class, protocol: &Protocol) -> Result<()> {
        let class = class.instance_class();
        for sel in protocol.all_required() {
            if self.method_implementation(class, sel).is_none() {
                return Err(Error::MissingProtocolMethod {
                    class: class.name().to_string(),
                    selector: self.sel_name(sel).to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::object::Id;

    fn noop(_: &Runtime, _: Id, _: Sel, _: &[usize]) -> usize {
        0
    }

    #[test]
    fn test_create_and_lookup() {
        let rt = Runtime::new(RuntimeConfig::default());
        let p = rt.create_protocol("Copying", &[]).unwrap();
        assert_eq!(rt.protocol("Copying"), Some(p.clone()));
        assert!(matches!(
            rt.create_protocol("Copying", &[]),
            Err(Error::ProtocolAlreadyExists { .. })
        ));
        assert_eq!(rt.all_protocols(), vec![p]);
    }

    #[test]
    fn test_inherited_requirements() {
        let rt = Runtime::new(RuntimeConfig::default());
        let base = rt.create_protocol("Base", &[]).unwrap();
        base.add_required(rt.selector("hash"));
        let child = rt.create_protocol("Child", &[base.clone()]).unwrap();
        child.add_required(rt.selector("describe"));
        child.add_required(rt.selector("hash"));
        child.add_optional(rt.selector("debugDescribe"));

        assert_eq!(child.all_required(), vec![rt.selector("hash"), rt.selector("describe")]);
        assert_eq!(child.optional(), vec![rt.selector("debugDescribe")]);
        assert!(child.includes(&base));
        assert!(!base.includes(&child));
    }

    #[test]
    fn test_conformance_through_superclass() {
        let rt = Runtime::new(RuntimeConfig::default());
        let base = rt.create_protocol("Base", &[]).unwrap();
        let child = rt.create_protocol("Child", &[base.clone()]).unwrap();

        let root = rt.create_class(None, "Root").unwrap();
        rt.register_class(root);
        let sub = rt.create_class(Some(root), "Sub").unwrap();
        rt.register_class(sub);
        rt.add_protocol(root, &child).unwrap();

        assert!(rt.conforms_to(sub, &base));
        assert!(rt.conforms_to(sub.metaclass(), &child));
        assert!(matches!(
            rt.add_protocol(root, &child),
            Err(Error::ProtocolAlreadyAdopted { .. })
        ));
        assert!(rt.add_protocol(sub, &child).is_ok());
    }

    #[test]
    fn test_validate_conformance() {
        let rt = Runtime::new(RuntimeConfig::default());
        let p = rt.create_protocol("Sized", &[]).unwrap();
        let count = rt.selector("count");
        p.add_required(count);
        p.add_optional(rt.selector("isEmpty"));

        let root = rt.create_class(None, "Bag").unwrap();
        rt.register_class(root);
        rt.add_protocol(root, &p).unwrap();
        let err = rt.validate_conformance(root, &p).unwrap_err();
        assert_eq!(
            err,
            Error::MissingProtocolMethod {
                class: "Bag".to_string(),
                selector: "count".to_string(),
            }
        );

        rt.add_method(root, count, noop);
        assert!(rt.validate_conformance(root, &p).is_ok());
    }
}
