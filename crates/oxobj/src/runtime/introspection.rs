//! Read-only queries over the class graph.
//!
//! - **Class enumeration**: registered classes, subclasses, hierarchy
//! - **Method enumeration**: own methods, everything a class answers
//! - **Object queries**: kind-of tests
//!
//! None of these run initializers. Tables of classes that have not received
//! a message yet are computed on the fly and discarded.

use std::sync::Arc;

use crate::runtime::class::{Class, Method};
use crate::runtime::object::Id;
use crate::runtime::selector::Sel;
use crate::runtime::{Runtime, read};

// ============================================================================
// Classes
// ============================================================================

impl Runtime {
    /// Registered classes in registration order. Metaclasses are not listed.
    #[must_use]
    pub fn all_classes(&self) -> Vec<Class> {
        read(&self.registry).classes.clone()
    }

    /// Number of registered classes.
    #[must_use]
    pub fn class_count(&self) -> usize {
        read(&self.registry).classes.len()
    }

    /// Direct subclasses of `class`, of the same kind (a class's list does
    /// not include the root metaclass).
    #[must_use]
    pub fn subclasses(&self, class: Class) -> Vec<Class> {
        class
            .subclasses()
            .into_iter()
            .filter(|sub| sub.is_metaclass() == class.is_metaclass())
            .collect()
    }

    /// `class` followed by its superclasses up to the root.
    #[must_use]
    pub fn class_hierarchy(&self, class: Class) -> Vec<Class> {
        let mut chain = vec![class];
        let mut current = class;
        while let Some(sup) = current.superclass() {
            if sup.is_metaclass() != class.is_metaclass() {
                break;
            }
            chain.push(sup);
            current = sup;
        }
        chain
    }

    #[must_use]
    pub fn is_subclass(&self, child: Class, parent: Class) -> bool {
        child.is_subclass_of(parent)
    }
}

// ============================================================================
// Methods
// ============================================================================

impl Runtime {
    /// Methods `class` defines itself (categories included), newest first.
    #[must_use]
    pub fn instance_methods(&self, class: Class) -> Vec<Arc<Method>> {
        class.instance_class().own_methods()
    }

    /// Class methods `class` defines itself.
    #[must_use]
    pub fn class_methods(&self, class: Class) -> Vec<Arc<Method>> {
        class.instance_class().metaclass().own_methods()
    }

    /// Returns true if `class` itself defines `sel`.
    #[must_use]
    pub fn has_method(&self, class: Class, sel: Sel) -> bool {
        class.own_method(sel).is_some()
    }

    /// Every selector instances of `class` answer, in token order.
    #[must_use]
    pub fn selectors_understood(&self, class: Class) -> Vec<Sel> {
        if !class.is_resolved() || class.is_disposed() {
            return Vec::new();
        }
        self.table_snapshot(class)
            .iter()
            .map(|(key, _)| Sel::from_u32(key))
            .collect()
    }

    /// Returns true if instances of `class` answer `sel`.
    #[must_use]
    pub fn instances_respond_to(&self, class: Class, sel: Sel) -> bool {
        self.lookup_slot(class, sel).is_some()
    }
}

// ============================================================================
// Objects
// ============================================================================

impl Runtime {
    /// Returns true if `obj` is an instance of `class` or of a subclass.
    #[must_use]
    pub fn is_kind_of(&self, obj: Id, class: Class) -> bool {
        self.object_class(obj)
            .is_some_and(|c| c.is_subclass_of(class))
    }

    /// Returns true if `obj` is an instance of exactly `class`.
    #[must_use]
    pub fn is_member_of(&self, obj: Id, class: Class) -> bool {
        self.object_class(obj) == Some(class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn noop(_: &Runtime, _: Id, _: Sel, _: &[usize]) -> usize {
        0
    }

    fn tree(rt: &Runtime) -> (Class, Class, Class) {
        let root = rt.create_class(None, "Root").unwrap();
        rt.register_class(root);
        let a = rt.create_class(Some(root), "A").unwrap();
        rt.register_class(a);
        let b = rt.create_class(Some(a), "B").unwrap();
        rt.register_class(b);
        (root, a, b)
    }

    #[test]
    fn test_class_enumeration() {
        let rt = Runtime::new(RuntimeConfig::default());
        let (root, a, b) = tree(&rt);
        assert_eq!(rt.all_classes(), vec![root, a, b]);
        assert_eq!(rt.class_count(), 3);
        assert_eq!(rt.subclasses(root), vec![a]);
        assert_eq!(rt.subclasses(root.metaclass()), vec![a.metaclass()]);
        assert_eq!(rt.class_hierarchy(b), vec![b, a, root]);
        assert_eq!(
            rt.class_hierarchy(b.metaclass()),
            vec![b.metaclass(), a.metaclass(), root.metaclass()]
        );
        assert!(rt.is_subclass(b, root));
        assert!(!rt.is_subclass(root, b));
    }

    #[test]
    fn test_method_enumeration() {
        let rt = Runtime::new(RuntimeConfig::default());
        let (root, a, _) = tree(&rt);
        let hash = rt.selector("hash");
        let make = rt.selector("make");
        let extra = rt.selector("extra");
        rt.add_method(root, hash, noop);
        rt.add_method(a, extra, noop);
        rt.add_method(a.metaclass(), make, noop);

        let own: Vec<Sel> = rt.instance_methods(a).iter().map(|m| m.selector()).collect();
        assert_eq!(own, vec![extra]);
        assert_eq!(rt.class_methods(a).len(), 1);
        assert!(rt.has_method(root, hash));
        assert!(!rt.has_method(a, hash));

        let mut expected = vec![hash, extra];
        expected.sort();
        assert_eq!(rt.selectors_understood(a), expected);
        assert!(rt.instances_respond_to(a, hash));
        assert!(!rt.instances_respond_to(root, extra));
    }

    #[test]
    fn test_kind_of() {
        let rt = Runtime::new(RuntimeConfig::default());
        let (root, a, b) = tree(&rt);
        let obj = rt.new_object(a);
        assert!(rt.is_kind_of(obj.id(), root));
        assert!(rt.is_kind_of(obj.id(), a));
        assert!(!rt.is_kind_of(obj.id(), b));
        assert!(rt.is_member_of(obj.id(), a));
        assert!(!rt.is_member_of(obj.id(), root));
        assert!(rt.is_kind_of(Id::from_class(b), root));
        assert!(!rt.is_kind_of(Id::NIL, root));
    }
}
