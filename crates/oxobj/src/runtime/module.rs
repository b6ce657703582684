//! Loading static metadata emitted by an ahead-of-time compiler.
//!
//! A compiled module describes its selectors, protocols, classes and
//! categories with `&'static` descriptor tables that can be emitted as plain
//! `static` items. [`Runtime::load_module`] brings them into the runtime:
//!
//! 1. intern every selector reference and method selector
//! 2. register protocols (a protocol already known by name is reused)
//! 3. build and register the classes; a class whose superclass is not loaded
//!    yet waits on the pending list until it is
//! 4. merge categories; a category whose class is not registered yet is
//!    buffered and retried on every later registration
//!
//! [`Runtime::unload_module`] swaps every implementation the module supplied
//! for a stub that faults when called, so no dispatch slot keeps pointing
//! into unloaded code, then unregisters the module's classes.
//!
//! # Example
//!
//! ```
//! use oxobj::{ClassDescriptor, Id, MethodDescriptor, ModuleDescriptor, Runtime, RuntimeConfig, Sel};
//!
//! fn area(_: &Runtime, _: Id, _: Sel, _: &[usize]) -> usize {
//!     12
//! }
//!
//! static SHAPES: ModuleDescriptor = ModuleDescriptor {
//!     name: "shapes",
//!     classes: &[ClassDescriptor {
//!         name: "Shape",
//!         instance_methods: &[MethodDescriptor { name: "area", types: Some("Q@:"), imp: area }],
//!         ..ClassDescriptor::EMPTY
//!     }],
//!     ..ModuleDescriptor::EMPTY
//! };
//!
//! let rt = Runtime::new(RuntimeConfig::default());
//! let module = rt.load_module(&SHAPES).unwrap();
//! let shape = rt.lookup_class("Shape").unwrap();
//! assert_eq!(rt.new_object(shape).send(rt.selector("area"), &[]), 12);
//! rt.unload_module(module);
//! assert!(rt.lookup_class("Shape").is_none());
//! ```

use std::sync::Arc;
use std::sync::atomic::Ordering;

use oxobj_log::{debug, info, warn};

use crate::error::{Error, Result, fatal};
use crate::runtime::category::{CategoryParts, has_category};
use crate::runtime::class::{Class, Method, MAX_IVAR_ALIGN, Parent, Registry, flags};
use crate::runtime::object::Id;
use crate::runtime::protocol::Protocol;
use crate::runtime::selector::Sel;
use crate::runtime::{Imp, Runtime, read, write};

/// A selector the module refers to.
#[derive(Debug, Clone, Copy)]
pub struct SelectorReference {
    pub name: &'static str,
    pub types: Option<&'static str>,
}

#[derive(Debug, Clone, Copy)]
pub struct MethodDescriptor {
    pub name: &'static str,
    /// Signature; recorded on the selector when present.
    pub types: Option<&'static str>,
    pub imp: Imp,
}

#[derive(Debug, Clone, Copy)]
pub struct IvarDescriptor {
    pub name: &'static str,
    pub size: usize,
    pub align: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ClassDescriptor {
    pub name: &'static str,
    /// Superclass name; `None` for a root class.
    pub superclass: Option<&'static str>,
    pub instance_methods: &'static [MethodDescriptor],
    pub class_methods: &'static [MethodDescriptor],
    pub ivars: &'static [IvarDescriptor],
    /// Names of adopted protocols.
    pub protocols: &'static [&'static str],
    pub custom_refcounting: bool,
}

impl ClassDescriptor {
    /// A root class with nothing in it, for struct-update syntax.
    pub const EMPTY: ClassDescriptor = ClassDescriptor {
        name: "",
        superclass: None,
        instance_methods: &[],
        class_methods: &[],
        ivars: &[],
        protocols: &[],
        custom_refcounting: false,
    };
}

#[derive(Debug, Clone, Copy)]
pub struct CategoryDescriptor {
    pub name: &'static str,
    /// Name of the class to extend.
    pub class_name: &'static str,
    pub instance_methods: &'static [MethodDescriptor],
    pub class_methods: &'static [MethodDescriptor],
    pub protocols: &'static [&'static str],
}

impl CategoryDescriptor {
    pub const EMPTY: CategoryDescriptor = CategoryDescriptor {
        name: "",
        class_name: "",
        instance_methods: &[],
        class_methods: &[],
        protocols: &[],
    };
}

#[derive(Debug, Clone, Copy)]
pub struct ProtocolDescriptor {
    pub name: &'static str,
    /// Names of inherited protocols, registered earlier.
    pub parents: &'static [&'static str],
    pub required: &'static [SelectorReference],
    pub optional: &'static [SelectorReference],
}

/// Everything one compiled module contributes.
#[derive(Debug, Clone, Copy)]
pub struct ModuleDescriptor {
    pub name: &'static str,
    pub selectors: &'static [SelectorReference],
    pub protocols: &'static [ProtocolDescriptor],
    pub classes: &'static [ClassDescriptor],
    pub categories: &'static [CategoryDescriptor],
}

impl ModuleDescriptor {
    pub const EMPTY: ModuleDescriptor = ModuleDescriptor {
        name: "",
        selectors: &[],
        protocols: &[],
        classes: &[],
        categories: &[],
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ModuleId(u32);

/// A category waiting for its class.
pub(crate) struct PendingCategory {
    module: ModuleId,
    descriptor: &'static CategoryDescriptor,
}

/// A loaded module, consumed by [`Runtime::unload_module`].
#[derive(Debug)]
pub struct ModuleHandle {
    id: ModuleId,
    name: &'static str,
    classes: Vec<Class>,
    selectors: Vec<Sel>,
}

impl ModuleHandle {
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Classes this module registered (duplicates it lost are not listed).
    #[must_use]
    pub fn classes(&self) -> &[Class] {
        &self.classes
    }

    /// Interned selector references, in descriptor order.
    #[must_use]
    pub fn selectors(&self) -> &[Sel] {
        &self.selectors
    }
}

fn unloaded_imp(rt: &Runtime, receiver: Id, sel: Sel, _: &[usize]) -> usize {
    fatal!(
        "{receiver:?} sent '{}', whose implementation belongs to an unloaded module",
        rt.sel_name(sel)
    );
}

impl Runtime {
    fn intern_reference(&self, name: &str, types: Option<&str>) -> Result<Sel> {
        match types {
            Some(types) => self.intern_selector(name, types),
            None => Ok(self.selector(name)),
        }
    }

    fn build_methods(&self, list: &[MethodDescriptor], module: ModuleId) -> Result<Vec<Arc<Method>>> {
        list.iter()
            .map(|m| {
                let sel = self.intern_reference(m.name, m.types)?;
                Ok(Arc::new(Method::new(sel, m.imp, Some(module))))
            })
            .collect()
    }

    fn protocols_named(&self, reg: &Registry, names: &[&str]) -> Result<Vec<Protocol>> {
        names
            .iter()
            .map(|&name| {
                reg.protocols.get(name).cloned().ok_or_else(|| Error::UnknownProtocol {
                    name: name.to_string(),
                })
            })
            .collect()
    }

    /// Loads a module's metadata.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidEncoding`] for a malformed signature
    /// - [`Error::InvalidIvar`] for a bad ivar alignment or an ivar name
    ///   declared twice in one class
    /// - [`Error::UnknownProtocol`] for a protocol name that is neither
    ///   registered nor declared by the module
    ///
    /// Errors are detected before anything is registered.
    ///
    /// # Panics
    ///
    /// Panics on conflicting selector signatures or a cyclic superclass
    /// chain.
    pub fn load_module(&self, module: &'static ModuleDescriptor) -> Result<ModuleHandle> {
        let id = ModuleId(self.next_module_id.fetch_add(1, Ordering::Relaxed));

        let selectors = module
            .selectors
            .iter()
            .map(|r| self.intern_reference(r.name, r.types))
            .collect::<Result<Vec<_>>>()?;
        for category in module.categories {
            self.build_methods(category.instance_methods, id)?;
            self.build_methods(category.class_methods, id)?;
        }
        for proto in module.protocols {
            for r in proto.required.iter().chain(proto.optional) {
                self.intern_reference(r.name, r.types)?;
            }
        }
        for class in module.classes {
            self.build_methods(class.instance_methods, id)?;
            self.build_methods(class.class_methods, id)?;
            for (i, ivar) in class.ivars.iter().enumerate() {
                if !ivar.align.is_power_of_two() || ivar.align > MAX_IVAR_ALIGN {
                    return Err(Error::InvalidIvar {
                        name: ivar.name.to_string(),
                        reason: format!("alignment {} in class '{}' is not supported", ivar.align, class.name),
                    });
                }
                if class.ivars[..i].iter().any(|prior| prior.name == ivar.name) {
                    return Err(Error::InvalidIvar {
                        name: ivar.name.to_string(),
                        reason: format!("declared twice in class '{}'", class.name),
                    });
                }
            }
        }
        self.check_protocol_names(module)?;

        for proto in module.protocols {
            let protocol = match self.protocol(proto.name) {
                Some(existing) => existing,
                None => {
                    let parents = self.protocols_named(&read(&self.registry), proto.parents)?;
                    self.create_protocol(proto.name, &parents)?
                }
            };
            for r in proto.required {
                protocol.add_required(self.intern_reference(r.name, r.types)?);
            }
            for r in proto.optional {
                protocol.add_optional(self.intern_reference(r.name, r.types)?);
            }
        }

        let mut built = Vec::with_capacity(module.classes.len());
        for desc in module.classes {
            built.push(self.build_class(desc, id)?);
        }

        let (resolved, handle) = {
            let mut reg = write(&self.registry);
            let mut classes = Vec::with_capacity(built.len());
            for class in built {
                if self.enter_name_table(&mut reg, class) {
                    classes.push(class);
                }
            }
            for category in module.categories {
                reg.pending_categories.push(PendingCategory {
                    module: id,
                    descriptor: category,
                });
            }
            let resolved = self.settle(&mut reg);
            for pending in reg.pending_categories.iter().filter(|p| p.module == id) {
                warn!(
                    "category '{}' buffered until class '{}' is loaded",
                    pending.descriptor.name, pending.descriptor.class_name
                );
            }
            info!("loaded module '{}' ({} classes)", module.name, classes.len());
            let handle = ModuleHandle {
                id,
                name: module.name,
                classes,
                selectors,
            };
            (resolved, handle)
        };
        self.run_loads(&resolved);
        Ok(handle)
    }

    fn check_protocol_names(&self, module: &ModuleDescriptor) -> Result<()> {
        let reg = read(&self.registry);
        let known = |name: &str| {
            reg.protocols.contains_key(name) || module.protocols.iter().any(|p| p.name == name)
        };
        let names = module
            .protocols
            .iter()
            .flat_map(|p| p.parents.iter())
            .chain(module.classes.iter().flat_map(|c| c.protocols.iter()))
            .chain(module.categories.iter().flat_map(|c| c.protocols.iter()));
        for &name in names {
            if !known(name) {
                return Err(Error::UnknownProtocol {
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }

    fn build_class(&self, desc: &ClassDescriptor, module: ModuleId) -> Result<Class> {
        let parent = desc.superclass.map_or(Parent::Root, Parent::Named);
        let extra = if desc.custom_refcounting { flags::CUSTOM_RC } else { 0 };
        let class = self.new_class_pair(desc.name, parent, extra, Some(module));
        for ivar in desc.ivars {
            self.add_ivar(class, ivar.name, ivar.size, ivar.align)?;
        }
        for method in self.build_methods(desc.instance_methods, module)? {
            class.push_method(method);
        }
        for method in self.build_methods(desc.class_methods, module)? {
            class.metaclass().push_method(method);
        }
        let protocols = self.protocols_named(&read(&self.registry), desc.protocols)?;
        write(&class.inner().protocols).extend(protocols);
        Ok(class)
    }

    fn category_parts(
        &self,
        reg: &Registry,
        desc: &CategoryDescriptor,
        module: ModuleId,
    ) -> Result<CategoryParts> {
        Ok(CategoryParts {
            name: desc.name.to_string(),
            instance_methods: self.build_methods(desc.instance_methods, module)?,
            class_methods: self.build_methods(desc.class_methods, module)?,
            protocols: self.protocols_named(reg, desc.protocols)?,
        })
    }

    /// Merges every buffered category whose class is now registered.
    /// Registry write lock must be held.
    pub(crate) fn retry_pending_categories(&self, reg: &mut Registry) {
        if reg.pending_categories.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut reg.pending_categories);
        for entry in pending {
            let Some(&class) = reg.by_name.get(entry.descriptor.class_name) else {
                reg.pending_categories.push(entry);
                continue;
            };
            let desc = entry.descriptor;
            if has_category(class, desc.name) {
                warn!("category '{}' already merged into '{}'; skipped", desc.name, class.name());
                continue;
            }
            match self.category_parts(reg, desc, entry.module) {
                Ok(parts) => self.attach_category(class, parts),
                Err(err) => warn!("category '{}' dropped: {err}", desc.name),
            }
        }
    }

    /// Unloads a module: its implementations become faulting stubs, its
    /// classes are unregistered and its buffered categories are dropped.
    pub fn unload_module(&self, handle: ModuleHandle) {
        let mut reg = write(&self.registry);
        let records: Vec<Class> = reg
            .classes
            .iter()
            .flat_map(|&c| [c, c.metaclass()])
            .collect();

        let mut stubbed = 0usize;
        for record in records {
            for method in record.own_methods() {
                if method.module() == Some(handle.id) {
                    method.replace(unloaded_imp);
                    self.refresh_slots(record, &method);
                    stubbed += 1;
                }
            }
        }

        for &class in &handle.classes {
            if !class.is_disposed() {
                self.unregister_locked(&mut reg, class);
            }
        }
        reg.pending_categories.retain(|p| p.module != handle.id);
        debug!(
            "unloaded module '{}' ({} implementations stubbed, {} classes)",
            handle.name,
            stubbed,
            handle.classes.len()
        );
    }
}
