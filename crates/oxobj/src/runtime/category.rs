//! Categories: method and protocol bundles merged into an existing class.
//!
//! A category's methods take precedence over the class's own methods and
//! over earlier categories (its method list is placed first). Merging
//! patches the dispatch tables the class and its subclasses have already
//! built, skipping subclasses that override a selector.
//!
//! # Example
//!
//! ```
//! use oxobj::{CategoryBuilder, Id, Runtime, RuntimeConfig, Sel};
//!
//! fn shout(_: &Runtime, _: Id, _: Sel, _: &[usize]) -> usize {
//!     1
//! }
//!
//! let rt = Runtime::new(RuntimeConfig::default());
//! let class = rt.create_class(None, "Greeter").unwrap();
//! rt.register_class(class);
//!
//! let sel = rt.selector("shout");
//! rt.add_category(class, CategoryBuilder::new("Loud").instance_method(sel, shout))
//!     .unwrap();
//! assert_eq!(rt.categories(class), vec!["Loud".to_string()]);
//! assert_eq!(rt.new_object(class).send(sel, &[]), 1);
//! ```

use std::sync::Arc;

use oxobj_log::debug;

use crate::error::{Error, Result};
use crate::runtime::class::{Class, ListSource, Method, MethodList};
use crate::runtime::protocol::Protocol;
use crate::runtime::selector::Sel;
use crate::runtime::{Imp, Runtime, read, write};

/// Methods and protocols to merge into a class with
/// [`Runtime::add_category`].
#[derive(Debug, Clone)]
pub struct CategoryBuilder {
    name: String,
    instance_methods: Vec<(Sel, Imp)>,
    class_methods: Vec<(Sel, Imp)>,
    protocols: Vec<Protocol>,
}

impl CategoryBuilder {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            instance_methods: Vec::new(),
            class_methods: Vec::new(),
            protocols: Vec::new(),
        }
    }

    #[must_use]
    pub fn instance_method(mut self, sel: Sel, imp: Imp) -> Self {
        self.instance_methods.push((sel, imp));
        self
    }

    #[must_use]
    pub fn class_method(mut self, sel: Sel, imp: Imp) -> Self {
        self.class_methods.push((sel, imp));
        self
    }

    #[must_use]
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocols.push(protocol);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A category ready to merge.
pub(crate) struct CategoryParts {
    pub(crate) name: String,
    pub(crate) instance_methods: Vec<Arc<Method>>,
    pub(crate) class_methods: Vec<Arc<Method>>,
    pub(crate) protocols: Vec<Protocol>,
}

impl CategoryParts {
    fn from_builder(builder: CategoryBuilder) -> Self {
        let methods = |list: Vec<(Sel, Imp)>| {
            list.into_iter()
                .map(|(sel, imp)| Arc::new(Method::new(sel, imp, None)))
                .collect()
        };
        Self {
            name: builder.name,
            instance_methods: methods(builder.instance_methods),
            class_methods: methods(builder.class_methods),
            protocols: builder.protocols,
        }
    }
}

pub(crate) fn has_category(class: Class, name: &str) -> bool {
    read(&class.inner().method_lists)
        .iter()
        .any(|list| matches!(&list.source, ListSource::Category(n) if &**n == name))
}

impl Runtime {
    /// Merges a category into `class` (a metaclass names its class).
    ///
    /// # Errors
    ///
    /// Returns [`Error::CategoryAlreadyExists`] if a category with the same
    /// name was already merged into the class.
    pub fn add_category(&self, class: Class, category: CategoryBuilder) -> Result<()> {
        let class = class.instance_class();
        let _reg = write(&self.registry);
        if has_category(class, category.name()) {
            return Err(Error::CategoryAlreadyExists {
                class: class.name().to_string(),
                category: category.name,
            });
        }
        self.attach_category(class, CategoryParts::from_builder(category));
        Ok(())
    }

    /// Merges `parts` into `class`. Registry write lock must be held.
    pub(crate) fn attach_category(&self, class: Class, parts: CategoryParts) {
        let meta = class.metaclass();
        for (record, methods) in [(class, parts.instance_methods), (meta, parts.class_methods)] {
            write(&record.inner().method_lists).insert(
                0,
                MethodList {
                    source: ListSource::Category(parts.name.as_str().into()),
                    methods: methods.clone(),
                },
            );
            for method in &methods {
                // Only the first entry for a selector in this list wins.
                let winner = record.own_method(method.selector());
                if winner.as_ref().is_some_and(|w| Arc::ptr_eq(w, method)) {
                    self.install_down(record, record, method);
                }
            }
        }

        let mut adopted = write(&class.inner().protocols);
        for protocol in parts.protocols {
            if !adopted.contains(&protocol) {
                adopted.push(protocol);
            }
        }
        debug!("merged category '{}' into class '{}'", parts.name, class.name());
    }

    /// Names of the categories merged into `class`, newest first.
    #[must_use]
    pub fn categories(&self, class: Class) -> Vec<String> {
        read(&class.instance_class().inner().method_lists)
            .iter()
            .filter_map(|list| match &list.source {
                ListSource::Category(name) => Some(name.to_string()),
                ListSource::Class => None,
            })
            .collect()
    }
}
