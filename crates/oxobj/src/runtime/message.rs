//! Message resolution, receiver substitution and forwarding.
//!
//! [`Runtime::resolve`] maps a receiver and selector to an implementation:
//!
//! 1. nil receiver: an implementation returning zero (float-returning
//!    selectors are fatal, there is no float zero in a machine word)
//! 2. fast path: lock-free lookup in the receiver class's installed table
//! 3. slow path: run the initialize protocol and look again (the look-aside
//!    table serves the initializing thread)
//! 4. receiver substitution: per-class hooks (walking up the superclasses),
//!    then the runtime-wide hook; a new receiver restarts the lookup,
//!    bounded by [`RuntimeConfig::max_forwarding_depth`]
//! 5. the forwarding hook, which must return an implementation; without one
//!    the receiver does not recognize the selector, which is fatal
//!
//! [`RuntimeConfig::max_forwarding_depth`]: crate::RuntimeConfig::max_forwarding_depth

use std::sync::Arc;

use oxobj_log::trace;

use crate::error::fatal;
use crate::runtime::class::Class;
use crate::runtime::dispatch::sign;
use crate::runtime::encoding::ReturnKind;
use crate::runtime::object::Id;
use crate::runtime::selector::Sel;
use crate::runtime::{Imp, Runtime, read, write};

/// Offers a replacement receiver for a selector the receiver lacks.
pub type SubstitutionHook = Arc<dyn Fn(&Runtime, Id, Sel) -> Option<Id> + Send + Sync>;

/// Last resort for an unrecognized selector: returns the implementation to
/// run in place of the missing method.
pub type ForwardHook = Arc<dyn Fn(&Runtime, Id, Sel) -> Imp + Send + Sync>;

fn nil_imp(_: &Runtime, _: Id, _: Sel, _: &[usize]) -> usize {
    0
}

/// Default forwarding target.
fn does_not_recognize(rt: &Runtime, receiver: Id, sel: Sel, _: &[usize]) -> usize {
    match rt.object_class(receiver) {
        Some(class) => fatal!(
            "{}[{} {}]: does not recognize selector",
            sign(class),
            class.name(),
            rt.sel_name(sel)
        ),
        None => fatal!("{receiver:?} does not recognize selector '{}'", rt.sel_name(sel)),
    }
}

impl Runtime {
    /// Resolves the implementation `receiver` runs for `sel`.
    ///
    /// `receiver` is updated when a substitution hook supplies a new one; the
    /// returned implementation must be called with the updated value.
    ///
    /// # Panics
    ///
    /// Panics (through the default forwarding target) when nothing answers
    /// `sel`, when substitution exceeds the configured depth, or when a
    /// float-returning selector is sent to nil.
    pub fn resolve(&self, receiver: &mut Id, sel: Sel) -> Imp {
        let Some(class) = self.receiver_class(*receiver, sel) else {
            return nil_imp;
        };
        if let Some(slot) = class.inner().dtable.load().lookup(sel.as_u32()) {
            return slot.imp;
        }
        self.resolve_slow(receiver, class, sel)
    }

    fn receiver_class(&self, receiver: Id, sel: Sel) -> Option<Class> {
        if receiver.is_nil() {
            if self.selectors.return_kind(sel) == ReturnKind::Float {
                fatal!("float-returning selector '{}' sent to nil", self.sel_name(sel));
            }
            return None;
        }
        match self.object_class(receiver) {
            Some(class) => Some(class),
            None => fatal!("{receiver:?} has no class (unregistered tagged index)"),
        }
    }

    #[cold]
    fn resolve_slow(&self, receiver: &mut Id, mut class: Class, sel: Sel) -> Imp {
        let mut depth = 0;
        loop {
            self.ensure_initialized(class);
            if let Some(slot) = self.table_snapshot(class).lookup(sel.as_u32()) {
                return slot.imp;
            }

            let Some(next) = self.substitute(*receiver, class, sel) else {
                break;
            };
            depth += 1;
            if depth > self.config.max_forwarding_depth {
                fatal!(
                    "forwarding loop: {}[{} {}] substituted {depth} times",
                    sign(class),
                    class.name(),
                    self.sel_name(sel)
                );
            }
            trace!("substituted {next:?} for {:?} on '{}'", *receiver, self.sel_name(sel));
            *receiver = next;
            let Some(next_class) = self.receiver_class(next, sel) else {
                return nil_imp;
            };
            class = next_class;
            if let Some(slot) = class.inner().dtable.load().lookup(sel.as_u32()) {
                return slot.imp;
            }
        }

        let hook = read(&self.forward_hook).clone();
        match hook {
            Some(hook) => hook(self, *receiver, sel),
            None => does_not_recognize,
        }
    }

    fn substitute(&self, receiver: Id, class: Class, sel: Sel) -> Option<Id> {
        let mut current = Some(class);
        while let Some(c) = current {
            let hook = read(&c.inner().substitution).clone();
            if let Some(next) = hook.and_then(|hook| hook(self, receiver, sel)) {
                return Some(next);
            }
            current = c.superclass().filter(|sup| sup.is_metaclass() == c.is_metaclass());
        }
        let hook = read(&self.substitution_hook).clone();
        hook.and_then(|hook| hook(self, receiver, sel))
    }

    /// Sends `sel` to `receiver` with `args`.
    pub fn send(&self, receiver: Id, sel: Sel, args: &[usize]) -> usize {
        let mut receiver = receiver;
        let imp = self.resolve(&mut receiver, sel);
        imp(self, receiver, sel, args)
    }

    /// Sends `sel` to `receiver`, starting the lookup at the superclass of
    /// `class` (the class whose method is making the call; pass the
    /// metaclass from a class method).
    pub fn send_super(&self, class: Class, receiver: Id, sel: Sel, args: &[usize]) -> usize {
        if receiver.is_nil() {
            return nil_imp(self, receiver, sel, args);
        }
        self.ensure_initialized(class);
        let slot = class
            .superclass()
            .and_then(|sup| self.table_snapshot(sup).lookup(sel.as_u32()).cloned());
        let imp = match slot {
            Some(slot) => slot.imp,
            None => {
                let hook = read(&self.forward_hook).clone();
                hook.map_or(does_not_recognize as Imp, |hook| hook(self, receiver, sel))
            }
        };
        imp(self, receiver, sel, args)
    }

    /// Returns true if `receiver`'s class has an implementation for `sel`.
    /// Does not consult substitution or forwarding.
    #[must_use]
    pub fn responds_to(&self, receiver: Id, sel: Sel) -> bool {
        self.object_class(receiver)
            .is_some_and(|class| self.lookup_slot(class, sel).is_some())
    }

    /// Installs or clears the runtime-wide substitution hook.
    pub fn set_substitution_hook(&self, hook: Option<SubstitutionHook>) {
        *write(&self.substitution_hook) = hook;
    }

    /// Installs or clears the substitution hook of one class. It serves
    /// instances of the class and of its subclasses; pass the metaclass for
    /// class-object receivers.
    pub fn set_class_substitution_hook(&self, class: Class, hook: Option<SubstitutionHook>) {
        *write(&class.inner().substitution) = hook;
    }

    /// Installs or clears the forwarding hook.
    pub fn set_forward_hook(&self, hook: Option<ForwardHook>) {
        *write(&self.forward_hook) = hook;
    }
}
