// src/wrappers.rs
use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

/// Opaque per-wrapper state slot; the core never looks inside.
pub type EnvSlot = Rc<dyn Any>;

/// Wrapper environment: one slot per registered wrapper, indexed by
/// registration order.
pub type Env = Vec<EnvSlot>;

/// A user-installed carrier of ambient state saved and restored around each
/// scope transition.
///
/// All three operations must be pure with respect to the core: they may be
/// called in any order and any number of times.
pub trait Wrapper {
    /// Capture the current ambient state.
    fn snapshot(&self) -> EnvSlot;
    /// Install a previously captured state.
    fn restore(&self, slot: &EnvSlot);
    /// Produce the initial state for a newborn scope.
    fn wrap(&self) -> EnvSlot;
}

thread_local! {
    static REGISTRY: RefCell<Vec<Rc<dyn Wrapper>>> = const { RefCell::new(Vec::new()) };
}

/// Register a wrapper. Addition-only; registration order is stable and is
/// the index order of every environment.
pub fn add(wrapper: Rc<dyn Wrapper>) {
    REGISTRY.with(|r| r.borrow_mut().push(wrapper));
}

pub(crate) fn snapshot_all() -> Env {
    REGISTRY.with(|r| r.borrow().iter().map(|w| w.snapshot()).collect())
}

pub(crate) fn restore_all(env: &Env) {
    REGISTRY.with(|r| {
        for (i, w) in r.borrow().iter().enumerate() {
            // Wrappers registered after this env was captured keep their
            // current state.
            if let Some(slot) = env.get(i) {
                w.restore(slot);
            }
        }
    });
}

pub(crate) fn wrap_all() -> Env {
    REGISTRY.with(|r| r.borrow().iter().map(|w| w.wrap()).collect())
}
