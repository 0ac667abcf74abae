// src/fault.rs
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use thiserror::Error;

use crate::promise::Promise;
use crate::stacks;
use crate::value::AnyRc;

/// Error name used for resolution-procedure violations.
pub const TYPE_ERROR: &str = "TypeError";
/// Error name used when every input of `any` rejects.
pub const AGGREGATE_ERROR: &str = "AggregateError";

/// A rejection reason.
///
/// Reasons are shared by `Rc` and compared by identity: the unhandled
/// tracker dedups on the pointer, and the "same reason" rule in listener
/// dispatch checks whether a handler re-rejected the identical reason.
#[derive(Error)]
#[error("{name}: {message}")]
pub struct Fault {
    name: Box<str>,
    message: Box<str>,
    payload: Option<AnyRc>,
    // Diagnostic back-pointer to the promise first rejected with this
    // reason; lets `stack()` render the long stack.
    promise: RefCell<Option<Promise>>,
    trace: Option<Rc<Backtrace>>,
    mapped: Cell<bool>,
    // Set once a scope sink has taken ownership of this reason; it never
    // reenters the process-wide unhandled list afterwards.
    consumed: Cell<bool>,
}

impl Fault {
    pub fn new(name: impl Into<Box<str>>, message: impl Into<Box<str>>) -> Fault {
        Fault {
            name: name.into(),
            message: message.into(),
            payload: None,
            promise: RefCell::new(None),
            trace: stacks::capture(),
            mapped: Cell::new(false),
            consumed: Cell::new(false),
        }
    }

    pub fn with_payload<T: Any>(
        name: impl Into<Box<str>>,
        message: impl Into<Box<str>>,
        payload: T,
    ) -> Fault {
        let mut f = Fault::new(name, message);
        f.payload = Some(Rc::new(payload));
        f
    }

    pub fn type_error(message: impl Into<Box<str>>) -> Rc<Fault> {
        Rc::new(Fault::new(TYPE_ERROR, message))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[inline]
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref::<T>())
    }

    /// The diagnostic stack: the owning promise's long stack when one was
    /// linked (debug mode), else the trace captured at construction, else
    /// the display form.
    pub fn stack(&self) -> String {
        if let Some(p) = self.promise.borrow().as_ref() {
            return p.stack();
        }
        match &self.trace {
            Some(bt) => format!("{self}{}", stacks::pretty(bt)),
            None => self.to_string(),
        }
    }

    #[inline]
    pub(crate) fn mark_consumed(&self) {
        self.consumed.set(true);
    }

    #[inline]
    pub(crate) fn is_consumed(&self) -> bool {
        self.consumed.get()
    }

    #[inline]
    pub(crate) fn link_promise(&self, promise: &Promise) {
        let mut slot = self.promise.borrow_mut();
        if slot.is_none() {
            *slot = Some(promise.clone());
        }
    }
}

impl std::fmt::Debug for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fault({}: {})", self.name, self.message)
    }
}

thread_local! {
    static MAPPER: RefCell<Option<Rc<dyn Fn(Rc<Fault>) -> Rc<Fault>>>> =
        const { RefCell::new(None) };
}

/// Install a rejection mapper, invoked once per reason at first rejection
/// (e.g. to normalize foreign error shapes). Mapped reasons are flagged and
/// never re-mapped, so identity-based dedup of the unhandled list stays
/// stable even when the mapper allocates a fresh reason.
pub fn set_rejection_mapper(mapper: impl Fn(Rc<Fault>) -> Rc<Fault> + 'static) {
    MAPPER.with(|m| *m.borrow_mut() = Some(Rc::new(mapper)));
}

pub fn clear_rejection_mapper() {
    MAPPER.with(|m| *m.borrow_mut() = None);
}

pub(crate) fn map_reason(reason: Rc<Fault>) -> Rc<Fault> {
    if reason.mapped.replace(true) {
        return reason;
    }
    let mapper = MAPPER.with(|m| m.borrow().clone());
    match mapper {
        Some(map) => {
            let out = map(reason);
            out.mapped.set(true);
            out
        }
        None => reason,
    }
}
