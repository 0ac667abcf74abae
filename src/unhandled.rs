// src/unhandled.rs
use std::cell::RefCell;
use std::rc::Rc;

use crate::fault::Fault;
use crate::promise::Promise;
use crate::trace;

/// What an on-error listener decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOutcome {
    /// Keep going; later listeners and the default handler still run.
    Propagate,
    /// Stop: the rejection is considered dealt with.
    Handled,
}

type ErrorListener = Rc<dyn Fn(&Rc<Fault>, &Promise) -> ErrorOutcome>;

thread_local! {
    // Rejected promises with no rejection handler observed yet, deduped by
    // reason identity. The first rejection wins the slot so the root cause
    // of a chain is the one reported.
    static UNHANDLED: RefCell<Vec<(Rc<Fault>, Promise)>> = const { RefCell::new(Vec::new()) };
    static LISTENERS: RefCell<Vec<(u64, ErrorListener)>> = const { RefCell::new(Vec::new()) };
    static NEXT_LISTENER_ID: RefCell<u64> = const { RefCell::new(1) };
}

pub(crate) fn add_possibly_unhandled(promise: &Promise, reason: &Rc<Fault>) {
    if reason.is_consumed() {
        return;
    }
    UNHANDLED.with(|u| {
        let mut u = u.borrow_mut();
        if !u.iter().any(|(r, _)| Rc::ptr_eq(r, reason)) {
            u.push((reason.clone(), promise.clone()));
        }
    });
}

/// A rejection handler actually observed this reason: drop every pending
/// report carrying it.
pub(crate) fn mark_error_as_handled(reason: &Rc<Fault>) {
    UNHANDLED.with(|u| u.borrow_mut().retain(|(r, _)| !Rc::ptr_eq(r, reason)));
}

/// Deliver every pending report: to the nearest scope sink on the owning
/// scope's parent chain when one is installed, else to the process-wide
/// handler. Returns the number of reports delivered.
pub(crate) fn fire_pending() -> usize {
    let pending = UNHANDLED.with(|u| std::mem::take(&mut *u.borrow_mut()));
    let count = pending.len();
    for (reason, promise) in pending {
        trace::with(|t| t.on_unhandled(promise.id(), reason.name()));
        match promise.scope().effective_onunhandled() {
            Some(sink) => {
                // The scope consumes the rejection: record it on the
                // scope-local list for end-of-scope checks and keep it off
                // the process-wide list for good.
                reason.mark_consumed();
                promise.scope().unhandleds().borrow_mut().push(reason.clone());
                sink(reason, promise);
            }
            None => global_error(&reason, &promise),
        }
    }
    count
}

/// Subscribe to unhandled rejections that reach the process-wide handler.
/// Returning [`ErrorOutcome::Handled`] suppresses the default warning and
/// any later listener.
pub fn on_error(listener: impl Fn(&Rc<Fault>, &Promise) -> ErrorOutcome + 'static) -> u64 {
    let id = NEXT_LISTENER_ID.with(|n| {
        let mut n = n.borrow_mut();
        let id = *n;
        *n += 1;
        id
    });
    LISTENERS.with(|l| l.borrow_mut().push((id, Rc::new(listener))));
    id
}

pub fn off_error(id: u64) {
    LISTENERS.with(|l| l.borrow_mut().retain(|(lid, _)| *lid != id));
}

pub(crate) fn global_error(reason: &Rc<Fault>, promise: &Promise) {
    let listeners: Vec<ErrorListener> =
        LISTENERS.with(|l| l.borrow().iter().map(|(_, f)| f.clone()).collect());
    for listener in listeners {
        if listener(reason, promise) == ErrorOutcome::Handled {
            return;
        }
    }
    let stack = reason.stack();
    if stack.is_empty() {
        log::warn!("Unhandled rejection: {reason}");
    } else {
        log::warn!("Unhandled rejection: {stack}");
    }
}
