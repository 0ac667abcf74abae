// src/promise.rs
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem;
use std::rc::Rc;

use crate::fault::{self, Fault};
use crate::ops;
use crate::scope::{self, Scope};
use crate::stacks;
use crate::tick;
use crate::trace;
use crate::unhandled;
use crate::value::Value;

/// Fulfillment handler: receives the upstream value, produces the derived
/// promise's resolution (a `Value::Promise` return is adopted).
pub type OnFulfilled = Box<dyn FnOnce(Value) -> Result<Value, Rc<Fault>>>;
/// Rejection handler: receives the upstream reason.
pub type OnRejected = Box<dyn FnOnce(Rc<Fault>) -> Result<Value, Rc<Fault>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

enum State {
    Pending,
    Fulfilled(Value),
    Rejected(Rc<Fault>),
}

/// A listener binds an optional handler pair to the promise that `then`
/// returned, plus the scope captured at `then` time.
struct Listener {
    on_fulfilled: Option<OnFulfilled>,
    on_rejected: Option<OnRejected>,
    target: Promise,
    scope: Scope,
}

enum Cb {
    F(OnFulfilled),
    R(OnRejected),
}

#[derive(Default)]
struct Diag {
    stack_holder: Option<Rc<std::backtrace::Backtrace>>,
    prev: Option<Promise>,
    num_prev: u32,
    cached_stack: Option<Rc<str>>,
}

struct PromiseInner {
    id: u64,
    scope: Scope,
    lib_mode: bool,
    state: RefCell<State>,
    listeners: RefCell<Vec<Listener>>,
    diag: RefCell<Diag>,
}

/// The thenable. Cloning the handle shares the underlying promise.
#[derive(Clone)]
pub struct Promise(Rc<PromiseInner>);

thread_local! {
    static NEXT_PROMISE_ID: Cell<u64> = const { Cell::new(1) };
    // The promise whose handler is presently executing; links successors in
    // the long-stack chain.
    static CURRENT_FULFILLER: RefCell<Option<Promise>> = const { RefCell::new(None) };
    // Reasons rejected during the currently running rejection handler; used
    // by the "same reason" rule.
    static REJECTING: RefCell<Vec<Rc<Fault>>> = const { RefCell::new(Vec::new()) };
}

impl Promise {
    fn allocate(lib_mode: bool) -> Promise {
        let id = NEXT_PROMISE_ID.with(|n| {
            let id = n.get();
            n.set(id + 1);
            id
        });
        let scope = scope::psd();
        scope.inc_ref();
        let p = Promise(Rc::new(PromiseInner {
            id,
            scope,
            lib_mode,
            state: RefCell::new(State::Pending),
            listeners: RefCell::new(Vec::new()),
            diag: RefCell::new(Diag::default()),
        }));
        if stacks::debug() {
            p.0.diag.borrow_mut().stack_holder = stacks::capture();
            let fulfiller = CURRENT_FULFILLER.with(|c| c.borrow().clone());
            p.link_to_previous(fulfiller.as_ref());
        }
        trace::with(|t| t.on_promise_new(id));
        p
    }

    /// Construct a promise and run the resolver synchronously. A resolver
    /// error rejects the promise with that reason.
    pub fn new(resolver: impl FnOnce(Resolve, Reject) -> Result<(), Rc<Fault>>) -> Promise {
        let p = Self::allocate(false);
        p.run_resolver(resolver);
        p
    }

    /// Trusted construction: settlement of this promise may drain the
    /// micro-tick queue synchronously beneath the resolve/reject caller.
    /// Only safe when that caller's stack contains nothing but library code.
    pub(crate) fn new_lib(
        resolver: impl FnOnce(Resolve, Reject) -> Result<(), Rc<Fault>>,
    ) -> Promise {
        let p = Self::allocate(true);
        p.run_resolver(resolver);
        p
    }

    fn run_resolver(&self, resolver: impl FnOnce(Resolve, Reject) -> Result<(), Rc<Fault>>) {
        let out = resolver(
            Resolve { target: self.clone() },
            Reject { target: self.clone() },
        );
        if let Err(reason) = out {
            self.handle_rejection(reason);
        }
    }

    fn internal_settled(outcome: Result<Value, Rc<Fault>>) -> Promise {
        let p = Self::allocate(false);
        match outcome {
            Ok(v) => p.execute_resolution(v),
            Err(f) => p.handle_rejection(f),
        }
        p
    }

    /// An already-fulfilled promise, or the input itself if it already is
    /// one; thenables are adopted.
    pub fn resolve(value: impl Into<Value>) -> Promise {
        match value.into() {
            Value::Promise(p) => p,
            Value::Thenable(t) => Promise::new(move |resolve, reject| {
                t.then(resolve, reject);
                Ok(())
            }),
            v => Self::internal_settled(Ok(v)),
        }
    }

    /// An already-rejected promise; the reason is tracked as unhandled
    /// until something observes it.
    pub fn reject(reason: Rc<Fault>) -> Promise {
        Self::internal_settled(Err(reason))
    }

    /// A pending promise plus its settlement capabilities, for callers that
    /// settle from outside a resolver body.
    pub fn with_resolvers() -> (Promise, Resolve, Reject) {
        let p = Self::allocate(false);
        let resolve = Resolve { target: p.clone() };
        let reject = Reject { target: p.clone() };
        (p, resolve, reject)
    }

    pub fn all(values: Vec<Value>) -> Promise {
        ops::all(values)
    }

    pub fn race(values: Vec<Value>) -> Promise {
        ops::race(values)
    }

    pub fn all_settled(values: Vec<Value>) -> Promise {
        ops::all_settled(values)
    }

    pub fn any(values: Vec<Value>) -> Promise {
        ops::any(values)
    }

    /// Run `body` in a child scope that captures every rejection left
    /// unhandled under it; the returned promise settles at tick end.
    pub fn follow(body: impl FnOnce() + 'static) -> Promise {
        ops::follow(body)
    }

    // ---------------- state ----------------

    #[inline]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    #[inline]
    pub fn same(a: &Promise, b: &Promise) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    pub fn state(&self) -> PromiseState {
        match &*self.0.state.borrow() {
            State::Pending => PromiseState::Pending,
            State::Fulfilled(_) => PromiseState::Fulfilled,
            State::Rejected(_) => PromiseState::Rejected,
        }
    }

    #[inline]
    fn is_pending(&self) -> bool {
        matches!(&*self.0.state.borrow(), State::Pending)
    }

    pub fn value(&self) -> Option<Value> {
        match &*self.0.state.borrow() {
            State::Fulfilled(v) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<Rc<Fault>> {
        match &*self.0.state.borrow() {
            State::Rejected(r) => Some(r.clone()),
            _ => None,
        }
    }

    pub fn outcome(&self) -> Option<Result<Value, Rc<Fault>>> {
        match &*self.0.state.borrow() {
            State::Pending => None,
            State::Fulfilled(v) => Some(Ok(v.clone())),
            State::Rejected(r) => Some(Err(r.clone())),
        }
    }

    #[inline]
    pub(crate) fn scope(&self) -> &Scope {
        &self.0.scope
    }

    // ---------------- resolution procedure ----------------

    pub(crate) fn execute_resolution(&self, value: Value) {
        if !self.is_pending() {
            return;
        }
        if let Value::Promise(other) = &value {
            if Promise::same(self, other) {
                self.handle_rejection(Fault::type_error(
                    "a promise cannot be resolved with itself",
                ));
                return;
            }
        }
        let should_tick = self.0.lib_mode && tick::begin_micro_tick_scope();
        match value {
            Value::Promise(other) => {
                // Adopt the native promise's eventual state through a
                // forwarding listener (no handlers, target = self).
                propagate_to_listener(
                    &other,
                    Listener {
                        on_fulfilled: None,
                        on_rejected: None,
                        target: self.clone(),
                        scope: scope::psd(),
                    },
                );
            }
            Value::Thenable(thenable) => {
                // Invoked once; a misbehaving thenable calling back more
                // than once is ignored by the terminal-state check.
                thenable.then(
                    Resolve { target: self.clone() },
                    Reject { target: self.clone() },
                );
            }
            v => {
                *self.0.state.borrow_mut() = State::Fulfilled(v);
                trace::with(|t| t.on_settle(self.0.id, true));
                self.propagate_all_listeners();
            }
        }
        if should_tick {
            tick::end_micro_tick_scope();
        }
    }

    pub(crate) fn handle_rejection(&self, reason: Rc<Fault>) {
        let reason = fault::map_reason(reason);
        REJECTING.with(|r| r.borrow_mut().push(reason.clone()));
        if !self.is_pending() {
            return;
        }
        let should_tick = self.0.lib_mode && tick::begin_micro_tick_scope();
        *self.0.state.borrow_mut() = State::Rejected(reason.clone());
        trace::with(|t| t.on_settle(self.0.id, false));
        if stacks::debug() {
            reason.link_promise(self);
        }
        unhandled::add_possibly_unhandled(self, &reason);
        self.propagate_all_listeners();
        if should_tick {
            tick::end_micro_tick_scope();
        }
    }

    /// Drain the listener queue exactly once, release the construction
    /// charge on the owning scope, and make sure the tick still finalizes
    /// when nothing was scheduled.
    fn propagate_all_listeners(&self) {
        let listeners = mem::take(&mut *self.0.listeners.borrow_mut());
        for listener in listeners {
            propagate_to_listener(self, listener);
        }
        self.0.scope.dec_ref();
        tick::nudge_tick_end();
    }

    // ---------------- then family ----------------

    /// The core `then`: registers a listener with the given handler pair
    /// and returns the derived promise.
    pub fn then_listener(
        &self,
        on_fulfilled: Option<OnFulfilled>,
        on_rejected: Option<OnRejected>,
    ) -> Promise {
        let listener_scope = scope::psd();
        let upstream = self.clone();
        let rv = Promise::new(move |resolve, _reject| {
            propagate_to_listener(
                &upstream,
                Listener {
                    on_fulfilled,
                    on_rejected,
                    target: resolve.target,
                    scope: listener_scope,
                },
            );
            Ok(())
        });
        if stacks::debug() {
            rv.link_to_previous(Some(self));
        }
        rv
    }

    pub fn then<F>(&self, on_fulfilled: F) -> Promise
    where
        F: FnOnce(Value) -> Result<Value, Rc<Fault>> + 'static,
    {
        self.then_listener(Some(Box::new(on_fulfilled)), None)
    }

    pub fn then_catch<F, G>(&self, on_fulfilled: F, on_rejected: G) -> Promise
    where
        F: FnOnce(Value) -> Result<Value, Rc<Fault>> + 'static,
        G: FnOnce(Rc<Fault>) -> Result<Value, Rc<Fault>> + 'static,
    {
        self.then_listener(Some(Box::new(on_fulfilled)), Some(Box::new(on_rejected)))
    }

    pub fn catch<G>(&self, on_rejected: G) -> Promise
    where
        G: FnOnce(Rc<Fault>) -> Result<Value, Rc<Fault>> + 'static,
    {
        self.then_listener(None, Some(Box::new(on_rejected)))
    }

    /// Catch only reasons whose name matches; anything else flows through
    /// unobserved.
    pub fn catch_named<G>(&self, name: impl Into<String>, handler: G) -> Promise
    where
        G: FnOnce(Rc<Fault>) -> Result<Value, Rc<Fault>> + 'static,
    {
        let name = name.into();
        self.catch(move |reason| {
            if reason.name() == name {
                handler(reason)
            } else {
                Err(reason)
            }
        })
    }

    /// Catch only reasons carrying a payload of type `T`.
    pub fn catch_type<T, G>(&self, handler: G) -> Promise
    where
        T: Any,
        G: FnOnce(Rc<Fault>) -> Result<Value, Rc<Fault>> + 'static,
    {
        self.catch(move |reason| {
            if reason.payload::<T>().is_some() {
                handler(reason)
            } else {
                Err(reason)
            }
        })
    }

    /// Run `on_finally` on either outcome; the outcome itself flows through
    /// unchanged (a rejection stays unobserved).
    pub fn finally<F>(&self, on_finally: F) -> Promise
    where
        F: Fn() + 'static,
    {
        let f = Rc::new(on_finally);
        let g = f.clone();
        self.then_listener(
            Some(Box::new(move |v| {
                f();
                Ok(v)
            })),
            Some(Box::new(move |e| {
                g();
                Err(e)
            })),
        )
    }

    // ---------------- diagnostics ----------------

    pub(crate) fn link_to_previous(&self, prev: Option<&Promise>) {
        if let Some(prev) = prev {
            let num_prev = prev.0.diag.borrow().num_prev + 1;
            if num_prev < stacks::LONG_STACKS_CLIP_LIMIT {
                let mut d = self.0.diag.borrow_mut();
                d.prev = Some(prev.clone());
                d.num_prev = num_prev;
            }
        }
    }

    /// The long stack: this promise's captured stack joined with its
    /// ancestors' (up to 20), cached once terminal. Empty when diagnostics
    /// are off.
    pub fn stack(&self) -> String {
        if let Some(cached) = &self.0.diag.borrow().cached_stack {
            return cached.to_string();
        }
        let mut frames = Vec::new();
        let mut cur = Some(self.clone());
        while let Some(p) = cur {
            if frames.len() == stacks::MAX_LONG_STACKS {
                break;
            }
            let d = p.0.diag.borrow();
            if let Some(holder) = &d.stack_holder {
                frames.push(stacks::pretty(holder));
            }
            cur = d.prev.clone();
        }
        let joined = frames.join("\nFrom previous:");
        if !self.is_pending() {
            self.0.diag.borrow_mut().cached_stack = Some(Rc::from(joined.as_str()));
        }
        joined
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Promise#{}({:?})", self.0.id, self.state())
    }
}

/// Resolve capability handed to resolver bodies and foreign thenables.
#[derive(Clone)]
pub struct Resolve {
    pub(crate) target: Promise,
}

impl Resolve {
    pub fn call(&self, value: impl Into<Value>) {
        self.target.execute_resolution(value.into());
    }
}

/// Reject capability handed to resolver bodies and foreign thenables.
#[derive(Clone)]
pub struct Reject {
    pub(crate) target: Promise,
}

impl Reject {
    pub fn call(&self, reason: Rc<Fault>) {
        self.target.handle_rejection(reason);
    }
}

/// Tick-end hygiene: the rejections-during-callback list is only ever read
/// while a rejection handler runs, so it can be dropped wholesale here.
pub(crate) fn clear_rejecting_errors() {
    REJECTING.with(|r| r.borrow_mut().clear());
}

// ---------------- listener dispatch ----------------

fn propagate_to_listener(upstream: &Promise, listener: Listener) {
    enum Snapshot {
        Pending,
        F(Value),
        R(Rc<Fault>),
    }
    let snapshot = match &*upstream.0.state.borrow() {
        State::Pending => Snapshot::Pending,
        State::Fulfilled(v) => Snapshot::F(v.clone()),
        State::Rejected(r) => Snapshot::R(r.clone()),
    };
    match snapshot {
        Snapshot::Pending => upstream.0.listeners.borrow_mut().push(listener),
        Snapshot::F(v) => match listener.on_fulfilled {
            // No handler for this event: forward to the derived promise so
            // the value propagates through handler-less links.
            None => listener.target.execute_resolution(v),
            Some(cb) => dispatch(Cb::F(cb), upstream.clone(), listener.target, listener.scope),
        },
        Snapshot::R(r) => match listener.on_rejected {
            None => listener.target.handle_rejection(r),
            Some(cb) => dispatch(Cb::R(cb), upstream.clone(), listener.target, listener.scope),
        },
    }
}

fn dispatch(cb: Cb, upstream: Promise, target: Promise, scope: Scope) {
    scope.inc_ref();
    tick::charge_scheduled_call();
    trace::with(|t| t.on_listener_scheduled(upstream.id()));
    tick::asap(Box::new(move || call_listener(cb, upstream, target, scope)));
}

fn call_listener(cb: Cb, upstream: Promise, target: Promise, scope: Scope) {
    {
        let _zone = scope::enter(&scope);
        CURRENT_FULFILLER.with(|c| *c.borrow_mut() = Some(upstream.clone()));
        let outcome = match cb {
            Cb::F(f) => {
                let value = upstream.value().expect("dispatched without fulfillment");
                f(value)
            }
            Cb::R(f) => {
                let reason = upstream.reason().expect("dispatched without rejection");
                REJECTING.with(|r| r.borrow_mut().clear());
                let out = f(reason.clone());
                // A handler that completed without re-rejecting the same
                // reason has observed the error; a different rejection or a
                // plain value propagates but clears the report.
                let rejected_same = REJECTING
                    .with(|r| r.borrow().iter().any(|e| Rc::ptr_eq(e, &reason)))
                    || matches!(&out, Err(e) if Rc::ptr_eq(e, &reason));
                if !rejected_same {
                    unhandled::mark_error_as_handled(&reason);
                }
                out
            }
        };
        match outcome {
            Ok(v) => target.execute_resolution(v),
            Err(e) => target.handle_rejection(e),
        }
        CURRENT_FULFILLER.with(|c| *c.borrow_mut() = None);
    }
    trace::with(|t| t.on_listener_done(upstream.id()));
    tick::discharge_scheduled_call();
    scope.dec_ref();
}
