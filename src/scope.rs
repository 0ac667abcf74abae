// src/scope.rs
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::fault::Fault;
use crate::guard::{MicroTickGuard, OnDrop};
use crate::promise::Promise;
use crate::trace;
use crate::value::AnyRc;
use crate::wrappers::{self, Env};

pub(crate) type UnhandledList = Rc<RefCell<Vec<Rc<Fault>>>>;
pub(crate) type Sink = Rc<dyn Fn(Rc<Fault>, Promise)>;
type FinalizeHook = Box<dyn FnOnce(&Scope)>;

/// A reference-counted ambient context (promise-scoped data) propagated
/// along continuation chains. Cloning the handle shares the scope.
#[derive(Clone)]
pub struct Scope(Rc<ScopeInner>);

struct ScopeInner {
    id: u64,
    global: bool,
    parent: Option<Scope>,
    ref_count: Cell<usize>,
    finalized: Cell<bool>,
    on_finalize: RefCell<Option<FinalizeHook>>,
    // Shared with the parent unless a fresh list was installed (follow).
    unhandleds: UnhandledList,
    onunhandled: Option<Sink>,
    env: RefCell<Env>,
    data: Option<AnyRc>,
}

/// Overrides applied to a scope created by [`new_scope_with`].
#[derive(Default)]
pub struct ScopeProps {
    data: Option<AnyRc>,
    pub(crate) unhandleds: Option<UnhandledList>,
    pub(crate) onunhandled: Option<Sink>,
    pub(crate) on_finalize: Option<FinalizeHook>,
}

impl ScopeProps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach user data readable through [`Scope::data`] anywhere in the
    /// scope's continuation chain (the slot consumers use to pin a live
    /// transaction to the chain).
    pub fn data(mut self, data: AnyRc) -> Self {
        self.data = Some(data);
        self
    }
}

thread_local! {
    static NEXT_SCOPE_ID: Cell<u64> = const { Cell::new(1) };
    static CURRENT: RefCell<Scope> = RefCell::new(Scope::new_root());
}

impl Scope {
    fn new_root() -> Scope {
        Scope(Rc::new(ScopeInner {
            id: 0,
            global: true,
            parent: None,
            ref_count: Cell::new(0),
            finalized: Cell::new(false),
            on_finalize: RefCell::new(None),
            unhandleds: Rc::new(RefCell::new(Vec::new())),
            onunhandled: None,
            env: RefCell::new(Vec::new()),
            data: None,
        }))
    }

    fn child(parent: &Scope, props: ScopeProps) -> Scope {
        let id = NEXT_SCOPE_ID.with(|n| {
            let id = n.get();
            n.set(id + 1);
            id
        });
        let scope = Scope(Rc::new(ScopeInner {
            id,
            global: false,
            parent: Some(parent.clone()),
            ref_count: Cell::new(0),
            finalized: Cell::new(false),
            on_finalize: RefCell::new(props.on_finalize),
            unhandleds: props
                .unhandleds
                .unwrap_or_else(|| parent.0.unhandleds.clone()),
            onunhandled: props.onunhandled,
            env: RefCell::new(wrappers::wrap_all()),
            data: props.data,
        }));
        trace::with(|t| t.on_scope_new(id, parent.id()));
        scope
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    #[inline]
    pub fn is_global(&self) -> bool {
        self.0.global
    }

    #[inline]
    pub fn parent(&self) -> Option<Scope> {
        self.0.parent.clone()
    }

    /// User data installed via [`ScopeProps::data`], searched up the chain.
    pub fn data(&self) -> Option<AnyRc> {
        let mut cur = Some(self.clone());
        while let Some(s) = cur {
            if let Some(d) = &s.0.data {
                return Some(d.clone());
            }
            cur = s.parent();
        }
        None
    }

    #[inline]
    pub fn same(a: &Scope, b: &Scope) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    #[inline]
    pub(crate) fn ref_count(&self) -> usize {
        self.0.ref_count.get()
    }

    #[inline]
    pub(crate) fn inc_ref(&self) {
        self.0.ref_count.set(self.0.ref_count.get() + 1);
    }

    pub(crate) fn dec_ref(&self) {
        let r = self.0.ref_count.get();
        debug_assert!(r > 0, "scope ref underflow");
        self.0.ref_count.set(r - 1);
        if r == 1 {
            self.finalize();
        }
    }

    /// Runs at most once: the chained hook first, then the cascade that
    /// releases this scope's charge on its parent.
    pub(crate) fn finalize(&self) {
        if self.0.finalized.replace(true) {
            return;
        }
        trace::with(|t| t.on_scope_finalize(self.0.id));
        if let Some(hook) = self.0.on_finalize.borrow_mut().take() {
            hook(self);
        }
        if let Some(parent) = &self.0.parent {
            parent.dec_ref();
        }
    }

    /// The nearest sink on the parent chain, if any; `None` means the
    /// process-wide default handler applies.
    pub(crate) fn effective_onunhandled(&self) -> Option<Sink> {
        let mut cur = Some(self.clone());
        while let Some(s) = cur {
            if let Some(sink) = &s.0.onunhandled {
                return Some(sink.clone());
            }
            cur = s.parent();
        }
        None
    }

    #[inline]
    pub(crate) fn unhandleds(&self) -> UnhandledList {
        self.0.unhandleds.clone()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Scope#{}{}",
            self.0.id,
            if self.0.global { " (global)" } else { "" }
        )
    }
}

/// The currently active scope.
pub fn psd() -> Scope {
    CURRENT.with(|c| c.borrow().clone())
}

/// Park the outgoing scope's wrapper environment and install the incoming
/// one. The PSD pointer itself moves between the two steps so wrappers
/// always see a consistent current scope.
fn switch_to_zone(target: &Scope) {
    let outgoing = psd();
    if Scope::same(&outgoing, target) {
        return;
    }
    trace::with(|t| t.on_scope_switch(outgoing.id(), target.id()));
    *outgoing.0.env.borrow_mut() = wrappers::snapshot_all();
    CURRENT.with(|c| *c.borrow_mut() = target.clone());
    wrappers::restore_all(&target.0.env.borrow());
}

/// Run `f` with `scope` active; the previous scope (and its wrapper
/// environment) is restored on every exit path.
pub fn use_psd<R>(scope: &Scope, f: impl FnOnce() -> R) -> R {
    let outer = psd();
    let switched = !Scope::same(&outer, scope);
    if switched {
        switch_to_zone(scope);
    }
    let _restore = OnDrop::new(move || {
        if switched {
            switch_to_zone(&outer);
        }
    });
    f()
}

/// RAII alternative to [`use_psd`]: the returned guard restores the
/// previous scope when dropped.
pub fn enter(scope: &Scope) -> ScopeEntered {
    let outer = psd();
    if Scope::same(&outer, scope) {
        ScopeEntered { outer: None }
    } else {
        switch_to_zone(scope);
        ScopeEntered { outer: Some(outer) }
    }
}

pub struct ScopeEntered {
    outer: Option<Scope>,
}

impl Drop for ScopeEntered {
    fn drop(&mut self) {
        if let Some(outer) = self.outer.take() {
            switch_to_zone(&outer);
        }
    }
}

/// Create a child scope of the current one and run `f` under it.
///
/// The child holds a charge on its parent for its lifetime. If nothing kept
/// the child alive by the time the body returns (no promise constructed
/// under it is still pending), it finalizes immediately.
pub fn new_scope<R>(f: impl FnOnce() -> R) -> R {
    new_scope_with(ScopeProps::new(), f)
}

pub fn new_scope_with<R>(props: ScopeProps, f: impl FnOnce() -> R) -> R {
    let parent = psd();
    let child = Scope::child(&parent, props);
    parent.inc_ref();
    let rv = use_psd(&child, f);
    if child.ref_count() == 0 {
        child.finalize();
    }
    rv
}

/// Capture the current scope and return a callable that reenters it.
///
/// Each invocation opens a micro-tick scope (draining on close when it is
/// the root frame), switches to the captured scope, and runs `f`. A failure
/// is routed to `error_catcher` and swallowed; the callable then yields
/// `None`.
pub fn wrap<A, R, F>(
    mut f: F,
    mut error_catcher: Option<Box<dyn FnMut(Rc<Fault>)>>,
) -> impl FnMut(A) -> Option<R>
where
    F: FnMut(A) -> Result<R, Rc<Fault>>,
{
    let captured = psd();
    move |arg: A| {
        let _tick = MicroTickGuard::enter();
        let out = use_psd(&captured, || f(arg));
        match out {
            Ok(v) => Some(v),
            Err(e) => {
                if let Some(catcher) = error_catcher.as_mut() {
                    catcher(e);
                }
                None
            }
        }
    }
}
