// src/trace.rs
use std::cell::RefCell;

/// Observability hooks for the scheduler, scopes and promises.
///
/// Every method has a no-op default; implementations pick the events they
/// care about. Hooks must not call back into the engine.
pub trait Tracer {
    fn on_asap(&mut self, _pending: usize) {}
    fn on_physical_tick(&mut self) {}
    fn on_drain_pass(&mut self, _batch: usize) {}
    fn on_tick_finalized(&mut self, _unhandled: usize) {}

    fn on_scope_new(&mut self, _id: u64, _parent: u64) {}
    fn on_scope_switch(&mut self, _from: u64, _to: u64) {}
    fn on_scope_finalize(&mut self, _id: u64) {}

    fn on_promise_new(&mut self, _id: u64) {}
    fn on_settle(&mut self, _id: u64, _fulfilled: bool) {}
    fn on_listener_scheduled(&mut self, _promise: u64) {}
    fn on_listener_done(&mut self, _promise: u64) {}

    fn on_unhandled(&mut self, _promise: u64, _name: &str) {}
}

pub struct LogTracer;
impl Tracer for LogTracer {
    fn on_physical_tick(&mut self) {
        eprintln!("[tick]");
    }
    fn on_drain_pass(&mut self, batch: usize) {
        eprintln!("[drain] batch={batch}");
    }
    fn on_tick_finalized(&mut self, unhandled: usize) {
        eprintln!("[tick_end] unhandled={unhandled}");
    }
    fn on_scope_new(&mut self, id: u64, parent: u64) {
        eprintln!("[scope] {id} parent={parent}");
    }
    fn on_scope_finalize(&mut self, id: u64) {
        eprintln!("[scope_done] {id}");
    }
    fn on_promise_new(&mut self, id: u64) {
        eprintln!("[promise] {id}");
    }
    fn on_settle(&mut self, id: u64, fulfilled: bool) {
        eprintln!(
            "[settle] {id} => {}",
            if fulfilled { "fulfilled" } else { "rejected" }
        );
    }
    fn on_unhandled(&mut self, promise: u64, name: &str) {
        eprintln!("[unhandled] promise={promise} {name}");
    }
}

/// Stores trace lines in memory instead of printing; handy for asserting
/// on event ordering in tests.
pub struct BufferTracer {
    lines: Vec<String>,
}

impl BufferTracer {
    pub fn new() -> Self {
        Self { lines: Vec::new() }
    }
    pub fn push(&mut self, s: impl Into<String>) {
        self.lines.push(s.into());
    }
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
    pub fn take(self) -> Vec<String> {
        self.lines
    }
}

impl Default for BufferTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer for BufferTracer {
    fn on_physical_tick(&mut self) {
        self.push("[tick]");
    }
    fn on_drain_pass(&mut self, batch: usize) {
        self.push(format!("[drain] batch={batch}"));
    }
    fn on_tick_finalized(&mut self, unhandled: usize) {
        self.push(format!("[tick_end] unhandled={unhandled}"));
    }
    fn on_scope_new(&mut self, id: u64, parent: u64) {
        self.push(format!("[scope] {id} parent={parent}"));
    }
    fn on_scope_switch(&mut self, from: u64, to: u64) {
        self.push(format!("[switch] {from} -> {to}"));
    }
    fn on_scope_finalize(&mut self, id: u64) {
        self.push(format!("[scope_done] {id}"));
    }
    fn on_settle(&mut self, id: u64, fulfilled: bool) {
        self.push(format!(
            "[settle] {id} => {}",
            if fulfilled { "fulfilled" } else { "rejected" }
        ));
    }
    fn on_listener_scheduled(&mut self, promise: u64) {
        self.push(format!("[listener+] {promise}"));
    }
    fn on_listener_done(&mut self, promise: u64) {
        self.push(format!("[listener-] {promise}"));
    }
    fn on_unhandled(&mut self, promise: u64, name: &str) {
        self.push(format!("[unhandled] promise={promise} {name}"));
    }
}

thread_local! {
    static TRACER: RefCell<Option<Box<dyn Tracer>>> = const { RefCell::new(None) };
}

pub fn set_tracer(tracer: Box<dyn Tracer>) {
    TRACER.with(|t| *t.borrow_mut() = Some(tracer));
}

pub fn clear_tracer() -> Option<Box<dyn Tracer>> {
    TRACER.with(|t| t.borrow_mut().take())
}

#[inline]
pub(crate) fn with(f: impl FnOnce(&mut dyn Tracer)) {
    TRACER.with(|t| {
        if let Ok(mut slot) = t.try_borrow_mut() {
            if let Some(tracer) = slot.as_mut() {
                f(&mut **tracer);
            }
        }
    });
}
