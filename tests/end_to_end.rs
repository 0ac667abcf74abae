#![forbid(unsafe_code)]
//! End-to-end scenarios for the promise core: chain ordering, scope
//! propagation, combinators, and unhandled-rejection reporting, exercised
//! from outside the crate boundary.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use strand::{
    add_wrapper, fault, new_scope, on_error, psd, run, ErrorOutcome, Promise, PromiseState, Value,
    Wrapper,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn log_cell() -> Rc<RefCell<Vec<String>>> {
    Rc::new(RefCell::new(Vec::new()))
}

fn push(log: &Rc<RefCell<Vec<String>>>, s: impl Into<String>) {
    log.borrow_mut().push(s.into());
}

struct Reporter {
    reasons: Rc<RefCell<Vec<String>>>,
    sub: u64,
}

impl Reporter {
    fn install() -> Reporter {
        let reasons = log_cell();
        let sink = reasons.clone();
        let sub = on_error(move |reason, _promise| {
            sink.borrow_mut().push(reason.message().to_owned());
            ErrorOutcome::Handled
        });
        Reporter { reasons, sub }
    }

    fn reported(&self) -> Vec<String> {
        self.reasons.borrow().clone()
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        strand::off_error(self.sub);
    }
}

// ---------------------------------------------------------------------------
// A1/A2: basic settle and observe
// ---------------------------------------------------------------------------

#[test]
fn a1_resolver_value_reaches_handler_after_current_frame() {
    let reporter = Reporter::install();
    let log = log_cell();
    let l = log.clone();
    Promise::new(|resolve, _reject| {
        resolve.call(1);
        Ok(())
    })
    .then(move |v| {
        push(&l, format!("{}", v.as_int().unwrap() + 1));
        Ok(Value::Unit)
    });
    // Still within the current frame: nothing ran yet.
    assert!(log.borrow().is_empty());
    run();
    assert_eq!(*log.borrow(), vec!["2"]);
    assert!(reporter.reported().is_empty());
}

#[test]
fn a2_rejection_handler_consumes_the_reason() {
    let reporter = Reporter::install();
    let log = log_cell();
    let l = log.clone();
    Promise::new(|_resolve, reject| {
        reject.call(fault!("E", "e"));
        Ok(())
    })
    .catch(move |e| {
        push(&l, e.message());
        Ok(Value::Unit)
    });
    run();
    assert_eq!(*log.borrow(), vec!["e"]);
    assert!(reporter.reported().is_empty());
}

// ---------------------------------------------------------------------------
// A3/A4: combinators
// ---------------------------------------------------------------------------

#[test]
fn a3_all_mixes_promises_and_plain_values() {
    let p = Promise::all(vec![
        Value::Promise(Promise::resolve(1)),
        Value::Promise(Promise::resolve(2)),
        Value::from(3),
    ]);
    run();
    let out = p.value().unwrap();
    let got: Vec<i64> = out
        .as_list()
        .unwrap()
        .iter()
        .map(|v| v.as_int().unwrap())
        .collect();
    assert_eq!(got, vec![1, 2, 3]);
}

#[test]
fn a4_race_prefers_the_already_settled_input() {
    let (slow, resolve_slow, _reject_slow) = Promise::with_resolvers();
    let p = Promise::race(vec![
        Value::Promise(slow),
        Value::Promise(Promise::resolve("fast")),
    ]);
    run();
    assert_eq!(p.value().unwrap().as_str(), Some("fast"));
    resolve_slow.call("slow");
    run();
    assert_eq!(p.value().unwrap().as_str(), Some("fast"));
}

// ---------------------------------------------------------------------------
// A5: ambient scope propagation through a wrapper
// ---------------------------------------------------------------------------

thread_local! {
    static TAG: RefCell<Option<String>> = const { RefCell::new(None) };
    static TAG_WRAPPER_INSTALLED: Cell<bool> = const { Cell::new(false) };
}

struct TagWrapper;

impl Wrapper for TagWrapper {
    fn snapshot(&self) -> strand::EnvSlot {
        Rc::new(TAG.with(|t| t.borrow().clone()))
    }
    fn restore(&self, slot: &strand::EnvSlot) {
        if let Some(v) = slot.downcast_ref::<Option<String>>() {
            TAG.with(|t| *t.borrow_mut() = v.clone());
        }
    }
    fn wrap(&self) -> strand::EnvSlot {
        Rc::new(None::<String>)
    }
}

fn install_tag_wrapper() {
    TAG_WRAPPER_INSTALLED.with(|done| {
        if !done.replace(true) {
            add_wrapper(Rc::new(TagWrapper));
        }
    });
}

fn tag(value: &str) {
    TAG.with(|t| *t.borrow_mut() = Some(value.to_owned()));
}

fn read_tag() -> Option<String> {
    TAG.with(|t| t.borrow().clone())
}

#[test]
fn a5_scope_tag_visible_in_handler_but_cleared_outside() {
    install_tag_wrapper();
    let log = log_cell();
    let l = log.clone();
    let tail = new_scope(move || {
        tag("inside");
        Promise::resolve(()).then(move |_| {
            push(&l, read_tag().unwrap_or_else(|| "<missing>".into()));
            Ok(Value::Unit)
        })
    });
    // The body returned: the scope parked its wrapper state.
    assert_eq!(read_tag(), None);
    run();
    assert_eq!(*log.borrow(), vec!["inside"]);
    assert_eq!(read_tag(), None);
    assert_eq!(tail.state(), PromiseState::Fulfilled);
}

// ---------------------------------------------------------------------------
// A6/A7: unhandled reporting
// ---------------------------------------------------------------------------

#[test]
fn a6_uncaught_rejection_reports_exactly_once_at_tick_end() {
    let reporter = Reporter::install();
    Promise::reject(fault!("E", "boom"));
    assert!(reporter.reported().is_empty());
    run();
    assert_eq!(reporter.reported(), vec!["boom"]);
    run();
    assert_eq!(reporter.reported().len(), 1);
}

#[test]
fn a6_synchronous_catch_suppresses_the_report() {
    let reporter = Reporter::install();
    Promise::reject(fault!("E", "quiet")).catch(|_| Ok(Value::Unit));
    run();
    assert!(reporter.reported().is_empty());
}

#[test]
fn a7_follow_consumes_scope_rejections() {
    let reporter = Reporter::install();
    let outcome = Promise::follow(|| {
        Promise::reject(fault!("E", "x"));
    });
    assert_eq!(outcome.state(), PromiseState::Pending);
    run();
    assert_eq!(outcome.state(), PromiseState::Rejected);
    assert_eq!(outcome.reason().unwrap().message(), "x");
    assert!(reporter.reported().is_empty());
    outcome.catch(|_| Ok(Value::Unit));
    run();
}

// ---------------------------------------------------------------------------
// Ordering laws
// ---------------------------------------------------------------------------

#[test]
fn handlers_run_in_registration_order_per_promise() {
    let log = log_cell();
    let (p, resolve, _reject) = Promise::with_resolvers();
    for i in 0..5 {
        let l = log.clone();
        p.then(move |_| {
            push(&l, format!("h{i}"));
            Ok(Value::Unit)
        });
    }
    resolve.call(());
    run();
    assert_eq!(*log.borrow(), vec!["h0", "h1", "h2", "h3", "h4"]);
}

#[test]
fn whole_chain_drains_within_one_host_task() {
    let log = log_cell();
    let l = log.clone();
    Promise::resolve(0)
        .then(|v| Ok(Value::from(v.as_int().unwrap() + 1)))
        .then(|v| Ok(Value::from(v.as_int().unwrap() + 1)))
        .then(move |v| {
            push(&l, format!("{}", v.as_int().unwrap()));
            Ok(Value::Unit)
        });
    // A single host task services the entire chain.
    assert_eq!(run(), 1);
    assert_eq!(*log.borrow(), vec!["2"]);
}

#[test]
fn rejection_propagates_until_observed() {
    let reporter = Reporter::install();
    let log = log_cell();
    let l = log.clone();
    Promise::reject(fault!("E", "deep"))
        .then(|v| Ok(v))
        .then(|v| Ok(v))
        .catch(move |e| {
            push(&l, e.message());
            Ok(Value::Unit)
        });
    run();
    assert_eq!(*log.borrow(), vec!["deep"]);
    assert!(reporter.reported().is_empty());
}

#[test]
fn adoption_follows_a_late_thenable() {
    let (inner, resolve_inner, _reject_inner) = Promise::with_resolvers();
    let adopted = Promise::resolve(7).then(move |_| Ok(Value::Promise(inner.clone())));
    run();
    assert_eq!(adopted.state(), PromiseState::Pending);
    resolve_inner.call("finally here");
    run();
    assert_eq!(adopted.value().unwrap().as_str(), Some("finally here"));
}

// ---------------------------------------------------------------------------
// Diagnostics and mapping
// ---------------------------------------------------------------------------

#[test]
fn long_stack_links_across_the_chain_when_debug_is_on() {
    strand::set_debug(true);
    let tail = Promise::resolve(1)
        .then(|v| Ok(v))
        .then(|_| Err(fault!("E", "deep failure")));
    tail.catch(|_| Ok(Value::Unit));
    run();
    let stack = tail.stack();
    assert!(!stack.is_empty());
    assert!(stack.contains("From previous:"));
    // Terminal promises cache the rendering.
    assert_eq!(stack, tail.stack());
    strand::set_debug(false);
}

#[test]
fn rejection_mapper_normalizes_reasons_once() {
    let reporter = Reporter::install();
    strand::set_rejection_mapper(|r| {
        Rc::new(strand::Fault::new("Normalized", r.message().to_owned()))
    });
    let tail = Promise::reject(fault!("Raw", "shape"));
    run();
    strand::clear_rejection_mapper();
    assert_eq!(tail.reason().unwrap().name(), "Normalized");
    // Dedup stayed keyed on the mapped reason: exactly one report.
    assert_eq!(reporter.reported(), vec!["shape"]);
}

#[test]
fn scope_of_registration_governs_handler_ambience() {
    // Register handlers on the same upstream from two different scopes;
    // each handler observes the scope it was registered under.
    let log = log_cell();
    let (p, resolve, _reject) = Promise::with_resolvers();
    let root_id = psd().id();
    let l1 = log.clone();
    p.then(move |_| {
        push(&l1, format!("root={}", psd().id() == root_id));
        Ok(Value::Unit)
    });
    let l2 = log.clone();
    new_scope(|| {
        let scoped_id = psd().id();
        p.then(move |_| {
            push(&l2, format!("scoped={}", psd().id() == scoped_id));
            Ok(Value::Unit)
        })
    });
    resolve.call(());
    run();
    assert_eq!(*log.borrow(), vec!["root=true", "scoped=true"]);
}
