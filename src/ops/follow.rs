// src/ops/follow.rs
use std::cell::RefCell;
use std::rc::Rc;

use crate::promise::Promise;
use crate::scope::{self, ScopeProps};
use crate::tick;
use crate::value::Value;

/// Run `body` inside a child scope that owns every rejection left
/// unhandled beneath it.
///
/// The returned promise rejects with the first such rejection (consumed by
/// the scope, so the process-wide handler never sees it) and resolves at
/// the end of the tick in which the scope wound down with nothing
/// outstanding. The body takes no arguments: it participates purely by
/// creating promises under the scope.
pub fn follow(body: impl FnOnce() + 'static) -> Promise {
    Promise::new_lib(move |resolve, reject| {
        let unhandleds = Rc::new(RefCell::new(Vec::new()));

        let mut props = ScopeProps::new();
        props.unhandleds = Some(unhandleds.clone());
        let sink_reject = reject.clone();
        props.onunhandled = Some(Rc::new(move |reason, _promise| {
            sink_reject.call(reason);
        }));
        let fin_resolve = resolve.clone();
        let fin_reject = reject;
        props.on_finalize = Some(Box::new(move |_scope| {
            // The scope wound down; its verdict lands at tick end, after
            // any unhandled reports of this tick have been delivered.
            tick::run_at_end_of_this_or_next_physical_tick(Box::new(move || {
                let first = unhandleds.borrow().first().cloned();
                match first {
                    None => fin_resolve.call(Value::Unit),
                    Some(reason) => fin_reject.call(reason),
                }
            }));
        }));

        scope::new_scope_with(props, body);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::Fault;
    use crate::promise::PromiseState;
    use crate::tick::run;
    use crate::unhandled::{off_error, on_error, ErrorOutcome};
    use std::cell::Cell;

    #[test]
    fn clean_scope_resolves_at_tick_end() {
        let p = follow(|| {
            Promise::resolve(1).then(|_| Ok(Value::Unit));
        });
        run();
        assert_eq!(p.state(), PromiseState::Fulfilled);
    }

    #[test]
    fn unhandled_rejection_in_scope_rejects_the_follower() {
        let global_saw = Rc::new(Cell::new(false));
        let flag = global_saw.clone();
        let sub = on_error(move |_, _| {
            flag.set(true);
            ErrorOutcome::Handled
        });

        let p = follow(|| {
            Promise::reject(Rc::new(Fault::new("E", "x")));
        });
        assert_eq!(p.state(), PromiseState::Pending);
        run();
        assert_eq!(p.state(), PromiseState::Rejected);
        assert_eq!(p.reason().unwrap().message(), "x");
        // The scope consumed the rejection; the global handler stayed
        // silent.
        assert!(!global_saw.get());
        off_error(sub);
        // Observe the follower itself so nothing leaks into later ticks.
        p.catch(|_| Ok(Value::Unit));
        run();
    }

    #[test]
    fn caught_rejection_inside_scope_stays_clean() {
        let p = follow(|| {
            Promise::reject(Rc::new(Fault::new("E", "seen"))).catch(|_| Ok(Value::Unit));
        });
        run();
        assert_eq!(p.state(), PromiseState::Fulfilled);
    }

    #[test]
    fn waits_for_pending_work_in_scope() {
        let p = follow(|| {
            Promise::resolve(()).then(|_| Ok(Value::Unit)).then(|_| Ok(Value::Unit));
        });
        run();
        assert_eq!(p.state(), PromiseState::Fulfilled);
    }
}
