// src/ops/all.rs
use std::cell::RefCell;
use std::rc::Rc;

use crate::fault::Fault;
use crate::promise::Promise;
use crate::value::Value;

/// How one input of [`all_settled`] ended up.
#[derive(Debug, Clone)]
pub enum Settlement {
    Fulfilled(Value),
    Rejected(Rc<Fault>),
}

struct CountdownState {
    results: Vec<Option<Value>>,
    remaining: usize,
}

/// Resolve with every input's value, in input order, once all fulfill;
/// reject with the first rejection.
pub fn all(values: Vec<Value>) -> Promise {
    Promise::new(move |resolve, reject| {
        if values.is_empty() {
            resolve.call(Value::list(Vec::new()));
            return Ok(());
        }
        let state = Rc::new(RefCell::new(CountdownState {
            results: vec![None; values.len()],
            remaining: values.len(),
        }));
        for (i, value) in values.into_iter().enumerate() {
            let state = state.clone();
            let resolve = resolve.clone();
            let reject = reject.clone();
            Promise::resolve(value).then_catch(
                move |v| {
                    let mut s = state.borrow_mut();
                    if s.results[i].is_none() {
                        s.results[i] = Some(v);
                        s.remaining -= 1;
                    }
                    if s.remaining == 0 {
                        let collected = s.results.iter_mut().map(|r| r.take().unwrap()).collect();
                        drop(s);
                        resolve.call(Value::list(collected));
                    }
                    Ok(Value::Unit)
                },
                move |e| {
                    reject.call(e);
                    Ok(Value::Unit)
                },
            );
        }
        Ok(())
    })
}

/// Resolve with one [`Settlement`] per input, in input order; never
/// rejects.
pub fn all_settled(values: Vec<Value>) -> Promise {
    Promise::new(move |resolve, _reject| {
        if values.is_empty() {
            resolve.call(Value::list(Vec::new()));
            return Ok(());
        }
        let state = Rc::new(RefCell::new(CountdownState {
            results: vec![None; values.len()],
            remaining: values.len(),
        }));
        for (i, value) in values.into_iter().enumerate() {
            let settle = {
                let state = state.clone();
                let resolve = resolve.clone();
                move |settlement: Settlement| {
                    let mut s = state.borrow_mut();
                    if s.results[i].is_none() {
                        s.results[i] = Some(Value::any(settlement));
                        s.remaining -= 1;
                    }
                    if s.remaining == 0 {
                        let collected = s.results.iter_mut().map(|r| r.take().unwrap()).collect();
                        drop(s);
                        resolve.call(Value::list(collected));
                    }
                }
            };
            let on_rejected = {
                let settle = settle.clone();
                move |e: Rc<Fault>| {
                    settle(Settlement::Rejected(e));
                    Ok(Value::Unit)
                }
            };
            Promise::resolve(value).then_catch(
                move |v| {
                    settle(Settlement::Fulfilled(v));
                    Ok(Value::Unit)
                },
                on_rejected,
            );
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::PromiseState;
    use crate::tick::run;

    #[test]
    fn all_collects_in_input_order() {
        let (slow, resolve_slow, _r) = Promise::with_resolvers();
        let p = all(vec![
            Value::Promise(slow),
            Value::Promise(Promise::resolve(2)),
            Value::from(3),
        ]);
        run();
        assert_eq!(p.state(), PromiseState::Pending);
        resolve_slow.call(1);
        run();
        let out = p.value().unwrap();
        let items = out.as_list().unwrap().to_vec();
        let got: Vec<i64> = items.iter().map(|v| v.as_int().unwrap()).collect();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn all_rejects_with_first_rejection() {
        let p = all(vec![
            Value::Promise(Promise::resolve(1)),
            Value::Promise(Promise::reject(Rc::new(Fault::new("E", "nope")))),
        ]);
        let tail = p.catch(|e| Ok(Value::from(e.message().to_owned())));
        run();
        assert_eq!(tail.value().unwrap().as_str(), Some("nope"));
    }

    #[test]
    fn all_of_empty_resolves_immediately() {
        let p = all(Vec::new());
        run();
        assert_eq!(p.value().unwrap().as_list().unwrap().len(), 0);
    }

    #[test]
    fn all_settled_reports_both_outcomes() {
        let p = all_settled(vec![
            Value::from(7),
            Value::Promise(Promise::reject(Rc::new(Fault::new("E", "down")))),
        ]);
        run();
        let out = p.value().unwrap();
        let items = out.as_list().unwrap();
        match items[0].downcast_ref::<Settlement>().unwrap() {
            Settlement::Fulfilled(v) => assert_eq!(v.as_int(), Some(7)),
            other => panic!("expected fulfillment, got {other:?}"),
        }
        match items[1].downcast_ref::<Settlement>().unwrap() {
            Settlement::Rejected(e) => assert_eq!(e.message(), "down"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
