// src/ops/race.rs
use std::cell::RefCell;
use std::rc::Rc;

use crate::fault::{Fault, AGGREGATE_ERROR};
use crate::promise::Promise;
use crate::value::Value;

/// Settle with whichever input settles first. An empty input never
/// settles.
pub fn race(values: Vec<Value>) -> Promise {
    Promise::new(move |resolve, reject| {
        for value in values {
            let resolve = resolve.clone();
            let reject = reject.clone();
            Promise::resolve(value).then_catch(
                move |v| {
                    resolve.call(v);
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

/// Resolve with the first fulfillment; once every input has rejected,
/// reject with an aggregate reason carrying each input's reason in input
/// order.
pub fn any(values: Vec<Value>) -> Promise {
    Promise::new(move |resolve, reject| {
        if values.is_empty() {
            reject.call(Rc::new(Fault::with_payload(
                AGGREGATE_ERROR,
                "all promises were rejected",
                Vec::<Rc<Fault>>::new(),
            )));
            return Ok(());
        }
        let reasons = Rc::new(RefCell::new((
            vec![None::<Rc<Fault>>; values.len()],
            values.len(),
        )));
        for (i, value) in values.into_iter().enumerate() {
            let resolve = resolve.clone();
            let reject = reject.clone();
            let reasons = reasons.clone();
            Promise::resolve(value).then_catch(
                move |v| {
                    resolve.call(v);
                    Ok(Value::Unit)
                },
                move |e| {
                    let mut state = reasons.borrow_mut();
                    if state.0[i].is_none() {
                        state.0[i] = Some(e);
                        state.1 -= 1;
                    }
                    if state.1 == 0 {
                        let collected: Vec<Rc<Fault>> =
                            state.0.iter_mut().map(|r| r.take().unwrap()).collect();
                        drop(state);
                        reject.call(Rc::new(Fault::with_payload(
                            AGGREGATE_ERROR,
                            "all promises were rejected",
                            collected,
                        )));
                    }
                    Ok(Value::Unit)
                },
            );
        }
        Ok(())
    })
}
