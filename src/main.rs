// src/main.rs (demo - chains, scopes, unhandled reporting)

use std::cell::RefCell;
use std::rc::Rc;

use strand::{
    fault, new_scope_with, psd, run, AnyRc, ErrorOutcome, Fault, LogTracer, Promise, ScopeProps,
    Value,
};

fn chain_demo() {
    println!("-- chain --");
    Promise::resolve(1)
        .then(|v| Ok(Value::from(v.as_int().unwrap() + 1)))
        .then(|v| {
            println!("chain produced {v:?}");
            Ok(Value::Unit)
        });
    run();
}

fn scope_demo() {
    println!("-- scope data --");
    let txn: AnyRc = Rc::new("txn-42".to_string());
    let tail = new_scope_with(ScopeProps::new().data(txn), || {
        // The handler below runs after the scope body returned, yet still
        // observes the scope it was registered under.
        Promise::resolve(()).then(|_| {
            let data = psd().data().expect("scope data travels with the chain");
            println!("handler sees {}", data.downcast_ref::<String>().unwrap());
            Ok(Value::Unit)
        })
    });
    run();
    assert!(tail.value().is_some());
    assert!(psd().data().is_none());
}

fn combinator_demo() {
    println!("-- all / race --");
    let all = strand::all_of![Promise::resolve(1), Promise::resolve(2), 3];
    let (slow, _resolve_slow, _reject_slow) = Promise::with_resolvers();
    let race = Promise::race(vec![
        Value::Promise(slow),
        Value::Promise(Promise::resolve("fast")),
    ]);
    run();
    println!("all  => {:?}", all.value().unwrap());
    println!("race => {:?}", race.value().unwrap());
}

fn unhandled_demo() {
    println!("-- unhandled reporting --");
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let sub = strand::on_error(move |reason, promise| {
        sink.borrow_mut()
            .push(format!("{} from {:?}", reason, promise));
        ErrorOutcome::Handled
    });

    Promise::reject(fault!("DemoError", "nobody caught promise {}", 1));
    Promise::reject(Rc::new(Fault::new("DemoError", "this one is caught")))
        .catch(|e| {
            println!("caught: {e}");
            Ok(Value::Unit)
        });
    run();
    for line in seen.borrow().iter() {
        println!("reported: {line}");
    }
    strand::off_error(sub);
}

fn follow_demo() {
    println!("-- follow --");
    let outcome = Promise::follow(|| {
        Promise::reject(fault!("TxnError", "rolled back"));
    });
    run();
    println!("follow => {:?}", outcome.reason().map(|r| r.to_string()));
    outcome.catch(|_| Ok(Value::Unit));
    run();
}

fn main() {
    if std::env::var("STRAND_TRACE").is_ok() {
        strand::set_tracer(Box::new(LogTracer));
    }
    chain_demo();
    scope_demo();
    combinator_demo();
    unhandled_demo();
    follow_demo();
}
