// src/tick.rs
//
// Two-level scheduler: host "physical" ticks wrapping a reentrant
// "micro tick" drain. A chain of continuations enqueued during a drain is
// fully serviced within the same host task, which is what lets downstream
// transactional I/O observe reentry inside its live window.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::rc::Rc;

use crate::trace;
use crate::unhandled;

pub(crate) type Job = Box<dyn FnOnce()>;

/// A unit of work handed to the host-task scheduler.
pub type HostTask = Box<dyn FnOnce()>;

struct TickState {
    deferred: Vec<Job>,
    outside_micro_tick: bool,
    needs_new_physical_tick: bool,
    num_scheduled_calls: usize,
    finalizers: Vec<(u64, Rc<dyn Fn()>)>,
    next_finalizer_id: u64,
    // Host integration: either a user-installed scheduler or the built-in
    // queue drained by `run()`.
    scheduler: Option<Rc<dyn Fn(HostTask)>>,
    host_queue: VecDeque<HostTask>,
}

impl TickState {
    fn new() -> Self {
        Self {
            deferred: Vec::new(),
            outside_micro_tick: true,
            needs_new_physical_tick: true,
            num_scheduled_calls: 0,
            finalizers: Vec::new(),
            next_finalizer_id: 0,
            scheduler: None,
            host_queue: VecDeque::new(),
        }
    }
}

thread_local! {
    static TICK: RefCell<TickState> = RefCell::new(TickState::new());
}

/// Enqueue a deferred callback. Never runs it synchronously; arranges a
/// host task when the queue transitions from idle.
pub(crate) fn asap(job: Job) {
    let request = TICK.with(|t| {
        let mut t = t.borrow_mut();
        t.deferred.push(job);
        trace::with(|tr| tr.on_asap(t.deferred.len()));
        if t.needs_new_physical_tick {
            t.needs_new_physical_tick = false;
            true
        } else {
            false
        }
    });
    if request {
        request_host_task();
    }
}

fn request_host_task() {
    let scheduler = TICK.with(|t| t.borrow().scheduler.clone());
    match scheduler {
        Some(s) => s(Box::new(physical_tick)),
        None => TICK.with(|t| t.borrow_mut().host_queue.push_back(Box::new(physical_tick))),
    }
}

/// Replace the host-task mechanism. The replacement receives each requested
/// task and must eventually run it; it must preserve request order.
pub fn set_scheduler(scheduler: impl Fn(HostTask) + 'static) {
    TICK.with(|t| t.borrow_mut().scheduler = Some(Rc::new(scheduler)));
}

/// Restore the built-in queue drained by [`run`].
pub fn clear_scheduler() {
    TICK.with(|t| t.borrow_mut().scheduler = None);
}

/// Drive the built-in host-task queue until it is empty. Returns the number
/// of host tasks executed. This is the stand-in for the host event loop.
pub fn run() -> usize {
    let mut executed = 0;
    loop {
        let task = TICK.with(|t| t.borrow_mut().host_queue.pop_front());
        match task {
            Some(task) => {
                task();
                executed += 1;
            }
            None => return executed,
        }
    }
}

/// Entry point of a host task.
pub fn physical_tick() {
    trace::with(|tr| tr.on_physical_tick());
    if begin_micro_tick_scope() {
        end_micro_tick_scope();
    }
}

/// Returns true iff this call transitions from outside to inside a
/// micro-tick drain. When false, a drain is already running higher on the
/// stack and the caller must not drain.
pub(crate) fn begin_micro_tick_scope() -> bool {
    TICK.with(|t| {
        let mut t = t.borrow_mut();
        let was_outside = t.outside_micro_tick;
        t.outside_micro_tick = false;
        t.needs_new_physical_tick = false;
        was_outside
    })
}

/// Drain the deferred queue to empty. Each pass swaps the whole list out and
/// runs it; callbacks may enqueue further work, which lands in subsequent
/// passes of the same drain. Iterative on purpose: stack depth stays flat
/// under arbitrarily long chains.
pub(crate) fn end_micro_tick_scope() {
    loop {
        let batch = TICK.with(|t| mem::take(&mut t.borrow_mut().deferred));
        if batch.is_empty() {
            break;
        }
        trace::with(|tr| tr.on_drain_pass(batch.len()));
        for job in batch {
            job();
        }
    }
    TICK.with(|t| {
        let mut t = t.borrow_mut();
        t.outside_micro_tick = true;
        t.needs_new_physical_tick = true;
    });
}

/// Record a dispatch whose completion this host task must await.
#[inline]
pub(crate) fn charge_scheduled_call() {
    TICK.with(|t| t.borrow_mut().num_scheduled_calls += 1);
}

/// Complete a dispatch; the last one out finalizes the physical tick.
pub(crate) fn discharge_scheduled_call() {
    let last = TICK.with(|t| {
        let mut t = t.borrow_mut();
        debug_assert!(t.num_scheduled_calls > 0);
        t.num_scheduled_calls -= 1;
        t.num_scheduled_calls == 0
    });
    if last {
        finalize_physical_tick();
    }
}

/// Ensure a finalization pass happens this tick even when nothing else is
/// charged (a settlement with no scheduled listeners still has to report
/// unhandled rejections at tick end).
pub(crate) fn nudge_tick_end() {
    let idle = TICK.with(|t| t.borrow().num_scheduled_calls == 0);
    if idle {
        charge_scheduled_call();
        asap(Box::new(discharge_scheduled_call));
    }
}

/// Run `f` when the current physical tick finalizes, or at the end of the
/// next one if none is in flight.
pub(crate) fn run_at_end_of_this_or_next_physical_tick(f: Box<dyn FnOnce()>) {
    let id = TICK.with(|t| {
        let mut t = t.borrow_mut();
        let id = t.next_finalizer_id;
        t.next_finalizer_id += 1;
        id
    });
    let slot = RefCell::new(Some(f));
    let entry: Rc<dyn Fn()> = Rc::new(move || {
        if let Some(f) = slot.borrow_mut().take() {
            f();
        }
        remove_finalizer(id);
    });
    TICK.with(|t| t.borrow_mut().finalizers.push((id, entry)));
    charge_scheduled_call();
    asap(Box::new(discharge_scheduled_call));
}

fn remove_finalizer(id: u64) {
    TICK.with(|t| t.borrow_mut().finalizers.retain(|(fid, _)| *fid != id));
}

/// Fires pending unhandled-rejection reports, then the tick finalizers
/// (newest first, from a copy; entries remove themselves).
fn finalize_physical_tick() {
    let reported = unhandled::fire_pending();
    trace::with(|tr| tr.on_tick_finalized(reported));
    let finalizers: Vec<Rc<dyn Fn()>> =
        TICK.with(|t| t.borrow().finalizers.iter().map(|(_, f)| f.clone()).collect());
    for f in finalizers.iter().rev() {
        f();
    }
    crate::promise::clear_rejecting_errors();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    fn log_cell() -> StdRc<StdRefCell<Vec<i32>>> {
        StdRc::new(StdRefCell::new(Vec::new()))
    }

    #[test]
    fn asap_is_fifo_within_a_pass() {
        let log = log_cell();
        for i in 0..4 {
            let log = log.clone();
            asap(Box::new(move || log.borrow_mut().push(i)));
        }
        run();
        assert_eq!(*log.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn work_enqueued_during_drain_runs_in_same_host_task() {
        let log = log_cell();
        let inner = log.clone();
        asap(Box::new(move || {
            inner.borrow_mut().push(1);
            let inner2 = inner.clone();
            asap(Box::new(move || inner2.borrow_mut().push(2)));
        }));
        // One host task services both passes.
        assert_eq!(run(), 1);
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn begin_micro_tick_scope_reports_root_only_once() {
        assert!(begin_micro_tick_scope());
        assert!(!begin_micro_tick_scope());
        end_micro_tick_scope();
        assert!(begin_micro_tick_scope());
        end_micro_tick_scope();
    }

    #[test]
    fn finalizer_runs_at_tick_end_and_self_removes() {
        let log = log_cell();
        let l = log.clone();
        run_at_end_of_this_or_next_physical_tick(Box::new(move || l.borrow_mut().push(9)));
        run();
        assert_eq!(*log.borrow(), vec![9]);
        // A later tick does not re-run it.
        let l2 = log.clone();
        asap(Box::new(move || l2.borrow_mut().push(1)));
        run();
        assert_eq!(*log.borrow(), vec![9, 1]);
    }

    #[test]
    fn custom_scheduler_receives_host_tasks() {
        let handed: StdRc<StdRefCell<Vec<HostTask>>> = StdRc::new(StdRefCell::new(Vec::new()));
        let sink = handed.clone();
        set_scheduler(move |task| sink.borrow_mut().push(task));
        let log = log_cell();
        let l = log.clone();
        asap(Box::new(move || l.borrow_mut().push(5)));
        assert!(log.borrow().is_empty());
        let tasks: Vec<HostTask> = handed.borrow_mut().drain(..).collect();
        for task in tasks {
            task();
        }
        clear_scheduler();
        assert_eq!(*log.borrow(), vec![5]);
    }
}
