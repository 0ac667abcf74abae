//! # STRAND
//! User-space promise chains with ambient scopes and a reentrant
//! micro-tick scheduler.
//!
//! This crate provides a thenable whose continuations drain inside a single
//! host task, so that downstream transactional I/O observes reentry while
//! its window is still live, together with promise-scoped data (PSD):
//! an implicitly propagated, reference-counted context that follows the
//! logical chain of continuations across asynchronous boundaries.
//!
//! ## Architectural Principles
//! * **One host task, whole subtree:** a chain registered during a drain is
//!   serviced before control returns to the host loop.
//! * **Ambient scopes:** continuations observe the scope captured where
//!   they were registered, with wrapper state saved and restored around
//!   every transition.
//! * **Deterministic accounting:** scopes are reference-counted and
//!   finalize exactly once; unhandled rejections are reported exactly once,
//!   at tick end, to the owning scope's sink.

pub mod fault;
pub mod guard;
mod macros;
pub mod ops;
pub mod promise;
pub mod scope;
pub mod stacks;
pub mod tick;
pub mod trace;
pub mod unhandled;
pub mod value;
pub mod wrappers;

pub use fault::{clear_rejection_mapper, set_rejection_mapper, Fault};
pub use guard::OnDrop;
pub use ops::Settlement;
pub use promise::{OnFulfilled, OnRejected, Promise, PromiseState, Reject, Resolve};
pub use scope::{
    enter, new_scope, new_scope_with, psd, use_psd, wrap, Scope, ScopeEntered, ScopeProps,
};
pub use stacks::set_debug;
pub use tick::{clear_scheduler, physical_tick, run, set_scheduler, HostTask};
pub use trace::{clear_tracer, set_tracer, BufferTracer, LogTracer, Tracer};
pub use unhandled::{off_error, on_error, ErrorOutcome};
pub use value::{AnyRc, Thenable, Value};
pub use wrappers::{add as add_wrapper, Env, EnvSlot, Wrapper};
