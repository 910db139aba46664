//! `cryo-vm` — the suspendable bytecode execution engine.
//!
//! The engine animates the `cryo-core` data model: closures enter through
//! the [`call`]/[`suspendable_call`] families, frames run under the dispatch
//! loop, and a suspendable run can pause at any host call boundary, parking
//! its whole call chain on the root closure for later resumption — in this
//! process or, via `cryo-snapshot`, in another one.

pub mod call;
mod dispatch;
pub mod stdlib;

pub use call::{
    call, call0, call1, call2, call3, invoke, on_invoke, suspendable_call, suspendable_call0,
    suspendable_call1, suspendable_call2, suspendable_call3, with_active_stack, CallMode,
    CallOutcome,
};
