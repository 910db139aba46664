//! Closure call entry points and the suspend/resume protocol.
//!
//! Every entry computes `restore_or_create_stack`: a fresh invocation gets a
//! new [`ExecutionStack`]; a closure carrying a parked stack re-enters its
//! saved call chain instead. Inside a run, nested calls descend through
//! [`invoke`]/[`on_invoke`] on the same stack; a host suspension travels back
//! up the native call stack as the `Suspended` error signal, leaving every
//! engine frame pushed for later re-descent.

use crate::dispatch;
use cryo_core::{ExecutionStack, Frame, LuaClosure, LuaError, LuaValue, Varargs};
use std::cell::Cell;
use std::sync::Arc;

/// Which flavor of the dispatch loop a call runs under.
///
/// The two flavors execute the same opcode set; the mode decides whether a
/// host callable may suspend at a CALL/TFORCALL boundary or whether such a
/// request is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Sync,
    Suspendable,
}

/// Result of a suspendable root call.
#[derive(Debug)]
pub enum CallOutcome {
    /// The script ran to completion with these results.
    Completed(Varargs),
    /// A host callable suspended; the execution stack is parked on the root
    /// closure, ready to be serialized or resumed.
    Suspended,
}

// ── Root entry points ─────────────────────────────────────────────────────────

/// Synchronous variadic entry. Used when no suspendable host call can occur;
/// a suspension attempt surfaces as an error.
pub fn call(closure: &Arc<LuaClosure>, args: Varargs) -> Result<Varargs, LuaError> {
    let mut stack = restore_or_create_stack(closure);
    if stack.user_end_call {
        unwind_stopped(&mut stack);
        return Ok(Varargs::None);
    }
    let _guard = activate(&mut stack);
    invoke(closure, &mut stack, args, CallMode::Sync)
}

pub fn call0(closure: &Arc<LuaClosure>) -> Result<Varargs, LuaError> {
    call(closure, Varargs::None)
}

pub fn call1(closure: &Arc<LuaClosure>, a: LuaValue) -> Result<Varargs, LuaError> {
    call(closure, Varargs::Single(a))
}

pub fn call2(closure: &Arc<LuaClosure>, a: LuaValue, b: LuaValue) -> Result<Varargs, LuaError> {
    call(closure, Varargs::Flat(vec![a, b]))
}

pub fn call3(
    closure: &Arc<LuaClosure>,
    a: LuaValue,
    b: LuaValue,
    c: LuaValue,
) -> Result<Varargs, LuaError> {
    call(closure, Varargs::Flat(vec![a, b, c]))
}

/// Suspendable variadic entry: the root of every pausable invocation, both
/// the first run and each resume of a parked chain.
pub fn suspendable_call(
    closure: &Arc<LuaClosure>,
    args: Varargs,
) -> Result<CallOutcome, LuaError> {
    let mut stack = restore_or_create_stack(closure);
    if stack.user_end_call {
        // Tear-down requested: every frame was forced onto its RETURN
        // epilogue by stop(); unwind them innermost-first and finish.
        unwind_stopped(&mut stack);
        return Ok(CallOutcome::Completed(Varargs::None));
    }
    let result = {
        let _guard = activate(&mut stack);
        invoke(closure, &mut stack, args, CallMode::Suspendable)
    };
    match result {
        Ok(vals) => Ok(CallOutcome::Completed(vals)),
        Err(e) if e.is_suspend() => {
            // Park the chain on the root closure. The root value is re-set on
            // the next entry; dropping it here keeps the parked graph acyclic.
            stack.root = LuaValue::Nil;
            closure.attach_stack(stack);
            Ok(CallOutcome::Suspended)
        }
        Err(e) => Err(e),
    }
}

pub fn suspendable_call0(closure: &Arc<LuaClosure>) -> Result<CallOutcome, LuaError> {
    suspendable_call(closure, Varargs::None)
}

pub fn suspendable_call1(
    closure: &Arc<LuaClosure>,
    a: LuaValue,
) -> Result<CallOutcome, LuaError> {
    suspendable_call(closure, Varargs::Single(a))
}

pub fn suspendable_call2(
    closure: &Arc<LuaClosure>,
    a: LuaValue,
    b: LuaValue,
) -> Result<CallOutcome, LuaError> {
    suspendable_call(closure, Varargs::Flat(vec![a, b]))
}

pub fn suspendable_call3(
    closure: &Arc<LuaClosure>,
    a: LuaValue,
    b: LuaValue,
    c: LuaValue,
) -> Result<CallOutcome, LuaError> {
    suspendable_call(closure, Varargs::Flat(vec![a, b, c]))
}

// ── Inner call machinery ──────────────────────────────────────────────────────

/// Reattach a parked stack or start a fresh one.
fn restore_or_create_stack(closure: &Arc<LuaClosure>) -> ExecutionStack {
    let mut stack = closure
        .take_stack()
        .unwrap_or_else(|| ExecutionStack::new(LuaValue::Nil));
    stack.root = LuaValue::Closure(Arc::clone(closure));
    stack
}

/// General entry: runs the closure at the stack's current level, resolving
/// tail-call trampolines until a concrete bundle emerges.
pub fn invoke(
    closure: &Arc<LuaClosure>,
    stack: &mut ExecutionStack,
    args: Varargs,
    mode: CallMode,
) -> Result<Varargs, LuaError> {
    let mut result = on_invoke(closure, stack, args, mode)?;
    while let Varargs::Tailcall(tc) = result {
        result = match tc.callee {
            LuaValue::Closure(ref next) => on_invoke(next, stack, tc.args, mode)?,
            LuaValue::NativeFunction(f) => {
                dispatch::call_native(f, tc.args.to_vec(), mode)?.into()
            }
            ref other => return Err(LuaError::type_error("function", other.type_name())),
        };
    }
    Ok(result)
}

/// Raw entry: run one activation of `closure`, returning its results — which
/// may be a tail-call trampoline for [`invoke`] to resolve.
///
/// The frame for this activation is either created fresh or, when the stack
/// already holds one at the current level, reused as-is: that is the resume
/// path, where the saved registers and pc must not be disturbed.
pub fn on_invoke(
    closure: &Arc<LuaClosure>,
    stack: &mut ExecutionStack,
    args: Varargs,
    mode: CallMode,
) -> Result<Varargs, LuaError> {
    let level = stack.current_level;
    if !stack.has_frame_at(level) {
        debug_assert_eq!(level, stack.frames.len(), "frames push only at the top");
        let mut frame = Frame::new(Arc::clone(closure));
        frame.install_args(&args);
        stack.push_frame(frame);
    }

    // From here on the frame's own closure is authoritative: on the resume
    // path it may differ from `closure` when a tail call replaced it.
    let result = dispatch::execute_frame(stack, level, mode);

    // The finally region: a suspension keeps the whole chain pushed; any
    // other exit closes this frame's upvalues and pops it.
    match result {
        Err(e) if e.is_suspend() => Err(e),
        Err(mut e) => {
            let frame = &stack.frames[level];
            e.trace_frame(format!(
                "\t{}:{}: in function",
                frame.proto().source,
                frame.proto().line_at(frame.pc)
            ));
            stack.close_frame(level);
            stack.frames.truncate(level);
            Err(e)
        }
        Ok(vals) => {
            stack.close_frame(level);
            stack.frames.truncate(level);
            Ok(vals)
        }
    }
}

/// Pop every frame of a stopped stack, closing upvalues on the way out.
fn unwind_stopped(stack: &mut ExecutionStack) {
    while !stack.frames.is_empty() {
        let level = stack.frames.len() - 1;
        stack.current_level = level;
        stack.close_frame(level);
        stack.pop_frame();
    }
    stack.current_level = 0;
}

// ── Active-stack handle for host callables ────────────────────────────────────
//
// Host functions are plain fn pointers; the one that wants to snapshot the
// live execution stack reaches it through a thread-local set for the duration
// of a root call.

thread_local! {
    static ACTIVE_STACK: Cell<*mut ExecutionStack> = const { Cell::new(std::ptr::null_mut()) };
}

pub(crate) struct StackGuard {
    prev: *mut ExecutionStack,
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        ACTIVE_STACK.with(|c| c.set(self.prev));
    }
}

pub(crate) fn activate(stack: &mut ExecutionStack) -> StackGuard {
    let this = stack as *mut ExecutionStack;
    let prev = ACTIVE_STACK.with(|c| {
        let p = c.get();
        c.set(this);
        p
    });
    StackGuard { prev }
}

/// Run `f` against the execution stack of the innermost root call on this
/// thread. Errors when no script is executing.
pub fn with_active_stack<R>(f: impl FnOnce(&mut ExecutionStack) -> R) -> Result<R, LuaError> {
    ACTIVE_STACK.with(|c| {
        let ptr = c.get();
        if ptr.is_null() {
            Err(LuaError::host("no active execution stack"))
        } else {
            // SAFETY: the pointer is set only while a root call is actively
            // executing on this thread, and the dispatch loop is parked for
            // the duration of the host callable that got us here.
            Ok(unsafe { f(&mut *ptr) })
        }
    })
}
