//! Closures and upvalue cells.

use crate::proto::Proto;
use crate::stack::ExecutionStack;
use crate::value::LuaValue;
use std::sync::{Arc, RwLock};

// ── Upvalue cells ─────────────────────────────────────────────────────────────

/// A shared, mutable upvalue cell.
///
/// While the captured variable is still live in its frame (`Open`), the cell
/// holds a (frame level, register slot) pair resolved through the execution
/// stack on every access; no back-pointer into the frame exists. When the
/// frame exits — or a snapshot is taken — the value migrates into the cell
/// (`Closed`).
#[derive(Debug, Clone)]
pub struct Upvalue(pub Arc<RwLock<UpvalueInner>>);

impl Upvalue {
    /// Create an open upvalue aliasing `slot` of the frame at `level`.
    pub fn open(level: usize, slot: u8) -> Self {
        Self(Arc::new(RwLock::new(UpvalueInner::Open { level, slot })))
    }

    /// Create a closed (self-contained) upvalue with the given value.
    pub fn closed(val: LuaValue) -> Self {
        Self(Arc::new(RwLock::new(UpvalueInner::Closed(val))))
    }

    pub fn is_open(&self) -> bool {
        matches!(&*self.0.read().unwrap(), UpvalueInner::Open { .. })
    }

    /// Cell identity: two handles to the same shared cell.
    pub fn ptr_eq(&self, other: &Upvalue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Interior state of an upvalue cell.
#[derive(Debug, Clone)]
pub enum UpvalueInner {
    /// The variable is still alive in register `slot` of the frame at
    /// `level` on the execution stack.
    Open { level: usize, slot: u8 },
    /// The frame exited; the value was migrated here.
    Closed(LuaValue),
}

// ── Lua closure ───────────────────────────────────────────────────────────────

/// A runtime closure: a `Proto` paired with its environment and captured
/// upvalue cells.
///
/// When the closure is the root of a resumable invocation, the execution
/// stack of the paused call chain is parked in `execution_stack` between
/// suspension and resume; this attached stack is what a snapshot persists.
pub struct LuaClosure {
    /// The compiled function body.
    pub proto: Arc<Proto>,
    /// The globals table this closure resolves free names against.
    pub env: LuaValue,
    /// Upvalue cells, one per `proto.upvalues` entry.
    pub upvalues: Vec<Upvalue>,
    /// Paused call chain, present only on the root of a suspended run.
    pub execution_stack: RwLock<Option<ExecutionStack>>,
}

// A parked execution stack refers back to this closure through its frames;
// Debug stays shallow so formatting never walks that cycle.
impl std::fmt::Debug for LuaClosure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaClosure")
            .field("proto", &self.proto.source)
            .field("upvalues", &self.upvalues.len())
            .field("suspended", &self.has_stack())
            .finish()
    }
}

impl LuaClosure {
    pub fn new(proto: Arc<Proto>, env: LuaValue, upvalues: Vec<Upvalue>) -> Self {
        Self {
            proto,
            env,
            upvalues,
            execution_stack: RwLock::new(None),
        }
    }

    /// Wrap a chunk's root prototype. Each declared upvalue of a root chunk
    /// is the environment (the `_ENV` convention), so every descriptor binds
    /// a closed cell holding the globals table.
    pub fn root(proto: Arc<Proto>, globals: LuaValue) -> Arc<Self> {
        let upvalues = proto
            .upvalues
            .iter()
            .map(|_| Upvalue::closed(globals.clone()))
            .collect();
        Arc::new(Self::new(proto, globals, upvalues))
    }

    /// Park a suspended execution stack on this closure.
    pub fn attach_stack(&self, stack: ExecutionStack) {
        *self.execution_stack.write().unwrap() = Some(stack);
    }

    /// Detach the parked stack, if any, for resumption.
    pub fn take_stack(&self) -> Option<ExecutionStack> {
        self.execution_stack.write().unwrap().take()
    }

    pub fn has_stack(&self) -> bool {
        self.execution_stack.read().unwrap().is_some()
    }

    /// Install the value the pending host call will appear to have returned
    /// on the next resume.
    pub fn set_return_value(&self, value: LuaValue) {
        if let Some(stack) = self.execution_stack.write().unwrap().as_mut() {
            stack.return_value = value;
        }
    }

    /// Request graceful tear-down: mark the parked stack and force every
    /// pushed frame onto its RETURN epilogue, so the next resume unwinds the
    /// whole chain without executing further user code.
    pub fn stop(&self) {
        if let Some(stack) = self.execution_stack.write().unwrap().as_mut() {
            stack.user_end_call = true;
            for frame in &mut stack.frames {
                frame.pc = frame.closure.proto.epilogue_pc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_share_identity_through_clones() {
        let a = Upvalue::closed(LuaValue::Integer(1));
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&Upvalue::closed(LuaValue::Integer(1))));
    }

    #[test]
    fn open_state_is_observable() {
        assert!(Upvalue::open(0, 3).is_open());
        assert!(!Upvalue::closed(LuaValue::Nil).is_open());
    }
}
