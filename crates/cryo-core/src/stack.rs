//! The execution stack: the full call chain plus resume bookkeeping.

use crate::closure::{Upvalue, UpvalueInner};
use crate::frame::Frame;
use crate::value::LuaValue;
use std::time::{SystemTime, UNIX_EPOCH};

/// Sentinel for "no host splice pending".
pub const HOST_LEVEL_NONE: usize = usize::MAX;

/// The stack of activation records for one script invocation, together with
/// the state that makes the invocation pausable and resumable.
///
/// `current_level` is the index of the frame currently being advanced; during
/// a restore it trails `frames.len()` while the saved chain is re-descended.
/// `host_level` marks the single level at which the next encountered CALL
/// splices in `return_value` instead of dispatching — the one-shot mechanism
/// that un-freezes a suspended host call.
#[derive(Debug)]
pub struct ExecutionStack {
    pub frames: Vec<Frame>,
    pub current_level: usize,
    pub host_level: usize,
    /// Value the host supplies for the pending splice.
    pub return_value: LuaValue,
    /// Graceful tear-down requested; the next resume only unwinds.
    pub user_end_call: bool,
    /// Epoch seconds at stack creation.
    pub script_start_time: u64,
    /// The root closure of this invocation, kept for snapshot reachability.
    pub root: LuaValue,
    /// Registry of open upvalue cells: at most one per (frame, slot).
    pub open_upvalues: Vec<OpenUpvalue>,
    /// Script-installed error message hook, applied once per raise.
    pub message_hook: Option<LuaValue>,
}

/// Registry entry for an open cell.
#[derive(Debug)]
pub struct OpenUpvalue {
    pub level: usize,
    pub slot: u8,
    pub cell: Upvalue,
}

impl ExecutionStack {
    pub fn new(root: LuaValue) -> Self {
        let script_start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            frames: Vec::new(),
            current_level: 0,
            host_level: HOST_LEVEL_NONE,
            return_value: LuaValue::Nil,
            user_end_call: false,
            script_start_time,
            root,
            open_upvalues: Vec::new(),
            message_hook: None,
        }
    }

    /// True when a frame is already pushed at `level` — the resume case.
    pub fn has_frame_at(&self, level: usize) -> bool {
        level < self.frames.len()
    }

    pub fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop_frame(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    // ── Upvalue cells ────────────────────────────────────────────────────────

    /// Find the open cell for (level, slot), or mint and register one. Peer
    /// closures locate the existing cell here, keeping the one-cell-per-slot
    /// invariant.
    pub fn open_cell(&mut self, level: usize, slot: u8) -> Upvalue {
        if let Some(entry) = self
            .open_upvalues
            .iter()
            .find(|e| e.level == level && e.slot == slot)
        {
            return entry.cell.clone();
        }
        let cell = Upvalue::open(level, slot);
        self.open_upvalues.push(OpenUpvalue {
            level,
            slot,
            cell: cell.clone(),
        });
        cell
    }

    /// Read through a cell, resolving open cells against the live frames.
    pub fn upvalue_get(&self, cell: &Upvalue) -> LuaValue {
        match &*cell.0.read().unwrap() {
            UpvalueInner::Open { level, slot } => {
                self.frames[*level].stack[*slot as usize].clone()
            }
            UpvalueInner::Closed(v) => v.clone(),
        }
    }

    /// Write through a cell, resolving open cells against the live frames.
    pub fn upvalue_set(&mut self, cell: &Upvalue, value: LuaValue) {
        let mut inner = cell.0.write().unwrap();
        match &*inner {
            UpvalueInner::Open { level, slot } => {
                let (level, slot) = (*level, *slot as usize);
                drop(inner);
                self.frames[level].stack[slot] = value;
            }
            UpvalueInner::Closed(_) => *inner = UpvalueInner::Closed(value),
        }
    }

    /// Close every open cell of `level` with slot ≥ `from_slot` (the JMP
    /// contract uses this for scope exits).
    pub fn close_from(&mut self, level: usize, from_slot: u8) {
        self.close_matching(|e| e.level == level && e.slot >= from_slot);
    }

    /// Close every open cell of `level` (frame exit).
    pub fn close_frame(&mut self, level: usize) {
        self.close_matching(|e| e.level == level);
    }

    /// Close every open cell on the stack (snapshot preparation: breaks the
    /// frame↔cell cycles so the graph serializes as a DAG).
    pub fn close_all(&mut self) {
        self.close_matching(|_| true);
    }

    fn close_matching(&mut self, pred: impl Fn(&OpenUpvalue) -> bool) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            if !pred(&self.open_upvalues[i]) {
                i += 1;
                continue;
            }
            let entry = self.open_upvalues.swap_remove(i);
            let value = self.frames[entry.level].stack[entry.slot as usize].clone();
            let mut inner = entry.cell.0.write().unwrap();
            // Closing twice is a no-op; only an open cell migrates its value.
            if matches!(&*inner, UpvalueInner::Open { .. }) {
                *inner = UpvalueInner::Closed(value);
            }
        }
    }
}
