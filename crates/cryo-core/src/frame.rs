//! Activation records.

use crate::closure::LuaClosure;
use crate::proto::Proto;
use crate::value::LuaValue;
use crate::varargs::Varargs;
use std::sync::Arc;

/// One activation record: the function instance being executed, the program
/// counter, the register file, and the variadic bookkeeping.
///
/// `pc` stays on the instruction currently being executed and is advanced
/// only after its arm completes, so a frame suspended inside a call resumes
/// on the very CALL word that yielded. While a frame is live,
/// `pc < proto.code.len()` holds.
///
/// Holding the closure (not just its prototype) is what makes re-descent
/// self-contained: a rehydrated frame knows which upvalues and environment
/// it runs under even when a tail call replaced whatever the caller's
/// registers once held.
#[derive(Debug)]
pub struct Frame {
    pub closure: Arc<LuaClosure>,
    pub pc: usize,
    /// Register file, fixed at `proto.max_stack_size`, nil-initialized.
    pub stack: Vec<LuaValue>,
    /// Arguments beyond the fixed parameters, when the prototype is vararg.
    pub varargs: Varargs,
    /// Virtual live top during an open (multi-result) sequence: the register
    /// just past where the pending results of `v` belong.
    pub top: usize,
    /// Results of the last open call, awaiting their consumer.
    pub v: Varargs,
}

impl Frame {
    pub fn new(closure: Arc<LuaClosure>) -> Self {
        let size = closure.proto.max_stack_size as usize;
        Self {
            closure,
            pc: 0,
            stack: vec![LuaValue::Nil; size],
            varargs: Varargs::None,
            top: 0,
            v: Varargs::None,
        }
    }

    pub fn proto(&self) -> &Arc<Proto> {
        &self.closure.proto
    }

    /// Write incoming arguments: the first `num_params` into registers, the
    /// remainder into the frame's varargs bundle when the prototype accepts
    /// them.
    pub fn install_args(&mut self, args: &Varargs) {
        let fixed = self.closure.proto.num_params as usize;
        for i in 0..fixed {
            self.stack[i] = args.arg(i + 1);
        }
        if self.closure.proto.is_vararg && args.narg() > fixed {
            self.varargs = args.subargs(fixed + 1);
        }
    }

    /// The instruction word at `pc`.
    pub fn fetch(&self) -> u32 {
        self.closure.proto.code[self.pc]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closure(num_params: u8, is_vararg: bool) -> Arc<LuaClosure> {
        let proto = Arc::new(Proto {
            code: vec![0],
            k: vec![],
            p: vec![],
            upvalues: vec![],
            num_params,
            is_vararg,
            max_stack_size: 4,
            source: "<test>".into(),
            line_info: vec![],
        });
        Arc::new(LuaClosure::new(proto, LuaValue::Nil, vec![]))
    }

    #[test]
    fn registers_start_nil() {
        let f = Frame::new(closure(0, false));
        assert_eq!(f.stack.len(), 4);
        assert!(f.stack.iter().all(|v| *v == LuaValue::Nil));
    }

    #[test]
    fn excess_args_become_varargs() {
        let mut f = Frame::new(closure(1, true));
        f.install_args(&Varargs::Flat(vec![
            LuaValue::Integer(1),
            LuaValue::Integer(2),
            LuaValue::Integer(3),
        ]));
        assert_eq!(f.stack[0], LuaValue::Integer(1));
        assert_eq!(f.varargs.narg(), 2);
        assert_eq!(f.varargs.arg1(), LuaValue::Integer(2));
    }

    #[test]
    fn missing_args_nil_pad() {
        let mut f = Frame::new(closure(2, false));
        f.install_args(&Varargs::Single(LuaValue::Integer(9)));
        assert_eq!(f.stack[0], LuaValue::Integer(9));
        assert_eq!(f.stack[1], LuaValue::Nil);
        assert_eq!(f.varargs, Varargs::None);
    }
}
