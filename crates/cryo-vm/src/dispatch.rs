//! The instruction dispatch loop.
//!
//! One loop body serves both flavors: [`CallMode::Sync`] invokes callees
//! through the synchronous entries and treats a host suspend request as an
//! error; [`CallMode::Suspendable`] lets the suspend signal propagate, frame
//! by frame, out of the root call.
//!
//! `pc` advances once at the bottom of the loop, after the arm for the
//! current word completes. Arms that transfer control adjust `pc` relative
//! to that final increment (a jump of `sBx` sets `pc += sBx`, landing on
//! `pc + sBx + 1`). A frame that suspends inside a CALL therefore keeps its
//! `pc` on the CALL word, which is exactly where resumption re-enters.

use crate::call::{self, CallMode};
use cryo_core::instruction::FIELDS_PER_FLUSH;
use cryo_core::stack::HOST_LEVEL_NONE;
use cryo_core::{
    Buffer, ExecutionStack, Instruction, LuaClosure, LuaError, LuaValue, OpCode, Varargs,
};
use std::sync::Arc;

// Metamethod chains longer than this are assumed cyclic.
const MAX_META_DEPTH: usize = 100;

/// Execute the frame at `level` until it returns, raises, or suspends.
pub(crate) fn execute_frame(
    stack: &mut ExecutionStack,
    level: usize,
    mode: CallMode,
) -> Result<Varargs, LuaError> {
    let closure = Arc::clone(&stack.frames[level].closure);
    match run_loop(&closure, stack, level, mode) {
        Err(e) if !e.is_suspend() => {
            let freshly_raised = e.fileline.is_none();
            let (source, line) = {
                let frame = &stack.frames[level];
                (
                    frame.proto().source.clone(),
                    frame.proto().line_at(frame.pc),
                )
            };
            let mut e = e.with_location(&source, line);
            if freshly_raised {
                apply_message_hook(stack, &mut e);
            }
            Err(e)
        }
        other => other,
    }
}

fn run_loop(
    closure: &Arc<LuaClosure>,
    stack: &mut ExecutionStack,
    level: usize,
    mode: CallMode,
) -> Result<Varargs, LuaError> {
    loop {
        let i = {
            let frame = &stack.frames[level];
            debug_assert!(frame.pc < frame.proto().code.len());
            Instruction(frame.fetch())
        };
        let op = i.opcode()?;
        let a = i.a();

        match op {
            // ── Loads & moves ────────────────────────────────────────────────
            OpCode::Move => {
                let v = reg(stack, level, i.b() as usize);
                set_reg(stack, level, a, v);
            }
            OpCode::LoadK => {
                let v = konst(stack, level, i.bx() as usize);
                set_reg(stack, level, a, v);
            }
            OpCode::LoadBool => {
                set_reg(stack, level, a, LuaValue::Boolean(i.b() != 0));
                if i.c() != 0 {
                    stack.frames[level].pc += 1;
                }
            }
            OpCode::LoadNil => {
                // R(A) through R(A+B) become nil
                for r in a..=a + i.b() as usize {
                    set_reg(stack, level, r, LuaValue::Nil);
                }
            }

            // ── Upvalues & globals ───────────────────────────────────────────
            OpCode::GetUpval => {
                let cell = upvalue_cell(closure, i.b() as usize)?;
                let v = stack.upvalue_get(&cell);
                set_reg(stack, level, a, v);
            }
            OpCode::SetUpval => {
                let cell = upvalue_cell(closure, i.b() as usize)?;
                let v = reg(stack, level, a);
                stack.upvalue_set(&cell, v);
            }
            OpCode::GetTabUp => {
                let table = upvalue_table(closure, stack, i.b() as usize);
                let key = rk(stack, level, i.c());
                let v = index_value(&table, &key)?;
                set_reg(stack, level, a, v);
            }
            OpCode::SetTabUp => {
                let table = upvalue_table(closure, stack, a);
                let key = rk(stack, level, i.b());
                let val = rk(stack, level, i.c());
                newindex_value(&table, key, val)?;
            }

            // ── Tables ───────────────────────────────────────────────────────
            OpCode::GetTable => {
                let base = reg(stack, level, i.b() as usize);
                let key = rk(stack, level, i.c());
                let v = index_value(&base, &key)?;
                set_reg(stack, level, a, v);
            }
            OpCode::SetTable => {
                let base = reg(stack, level, a);
                let key = rk(stack, level, i.b());
                let val = rk(stack, level, i.c());
                newindex_value(&base, key, val)?;
            }
            OpCode::NewTable => {
                let table = LuaValue::new_table();
                let hint = fb2int(i.b());
                if hint > 0 {
                    if let LuaValue::Table(t) = &table {
                        t.write().unwrap().array.reserve(hint);
                    }
                }
                set_reg(stack, level, a, table);
            }
            OpCode::Self_ => {
                let base = reg(stack, level, i.b() as usize);
                let key = rk(stack, level, i.c());
                set_reg(stack, level, a + 1, base.clone());
                let method = index_value(&base, &key)?;
                set_reg(stack, level, a, method);
            }

            // ── Arithmetic ───────────────────────────────────────────────────
            OpCode::Add => arith(stack, level, i, a, "__add", LuaValue::add)?,
            OpCode::Sub => arith(stack, level, i, a, "__sub", LuaValue::sub)?,
            OpCode::Mul => arith(stack, level, i, a, "__mul", LuaValue::mul)?,
            OpCode::Div => arith(stack, level, i, a, "__div", LuaValue::div)?,
            OpCode::Mod => arith(stack, level, i, a, "__mod", LuaValue::modulo)?,
            OpCode::Pow => arith(stack, level, i, a, "__pow", LuaValue::pow)?,
            OpCode::Unm => {
                let v = reg(stack, level, i.b() as usize);
                let out = match v.unm() {
                    Ok(out) => out,
                    Err(raw) => metamethod_fallback(&v, &v, "__unm", raw)?,
                };
                set_reg(stack, level, a, out);
            }
            OpCode::Not => {
                let v = reg(stack, level, i.b() as usize);
                set_reg(stack, level, a, LuaValue::Boolean(!v.is_truthy()));
            }
            OpCode::Len => {
                let v = reg(stack, level, i.b() as usize);
                let mm = metamethod_of(&v, "__len");
                let out = if matches!(mm, LuaValue::Nil) {
                    v.len()?
                } else {
                    first_result(call_value_sync(&mm, vec![v])?)
                };
                set_reg(stack, level, a, out);
            }
            OpCode::Concat => {
                let out = concat_range(stack, level, i.b() as usize, i.c() as usize)?;
                set_reg(stack, level, a, out);
            }

            // ── Comparison & tests ───────────────────────────────────────────
            OpCode::Eq => {
                let lhs = rk(stack, level, i.b());
                let rhs = rk(stack, level, i.c());
                let cond = eq_value(&lhs, &rhs)?;
                if cond != (a != 0) {
                    stack.frames[level].pc += 1;
                }
            }
            OpCode::Lt => {
                let lhs = rk(stack, level, i.b());
                let rhs = rk(stack, level, i.c());
                let cond = order_value(&lhs, &rhs, "__lt", LuaValue::lt_b)?;
                if cond != (a != 0) {
                    stack.frames[level].pc += 1;
                }
            }
            OpCode::Le => {
                let lhs = rk(stack, level, i.b());
                let rhs = rk(stack, level, i.c());
                let cond = order_value(&lhs, &rhs, "__le", LuaValue::le_b)?;
                if cond != (a != 0) {
                    stack.frames[level].pc += 1;
                }
            }
            OpCode::Test => {
                if reg(stack, level, a).is_truthy() != (i.c() != 0) {
                    stack.frames[level].pc += 1;
                }
            }
            OpCode::TestSet => {
                let v = reg(stack, level, i.b() as usize);
                if v.is_truthy() == (i.c() != 0) {
                    set_reg(stack, level, a, v);
                } else {
                    stack.frames[level].pc += 1;
                }
            }

            // ── Jumps ────────────────────────────────────────────────────────
            OpCode::Jmp => {
                if a > 0 {
                    // scope exit: close upvalues for registers >= A-1
                    stack.close_from(level, (a - 1) as u8);
                }
                jump(stack, level, i.sbx());
            }

            // ── Calls & returns ──────────────────────────────────────────────
            OpCode::Call => {
                stack.current_level += 1;
                if stack.current_level == stack.host_level {
                    // Resume splice: the call that suspended is not re-run;
                    // the host-supplied value stands in for its results.
                    stack.host_level = HOST_LEVEL_NONE;
                    let rv = std::mem::replace(&mut stack.return_value, LuaValue::Nil);
                    install_results(stack, level, a, i.c(), Varargs::Single(rv));
                    stack.current_level -= 1;
                } else {
                    let callee = reg(stack, level, a);
                    let args = gather_args(stack, level, a, i.b());
                    match call_callee(&callee, args, stack, mode) {
                        Ok(vals) => {
                            install_results(stack, level, a, i.c(), vals);
                            stack.current_level -= 1;
                        }
                        Err(e) => {
                            if e.is_suspend() && stack.host_level == HOST_LEVEL_NONE {
                                // Deepest crossing of the suspend signal marks
                                // the splice point for the eventual resume.
                                stack.host_level = stack.current_level;
                            }
                            stack.current_level -= 1;
                            return Err(e);
                        }
                    }
                }
            }
            OpCode::TailCall => {
                let callee = reg(stack, level, a);
                let args = gather_args(stack, level, a, i.b());
                // The frame's locals die here; the caller's invoke() loop
                // finishes the job with this frame already off the stack.
                return Ok(Varargs::tailcall(callee, args));
            }
            OpCode::Return => {
                let b = i.b();
                return Ok(match b {
                    0 => {
                        let frame = &mut stack.frames[level];
                        let pending = std::mem::take(&mut frame.v);
                        let split = frame
                            .top
                            .saturating_sub(pending.narg())
                            .max(a)
                            .min(frame.stack.len());
                        frame.top = 0;
                        let mut out: Vec<LuaValue> = frame.stack[a..split].to_vec();
                        out.extend(pending.to_vec());
                        Varargs::from(out)
                    }
                    1 => Varargs::None,
                    2 => Varargs::Single(reg(stack, level, a)),
                    n => {
                        let frame = &stack.frames[level];
                        Varargs::Flat(frame.stack[a..a + (n as usize - 1)].to_vec())
                    }
                });
            }

            // ── Loops ────────────────────────────────────────────────────────
            OpCode::ForPrep => {
                let init = reg(stack, level, a).fornum("initial value")?;
                let limit = reg(stack, level, a + 1).fornum("limit")?;
                let step = reg(stack, level, a + 2).fornum("step")?;
                set_reg(stack, level, a, init.sub(&step)?);
                set_reg(stack, level, a + 1, limit);
                set_reg(stack, level, a + 2, step);
                jump(stack, level, i.sbx());
            }
            OpCode::ForLoop => {
                let step = reg(stack, level, a + 2);
                let idx = reg(stack, level, a).add(&step)?;
                let limit = reg(stack, level, a + 1);
                let positive = match &step {
                    LuaValue::Integer(n) => *n >= 0,
                    LuaValue::Float(f) => *f >= 0.0,
                    _ => true,
                };
                let keep_going = if positive {
                    idx.le_b(&limit)?
                } else {
                    idx.gteq_b(&limit)?
                };
                set_reg(stack, level, a, idx.clone());
                if keep_going {
                    set_reg(stack, level, a + 3, idx);
                    jump(stack, level, i.sbx());
                }
            }
            OpCode::TForCall => {
                let nresults = i.c() as usize;
                stack.current_level += 1;
                if stack.current_level == stack.host_level {
                    stack.host_level = HOST_LEVEL_NONE;
                    let rv = std::mem::replace(&mut stack.return_value, LuaValue::Nil);
                    install_tfor_results(stack, level, a, nresults, Varargs::Single(rv));
                    stack.current_level -= 1;
                } else {
                    let callee = reg(stack, level, a);
                    let args =
                        Varargs::Flat(vec![reg(stack, level, a + 1), reg(stack, level, a + 2)]);
                    match call_callee(&callee, args, stack, mode) {
                        Ok(vals) => {
                            install_tfor_results(stack, level, a, nresults, vals);
                            stack.current_level -= 1;
                        }
                        Err(e) => {
                            if e.is_suspend() && stack.host_level == HOST_LEVEL_NONE {
                                stack.host_level = stack.current_level;
                            }
                            stack.current_level -= 1;
                            return Err(e);
                        }
                    }
                }
            }
            OpCode::TForLoop => {
                let control = reg(stack, level, a + 1);
                if control != LuaValue::Nil {
                    set_reg(stack, level, a, control);
                    jump(stack, level, i.sbx());
                }
            }

            // ── Table constructors ───────────────────────────────────────────
            OpCode::SetList => {
                let b = i.b() as usize;
                let mut c = i.c() as usize;
                if c == 0 {
                    // The batch index rides in the next word (EXTRAARG); pc
                    // skips it here and the bottom-of-loop increment lands
                    // past it — a net advance of two.
                    let frame = &mut stack.frames[level];
                    c = Instruction(frame.closure.proto.code[frame.pc + 1]).ax() as usize;
                    frame.pc += 1;
                }
                if c == 0 {
                    return Err(LuaError::illegal_opcode(i.0));
                }
                let offset = (c - 1) * FIELDS_PER_FLUSH;
                let elements: Vec<LuaValue> = if b == 0 {
                    let frame = &mut stack.frames[level];
                    let pending = std::mem::take(&mut frame.v);
                    let split = frame
                        .top
                        .saturating_sub(pending.narg())
                        .max(a + 1)
                        .min(frame.stack.len());
                    frame.top = 0;
                    let mut out: Vec<LuaValue> = frame.stack[a + 1..split].to_vec();
                    out.extend(pending.to_vec());
                    out
                } else {
                    stack.frames[level].stack[a + 1..=a + b].to_vec()
                };
                match reg(stack, level, a) {
                    LuaValue::Table(t) => {
                        let mut t = t.write().unwrap();
                        t.presize(offset + elements.len());
                        for (j, v) in elements.into_iter().enumerate() {
                            t.set(LuaValue::Integer((offset + j + 1) as i64), v);
                        }
                    }
                    other => {
                        return Err(LuaError::type_error("table", other.type_name()));
                    }
                }
            }

            // ── Closures & varargs ───────────────────────────────────────────
            OpCode::Closure => {
                let bx = i.bx() as usize;
                let child = stack.frames[level]
                    .proto()
                    .p
                    .get(bx)
                    .cloned()
                    .ok_or_else(|| LuaError::illegal_opcode(i.0))?;
                let mut cells = Vec::with_capacity(child.upvalues.len());
                for desc in &child.upvalues {
                    if desc.in_stack {
                        // share the open cell for this register, if one exists
                        cells.push(stack.open_cell(level, desc.index));
                    } else {
                        let cell = closure
                            .upvalues
                            .get(desc.index as usize)
                            .cloned()
                            .ok_or_else(|| LuaError::runtime("No space for upvalue"))?;
                        cells.push(cell);
                    }
                }
                let new = LuaClosure::new(child, closure.env.clone(), cells);
                set_reg(stack, level, a, LuaValue::Closure(Arc::new(new)));
            }
            OpCode::Vararg => {
                let b = i.b() as usize;
                if b == 0 {
                    let frame = &mut stack.frames[level];
                    let all = frame.varargs.clone();
                    frame.top = a + all.narg();
                    frame.v = all;
                } else {
                    let varargs = stack.frames[level].varargs.clone();
                    for j in 0..b - 1 {
                        set_reg(stack, level, a + j, varargs.arg(j + 1));
                    }
                }
            }

            // A bare EXTRAARG is only legal as the operand word of SETLIST.
            OpCode::ExtraArg => return Err(LuaError::illegal_opcode(i.0)),
        }

        stack.frames[level].pc += 1;
    }
}

// ── Operand access ────────────────────────────────────────────────────────────

fn reg(stack: &ExecutionStack, level: usize, r: usize) -> LuaValue {
    stack.frames[level].stack[r].clone()
}

fn set_reg(stack: &mut ExecutionStack, level: usize, r: usize, v: LuaValue) {
    stack.frames[level].stack[r] = v;
}

fn konst(stack: &ExecutionStack, level: usize, idx: usize) -> LuaValue {
    stack.frames[level].proto().k[idx].clone()
}

/// RK operand: a constant when above the register range, a register below.
fn rk(stack: &ExecutionStack, level: usize, x: u32) -> LuaValue {
    if x > 0xff {
        konst(stack, level, (x & 0xff) as usize)
    } else {
        reg(stack, level, x as usize)
    }
}

fn jump(stack: &mut ExecutionStack, level: usize, sbx: i32) {
    let frame = &mut stack.frames[level];
    frame.pc = (frame.pc as i64 + sbx as i64) as usize;
}

fn upvalue_cell(
    closure: &Arc<LuaClosure>,
    idx: usize,
) -> Result<cryo_core::Upvalue, LuaError> {
    closure
        .upvalues
        .get(idx)
        .cloned()
        .ok_or_else(|| LuaError::runtime("No space for upvalue"))
}

/// GETTABUP/SETTABUP base: the addressed upvalue, or the closure's
/// environment for chunks assembled without explicit `_ENV` descriptors.
fn upvalue_table(closure: &Arc<LuaClosure>, stack: &ExecutionStack, idx: usize) -> LuaValue {
    match closure.upvalues.get(idx) {
        Some(cell) => stack.upvalue_get(cell),
        None => closure.env.clone(),
    }
}

// ── Call plumbing ─────────────────────────────────────────────────────────────

/// Arguments for a CALL-shaped instruction at base register `a`.
fn gather_args(stack: &mut ExecutionStack, level: usize, a: usize, b: u32) -> Varargs {
    match b {
        1 => Varargs::None,
        0 => {
            // open argument list: fixed prefix on the stack, pending tail in v
            let frame = &mut stack.frames[level];
            let pending = std::mem::take(&mut frame.v);
            let split = frame
                .top
                .saturating_sub(pending.narg())
                .max(a + 1)
                .min(frame.stack.len());
            frame.top = 0;
            let mut out: Vec<LuaValue> = frame.stack[a + 1..split].to_vec();
            out.extend(pending.to_vec());
            Varargs::from(out)
        }
        n => Varargs::from(stack.frames[level].stack[a + 1..a + n as usize].to_vec()),
    }
}

/// Deliver call results according to the C operand.
fn install_results(stack: &mut ExecutionStack, level: usize, a: usize, c: u32, vals: Varargs) {
    match c {
        1 => {}
        0 => {
            let frame = &mut stack.frames[level];
            frame.top = a + vals.narg();
            frame.v = vals;
        }
        n => {
            for j in 0..(n as usize - 1) {
                set_reg(stack, level, a + j, vals.arg(j + 1));
            }
        }
    }
}

/// TFORCALL delivers exactly `nresults` values starting at R(A+3).
fn install_tfor_results(
    stack: &mut ExecutionStack,
    level: usize,
    a: usize,
    nresults: usize,
    vals: Varargs,
) {
    for j in 0..nresults {
        set_reg(stack, level, a + 3 + j, vals.arg(j + 1));
    }
}

/// Dispatch a callee value. Closures descend on the same execution stack;
/// natives run inline; tables chase `__call`. A nil callee is always
/// reported synchronously.
fn call_callee(
    callee: &LuaValue,
    args: Varargs,
    stack: &mut ExecutionStack,
    mode: CallMode,
) -> Result<Varargs, LuaError> {
    match callee {
        LuaValue::Closure(c) => call::invoke(c, stack, args, mode),
        LuaValue::NativeFunction(f) => Ok(call_native(*f, args.to_vec(), mode)?.into()),
        LuaValue::Table(_) => {
            let mm = metamethod_of(callee, "__call");
            if matches!(mm, LuaValue::Nil) {
                return Err(LuaError::type_error("function", callee.type_name()));
            }
            let full = Varargs::cons(callee.clone(), args);
            call_callee(&mm, full, stack, mode)
        }
        other => Err(LuaError::type_error("function", other.type_name())),
    }
}

/// Invoke a host function. In synchronous mode a suspend request is a
/// failure: nothing above us can park the stack.
pub(crate) fn call_native(
    f: cryo_core::NativeFn,
    args: Vec<LuaValue>,
    mode: CallMode,
) -> Result<Vec<LuaValue>, LuaError> {
    match f(args) {
        Err(e) if e.is_suspend() && mode == CallMode::Sync => Err(LuaError::runtime(
            "attempt to suspend inside a synchronous call",
        )),
        other => other,
    }
}

/// Call a value outside any script frame (metamethods, the message hook).
/// Closure callees run synchronously on a stack of their own: metamethods
/// are not suspension points.
fn call_value_sync(callee: &LuaValue, args: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
    match callee {
        LuaValue::NativeFunction(f) => call_native(*f, args, CallMode::Sync),
        LuaValue::Closure(c) => call::call(c, Varargs::from(args)).map(|v| v.to_vec()),
        LuaValue::Table(_) => {
            let mm = metamethod_of(callee, "__call");
            if matches!(mm, LuaValue::Nil) {
                return Err(LuaError::type_error("function", callee.type_name()));
            }
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(callee.clone());
            full.extend(args);
            call_value_sync(&mm, full)
        }
        other => Err(LuaError::type_error("function", other.type_name())),
    }
}

fn first_result(mut vals: Vec<LuaValue>) -> LuaValue {
    if vals.is_empty() {
        LuaValue::Nil
    } else {
        vals.swap_remove(0)
    }
}

// ── Metamethods ───────────────────────────────────────────────────────────────

fn metamethod_of(v: &LuaValue, name: &str) -> LuaValue {
    match v {
        LuaValue::Table(t) | LuaValue::UserData(t) => t
            .read()
            .unwrap()
            .get_metatable()
            .map(|mt| mt.read().unwrap().get(&LuaValue::LuaString(name.into())))
            .unwrap_or(LuaValue::Nil),
        _ => LuaValue::Nil,
    }
}

fn binary_metamethod(lhs: &LuaValue, rhs: &LuaValue, name: &str) -> LuaValue {
    let mm = metamethod_of(lhs, name);
    if !matches!(mm, LuaValue::Nil) {
        return mm;
    }
    metamethod_of(rhs, name)
}

/// One arithmetic arm: raw operation first, metamethod fallback second.
fn arith(
    stack: &mut ExecutionStack,
    level: usize,
    i: Instruction,
    a: usize,
    event: &str,
    op: fn(&LuaValue, &LuaValue) -> Result<LuaValue, LuaError>,
) -> Result<(), LuaError> {
    let lhs = rk(stack, level, i.b());
    let rhs = rk(stack, level, i.c());
    let out = match op(&lhs, &rhs) {
        Ok(v) => v,
        Err(raw) => metamethod_fallback(&lhs, &rhs, event, raw)?,
    };
    set_reg(stack, level, a, out);
    Ok(())
}

fn metamethod_fallback(
    lhs: &LuaValue,
    rhs: &LuaValue,
    event: &str,
    raw: LuaError,
) -> Result<LuaValue, LuaError> {
    let mm = binary_metamethod(lhs, rhs, event);
    if matches!(mm, LuaValue::Nil) {
        return Err(raw);
    }
    Ok(first_result(call_value_sync(
        &mm,
        vec![lhs.clone(), rhs.clone()],
    )?))
}

/// Equality with `__eq`: the handler fires only for two tables or two
/// userdata that are not already raw-equal.
fn eq_value(lhs: &LuaValue, rhs: &LuaValue) -> Result<bool, LuaError> {
    if lhs.eq_b(rhs) {
        return Ok(true);
    }
    let comparable = matches!(
        (lhs, rhs),
        (LuaValue::Table(_), LuaValue::Table(_))
            | (LuaValue::UserData(_), LuaValue::UserData(_))
    );
    if !comparable {
        return Ok(false);
    }
    let mm = binary_metamethod(lhs, rhs, "__eq");
    if matches!(mm, LuaValue::Nil) {
        return Ok(false);
    }
    Ok(first_result(call_value_sync(&mm, vec![lhs.clone(), rhs.clone()])?).is_truthy())
}

/// Ordering with `__lt`/`__le` fallback when the raw comparison rejects the
/// operand types.
fn order_value(
    lhs: &LuaValue,
    rhs: &LuaValue,
    event: &str,
    op: fn(&LuaValue, &LuaValue) -> Result<bool, LuaError>,
) -> Result<bool, LuaError> {
    match op(lhs, rhs) {
        Ok(b) => Ok(b),
        Err(raw) => {
            let mm = binary_metamethod(lhs, rhs, event);
            if matches!(mm, LuaValue::Nil) {
                return Err(raw);
            }
            Ok(first_result(call_value_sync(&mm, vec![lhs.clone(), rhs.clone()])?).is_truthy())
        }
    }
}

// ── Indexing with metamethod chasing ──────────────────────────────────────────

/// `base[key]` honoring `__index` chains.
fn index_value(base: &LuaValue, key: &LuaValue) -> Result<LuaValue, LuaError> {
    let mut cur = base.clone();
    for _ in 0..MAX_META_DEPTH {
        match &cur {
            LuaValue::Table(t) | LuaValue::UserData(t) => {
                let direct = t.read().unwrap().get(key);
                if direct != LuaValue::Nil {
                    return Ok(direct);
                }
                let mm = metamethod_of(&cur, "__index");
                match mm {
                    LuaValue::Nil => return Ok(LuaValue::Nil),
                    LuaValue::Table(_) | LuaValue::UserData(_) => cur = mm,
                    handler => {
                        return Ok(first_result(call_value_sync(
                            &handler,
                            vec![cur.clone(), key.clone()],
                        )?))
                    }
                }
            }
            other => return Err(LuaError::type_error("table", other.type_name())),
        }
    }
    Err(LuaError::runtime("'__index' chain too long; possible loop"))
}

/// `base[key] = val` honoring `__newindex` chains.
fn newindex_value(base: &LuaValue, key: LuaValue, val: LuaValue) -> Result<(), LuaError> {
    if matches!(key, LuaValue::Nil) {
        return Err(LuaError::runtime("table index is nil"));
    }
    let mut cur = base.clone();
    for _ in 0..MAX_META_DEPTH {
        match &cur {
            LuaValue::Table(t) | LuaValue::UserData(t) => {
                let exists = t.read().unwrap().get(&key) != LuaValue::Nil;
                if exists {
                    t.write().unwrap().set(key, val);
                    return Ok(());
                }
                let mm = metamethod_of(&cur, "__newindex");
                match mm {
                    LuaValue::Nil => {
                        t.write().unwrap().set(key, val);
                        return Ok(());
                    }
                    LuaValue::Table(_) | LuaValue::UserData(_) => cur = mm,
                    handler => {
                        call_value_sync(&handler, vec![cur.clone(), key, val])?;
                        return Ok(());
                    }
                }
            }
            other => return Err(LuaError::type_error("table", other.type_name())),
        }
    }
    Err(LuaError::runtime("'__newindex' chain too long; possible loop"))
}

// ── Concatenation ─────────────────────────────────────────────────────────────

/// CONCAT folds R(B)..R(C). The fast path accumulates the whole range into
/// one buffer; a non-coercible operand falls back to the right-associative
/// pairwise fold so `__concat` handlers see the operands Lua gives them.
fn concat_range(
    stack: &mut ExecutionStack,
    level: usize,
    b: usize,
    c: usize,
) -> Result<LuaValue, LuaError> {
    let mut values: Vec<LuaValue> = stack.frames[level].stack[b..=c].to_vec();
    let mut buf = Buffer::new();
    if values.iter().try_for_each(|v| buf.append_value(v)).is_ok() {
        return Ok(buf.value());
    }
    let mut acc = match values.pop() {
        Some(v) => v,
        None => return Ok(LuaValue::LuaString(String::new())),
    };
    for v in values.into_iter().rev() {
        acc = concat_pair(&v, &acc)?;
    }
    Ok(acc)
}

fn concat_pair(lhs: &LuaValue, rhs: &LuaValue) -> Result<LuaValue, LuaError> {
    let mut buf = Buffer::new();
    match buf.append_value(lhs).and_then(|_| buf.append_value(rhs)) {
        Ok(()) => Ok(buf.value()),
        Err(raw) => metamethod_fallback(lhs, rhs, "__concat", raw),
    }
}

// ── Misc helpers ──────────────────────────────────────────────────────────────

/// Decode a size hint stored as a floating-point byte (eeeeexxx:
/// `(xxx|0x8) << (eeeee-1)` when an exponent is present).
fn fb2int(x: u32) -> usize {
    let e = (x >> 3) & 0x1f;
    if e == 0 {
        x as usize
    } else {
        (((x & 7) + 8) << (e - 1)) as usize
    }
}

/// Route a freshly raised error's message through the script-installed hook,
/// if any. The hook is taken off the stack around its own invocation, so a
/// hook cannot be re-entered from inside itself.
fn apply_message_hook(stack: &mut ExecutionStack, err: &mut LuaError) {
    let Some(hook) = stack.message_hook.take() else {
        return;
    };
    let message = err.to_string();
    if let Ok(vals) = call_value_sync(&hook, vec![LuaValue::LuaString(message)]) {
        if let Some(LuaValue::LuaString(s)) = vals.into_iter().next() {
            err.reword(s);
        }
    }
    stack.message_hook = Some(hook);
}

#[cfg(test)]
mod tests {
    use super::fb2int;

    #[test]
    fn fb2int_small_values_are_literal() {
        assert_eq!(fb2int(0), 0);
        assert_eq!(fb2int(7), 7);
    }

    #[test]
    fn fb2int_exponent_form() {
        // 0b0001_0000: e=2, mantissa 0 → (0+8) << 1 = 16
        assert_eq!(fb2int(0b0001_0000), 16);
    }
}
