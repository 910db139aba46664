//! Suspend → serialize → rehydrate → resume, end to end.
//!
//! The chunks are hand-assembled to what the reference compiler would emit;
//! `obj` is a host object (userdata over a method table) whose `coreFun`
//! captures and serializes the live execution stack before suspending —
//! the host contract a snapshotting callable follows.

use cryo_bytecode::ProtoBuilder;
use cryo_core::instruction::rk;
use cryo_core::{
    ExecutionStack, Frame, Instruction, LuaClosure, LuaError, LuaTable, LuaValue, NativeFn,
    OpCode, Proto, Upvalue, UpvalueDesc, Varargs,
};
use cryo_snapshot::{
    deserialize_execution_context, serialize_execution_context, HostRegistry, SnapshotError,
};
use cryo_vm::{stdlib, suspendable_call, with_active_stack, CallOutcome};
use std::cell::RefCell;
use std::sync::{Arc, RwLock};

// ── Test host ─────────────────────────────────────────────────────────────────

thread_local! {
    static OUTPUT: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    static SNAPSHOT: RefCell<Option<Vec<u8>>> = const { RefCell::new(None) };
}

fn test_print(args: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
    let line = args
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("\t");
    OUTPUT.with(|o| o.borrow_mut().push(line));
    Ok(vec![])
}

fn drain_output() -> Vec<String> {
    OUTPUT.with(|o| o.borrow_mut().drain(..).collect())
}

fn take_snapshot_bytes() -> Vec<u8> {
    SNAPSHOT
        .with(|s| s.borrow_mut().take())
        .expect("suspending callable stored a snapshot")
}

fn core_delay(_: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
    Ok(vec![])
}

/// The snapshotting suspendable callable: capture the stack, serialize it,
/// park the bytes for the test to pick up, signal suspension.
fn core_fun(_: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
    let bytes = with_active_stack(|stack| {
        serialize_execution_context(stack, &test_registry())
            .map_err(|e| LuaError::host(e.to_string()))
    })??;
    SNAPSHOT.with(|s| *s.borrow_mut() = Some(bytes));
    Err(LuaError::suspended())
}

/// Non-suspending stand-in with the same observable result, for the
/// uninterrupted-run comparison.
fn core_fun_sync(_: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
    Ok(vec![LuaValue::LuaString("RESUMED".into())])
}

fn test_registry() -> HostRegistry {
    let mut registry = HostRegistry::new();
    registry.register("print", test_print);
    registry.register("coreFun", core_fun);
    registry.register("coreDelay", core_delay);
    registry
}

fn new_table() -> Arc<RwLock<LuaTable>> {
    Arc::new(RwLock::new(LuaTable::new()))
}

fn host_globals(core: NativeFn) -> LuaValue {
    let globals = LuaValue::new_table();
    stdlib::bind(&globals, "print", test_print);
    let methods = new_table();
    methods.write().unwrap().set(
        LuaValue::LuaString("coreFun".into()),
        LuaValue::NativeFunction(core),
    );
    methods.write().unwrap().set(
        LuaValue::LuaString("coreDelay".into()),
        LuaValue::NativeFunction(core_delay),
    );
    if let LuaValue::Table(g) = &globals {
        g.write().unwrap().set(
            LuaValue::LuaString("obj".into()),
            LuaValue::UserData(methods),
        );
    }
    globals
}

fn kc(b: &mut ProtoBuilder, v: LuaValue) -> u32 {
    rk(b.add_constant(v) as u8)
}

fn abc(op: OpCode, a: u8, bb: u32, c: u32) -> Instruction {
    Instruction::abc(op, a, bb, c)
}

// ── The suspending dialog chunk ──────────────────────────────────────────────
//
// function test(a,b) print(a..b); local r=obj:coreFun(); print(r); print("done") end
// obj:coreDelay(100); test(1,2); print("tail")

fn dialog_chunk() -> Arc<Proto> {
    let mut test = ProtoBuilder::new("dialog.lua");
    test.max_stack_size = 6;
    test.num_params = 2;
    test.add_upvalue(UpvalueDesc::in_parent("_ENV", 0));
    let name_print = kc(&mut test, LuaValue::LuaString("print".into()));
    let name_obj = kc(&mut test, LuaValue::LuaString("obj".into()));
    let name_core = kc(&mut test, LuaValue::LuaString("coreFun".into()));
    let k_done = test.add_constant(LuaValue::LuaString("done".into()));
    test.emit(abc(OpCode::GetTabUp, 2, 0, name_print));
    test.emit(abc(OpCode::Move, 3, 0, 0));
    test.emit(abc(OpCode::Move, 4, 1, 0));
    test.emit(abc(OpCode::Concat, 3, 3, 4));
    test.emit(abc(OpCode::Call, 2, 2, 1)); // print(a..b)
    test.emit(abc(OpCode::GetTabUp, 2, 0, name_obj));
    test.emit(abc(OpCode::Self_, 2, 2, name_core));
    test.emit(abc(OpCode::Call, 2, 2, 2)); // r = obj:coreFun()  ← suspends
    test.emit(abc(OpCode::GetTabUp, 3, 0, name_print));
    test.emit(abc(OpCode::Move, 4, 2, 0));
    test.emit(abc(OpCode::Call, 3, 2, 1)); // print(r)
    test.emit(abc(OpCode::GetTabUp, 3, 0, name_print));
    test.emit(Instruction::abx(OpCode::LoadK, 4, k_done as u32));
    test.emit(abc(OpCode::Call, 3, 2, 1)); // print("done")
    test.emit(abc(OpCode::Return, 0, 1, 0));
    let test = Arc::new(test.finish());

    let mut chunk = ProtoBuilder::new("dialog.lua");
    chunk.max_stack_size = 4;
    chunk.add_upvalue(UpvalueDesc::in_parent("_ENV", 0));
    let name_test = kc(&mut chunk, LuaValue::LuaString("test".into()));
    let name_obj = kc(&mut chunk, LuaValue::LuaString("obj".into()));
    let name_delay = kc(&mut chunk, LuaValue::LuaString("coreDelay".into()));
    let name_print = kc(&mut chunk, LuaValue::LuaString("print".into()));
    let k_100 = chunk.add_constant(LuaValue::Integer(100));
    let k_1 = chunk.add_constant(LuaValue::Integer(1));
    let k_2 = chunk.add_constant(LuaValue::Integer(2));
    let k_tail = chunk.add_constant(LuaValue::LuaString("tail".into()));
    chunk.add_proto(test);
    chunk.emit(Instruction::abx(OpCode::Closure, 0, 0));
    chunk.emit(abc(OpCode::SetTabUp, 0, name_test, 0));
    chunk.emit(abc(OpCode::GetTabUp, 0, 0, name_obj));
    chunk.emit(abc(OpCode::Self_, 0, 0, name_delay));
    chunk.emit(Instruction::abx(OpCode::LoadK, 2, k_100 as u32));
    chunk.emit(abc(OpCode::Call, 0, 3, 1)); // obj:coreDelay(100)
    chunk.emit(abc(OpCode::GetTabUp, 0, 0, name_test));
    chunk.emit(Instruction::abx(OpCode::LoadK, 1, k_1 as u32));
    chunk.emit(Instruction::abx(OpCode::LoadK, 2, k_2 as u32));
    chunk.emit(abc(OpCode::Call, 0, 3, 1)); // test(1,2)     ← resumes here
    chunk.emit(abc(OpCode::GetTabUp, 0, 0, name_print));
    chunk.emit(Instruction::abx(OpCode::LoadK, 1, k_tail as u32));
    chunk.emit(abc(OpCode::Call, 0, 2, 1)); // print("tail")
    chunk.emit(abc(OpCode::Return, 0, 1, 0));
    chunk.finish_chunk().proto
}

fn run_until_suspended(proto: Arc<Proto>) -> Vec<u8> {
    let root = LuaClosure::root(proto, host_globals(core_fun));
    match suspendable_call(&root, Varargs::None).unwrap() {
        CallOutcome::Suspended => {}
        CallOutcome::Completed(_) => panic!("expected suspension"),
    }
    take_snapshot_bytes()
}

// ── Suspend, serialize, resume ───────────────────────────────────────────────

#[test]
fn suspend_serialize_resume_replays_the_tail() {
    let bytes = run_until_suspended(dialog_chunk());
    let before = drain_output();
    assert_eq!(before, vec!["12".to_string()]);

    // "Fresh process": everything reachable is rebuilt from bytes.
    let restored = deserialize_execution_context(&bytes, &test_registry()).unwrap();
    assert!(restored.has_stack());
    restored.set_return_value(LuaValue::LuaString("RESUMED".into()));
    match suspendable_call(&restored, Varargs::None).unwrap() {
        CallOutcome::Completed(_) => {}
        CallOutcome::Suspended => panic!("expected completion"),
    }
    let after = drain_output();
    assert_eq!(
        after,
        vec!["RESUMED".to_string(), "done".to_string(), "tail".to_string()]
    );

    // Uninterrupted run with a synchronous coreFun producing the same value:
    // the two output streams must agree (snapshot transparency).
    let root = LuaClosure::root(dialog_chunk(), host_globals(core_fun_sync));
    assert!(matches!(
        suspendable_call(&root, Varargs::None).unwrap(),
        CallOutcome::Completed(_)
    ));
    let uninterrupted = drain_output();
    let mut spliced = before;
    spliced.extend(after);
    assert_eq!(spliced, uninterrupted);
}

// ── Stop a restored closure ──────────────────────────────────────────────────

#[test]
fn stop_unwinds_a_restored_closure() {
    let bytes = run_until_suspended(dialog_chunk());
    drain_output();

    let restored = deserialize_execution_context(&bytes, &test_registry()).unwrap();
    restored.stop();
    match suspendable_call(&restored, Varargs::None).unwrap() {
        CallOutcome::Completed(vals) => assert_eq!(vals, Varargs::None),
        CallOutcome::Suspended => panic!("stopped closure must not suspend"),
    }
    assert_eq!(drain_output(), Vec::<String>::new());
    assert!(!restored.has_stack());
}

// ── Nested resume ────────────────────────────────────────────────────────────
//
// test4 → test3 → test2 → test1 → obj:coreFun(); each level prints after its
// inner call returns, so the resume replays inner-to-outer.

fn nested_call_chain_chunk() -> Arc<Proto> {
    let mut inner = ProtoBuilder::new("nested.lua");
    inner.max_stack_size = 4;
    inner.add_upvalue(UpvalueDesc::in_parent("_ENV", 0));
    let name_obj = kc(&mut inner, LuaValue::LuaString("obj".into()));
    let name_core = kc(&mut inner, LuaValue::LuaString("coreFun".into()));
    let name_print = kc(&mut inner, LuaValue::LuaString("print".into()));
    inner.emit(abc(OpCode::GetTabUp, 0, 0, name_obj));
    inner.emit(abc(OpCode::Self_, 0, 0, name_core));
    inner.emit(abc(OpCode::Call, 0, 2, 2)); // r = obj:coreFun()
    inner.emit(abc(OpCode::GetTabUp, 1, 0, name_print));
    inner.emit(abc(OpCode::Move, 2, 0, 0));
    inner.emit(abc(OpCode::Call, 1, 2, 1)); // print(r)
    inner.emit(abc(OpCode::Return, 0, 1, 0));
    let mut protos = vec![Arc::new(inner.finish())];

    for n in 2..=4 {
        let mut outer = ProtoBuilder::new("nested.lua");
        outer.max_stack_size = 3;
        outer.add_upvalue(UpvalueDesc::in_parent("_ENV", 0));
        let callee = kc(&mut outer, LuaValue::LuaString(format!("test{}", n - 1)));
        let name_print = kc(&mut outer, LuaValue::LuaString("print".into()));
        let marker = outer.add_constant(LuaValue::LuaString(format!("after{n}")));
        outer.emit(abc(OpCode::GetTabUp, 0, 0, callee));
        outer.emit(abc(OpCode::Call, 0, 1, 1));
        outer.emit(abc(OpCode::GetTabUp, 0, 0, name_print));
        outer.emit(Instruction::abx(OpCode::LoadK, 1, marker as u32));
        outer.emit(abc(OpCode::Call, 0, 2, 1));
        outer.emit(abc(OpCode::Return, 0, 1, 0));
        protos.push(Arc::new(outer.finish()));
    }

    let mut chunk = ProtoBuilder::new("nested.lua");
    chunk.max_stack_size = 3;
    chunk.add_upvalue(UpvalueDesc::in_parent("_ENV", 0));
    let name_print = kc(&mut chunk, LuaValue::LuaString("print".into()));
    let name_test4 = kc(&mut chunk, LuaValue::LuaString("test4".into()));
    let k_tail = chunk.add_constant(LuaValue::LuaString("tail".into()));
    for (idx, proto) in protos.into_iter().enumerate() {
        let name = kc(&mut chunk, LuaValue::LuaString(format!("test{}", idx + 1)));
        chunk.add_proto(proto);
        chunk.emit(Instruction::abx(OpCode::Closure, 0, idx as u32));
        chunk.emit(abc(OpCode::SetTabUp, 0, name, 0));
    }
    chunk.emit(abc(OpCode::GetTabUp, 0, 0, name_test4));
    chunk.emit(abc(OpCode::Call, 0, 1, 1)); // test4()
    chunk.emit(abc(OpCode::GetTabUp, 0, 0, name_print));
    chunk.emit(Instruction::abx(OpCode::LoadK, 1, k_tail as u32));
    chunk.emit(abc(OpCode::Call, 0, 2, 1)); // print("tail")
    chunk.emit(abc(OpCode::Return, 0, 1, 0));
    chunk.finish_chunk().proto
}

#[test]
fn nested_resume_replays_inner_to_outer() {
    let bytes = run_until_suspended(nested_call_chain_chunk());
    assert_eq!(drain_output(), Vec::<String>::new());

    let restored = deserialize_execution_context(&bytes, &test_registry()).unwrap();
    {
        let guard = restored.execution_stack.read().unwrap();
        let stack = guard.as_ref().unwrap();
        assert_eq!(stack.frames.len(), 5, "chunk + test4..test1");
        assert_eq!(stack.host_level, 5);
        assert_eq!(stack.current_level, 0);
    }

    restored.set_return_value(LuaValue::LuaString("Z".into()));
    assert!(matches!(
        suspendable_call(&restored, Varargs::None).unwrap(),
        CallOutcome::Completed(_)
    ));
    assert_eq!(
        drain_output(),
        vec!["Z", "after2", "after3", "after4", "tail"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
    );
}

// ── Identity across the byte boundary ────────────────────────────────────────

#[test]
fn round_trip_preserves_aliasing_and_cell_sharing() {
    let mut proto = ProtoBuilder::new("alias.lua");
    proto.max_stack_size = 4;
    proto.emit(abc(OpCode::Return, 0, 1, 0));
    let proto = Arc::new(proto.finish());

    let globals = LuaValue::new_table();
    let root = LuaClosure::root(Arc::clone(&proto), globals.clone());

    let t = new_table();
    t.write()
        .unwrap()
        .set(LuaValue::LuaString("self".into()), LuaValue::Table(t.clone()));

    let cell = Upvalue::closed(LuaValue::Integer(5));
    let c1 = Arc::new(LuaClosure::new(
        Arc::clone(&proto),
        globals.clone(),
        vec![cell.clone()],
    ));
    let c2 = Arc::new(LuaClosure::new(Arc::clone(&proto), globals, vec![cell]));

    let mut stack = ExecutionStack::new(LuaValue::Closure(Arc::clone(&root)));
    let mut frame = Frame::new(root);
    frame.stack[0] = LuaValue::Table(t.clone());
    frame.stack[1] = LuaValue::Table(t);
    frame.stack[2] = LuaValue::Closure(c1);
    frame.stack[3] = LuaValue::Closure(c2);
    stack.push_frame(frame);

    let bytes = serialize_execution_context(&mut stack, &HostRegistry::new()).unwrap();
    let restored = deserialize_execution_context(&bytes, &HostRegistry::new()).unwrap();

    let guard = restored.execution_stack.read().unwrap();
    let frame = &guard.as_ref().unwrap().frames[0];
    let (LuaValue::Table(a), LuaValue::Table(b)) = (&frame.stack[0], &frame.stack[1]) else {
        panic!("registers lost their tables");
    };
    assert!(Arc::ptr_eq(a, b), "aliased registers share one table");
    let inner = a.read().unwrap().get(&LuaValue::LuaString("self".into()));
    match inner {
        LuaValue::Table(inner) => assert!(Arc::ptr_eq(&inner, a), "self-cycle survives"),
        other => panic!("expected table, got {other:?}"),
    }

    let (LuaValue::Closure(c1), LuaValue::Closure(c2)) = (&frame.stack[2], &frame.stack[3])
    else {
        panic!("registers lost their closures");
    };
    assert!(
        c1.upvalues[0].ptr_eq(&c2.upvalues[0]),
        "peer closures still share their cell"
    );
}

// ── Registry misses fail loudly ──────────────────────────────────────────────

fn unlisted(_: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
    Ok(vec![])
}

#[test]
fn unregistered_native_cannot_be_serialized() {
    let mut proto = ProtoBuilder::new("unreg.lua");
    proto.emit(abc(OpCode::Return, 0, 1, 0));
    let root = LuaClosure::root(Arc::new(proto.finish()), LuaValue::new_table());

    let mut stack = ExecutionStack::new(LuaValue::Closure(Arc::clone(&root)));
    let mut frame = Frame::new(root);
    frame.stack[0] = LuaValue::NativeFunction(unlisted);
    stack.push_frame(frame);

    let err = serialize_execution_context(&mut stack, &HostRegistry::new()).unwrap_err();
    assert!(matches!(err, SnapshotError::UnregisteredNative));
}

#[test]
fn unknown_native_name_fails_restore() {
    let bytes = run_until_suspended(dialog_chunk());
    drain_output();
    let err = deserialize_execution_context(&bytes, &HostRegistry::new()).unwrap_err();
    assert!(matches!(err, SnapshotError::UnknownNative(_)));
}
