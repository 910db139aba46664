//! `cryo` — driver binary: run a chunk, suspend it to a snapshot file,
//! resume a snapshot, or disassemble a chunk.

use cryo_core::{LuaClosure, LuaError, LuaValue, Varargs};
use cryo_snapshot::{deserialize_execution_context, serialize_execution_context, HostRegistry};
use cryo_vm::{stdlib, suspendable_call, with_active_stack, CallOutcome};
use std::cell::RefCell;
use std::sync::Arc;

fn usage() -> ! {
    eprintln!("usage: cryo run <chunk.cryoc>");
    eprintln!("       cryo resume <file.snap> [value]");
    eprintln!("       cryo stop <file.snap>");
    eprintln!("       cryo disasm <chunk.cryoc>");
    std::process::exit(2);
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [cmd, path] if cmd == "run" => run_file(path),
        [cmd, path] if cmd == "resume" => resume_file(path, ""),
        [cmd, path, value] if cmd == "resume" => resume_file(path, value),
        [cmd, path] if cmd == "stop" => stop_file(path),
        [cmd, path] if cmd == "disasm" => disasm_file(path),
        _ => usage(),
    }
}

// ── Host side of the suspend contract ─────────────────────────────────────────
//
// `suspend()` is the one suspending callable this driver binds: it captures
// the live execution stack, serializes it, parks the bytes for main() to
// write out, and signals suspension.

thread_local! {
    static PENDING_SNAPSHOT: RefCell<Option<Vec<u8>>> = const { RefCell::new(None) };
}

fn host_suspend(_args: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
    let bytes = with_active_stack(|stack| {
        serialize_execution_context(stack, &registry())
            .map_err(|e| LuaError::host(e.to_string()))
    })??;
    PENDING_SNAPSHOT.with(|slot| *slot.borrow_mut() = Some(bytes));
    Err(LuaError::suspended())
}

fn registry() -> HostRegistry {
    let mut registry = HostRegistry::with_baseline();
    registry.register("suspend", host_suspend);
    registry
}

fn make_root(proto: Arc<cryo_core::Proto>) -> Arc<LuaClosure> {
    let globals = stdlib::default_globals();
    stdlib::bind(&globals, "suspend", host_suspend);
    LuaClosure::root(proto, globals)
}

// ── Subcommands ───────────────────────────────────────────────────────────────

fn run_file(path: &str) {
    let bytes = read(path);
    let chunk = cryo_bytecode::load(&bytes, path).unwrap_or_else(|e| {
        eprintln!("error: {e}");
        std::process::exit(1);
    });
    let root = make_root(chunk.proto);
    finish(suspendable_call(&root, Varargs::None), path);
}

fn resume_file(path: &str, value: &str) {
    let root = load_snapshot(path);
    if !value.is_empty() {
        root.set_return_value(LuaValue::LuaString(value.into()));
    }
    finish(suspendable_call(&root, Varargs::None), path);
}

fn stop_file(path: &str) {
    let root = load_snapshot(path);
    root.stop();
    match suspendable_call(&root, Varargs::None) {
        Ok(_) => eprintln!("stopped: {path}"),
        Err(e) => {
            eprintln!("runtime error: {e}");
            std::process::exit(1);
        }
    }
}

fn disasm_file(path: &str) {
    let bytes = read(path);
    let chunk = cryo_bytecode::load(&bytes, path).unwrap_or_else(|e| {
        eprintln!("error: {e}");
        std::process::exit(1);
    });
    print!("{}", cryo_bytecode::disassemble(&chunk.proto));
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn read(path: &str) -> Vec<u8> {
    std::fs::read(path).unwrap_or_else(|e| {
        eprintln!("error: cannot read '{path}': {e}");
        std::process::exit(1);
    })
}

fn load_snapshot(path: &str) -> Arc<LuaClosure> {
    let bytes = read(path);
    deserialize_execution_context(&bytes, &registry()).unwrap_or_else(|e| {
        eprintln!("error: {e}");
        std::process::exit(1);
    })
}

fn snap_path(path: &str) -> String {
    match path.strip_suffix(".cryoc") {
        Some(stem) => format!("{stem}.snap"),
        None => format!("{path}.snap"),
    }
}

fn finish(outcome: Result<CallOutcome, LuaError>, path: &str) {
    match outcome {
        Ok(CallOutcome::Completed(vals)) => {
            let vals = vals.to_vec();
            if !vals.is_empty() {
                let parts: Vec<String> = vals.iter().map(|v| v.to_string()).collect();
                println!("{}", parts.join("\t"));
            }
        }
        Ok(CallOutcome::Suspended) => {
            let bytes = PENDING_SNAPSHOT
                .with(|slot| slot.borrow_mut().take())
                .unwrap_or_default();
            let dest = snap_path(path);
            std::fs::write(&dest, &bytes).unwrap_or_else(|e| {
                eprintln!("error: cannot write '{dest}': {e}");
                std::process::exit(1);
            });
            eprintln!("suspended: wrote {} bytes to '{dest}'", bytes.len());
        }
        Err(e) => {
            eprintln!("runtime error: {e}");
            for line in &e.traceback {
                eprintln!("{line}");
            }
            std::process::exit(1);
        }
    }
}
