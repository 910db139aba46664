//! `cryo-snapshot` — continuation capture and restore.
//!
//! A suspended script is an [`ExecutionStack`] full of frames plus the
//! closure graph hanging off it. [`serialize_execution_context`] turns that
//! into bytes; [`deserialize_execution_context`] rehydrates the bytes — in
//! the same process or a fresh one — into a root closure whose next
//! `suspendable_call` picks up at the exact instruction that was pending.
//!
//! The byte container is `bincode` over plain record types; it is not a
//! stable cross-version format. Host functions cross the boundary by name
//! through a [`HostRegistry`].

mod graph;

use cryo_core::{ExecutionStack, LuaClosure, NativeFn};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    /// A host function reachable from the stack has no registry name.
    #[error("host function not registered for snapshot")]
    UnregisteredNative,

    /// The snapshot names a host function this registry does not know.
    #[error("unknown host function '{0}' in snapshot")]
    UnknownNative(String),

    /// The byte graph is structurally inconsistent.
    #[error("malformed snapshot graph: {0}")]
    BadGraph(String),

    #[error("snapshot codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Two-way `name ↔ fn` map for every host function that may be reachable
/// from a snapshot: the stdlib baseline plus whatever the host binds.
#[derive(Default)]
pub struct HostRegistry {
    entries: Vec<(String, NativeFn)>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the stdlib baseline bindings.
    pub fn with_baseline() -> Self {
        let mut registry = Self::new();
        for (name, f) in cryo_vm::stdlib::natives() {
            registry.register(name, f);
        }
        registry
    }

    /// Register one host function. Later registrations of the same name
    /// shadow earlier ones on lookup.
    pub fn register(&mut self, name: impl Into<String>, f: NativeFn) {
        self.entries.push((name.into(), f));
    }

    /// The registered name for `f`, by function pointer identity.
    pub fn name_of(&self, f: NativeFn) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, g)| *g as usize == f as usize)
            .map(|(name, _)| name.as_str())
    }

    /// The function registered under `name`.
    pub fn get(&self, name: &str) -> Option<NativeFn> {
        self.entries
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, f)| *f)
    }
}

/// Serialize a live execution stack — typically from inside the suspending
/// host callable, through `cryo_vm::with_active_stack`.
///
/// Every open upvalue cell is force-closed first: that breaks the
/// cell-to-frame cycles and fixes each captured value in place, so the
/// serialized graph is a DAG and identity survives the round trip. The
/// snapshot records the pending call depth as its splice level and restarts
/// the walk at the outermost frame.
pub fn serialize_execution_context(
    stack: &mut ExecutionStack,
    registry: &HostRegistry,
) -> Result<Vec<u8>, SnapshotError> {
    stack.close_all();
    let graph = graph::flatten(stack, registry)?;
    Ok(bincode::serialize(&graph)?)
}

/// Rehydrate a snapshot into a root closure with its execution stack
/// attached. `cryo_vm::suspendable_call` on the result resumes the script;
/// `LuaClosure::set_return_value` first installs what the pending host call
/// should appear to have returned.
pub fn deserialize_execution_context(
    bytes: &[u8],
    registry: &HostRegistry,
) -> Result<Arc<LuaClosure>, SnapshotError> {
    let graph = bincode::deserialize(bytes)?;
    let (root, stack) = graph::rebuild(&graph, registry)?;
    root.attach_stack(stack);
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryo_core::{LuaError, LuaValue};

    fn nop(_: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
        Ok(vec![])
    }

    fn other(_: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
        Ok(vec![LuaValue::Nil])
    }

    #[test]
    fn registry_maps_both_ways() {
        let mut r = HostRegistry::new();
        r.register("nop", nop);
        assert_eq!(r.name_of(nop), Some("nop"));
        assert!(r.name_of(other).is_none());
        assert_eq!(r.get("nop").map(|f| f as usize), Some(nop as usize));
        assert!(r.get("missing").is_none());
    }

    #[test]
    fn baseline_covers_the_stdlib() {
        let r = HostRegistry::with_baseline();
        for (name, f) in cryo_vm::stdlib::natives() {
            assert_eq!(r.name_of(f), Some(name));
        }
    }
}
