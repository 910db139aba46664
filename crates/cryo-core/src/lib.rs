//! `cryo-core` — data model shared across the luacryo workspace.
//!
//! This crate defines:
//! - [`LuaValue`]: the dynamically-typed Lua value enum, with the raw
//!   arithmetic/comparison/coercion semantics
//! - [`Varargs`]: variadic bundles and the tail-call trampoline sentinel
//! - [`Proto`]: immutable compiled prototypes over raw instruction words
//! - [`Upvalue`] / [`LuaClosure`]: capture cells and runtime closures
//! - [`Frame`] / [`ExecutionStack`]: the pausable call chain
//! - [`LuaError`]: the unified error type
//!
//! The dispatch loops that animate these types live in `cryo-vm`.

pub mod closure;
pub mod error;
pub mod frame;
pub mod instruction;
pub mod proto;
pub mod stack;
pub mod table;
pub mod value;
pub mod varargs;

pub use closure::{LuaClosure, Upvalue, UpvalueInner};
pub use error::{LuaError, LuaErrorKind};
pub use frame::Frame;
pub use instruction::{Instruction, OpCode};
pub use proto::{Proto, UpvalueDesc};
pub use stack::{ExecutionStack, HOST_LEVEL_NONE};
pub use table::{HashKey, LuaTable};
pub use value::{Buffer, LuaValue, NativeFn, NIL};
pub use varargs::{TailCall, Varargs};
