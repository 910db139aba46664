use thiserror::Error;

/// Unified error type for the engine.
///
/// Carries the raise site (`fileline`) and the unwind path (`traceback`)
/// alongside the failure itself; both are filled in by the dispatch loop as
/// the error propagates outward.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{kind}")]
pub struct LuaError {
    pub kind: LuaErrorKind,
    /// Stack level the error was raised at (1 = the raising function).
    pub level: u32,
    /// `source:line` of the instruction that raised, once known.
    pub fileline: Option<String>,
    /// One entry per unwound frame, innermost first.
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LuaErrorKind {
    /// A runtime error (equivalent to Lua's `error()` function).
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Wrong type used for an operation.
    #[error("type error: expected {expected}, got {got}")]
    TypeError {
        expected: &'static str,
        got: &'static str,
    },

    /// Unexecutable or unknown instruction word — fatal.
    #[error("illegal opcode {0:#010x}")]
    IllegalOpcode(u32),

    /// A non-Lua failure raised by a host callable, re-wrapped.
    #[error("host error: {0}")]
    Host(String),

    /// Internal control-flow signal: a host callable requested suspension
    /// at a call boundary. Never surfaces from a suspendable root entry.
    #[error("execution suspended")]
    Suspended,
}

impl LuaError {
    fn of(kind: LuaErrorKind) -> Self {
        Self {
            kind,
            level: 1,
            fileline: None,
            traceback: Vec::new(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::of(LuaErrorKind::Runtime(message.into()))
    }

    pub fn type_error(expected: &'static str, got: &'static str) -> Self {
        Self::of(LuaErrorKind::TypeError { expected, got })
    }

    pub fn illegal_opcode(word: u32) -> Self {
        Self::of(LuaErrorKind::IllegalOpcode(word))
    }

    pub fn host(message: impl Into<String>) -> Self {
        Self::of(LuaErrorKind::Host(message.into()))
    }

    pub fn suspended() -> Self {
        Self::of(LuaErrorKind::Suspended)
    }

    /// True for the cooperative suspend signal, which must be passed through
    /// untouched rather than decorated like a genuine failure.
    pub fn is_suspend(&self) -> bool {
        matches!(self.kind, LuaErrorKind::Suspended)
    }

    /// Record the raise site. The first location wins; re-raises along the
    /// unwind path keep the innermost `source:line`.
    pub fn with_location(mut self, source: &str, line: u32) -> Self {
        if self.fileline.is_none() {
            self.fileline = Some(format!("{source}:{line}"));
        }
        self
    }

    /// Append one unwound frame to the traceback.
    pub fn trace_frame(&mut self, entry: String) {
        self.traceback.push(entry);
    }

    /// Replace the message, keeping location and traceback. Used by the
    /// message hook: the hook rewrites the text only.
    pub fn reword(&mut self, message: String) {
        self.kind = LuaErrorKind::Runtime(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_location_wins() {
        let e = LuaError::runtime("boom")
            .with_location("a.lua", 3)
            .with_location("b.lua", 9);
        assert_eq!(e.fileline.as_deref(), Some("a.lua:3"));
    }

    #[test]
    fn suspend_is_not_a_failure() {
        assert!(LuaError::suspended().is_suspend());
        assert!(!LuaError::runtime("x").is_suspend());
    }
}
