use cryo_core::{Instruction, LuaValue, Proto, UpvalueDesc};
use std::sync::Arc;

/// A loadable top-level chunk — thin wrapper around the root [`Proto`].
///
/// Produced by [`ProtoBuilder::finish_chunk`] or [`crate::decode::load`] and
/// handed to the engine wrapped in a root closure.
#[derive(Debug)]
pub struct Chunk {
    /// The root function prototype.
    pub proto: Arc<Proto>,
}

impl Chunk {
    pub fn new(proto: Proto) -> Self {
        Self {
            proto: Arc::new(proto),
        }
    }
}

// ── Proto builder ─────────────────────────────────────────────────────────────

/// Mutable builder for a [`Proto`].
///
/// With the compiler front end out of the picture, this is how hosts and
/// tests assemble code: emit raw words, intern constants, attach children
/// and upvalue descriptors, then `finish`.
#[derive(Debug)]
pub struct ProtoBuilder {
    pub code: Vec<u32>,
    pub line_info: Vec<u32>,
    pub k: Vec<LuaValue>,
    pub p: Vec<Arc<Proto>>,
    pub upvalues: Vec<UpvalueDesc>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
    pub source: String,
}

impl ProtoBuilder {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            code: Vec::new(),
            line_info: Vec::new(),
            k: Vec::new(),
            p: Vec::new(),
            upvalues: Vec::new(),
            num_params: 0,
            is_vararg: false,
            // room for a couple of scratch registers even in trivial chunks
            max_stack_size: 2,
            source: source.into(),
        }
    }

    /// Append one instruction; returns its pc for jump bookkeeping.
    pub fn emit(&mut self, i: Instruction) -> usize {
        self.code.push(i.0);
        self.line_info.push(0);
        self.code.len() - 1
    }

    /// Append one instruction tagged with a source line.
    pub fn emit_line(&mut self, i: Instruction, line: u32) -> usize {
        let pc = self.emit(i);
        self.line_info[pc] = line;
        pc
    }

    /// Intern a constant, deduplicating repeats.
    pub fn add_constant(&mut self, value: LuaValue) -> u16 {
        if let Some(idx) = self.k.iter().position(|c| c == &value) {
            return idx as u16;
        }
        let idx = self.k.len() as u16;
        self.k.push(value);
        idx
    }

    pub fn add_proto(&mut self, proto: Arc<Proto>) -> u16 {
        let idx = self.p.len() as u16;
        self.p.push(proto);
        idx
    }

    pub fn add_upvalue(&mut self, desc: UpvalueDesc) -> u8 {
        let idx = self.upvalues.len() as u8;
        self.upvalues.push(desc);
        idx
    }

    pub fn finish(self) -> Proto {
        Proto {
            code: self.code,
            k: self.k,
            p: self.p,
            upvalues: self.upvalues,
            num_params: self.num_params,
            is_vararg: self.is_vararg,
            max_stack_size: self.max_stack_size,
            source: self.source,
            line_info: self.line_info,
        }
    }

    pub fn finish_chunk(self) -> Chunk {
        Chunk::new(self.finish())
    }
}
