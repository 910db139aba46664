//! Binary decoder: `&[u8]` → `Chunk`.
//!
//! Mirrors the encoding in `encode.rs` exactly.

use std::sync::Arc;

use cryo_core::{LuaError, LuaValue, Proto, UpvalueDesc};

use crate::chunk::Chunk;
use crate::encode::MAGIC;

// ── Cursor reader ─────────────────────────────────────────────────────────────

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.remaining() < n {
            return Err(format!(
                "unexpected end of data: need {n} bytes at offset {}",
                self.pos
            ));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, String> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16_le(&mut self) -> Result<u16, String> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32_le(&mut self) -> Result<u32, String> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i64_le(&mut self) -> Result<i64, String> {
        let b = self.read_bytes(8)?;
        Ok(i64::from_le_bytes(b.try_into().unwrap()))
    }

    fn read_f64_le(&mut self) -> Result<f64, String> {
        let b = self.read_bytes(8)?;
        Ok(f64::from_le_bytes(b.try_into().unwrap()))
    }

    fn read_str(&mut self) -> Result<String, String> {
        let len = self.read_u16_le()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| format!("invalid UTF-8 in string: {e}"))
    }
}

// ── Proto decoder ─────────────────────────────────────────────────────────────

fn decode_proto(r: &mut Reader<'_>) -> Result<Proto, String> {
    let source = r.read_str()?;

    let num_params = r.read_u8()?;
    let is_vararg = r.read_u8()? != 0;
    let max_stack_size = r.read_u8()?;

    let const_count = r.read_u16_le()? as usize;
    let mut k = Vec::with_capacity(const_count);
    for _ in 0..const_count {
        k.push(decode_constant(r)?);
    }

    let upval_count = r.read_u16_le()? as usize;
    let mut upvalues = Vec::with_capacity(upval_count);
    for _ in 0..upval_count {
        let name = r.read_str()?;
        let in_stack = r.read_u8()? != 0;
        let index = r.read_u8()?;
        upvalues.push(UpvalueDesc {
            name,
            in_stack,
            index,
        });
    }

    let proto_count = r.read_u16_le()? as usize;
    let mut p = Vec::with_capacity(proto_count);
    for _ in 0..proto_count {
        p.push(Arc::new(decode_proto(r)?));
    }

    let code_count = r.read_u32_le()? as usize;
    let mut code = Vec::with_capacity(code_count);
    for _ in 0..code_count {
        code.push(r.read_u32_le()?);
    }

    let line_count = r.read_u32_le()? as usize;
    let mut line_info = Vec::with_capacity(line_count);
    for _ in 0..line_count {
        line_info.push(r.read_u32_le()?);
    }

    Ok(Proto {
        code,
        k,
        p,
        upvalues,
        num_params,
        is_vararg,
        max_stack_size,
        source,
        line_info,
    })
}

fn decode_constant(r: &mut Reader<'_>) -> Result<LuaValue, String> {
    Ok(match r.read_u8()? {
        0 => LuaValue::Nil,
        1 => LuaValue::Boolean(r.read_u8()? != 0),
        2 => LuaValue::Integer(r.read_i64_le()?),
        3 => LuaValue::Float(r.read_f64_le()?),
        4 => LuaValue::LuaString(r.read_str()?),
        tag => return Err(format!("unknown constant tag {tag}")),
    })
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Decode a chunk previously produced by [`crate::encode::encode_chunk`].
pub fn decode_chunk(bytes: &[u8]) -> Result<Chunk, LuaError> {
    if !bytes.starts_with(MAGIC) {
        return Err(LuaError::runtime("not a luacryo chunk: bad magic"));
    }
    let mut r = Reader::new(&bytes[MAGIC.len()..]);
    let proto = decode_proto(&mut r).map_err(LuaError::runtime)?;
    Ok(Chunk::new(proto))
}

/// Driver entry point: decode `bytes` into a chunk, naming its root
/// prototype `name` (the on-disk source label stands when `name` is empty).
pub fn load(bytes: &[u8], name: &str) -> Result<Chunk, LuaError> {
    if !bytes.starts_with(MAGIC) {
        return Err(LuaError::runtime("not a luacryo chunk: bad magic"));
    }
    let mut r = Reader::new(&bytes[MAGIC.len()..]);
    let mut proto = decode_proto(&mut r).map_err(LuaError::runtime)?;
    if !name.is_empty() {
        proto.source = name.to_string();
    }
    Ok(Chunk::new(proto))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ProtoBuilder;
    use crate::encode::encode_chunk;
    use cryo_core::{Instruction, OpCode};

    fn nested_chunk() -> Chunk {
        let mut inner = ProtoBuilder::new("<inner>");
        inner.num_params = 1;
        inner.add_constant(LuaValue::Float(0.5));
        inner.add_upvalue(UpvalueDesc::in_parent("_ENV", 0));
        inner.emit(Instruction::abc(OpCode::Return, 0, 2, 0));
        let inner = Arc::new(inner.finish());

        let mut outer = ProtoBuilder::new("demo.lua");
        outer.is_vararg = true;
        outer.max_stack_size = 5;
        outer.add_constant(LuaValue::Integer(42));
        outer.add_constant(LuaValue::LuaString("hi".into()));
        outer.add_constant(LuaValue::Boolean(true));
        outer.add_constant(LuaValue::Nil);
        outer.add_upvalue(UpvalueDesc::in_stack("x", 3));
        outer.add_proto(inner);
        outer.emit_line(Instruction::abx(OpCode::Closure, 0, 0), 1);
        outer.emit_line(Instruction::abc(OpCode::Return, 0, 1, 0), 2);
        outer.finish_chunk()
    }

    #[test]
    fn codec_round_trips_a_nested_tree() {
        let chunk = nested_chunk();
        let bytes = encode_chunk(&chunk);
        let back = decode_chunk(&bytes).unwrap();

        assert_eq!(back.proto.source, "demo.lua");
        assert_eq!(back.proto.code, chunk.proto.code);
        assert_eq!(back.proto.k, chunk.proto.k);
        assert_eq!(back.proto.line_info, vec![1, 2]);
        assert_eq!(back.proto.max_stack_size, 5);
        assert!(back.proto.is_vararg);
        assert_eq!(back.proto.upvalues, chunk.proto.upvalues);

        let inner = &back.proto.p[0];
        assert_eq!(inner.source, "<inner>");
        assert_eq!(inner.num_params, 1);
        assert_eq!(inner.k, vec![LuaValue::Float(0.5)]);
    }

    #[test]
    fn load_renames_the_root_only() {
        let bytes = encode_chunk(&nested_chunk());
        let chunk = load(&bytes, "renamed.lua").unwrap();
        assert_eq!(chunk.proto.source, "renamed.lua");
        assert_eq!(chunk.proto.p[0].source, "<inner>");
    }

    #[test]
    fn bad_magic_is_rejected() {
        assert!(decode_chunk(b"\x1bLua\x52junk").is_err());
    }

    #[test]
    fn truncated_chunk_is_rejected() {
        let bytes = encode_chunk(&nested_chunk());
        assert!(decode_chunk(&bytes[..bytes.len() - 3]).is_err());
    }
}
