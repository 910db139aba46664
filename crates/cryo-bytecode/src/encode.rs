//! Binary encoder: `Chunk` → `Vec<u8>`.
//!
//! Format: MAGIC (6 bytes) followed by a recursive Proto encoding, all
//! multi-byte fields little-endian.

use cryo_core::{LuaValue, Proto};

use crate::chunk::Chunk;

/// Magic bytes identifying a compiled luacryo chunk file.
pub const MAGIC: &[u8] = b"\x1bCryo\x01";

// ── Low-level write helpers ───────────────────────────────────────────────────

fn push_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

fn push_u16_le(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_u32_le(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_i64_le(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_f64_le(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_str(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    push_u16_le(buf, bytes.len() as u16);
    buf.extend_from_slice(bytes);
}

// ── Proto encoder ─────────────────────────────────────────────────────────────

fn encode_proto(proto: &Proto, buf: &mut Vec<u8>) {
    push_str(buf, &proto.source);

    push_u8(buf, proto.num_params);
    push_u8(buf, proto.is_vararg as u8);
    push_u8(buf, proto.max_stack_size);

    // constants
    push_u16_le(buf, proto.k.len() as u16);
    for c in &proto.k {
        encode_constant(c, buf);
    }

    // upvalue descriptors
    push_u16_le(buf, proto.upvalues.len() as u16);
    for desc in &proto.upvalues {
        push_str(buf, &desc.name);
        push_u8(buf, desc.in_stack as u8);
        push_u8(buf, desc.index);
    }

    // nested protos
    push_u16_le(buf, proto.p.len() as u16);
    for p in &proto.p {
        encode_proto(p, buf);
    }

    // code
    push_u32_le(buf, proto.code.len() as u32);
    for word in &proto.code {
        push_u32_le(buf, *word);
    }

    // line info
    push_u32_le(buf, proto.line_info.len() as u32);
    for line in &proto.line_info {
        push_u32_le(buf, *line);
    }
}

fn encode_constant(val: &LuaValue, buf: &mut Vec<u8>) {
    match val {
        LuaValue::Nil => push_u8(buf, 0),
        LuaValue::Boolean(b) => {
            push_u8(buf, 1);
            push_u8(buf, *b as u8);
        }
        LuaValue::Integer(n) => {
            push_u8(buf, 2);
            push_i64_le(buf, *n);
        }
        LuaValue::Float(f) => {
            push_u8(buf, 3);
            push_f64_le(buf, *f);
        }
        LuaValue::LuaString(s) => {
            push_u8(buf, 4);
            push_str(buf, s);
        }
        // Reference types never appear in a constant pool; encode the slot
        // as nil rather than panicking on malformed input.
        _ => push_u8(buf, 0),
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encode a `Chunk` to bytes suitable for writing to a `.cryoc` file.
pub fn encode_chunk(chunk: &Chunk) -> Vec<u8> {
    let mut buf = MAGIC.to_vec();
    encode_proto(&chunk.proto, &mut buf);
    buf
}
