//! `cryo-bytecode` — the chunk container around the engine.
//!
//! The compiler front end is not part of this workspace; code arrives either
//! pre-assembled through [`ProtoBuilder`] or from disk through [`load`].

pub mod chunk;
pub mod decode;
pub mod disasm;
pub mod encode;

pub use chunk::{Chunk, ProtoBuilder};
pub use decode::{decode_chunk, load};
pub use disasm::disassemble;
pub use encode::{encode_chunk, MAGIC};
