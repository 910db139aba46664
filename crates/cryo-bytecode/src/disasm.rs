use cryo_core::{Instruction, LuaValue, OpCode, Proto};

/// Disassemble a [`Proto`] into a human-readable string.
///
/// Recursively lists any nested prototypes so you see the full picture.
pub fn disassemble(proto: &Proto) -> String {
    let mut out = String::new();
    disasm_proto(proto, &mut out);
    out
}

fn disasm_proto(proto: &Proto, out: &mut String) {
    let name = if proto.source.is_empty() {
        "<?>".to_string()
    } else {
        proto.source.clone()
    };
    out.push_str(&format!(
        "== {} ==  (params={}, vararg={}, stack={})\n",
        name, proto.num_params, proto.is_vararg, proto.max_stack_size
    ));

    if !proto.k.is_empty() {
        out.push_str("constants:\n");
        for (i, c) in proto.k.iter().enumerate() {
            out.push_str(&format!("  [K{i}]  {}\n", fmt_value(c)));
        }
    }

    if !proto.upvalues.is_empty() {
        out.push_str("upvalues:\n");
        for (i, uv) in proto.upvalues.iter().enumerate() {
            let place = if uv.in_stack { "stack reg" } else { "parent idx" };
            out.push_str(&format!("  [U{i}]  {} {}={}\n", uv.name, place, uv.index));
        }
    }

    out.push_str("instructions:\n");
    for (pc, word) in proto.code.iter().enumerate() {
        out.push_str(&format!("  {}\n", fmt_instruction(pc, *word, proto)));
    }

    for sub in &proto.p {
        out.push('\n');
        disasm_proto(sub, out);
    }
}

fn fmt_instruction(pc: usize, word: u32, proto: &Proto) -> String {
    let i = Instruction(word);
    let Ok(op) = i.opcode() else {
        return format!("{pc:04}  ???       {word:#010x}");
    };
    let fields = match op {
        // Bx-shaped
        OpCode::LoadK | OpCode::Closure => format!("{} {}", i.a(), i.bx()),
        // sBx-shaped
        OpCode::Jmp | OpCode::ForLoop | OpCode::ForPrep | OpCode::TForLoop => {
            format!("{} {:+}", i.a(), i.sbx())
        }
        OpCode::ExtraArg => format!("{}", i.ax()),
        _ => format!("{} {} {}", i.a(), i.b(), i.c()),
    };
    let mut line = format!("{pc:04}  {:<9} {fields}", op.name());
    if let Some(comment) = comment_for(i, op, proto) {
        line.push_str(&format!("  ; {comment}"));
    }
    line
}

/// Resolve constant operands into the comment column.
fn comment_for(i: Instruction, op: OpCode, proto: &Proto) -> Option<String> {
    let k = |x: u32| -> Option<String> {
        if x > 0xff {
            proto.k.get((x & 0xff) as usize).map(fmt_value)
        } else {
            None
        }
    };
    match op {
        OpCode::LoadK => proto.k.get(i.bx() as usize).map(fmt_value),
        OpCode::GetTabUp
        | OpCode::GetTable
        | OpCode::SetTabUp
        | OpCode::SetTable
        | OpCode::Self_
        | OpCode::Add
        | OpCode::Sub
        | OpCode::Mul
        | OpCode::Div
        | OpCode::Mod
        | OpCode::Pow
        | OpCode::Eq
        | OpCode::Lt
        | OpCode::Le => {
            let parts: Vec<String> = [k(i.b()), k(i.c())].into_iter().flatten().collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(" "))
            }
        }
        _ => None,
    }
}

fn fmt_value(v: &LuaValue) -> String {
    match v {
        LuaValue::LuaString(s) => format!("{s:?}"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ProtoBuilder;
    use cryo_core::instruction::rk;

    #[test]
    fn listing_resolves_constants() {
        let mut b = ProtoBuilder::new("demo.lua");
        let k = b.add_constant(LuaValue::LuaString("print".into()));
        b.emit(Instruction::abc(OpCode::GetTabUp, 0, 0, rk(k as u8)));
        b.emit(Instruction::abc(OpCode::Return, 0, 1, 0));
        let listing = disassemble(&b.finish());
        assert!(listing.contains("GETTABUP"));
        assert!(listing.contains("\"print\""));
        assert!(listing.contains("== demo.lua =="));
    }
}
