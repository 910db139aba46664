//! Raw 32-bit instruction words and their field decode.
//!
//! Layout (iABC / iABx / iAsBx):
//!
//! ```text
//!  31        23 22        14 13      6 5     0
//! +------------+------------+---------+------+
//! |     B      |     C      |    A    |  op  |
//! +------------+------------+---------+------+
//! |           Bx            |    A    |  op  |
//! +-------------------------+---------+------+
//! ```
//!
//! `sBx` is `Bx` biased by `0x1ffff`. An operand of the RK kind addresses
//! the constant pool when it exceeds `0xff`, registers otherwise.

use crate::error::LuaError;

/// Operand bias for RK encoding: `0x100 | k` addresses constant `k`.
pub const RK_CONST: u32 = 0x100;

/// Bias applied to the signed `sBx` field.
pub const SBX_BIAS: i32 = 0x1ffff;

/// SETLIST moves table elements in batches of this size.
pub const FIELDS_PER_FLUSH: usize = 50;

/// A single encoded instruction word.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    pub fn opcode(self) -> Result<OpCode, LuaError> {
        OpCode::from_u6((self.0 & 0x3f) as u8).ok_or_else(|| LuaError::illegal_opcode(self.0))
    }

    pub fn a(self) -> usize {
        ((self.0 >> 6) & 0xff) as usize
    }

    pub fn b(self) -> u32 {
        self.0 >> 23
    }

    pub fn c(self) -> u32 {
        (self.0 >> 14) & 0x1ff
    }

    pub fn bx(self) -> u32 {
        self.0 >> 14
    }

    pub fn sbx(self) -> i32 {
        self.bx() as i32 - SBX_BIAS
    }

    /// The wide unsigned operand of EXTRAARG.
    pub fn ax(self) -> u32 {
        self.0 >> 6
    }

    // ── Encoders (used by the chunk builder and tests) ───────────────────────

    pub fn abc(op: OpCode, a: u8, b: u32, c: u32) -> Instruction {
        debug_assert!(b < (1 << 9) && c < (1 << 9));
        Instruction(op as u32 | ((a as u32) << 6) | (c << 14) | (b << 23))
    }

    pub fn abx(op: OpCode, a: u8, bx: u32) -> Instruction {
        debug_assert!(bx < (1 << 18));
        Instruction(op as u32 | ((a as u32) << 6) | (bx << 14))
    }

    pub fn asbx(op: OpCode, a: u8, sbx: i32) -> Instruction {
        Self::abx(op, a, (sbx + SBX_BIAS) as u32)
    }

    pub fn ax_arg(ax: u32) -> Instruction {
        Instruction(OpCode::ExtraArg as u32 | (ax << 6))
    }
}

/// Address constant `k` as an RK operand.
pub fn rk(k: u8) -> u32 {
    RK_CONST | k as u32
}

/// The Lua 5.2 operation set.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Move = 0,
    LoadK,
    LoadBool,
    LoadNil,
    GetUpval,
    GetTabUp,
    GetTable,
    SetTabUp,
    SetUpval,
    SetTable,
    NewTable,
    Self_,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Not,
    Len,
    Concat,
    Jmp,
    Eq,
    Lt,
    Le,
    Test,
    TestSet,
    Call,
    TailCall,
    Return,
    ForLoop,
    ForPrep,
    TForCall,
    TForLoop,
    SetList,
    Closure,
    Vararg,
    ExtraArg,
}

impl OpCode {
    pub fn from_u6(n: u8) -> Option<OpCode> {
        use OpCode::*;
        Some(match n {
            0 => Move,
            1 => LoadK,
            2 => LoadBool,
            3 => LoadNil,
            4 => GetUpval,
            5 => GetTabUp,
            6 => GetTable,
            7 => SetTabUp,
            8 => SetUpval,
            9 => SetTable,
            10 => NewTable,
            11 => Self_,
            12 => Add,
            13 => Sub,
            14 => Mul,
            15 => Div,
            16 => Mod,
            17 => Pow,
            18 => Unm,
            19 => Not,
            20 => Len,
            21 => Concat,
            22 => Jmp,
            23 => Eq,
            24 => Lt,
            25 => Le,
            26 => Test,
            27 => TestSet,
            28 => Call,
            29 => TailCall,
            30 => Return,
            31 => ForLoop,
            32 => ForPrep,
            33 => TForCall,
            34 => TForLoop,
            35 => SetList,
            36 => Closure,
            37 => Vararg,
            38 => ExtraArg,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        use OpCode::*;
        match self {
            Move => "MOVE",
            LoadK => "LOADK",
            LoadBool => "LOADBOOL",
            LoadNil => "LOADNIL",
            GetUpval => "GETUPVAL",
            GetTabUp => "GETTABUP",
            GetTable => "GETTABLE",
            SetTabUp => "SETTABUP",
            SetUpval => "SETUPVAL",
            SetTable => "SETTABLE",
            NewTable => "NEWTABLE",
            Self_ => "SELF",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            Mod => "MOD",
            Pow => "POW",
            Unm => "UNM",
            Not => "NOT",
            Len => "LEN",
            Concat => "CONCAT",
            Jmp => "JMP",
            Eq => "EQ",
            Lt => "LT",
            Le => "LE",
            Test => "TEST",
            TestSet => "TESTSET",
            Call => "CALL",
            TailCall => "TAILCALL",
            Return => "RETURN",
            ForLoop => "FORLOOP",
            ForPrep => "FORPREP",
            TForCall => "TFORCALL",
            TForLoop => "TFORLOOP",
            SetList => "SETLIST",
            Closure => "CLOSURE",
            Vararg => "VARARG",
            ExtraArg => "EXTRAARG",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abc_round_trips_fields() {
        let i = Instruction::abc(OpCode::Add, 3, 0x1ff, 7);
        assert_eq!(i.opcode().unwrap(), OpCode::Add);
        assert_eq!(i.a(), 3);
        assert_eq!(i.b(), 0x1ff);
        assert_eq!(i.c(), 7);
    }

    #[test]
    fn sbx_bias_round_trips() {
        for off in [-5, 0, 12, -0x1ffff] {
            assert_eq!(Instruction::asbx(OpCode::Jmp, 0, off).sbx(), off);
        }
    }

    #[test]
    fn rk_operand_addresses_constants() {
        assert!(rk(0) > 0xff);
        assert_eq!(rk(9) & 0xff, 9);
        // Plain register operands stay below the threshold
        assert!(Instruction::abc(OpCode::Add, 0, 5, 6).b() <= 0xff);
    }

    #[test]
    fn unknown_opcode_is_illegal() {
        assert!(Instruction(63).opcode().is_err());
    }
}
