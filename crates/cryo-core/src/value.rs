use crate::closure::LuaClosure;
use crate::error::LuaError;
use crate::table::LuaTable;
use std::sync::{Arc, RwLock};

/// Signature of a host function callable from script code.
///
/// A plain callable returns its results directly; a suspending callable
/// returns the engine's suspend signal (`LuaError::suspended()`) after
/// arranging its own continuation (typically by snapshotting the live
/// execution stack).
pub type NativeFn = fn(Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError>;

/// All Lua value types, following the Lua 5.2 type system.
#[derive(Clone)]
pub enum LuaValue {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    LuaString(String),
    /// A host function callable from Lua.
    NativeFunction(NativeFn),
    /// A Lua closure (compiled prototype + environment + upvalues).
    Closure(Arc<LuaClosure>),
    /// A Lua table (array + hash parts, reference-counted + interior mutability).
    Table(Arc<RwLock<LuaTable>>),
    /// An opaque host-object handle; indexing delegates to its method table.
    UserData(Arc<RwLock<LuaTable>>),
}

/// The canonical nil. Identity-comparable and cheap to clone.
pub const NIL: LuaValue = LuaValue::Nil;

/// Numeric view of a value after coercion.
enum Num {
    Int(i64),
    Float(f64),
}

fn as_num(v: &LuaValue) -> Option<Num> {
    match v {
        LuaValue::Integer(n) => Some(Num::Int(*n)),
        LuaValue::Float(f) => Some(Num::Float(*f)),
        // Arithmetic coerces numeric strings, per the reference manual.
        LuaValue::LuaString(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<i64>() {
                Some(Num::Int(n))
            } else if let Ok(f) = s.parse::<f64>() {
                Some(Num::Float(f))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn as_float(v: &LuaValue) -> Result<f64, LuaError> {
    match as_num(v) {
        Some(Num::Int(n)) => Ok(n as f64),
        Some(Num::Float(f)) => Ok(f),
        None => Err(LuaError::type_error("number", v.type_name())),
    }
}

/// Pick the operand to blame in a two-operand arithmetic type error.
fn blame<'a>(a: &'a LuaValue, b: &'a LuaValue) -> &'a LuaValue {
    if as_num(a).is_none() {
        a
    } else {
        b
    }
}

impl LuaValue {
    /// Returns the Lua type name string as per the reference manual.
    pub fn type_name(&self) -> &'static str {
        match self {
            LuaValue::Nil => "nil",
            LuaValue::Boolean(_) => "boolean",
            LuaValue::Integer(_) => "number",
            LuaValue::Float(_) => "number",
            LuaValue::LuaString(_) => "string",
            LuaValue::NativeFunction(_) => "function",
            LuaValue::Closure(_) => "function",
            LuaValue::Table(_) => "table",
            LuaValue::UserData(_) => "userdata",
        }
    }

    /// Boolean projection: everything except `nil` and `false` is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, LuaValue::Nil | LuaValue::Boolean(false))
    }

    /// Create a new empty table value.
    pub fn new_table() -> Self {
        LuaValue::Table(Arc::new(RwLock::new(LuaTable::new())))
    }

    // ── Arithmetic ───────────────────────────────────────────────────────────
    //
    // Integer pairs stay integral (wrapping, as the reference integer ops do);
    // any float operand promotes. Division and exponentiation always work in
    // floats.

    pub fn add(&self, other: &LuaValue) -> Result<LuaValue, LuaError> {
        match (as_num(self), as_num(other)) {
            (Some(Num::Int(x)), Some(Num::Int(y))) => Ok(LuaValue::Integer(x.wrapping_add(y))),
            (Some(a), Some(b)) => Ok(LuaValue::Float(float_of(a) + float_of(b))),
            _ => Err(LuaError::type_error("number", blame(self, other).type_name())),
        }
    }

    pub fn sub(&self, other: &LuaValue) -> Result<LuaValue, LuaError> {
        match (as_num(self), as_num(other)) {
            (Some(Num::Int(x)), Some(Num::Int(y))) => Ok(LuaValue::Integer(x.wrapping_sub(y))),
            (Some(a), Some(b)) => Ok(LuaValue::Float(float_of(a) - float_of(b))),
            _ => Err(LuaError::type_error("number", blame(self, other).type_name())),
        }
    }

    pub fn mul(&self, other: &LuaValue) -> Result<LuaValue, LuaError> {
        match (as_num(self), as_num(other)) {
            (Some(Num::Int(x)), Some(Num::Int(y))) => Ok(LuaValue::Integer(x.wrapping_mul(y))),
            (Some(a), Some(b)) => Ok(LuaValue::Float(float_of(a) * float_of(b))),
            _ => Err(LuaError::type_error("number", blame(self, other).type_name())),
        }
    }

    pub fn div(&self, other: &LuaValue) -> Result<LuaValue, LuaError> {
        Ok(LuaValue::Float(as_float(self)? / as_float(other)?))
    }

    pub fn modulo(&self, other: &LuaValue) -> Result<LuaValue, LuaError> {
        match (as_num(self), as_num(other)) {
            (Some(Num::Int(_)), Some(Num::Int(0))) => {
                Err(LuaError::runtime("attempt to perform 'n%0'"))
            }
            (Some(Num::Int(x)), Some(Num::Int(y))) => {
                // floor modulo: the result takes the divisor's sign
                let r = x.wrapping_rem(y);
                let r = if r != 0 && (r < 0) != (y < 0) { r + y } else { r };
                Ok(LuaValue::Integer(r))
            }
            (Some(a), Some(b)) => {
                let (x, y) = (float_of(a), float_of(b));
                Ok(LuaValue::Float(x - (x / y).floor() * y))
            }
            _ => Err(LuaError::type_error("number", blame(self, other).type_name())),
        }
    }

    pub fn pow(&self, other: &LuaValue) -> Result<LuaValue, LuaError> {
        Ok(LuaValue::Float(as_float(self)?.powf(as_float(other)?)))
    }

    pub fn unm(&self) -> Result<LuaValue, LuaError> {
        match as_num(self) {
            Some(Num::Int(n)) => Ok(LuaValue::Integer(n.wrapping_neg())),
            Some(Num::Float(f)) => Ok(LuaValue::Float(-f)),
            None => Err(LuaError::type_error("number", self.type_name())),
        }
    }

    /// Raw length: string bytes or table border. Metamethod dispatch happens
    /// in the engine layer before falling back here.
    pub fn len(&self) -> Result<LuaValue, LuaError> {
        match self {
            LuaValue::LuaString(s) => Ok(LuaValue::Integer(s.len() as i64)),
            LuaValue::Table(t) => Ok(LuaValue::Integer(t.read().unwrap().length())),
            _ => Err(LuaError::type_error("string or table", self.type_name())),
        }
    }

    // ── Comparison ───────────────────────────────────────────────────────────
    //
    // Numbers compare across the integer/float split; strings compare
    // byte-wise. Anything else is a type error (no coercion here).

    pub fn lt_b(&self, other: &LuaValue) -> Result<bool, LuaError> {
        match (self, other) {
            (LuaValue::Integer(x), LuaValue::Integer(y)) => Ok(x < y),
            (LuaValue::Float(x), LuaValue::Float(y)) => Ok(x < y),
            (LuaValue::Integer(x), LuaValue::Float(y)) => Ok((*x as f64) < *y),
            (LuaValue::Float(x), LuaValue::Integer(y)) => Ok(*x < (*y as f64)),
            (LuaValue::LuaString(x), LuaValue::LuaString(y)) => Ok(x < y),
            _ => Err(LuaError::type_error("number or string", self.type_name())),
        }
    }

    pub fn le_b(&self, other: &LuaValue) -> Result<bool, LuaError> {
        match (self, other) {
            (LuaValue::Integer(x), LuaValue::Integer(y)) => Ok(x <= y),
            (LuaValue::Float(x), LuaValue::Float(y)) => Ok(x <= y),
            (LuaValue::Integer(x), LuaValue::Float(y)) => Ok((*x as f64) <= *y),
            (LuaValue::Float(x), LuaValue::Integer(y)) => Ok(*x <= (*y as f64)),
            (LuaValue::LuaString(x), LuaValue::LuaString(y)) => Ok(x <= y),
            _ => Err(LuaError::type_error("number or string", self.type_name())),
        }
    }

    pub fn gt_b(&self, other: &LuaValue) -> Result<bool, LuaError> {
        other.lt_b(self)
    }

    pub fn gteq_b(&self, other: &LuaValue) -> Result<bool, LuaError> {
        other.le_b(self)
    }

    /// Raw equality (`==` without `__eq`). Delegates to `PartialEq`.
    pub fn eq_b(&self, other: &LuaValue) -> bool {
        self == other
    }

    // ── Coercion ─────────────────────────────────────────────────────────────

    /// Coerce to a numeric value, or `None` if the value has no numeric
    /// reading. Strings parse as integers first, then floats.
    pub fn coerce_number(&self) -> Option<LuaValue> {
        match as_num(self) {
            Some(Num::Int(n)) => Some(LuaValue::Integer(n)),
            Some(Num::Float(f)) => Some(LuaValue::Float(f)),
            None => None,
        }
    }

    /// Numeric coercion for `for`-loop control values. `what` is the operand
    /// role used in the reference error wording ("initial value", "limit",
    /// "step").
    pub fn fornum(&self, what: &str) -> Result<LuaValue, LuaError> {
        self.coerce_number()
            .ok_or_else(|| LuaError::runtime(format!("'for' {what} must be a number")))
    }

    /// Start a string accumulation seeded with this value.
    pub fn buffer(&self) -> Result<Buffer, LuaError> {
        let mut b = Buffer::new();
        b.append_value(self)?;
        Ok(b)
    }
}

fn float_of(n: Num) -> f64 {
    match n {
        Num::Int(i) => i as f64,
        Num::Float(f) => f,
    }
}

// ── Buffer ────────────────────────────────────────────────────────────────────

/// Left-to-right string accumulator backing the CONCAT instruction.
#[derive(Default)]
pub struct Buffer {
    buf: String,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one value, coercing numbers through the one number→string
    /// formatting the rest of the engine uses (`Display`), so `..` and
    /// `tostring` agree. Anything that is not a string or number is a concat
    /// type error.
    pub fn append_value(&mut self, v: &LuaValue) -> Result<(), LuaError> {
        match v {
            LuaValue::LuaString(s) => self.buf.push_str(s),
            LuaValue::Integer(_) | LuaValue::Float(_) => self.buf.push_str(&v.to_string()),
            _ => return Err(LuaError::type_error("string or number", v.type_name())),
        }
        Ok(())
    }

    /// Append another accumulation to this one.
    pub fn concat(&mut self, other: Buffer) {
        self.buf.push_str(&other.buf);
    }

    /// Flatten into a string value.
    pub fn value(self) -> LuaValue {
        LuaValue::LuaString(self.buf)
    }
}

// NativeFunction is a plain fn pointer which implements PartialEq via pointer
// equality; tables, userdata, and closures compare by identity.
impl PartialEq for LuaValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LuaValue::Nil, LuaValue::Nil) => true,
            (LuaValue::Boolean(a), LuaValue::Boolean(b)) => a == b,
            (LuaValue::Integer(a), LuaValue::Integer(b)) => a == b,
            (LuaValue::Float(a), LuaValue::Float(b)) => a == b,
            (LuaValue::Integer(a), LuaValue::Float(b)) => (*a as f64) == *b,
            (LuaValue::Float(a), LuaValue::Integer(b)) => *a == (*b as f64),
            (LuaValue::LuaString(a), LuaValue::LuaString(b)) => a == b,
            (LuaValue::NativeFunction(a), LuaValue::NativeFunction(b)) => {
                (*a as usize) == (*b as usize)
            }
            (LuaValue::Closure(a), LuaValue::Closure(b)) => Arc::ptr_eq(a, b),
            (LuaValue::Table(a), LuaValue::Table(b)) => Arc::ptr_eq(a, b),
            (LuaValue::UserData(a), LuaValue::UserData(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for LuaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LuaValue::Nil => write!(f, "LuaValue::Nil"),
            LuaValue::Boolean(b) => write!(f, "LuaValue::Boolean({b})"),
            LuaValue::Integer(n) => write!(f, "LuaValue::Integer({n})"),
            LuaValue::Float(n) => write!(f, "LuaValue::Float({n})"),
            LuaValue::LuaString(s) => write!(f, "LuaValue::LuaString({s:?})"),
            LuaValue::NativeFunction(_) => write!(f, "LuaValue::NativeFunction(<fn>)"),
            LuaValue::Closure(c) => write!(f, "LuaValue::Closure({:p})", Arc::as_ptr(c)),
            LuaValue::Table(t) => write!(f, "LuaValue::Table({:p})", Arc::as_ptr(t)),
            LuaValue::UserData(u) => write!(f, "LuaValue::UserData({:p})", Arc::as_ptr(u)),
        }
    }
}

impl std::fmt::Display for LuaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LuaValue::Nil => write!(f, "nil"),
            LuaValue::Boolean(b) => write!(f, "{b}"),
            LuaValue::Integer(n) => write!(f, "{n}"),
            LuaValue::Float(n) => {
                // Lua displays 1.0 as "1.0", not "1"
                if n.fract() == 0.0 && n.is_finite() {
                    write!(f, "{n:.1}")
                } else {
                    write!(f, "{n}")
                }
            }
            LuaValue::LuaString(s) => write!(f, "{s}"),
            LuaValue::NativeFunction(_) => write!(f, "function: 0x<native>"),
            LuaValue::Closure(c) => write!(f, "function: {:p}", Arc::as_ptr(c)),
            LuaValue::Table(t) => write!(f, "table: {:p}", Arc::as_ptr(t)),
            LuaValue::UserData(u) => write!(f, "userdata: {:p}", Arc::as_ptr(u)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_and_false_are_falsy() {
        assert!(!LuaValue::Nil.is_truthy());
        assert!(!LuaValue::Boolean(false).is_truthy());
        // In Lua, 0 is truthy!
        assert!(LuaValue::Integer(0).is_truthy());
    }

    #[test]
    fn integer_add_stays_integral() {
        let v = LuaValue::Integer(2).add(&LuaValue::Integer(3)).unwrap();
        assert_eq!(v, LuaValue::Integer(5));
    }

    #[test]
    fn mixed_add_promotes_to_float() {
        let v = LuaValue::Integer(2).add(&LuaValue::Float(0.5)).unwrap();
        assert_eq!(v, LuaValue::Float(2.5));
    }

    #[test]
    fn string_operand_coerces() {
        let v = LuaValue::LuaString("10".into())
            .mul(&LuaValue::Integer(4))
            .unwrap();
        assert_eq!(v, LuaValue::Integer(40));
    }

    #[test]
    fn arithmetic_on_table_is_a_type_error() {
        let err = LuaValue::new_table().add(&LuaValue::Integer(1)).unwrap_err();
        assert_eq!(
            err.kind,
            crate::error::LuaErrorKind::TypeError {
                expected: "number",
                got: "table"
            }
        );
    }

    #[test]
    fn integer_modulo_by_zero() {
        assert!(LuaValue::Integer(1).modulo(&LuaValue::Integer(0)).is_err());
    }

    #[test]
    fn modulo_follows_the_divisor_sign() {
        let m = |x: i64, y: i64| LuaValue::Integer(x).modulo(&LuaValue::Integer(y)).unwrap();
        assert_eq!(m(5, -3), LuaValue::Integer(-1));
        assert_eq!(m(-5, 3), LuaValue::Integer(1));
        assert_eq!(m(-5, -3), LuaValue::Integer(-2));
        assert_eq!(m(5, 3), LuaValue::Integer(2));
        // integer and float modulo agree
        let f = LuaValue::Float(5.0).modulo(&LuaValue::Float(-3.0)).unwrap();
        assert_eq!(f, LuaValue::Float(-1.0));
    }

    #[test]
    fn comparisons_cross_numeric_kinds() {
        assert!(LuaValue::Integer(1).lt_b(&LuaValue::Float(1.5)).unwrap());
        assert!(LuaValue::Float(2.0).gteq_b(&LuaValue::Integer(2)).unwrap());
    }

    #[test]
    fn gt_is_swapped_lt() {
        assert!(LuaValue::Integer(3).gt_b(&LuaValue::Integer(2)).unwrap());
        assert!(!LuaValue::Integer(2).gt_b(&LuaValue::Integer(2)).unwrap());
    }

    #[test]
    fn buffer_accumulates_left_to_right() {
        let mut b = LuaValue::Integer(1).buffer().unwrap();
        b.append_value(&LuaValue::LuaString("x".into())).unwrap();
        let mut tail = Buffer::new();
        tail.append_value(&LuaValue::Integer(2)).unwrap();
        b.concat(tail);
        assert_eq!(b.value(), LuaValue::LuaString("1x2".into()));
    }

    #[test]
    fn buffer_formats_numbers_like_display() {
        // 2.0 must concat as "2.0", exactly as tostring renders it
        let mut b = Buffer::new();
        b.append_value(&LuaValue::Float(2.0)).unwrap();
        b.append_value(&LuaValue::LuaString("/".into())).unwrap();
        b.append_value(&LuaValue::Float(2.5)).unwrap();
        assert_eq!(b.value(), LuaValue::LuaString("2.0/2.5".into()));
    }

    #[test]
    fn fornum_uses_reference_wording() {
        let err = LuaValue::Nil.fornum("initial value").unwrap_err();
        assert_eq!(err.to_string(), "runtime error: 'for' initial value must be a number");
    }

    #[test]
    fn table_identity_equality() {
        let t1 = LuaValue::new_table();
        let t2 = LuaValue::new_table();
        assert_eq!(t1, t1.clone()); // same Arc → equal
        assert_ne!(t1, t2); // different Arcs → not equal
    }
}
