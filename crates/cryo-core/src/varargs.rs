//! Variadic value bundles and the tail-call trampoline sentinel.

use crate::value::LuaValue;

/// An ordered bundle of values, as produced by multi-result calls, `...`,
/// and `return`.
///
/// The `Cons` form gives O(1) `arg1`/`subargs` when a single value is
/// prefixed onto an existing bundle; consumers that need random access fall
/// back to walking, which is bounded by the bundle length.
///
/// `Tailcall` is not a proper bundle: it is the trampoline sentinel a frame
/// returns when it ends in a tail call. Callers resolve it by repeatedly
/// invoking the callee until a concrete bundle emerges; it never escapes the
/// call entry points.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Varargs {
    #[default]
    None,
    Single(LuaValue),
    Flat(Vec<LuaValue>),
    Cons(Box<(LuaValue, Varargs)>),
    Tailcall(Box<TailCall>),
}

/// Pending tail call: the callee and its already-evaluated arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct TailCall {
    pub callee: LuaValue,
    pub args: Varargs,
}

impl Varargs {
    pub fn tailcall(callee: LuaValue, args: Varargs) -> Self {
        Varargs::Tailcall(Box::new(TailCall { callee, args }))
    }

    pub fn cons(head: LuaValue, tail: Varargs) -> Self {
        Varargs::Cons(Box::new((head, tail)))
    }

    pub fn is_tailcall(&self) -> bool {
        matches!(self, Varargs::Tailcall(_))
    }

    /// Number of values in the bundle.
    pub fn narg(&self) -> usize {
        match self {
            Varargs::None => 0,
            Varargs::Single(_) => 1,
            Varargs::Flat(vs) => vs.len(),
            Varargs::Cons(pair) => 1 + pair.1.narg(),
            Varargs::Tailcall(_) => 0,
        }
    }

    /// The `n`-th value, 1-based; `Nil` beyond the end.
    pub fn arg(&self, n: usize) -> LuaValue {
        match self {
            Varargs::Single(v) if n == 1 => v.clone(),
            Varargs::Flat(vs) if n >= 1 => vs.get(n - 1).cloned().unwrap_or(LuaValue::Nil),
            Varargs::Cons(pair) if n == 1 => pair.0.clone(),
            Varargs::Cons(pair) if n > 1 => pair.1.arg(n - 1),
            _ => LuaValue::Nil,
        }
    }

    /// The first value, `Nil` when empty.
    pub fn arg1(&self) -> LuaValue {
        self.arg(1)
    }

    /// The sub-bundle starting at the `n`-th value (1-based).
    pub fn subargs(&self, n: usize) -> Varargs {
        if n <= 1 {
            return self.clone();
        }
        match self {
            Varargs::None | Varargs::Single(_) => Varargs::None,
            Varargs::Flat(vs) => {
                if n - 1 >= vs.len() {
                    Varargs::None
                } else {
                    Varargs::Flat(vs[n - 1..].to_vec())
                }
            }
            Varargs::Cons(pair) => pair.1.subargs(n - 1),
            Varargs::Tailcall(_) => Varargs::None,
        }
    }

    /// Flatten into a plain vector.
    pub fn to_vec(&self) -> Vec<LuaValue> {
        let mut out = Vec::with_capacity(self.narg());
        self.collect_into(&mut out);
        out
    }

    fn collect_into(&self, out: &mut Vec<LuaValue>) {
        match self {
            Varargs::None | Varargs::Tailcall(_) => {}
            Varargs::Single(v) => out.push(v.clone()),
            Varargs::Flat(vs) => out.extend(vs.iter().cloned()),
            Varargs::Cons(pair) => {
                out.push(pair.0.clone());
                pair.1.collect_into(out);
            }
        }
    }
}

impl From<Vec<LuaValue>> for Varargs {
    fn from(mut vs: Vec<LuaValue>) -> Self {
        match vs.len() {
            0 => Varargs::None,
            1 => Varargs::Single(vs.pop().unwrap()),
            _ => Varargs::Flat(vs),
        }
    }
}

impl From<LuaValue> for Varargs {
    fn from(v: LuaValue) -> Self {
        Varargs::Single(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(ns: &[i64]) -> Varargs {
        Varargs::from(ns.iter().map(|n| LuaValue::Integer(*n)).collect::<Vec<_>>())
    }

    #[test]
    fn arg_is_one_based_and_nil_padded() {
        let v = ints(&[10, 20]);
        assert_eq!(v.arg(1), LuaValue::Integer(10));
        assert_eq!(v.arg(2), LuaValue::Integer(20));
        assert_eq!(v.arg(3), LuaValue::Nil);
        assert_eq!(v.arg(0), LuaValue::Nil);
    }

    #[test]
    fn cons_prepends_in_constant_shape() {
        let v = Varargs::cons(LuaValue::Integer(1), ints(&[2, 3]));
        assert_eq!(v.narg(), 3);
        assert_eq!(v.arg1(), LuaValue::Integer(1));
        assert_eq!(v.subargs(2), ints(&[2, 3]));
    }

    #[test]
    fn subargs_past_the_end_is_empty() {
        assert_eq!(ints(&[1]).subargs(5), Varargs::None);
        assert_eq!(Varargs::None.subargs(2), Varargs::None);
    }

    #[test]
    fn trampoline_is_not_a_bundle() {
        let t = Varargs::tailcall(LuaValue::Nil, Varargs::None);
        assert!(t.is_tailcall());
        assert_eq!(t.narg(), 0);
    }
}
