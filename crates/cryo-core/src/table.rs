use crate::value::LuaValue;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A Lua table: an associative array keyed by any non-nil, non-NaN value.
///
/// Integer keys 1..n live in a compact `array` part; everything else goes
/// into the `hash` part. Mutation order is observable, per the language.
#[derive(Debug, Clone, Default)]
pub struct LuaTable {
    pub array: Vec<LuaValue>, // 1-indexed: array[i-1] = t[i]
    pub hash: HashMap<HashKey, LuaValue>,
    pub metatable: Option<Arc<RwLock<LuaTable>>>,
}

/// Keys that can be stored in the hash part of a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl HashKey {
    pub fn from_value(v: &LuaValue) -> Option<HashKey> {
        match v {
            LuaValue::Integer(n) => Some(HashKey::Int(*n)),
            LuaValue::LuaString(s) => Some(HashKey::Str(s.clone())),
            LuaValue::Boolean(b) => Some(HashKey::Bool(*b)),
            // Floats with an exact integer value alias the integer key.
            LuaValue::Float(f) => {
                let n = *f as i64;
                if n as f64 == *f {
                    Some(HashKey::Int(n))
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

impl LuaTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_metatable(&self) -> Option<Arc<RwLock<LuaTable>>> {
        self.metatable.clone()
    }

    pub fn set_metatable(&mut self, mt: Option<Arc<RwLock<LuaTable>>>) {
        self.metatable = mt;
    }

    /// Read `t[key]`. Returns `LuaValue::Nil` for missing keys.
    pub fn get(&self, key: &LuaValue) -> LuaValue {
        if let LuaValue::Integer(i) = key {
            let i = *i;
            if i >= 1 && i as usize <= self.array.len() {
                return self.array[(i - 1) as usize].clone();
            }
        }
        if let LuaValue::Float(f) = key {
            let i = *f as i64;
            if i as f64 == *f && i >= 1 && i as usize <= self.array.len() {
                return self.array[(i - 1) as usize].clone();
            }
        }
        HashKey::from_value(key)
            .and_then(|hk| self.hash.get(&hk))
            .cloned()
            .unwrap_or(LuaValue::Nil)
    }

    /// Write `t[key] = val`. Setting a hash entry to nil deletes it.
    pub fn set(&mut self, key: LuaValue, val: LuaValue) {
        if let LuaValue::Integer(i) = &key {
            let i = *i;
            if i >= 1 {
                let idx = (i - 1) as usize;
                if idx < self.array.len() {
                    self.array[idx] = val;
                    return;
                } else if idx == self.array.len() {
                    self.array.push(val);
                    self.absorb_sequence();
                    return;
                }
            }
        }
        if let LuaValue::Float(f) = &key {
            let f = *f;
            let i = f as i64;
            if i as f64 == f {
                self.set(LuaValue::Integer(i), val);
                return;
            }
        }
        if let Some(hk) = HashKey::from_value(&key) {
            if matches!(val, LuaValue::Nil) {
                self.hash.remove(&hk);
            } else {
                self.hash.insert(hk, val);
            }
        }
    }

    /// Lua-style length: the border of the array sequence.
    pub fn length(&self) -> i64 {
        self.array.len() as i64
    }

    /// Append `val` to the array part (equivalent to `t[#t+1] = val`).
    pub fn push(&mut self, val: LuaValue) {
        self.array.push(val);
    }

    /// Ensure the array part can hold at least `n` elements, nil-filling the
    /// gap. SETLIST pre-sizes its target table through this.
    pub fn presize(&mut self, n: usize) {
        if self.array.len() < n {
            self.array.resize(n, LuaValue::Nil);
        }
    }

    /// After a new integer key extends the array part, pull consecutive keys
    /// from the hash part into the array to keep the border invariant.
    fn absorb_sequence(&mut self) {
        loop {
            let next = (self.array.len() + 1) as i64;
            if let Some(v) = self.hash.remove(&HashKey::Int(next)) {
                self.array.push(v);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_keys_land_in_the_array_part() {
        let mut t = LuaTable::new();
        t.set(LuaValue::Integer(1), LuaValue::Integer(10));
        t.set(LuaValue::Integer(2), LuaValue::Integer(20));
        assert_eq!(t.array.len(), 2);
        assert_eq!(t.get(&LuaValue::Integer(2)), LuaValue::Integer(20));
    }

    #[test]
    fn gap_key_goes_to_hash_then_absorbs() {
        let mut t = LuaTable::new();
        t.set(LuaValue::Integer(2), LuaValue::Integer(20));
        assert_eq!(t.array.len(), 0);
        t.set(LuaValue::Integer(1), LuaValue::Integer(10));
        // 1 extended the array, which then absorbed 2 from the hash part
        assert_eq!(t.length(), 2);
        assert_eq!(t.get(&LuaValue::Integer(2)), LuaValue::Integer(20));
    }

    #[test]
    fn exact_float_keys_alias_integers() {
        let mut t = LuaTable::new();
        t.set(LuaValue::Float(1.0), LuaValue::Boolean(true));
        assert_eq!(t.get(&LuaValue::Integer(1)), LuaValue::Boolean(true));
    }

    #[test]
    fn presize_nil_fills() {
        let mut t = LuaTable::new();
        t.presize(3);
        assert_eq!(t.length(), 3);
        assert_eq!(t.get(&LuaValue::Integer(3)), LuaValue::Nil);
    }
}
