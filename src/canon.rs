//! Canonical value encoding, hashing, and ordering.
//!
//! Shuffle routing and map-side key buffering both need a textual form of a
//! JSON value that is identical on every worker. The encoding here is
//! self-delimiting: strings, arrays, and objects are length-prefixed, object
//! entries are emitted in sorted key order, and integers are tagged
//! differently from floats, so `{"1":_, "2":_}`, `{"2":_, "1":_}` and
//! `[1, 2]` are mutually distinct while equal values encode to equal bytes
//! regardless of construction order.

use serde_json::Value;
use std::cmp::Ordering;
use std::fmt::Write as _;

/// Encode `v` into its canonical textual form.
pub fn encode(v: &Value) -> String {
    let mut out = String::new();
    encode_into(&mut out, v);
    out
}

fn encode_into(out: &mut String, v: &Value) {
    match v {
        Value::Null => out.push('z'),
        Value::Bool(b) => out.push_str(if *b { "b1" } else { "b0" }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                let _ = write!(out, "i:{i}");
            } else if let Some(u) = n.as_u64() {
                let _ = write!(out, "i:{u}");
            } else {
                let _ = write!(out, "f:{}", n.as_f64().unwrap_or(f64::NAN));
            }
        }
        Value::String(s) => {
            let _ = write!(out, "s:{}:", s.len());
            out.push_str(s);
        }
        Value::Array(items) => {
            let _ = write!(out, "a:{}[", items.len());
            for item in items {
                encode_into(out, item);
                out.push(',');
            }
            out.push(']');
        }
        Value::Object(map) => {
            // serde_json's default map is a BTreeMap, so iteration is
            // already in sorted key order.
            let _ = write!(out, "o:{}{{", map.len());
            for (k, val) in map {
                let _ = write!(out, "s:{}:", k.len());
                out.push_str(k);
                out.push('=');
                encode_into(out, val);
                out.push(';');
            }
            out.push('}');
        }
    }
}

/// Polynomial rolling hash over the canonical encoding, multiplier 31,
/// accumulated in wrapping signed 32-bit arithmetic with the absolute value
/// taken at the end. Every worker hashing the same key gets the same result.
pub fn hash31(s: &str) -> u32 {
    let mut h: i32 = 0;
    for b in s.bytes() {
        h = h.wrapping_mul(31).wrapping_add(i32::from(b));
    }
    h.unsigned_abs()
}

/// Three-way comparison used by sorting and range routing: numbers compare
/// numerically, strings lexicographically, arrays element-wise; values of
/// incomparable kinds compare equal so the surrounding sort stays stable.
pub fn value_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xe, ye) in x.iter().zip(y.iter()) {
                let ord = value_cmp(xe, ye);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Rough in-memory byte cost of a value, used by the storage-memory
/// accounting in partition buffers. Cheap to compute; does not serialize.
pub fn estimate_size(v: &Value) -> usize {
    match v {
        Value::Null | Value::Bool(_) => 8,
        Value::Number(_) => 16,
        Value::String(s) => 24 + s.len(),
        Value::Array(items) => 24 + items.iter().map(estimate_size).sum::<usize>(),
        Value::Object(map) => {
            24 + map
                .iter()
                .map(|(k, val)| 24 + k.len() + estimate_size(val))
                .sum::<usize>()
        }
    }
}
