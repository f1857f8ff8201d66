//! # Order-Preserving Key Encoding
//!
//! Typed column values encode into byte strings whose lexicographic order
//! matches the values' native order, so the B+tree compares keys with a
//! plain memcmp and range scans work on encoded bytes directly.
//!
//! ## Encodings
//!
//! - **INT64**: the sign bit is flipped (equivalent to adding 2^63) and
//!   the result is written as 8 big-endian bytes, mapping the signed range
//!   monotonically onto the unsigned one.
//! - **BYTES**: escaped and null-terminated. `0x00` becomes `0x01 0x01`
//!   and `0x01` becomes `0x01 0x02`, so the terminator byte never appears
//!   in the payload. A leading byte >= `0xfe` is additionally prefixed
//!   with `0xfe`, so no encoding ever begins with `0xff` and the `0xff`
//!   byte stays available as a range sentinel strictly above every
//!   encoded string.
//!
//! ## Table Keys
//!
//! A full key is `prefix (u32 big-endian) || encoded columns`. The prefix
//! namespaces one table or index inside the shared tree, and big-endian
//! keeps prefixes ordered.
//!
//! ## Partial Keys
//!
//! A range endpoint may name fewer columns than its index. The missing
//! suffix is padded with the extreme matching the comparator: nothing for
//! `GE`/`LT` (the empty suffix sorts below every value), the maximum
//! encoding for `GT`/`LE` (`0xff` for BYTES, after which nothing more can
//! follow; eight `0xff` bytes for INT64).

use eyre::{bail, ensure, Result};

use crate::btree::Cmp;
use crate::types::{Value, ValueType};

/// Escapes a byte string so its encoding contains no `0x00` and never
/// starts with `0xff`.
pub fn escape_bytes(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + 2);
    for (i, &b) in input.iter().enumerate() {
        if i == 0 && b >= 0xfe {
            out.push(0xfe);
            out.push(b);
        } else if b <= 0x01 {
            out.push(0x01);
            out.push(b + 1);
        } else {
            out.push(b);
        }
    }
    out
}

/// Reverses [`escape_bytes`].
pub fn unescape_bytes(input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        let b = input[i];
        if i == 0 && b == 0xfe {
            ensure!(input.len() >= 2, "truncated escape at start of string");
            out.push(input[1]);
            i = 2;
        } else if b == 0x01 {
            ensure!(i + 1 < input.len(), "truncated escape in string");
            let escaped = input[i + 1];
            ensure!(
                escaped == 0x01 || escaped == 0x02,
                "invalid escape pair 0x01 {:#04x}",
                escaped
            );
            out.push(escaped - 1);
            i += 2;
        } else {
            ensure!(b != 0x00, "unescaped null byte inside string");
            out.push(b);
            i += 1;
        }
    }
    Ok(out)
}

/// Appends the order-preserving encoding of `vals` to `out`.
pub fn encode_values(out: &mut Vec<u8>, vals: &[Value]) {
    for val in vals {
        match val {
            Value::Int64(v) => {
                let biased = (*v as u64) ^ (1 << 63);
                out.extend_from_slice(&biased.to_be_bytes());
            }
            Value::Bytes(b) => {
                out.extend_from_slice(&escape_bytes(b));
                out.push(0x00);
            }
        }
    }
}

/// Decodes `types.len()` values from `input`, which must be consumed
/// exactly.
pub fn decode_values(input: &[u8], types: &[ValueType]) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(types.len());
    let mut rest = input;
    for ty in types {
        let (val, consumed) = decode_value(rest, *ty)?;
        out.push(val);
        rest = &rest[consumed..];
    }
    ensure!(
        rest.is_empty(),
        "{} trailing bytes after decoding {} values",
        rest.len(),
        types.len()
    );
    Ok(out)
}

/// Decodes one value, returning it with the number of bytes consumed.
pub fn decode_value(input: &[u8], ty: ValueType) -> Result<(Value, usize)> {
    match ty {
        ValueType::Int64 => {
            ensure!(input.len() >= 8, "truncated int64 in key");
            let raw = u64::from_be_bytes(input[..8].try_into().unwrap());
            Ok((Value::Int64((raw ^ (1 << 63)) as i64), 8))
        }
        ValueType::Bytes => {
            let end = find_terminator(input)?;
            let decoded = unescape_bytes(&input[..end])?;
            Ok((Value::Bytes(decoded), end + 1))
        }
    }
}

/// Position of the unescaped null terminator of an encoded byte string.
fn find_terminator(input: &[u8]) -> Result<usize> {
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            0x00 => return Ok(i),
            0xfe if i == 0 => i += 2,
            0x01 => i += 2,
            _ => i += 1,
        }
    }
    bail!("encoded string is missing its terminator");
}

/// Encodes a full table/index key: big-endian prefix then columns.
pub fn encode_key(out: &mut Vec<u8>, prefix: u32, vals: &[Value]) {
    out.extend_from_slice(&prefix.to_be_bytes());
    encode_values(out, vals);
}

/// Encodes a range endpoint over the first `vals.len()` columns of an
/// index, padding the missing columns per the comparator.
pub fn encode_key_partial(
    prefix: u32,
    vals: &[Value],
    missing: &[ValueType],
    cmp: Cmp,
) -> Vec<u8> {
    let mut out = Vec::new();
    encode_key(&mut out, prefix, vals);

    // The empty suffix is below every value encoding, which is exactly
    // what GE/LT need; GT/LE pad up to the maximum instead.
    if matches!(cmp, Cmp::Gt | Cmp::Le) {
        for ty in missing {
            match ty {
                ValueType::Bytes => {
                    // No string encoding starts with 0xff, so nothing can
                    // follow it; later columns are unreachable.
                    out.push(0xff);
                    break;
                }
                ValueType::Int64 => out.extend_from_slice(&[0xff; 8]),
            }
        }
    }
    out
}
