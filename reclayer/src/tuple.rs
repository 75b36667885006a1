//! Order-preserving tuple encoding.
//!
//! Stands in for the external tuple/subspace layer: every structural key in
//! this crate (`R/<type>/<pk>`, `I/<name>/<fields>/<pk>`, ...) is built by
//! packing a [`Value`] tuple. Byte-lexicographic order of the packed bytes
//! matches the logical order of the tuple, the same invariant that lets a
//! reader recover a field's slot by reading a prefix straight off the key
//! bytes without decoding the rest.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{ErrorKind, Result};

const TAG_NULL: u8 = 0x00;
const TAG_BYTES: u8 = 0x01;
const TAG_STRING: u8 = 0x02;
const TAG_NESTED: u8 = 0x05;
const TAG_INT: u8 = 0x14;
const TAG_BOOL_FALSE: u8 = 0x26;
const TAG_BOOL_TRUE: u8 = 0x27;

/// A single element of an ordered tuple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Value {
	Null,
	Int(i64),
	Bytes(Vec<u8>),
	Str(String),
	Bool(bool),
	Tuple(Vec<Value>),
}

impl From<i64> for Value {
	fn from(v: i64) -> Self {
		Value::Int(v)
	}
}
impl From<&str> for Value {
	fn from(v: &str) -> Self {
		Value::Str(v.to_string())
	}
}
impl From<String> for Value {
	fn from(v: String) -> Self {
		Value::Str(v)
	}
}
impl From<Vec<u8>> for Value {
	fn from(v: Vec<u8>) -> Self {
		Value::Bytes(v)
	}
}
impl From<bool> for Value {
	fn from(v: bool) -> Self {
		Value::Bool(v)
	}
}

/// Escapes `0x00` as `0x00 0xFF` and appends a bare `0x00` terminator, so the
/// encoding of no tuple element is ever a byte-prefix of another element's
/// encoding unless the logical values already were.
fn write_escaped(out: &mut Vec<u8>, raw: &[u8]) {
	for &b in raw {
		out.push(b);
		if b == 0x00 {
			out.push(0xFF);
		}
	}
	out.push(0x00);
}

fn read_escaped(buf: &[u8]) -> Result<(Vec<u8>, usize)> {
	let mut out = Vec::new();
	let mut i = 0;
	while i < buf.len() {
		if buf[i] == 0x00 {
			if i + 1 < buf.len() && buf[i + 1] == 0xFF {
				out.push(0x00);
				i += 2;
			} else {
				return Ok((out, i + 1));
			}
		} else {
			out.push(buf[i]);
			i += 1;
		}
	}
	bail!(ErrorKind::SerializationFailed("unterminated tuple element".into()))
}

fn encode_value(out: &mut Vec<u8>, value: &Value) {
	match value {
		Value::Null => out.push(TAG_NULL),
		Value::Int(v) => {
			out.push(TAG_INT);
			let flipped = (*v as u64) ^ 0x8000_0000_0000_0000;
			let mut buf = [0u8; 8];
			BigEndian::write_u64(&mut buf, flipped);
			out.extend_from_slice(&buf);
		}
		Value::Bytes(b) => {
			out.push(TAG_BYTES);
			write_escaped(out, b);
		}
		Value::Str(s) => {
			out.push(TAG_STRING);
			write_escaped(out, s.as_bytes());
		}
		Value::Bool(false) => out.push(TAG_BOOL_FALSE),
		Value::Bool(true) => out.push(TAG_BOOL_TRUE),
		Value::Tuple(items) => {
			out.push(TAG_NESTED);
			let mut inner = Vec::new();
			for item in items {
				encode_value(&mut inner, item);
			}
			write_escaped(out, &inner);
		}
	}
}

fn decode_value(buf: &[u8]) -> Result<(Value, usize)> {
	if buf.is_empty() {
		bail!(ErrorKind::SerializationFailed("empty tuple element".into()));
	}
	match buf[0] {
		TAG_NULL => Ok((Value::Null, 1)),
		TAG_INT => {
			if buf.len() < 9 {
				bail!(ErrorKind::SerializationFailed("truncated int element".into()));
			}
			let flipped = BigEndian::read_u64(&buf[1..9]);
			let v = (flipped ^ 0x8000_0000_0000_0000) as i64;
			Ok((Value::Int(v), 9))
		}
		TAG_BYTES => {
			let (raw, consumed) = read_escaped(&buf[1..])?;
			Ok((Value::Bytes(raw), 1 + consumed))
		}
		TAG_STRING => {
			let (raw, consumed) = read_escaped(&buf[1..])?;
			let s = String::from_utf8(raw)
				.map_err(|e| ErrorKind::SerializationFailed(e.to_string()))?;
			Ok((Value::Str(s), 1 + consumed))
		}
		TAG_BOOL_FALSE => Ok((Value::Bool(false), 1)),
		TAG_BOOL_TRUE => Ok((Value::Bool(true), 1)),
		TAG_NESTED => {
			let (raw, consumed) = read_escaped(&buf[1..])?;
			let mut items = Vec::new();
			let mut rest = raw.as_slice();
			while !rest.is_empty() {
				let (item, used) = decode_value(rest)?;
				items.push(item);
				rest = &rest[used..];
			}
			Ok((Value::Tuple(items), 1 + consumed))
		}
		other => bail!(ErrorKind::SerializationFailed(format!("unknown tuple tag 0x{:02x}", other))),
	}
}

/// Packs a tuple of values into order-preserving bytes.
pub fn pack(values: &[Value]) -> Vec<u8> {
	let mut out = Vec::new();
	for v in values {
		encode_value(&mut out, v);
	}
	out
}

/// Unpacks a byte string produced by [`pack`] back into its values.
pub fn unpack(mut buf: &[u8]) -> Result<Vec<Value>> {
	let mut out = Vec::new();
	while !buf.is_empty() {
		let (value, consumed) = decode_value(buf)?;
		out.push(value);
		buf = &buf[consumed..];
	}
	Ok(out)
}

/// Appends `[prefix]` onto `key`, producing the smallest key strictly
/// greater than every key starting with `prefix` — the `end` bound of a
/// `get_range` over everything under `prefix`.
pub fn strinc(prefix: &[u8]) -> Vec<u8> {
	let mut out = prefix.to_vec();
	for i in (0..out.len()).rev() {
		if out[i] != 0xFF {
			out[i] += 1;
			out.truncate(i + 1);
			return out;
		}
	}
	// all 0xFF: no finite successor under byte-string order other than
	// appending a sentinel byte, which range scans never see in practice
	// because real keys are otherwise bounded.
	out.push(0x00);
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_mixed_tuple() {
		let values = vec![
			Value::Int(-42),
			Value::Str("hello\0world".to_string()),
			Value::Bytes(vec![0, 1, 2, 0xFF]),
			Value::Bool(true),
			Value::Tuple(vec![Value::Int(1), Value::Str("nested".into())]),
		];
		let packed = pack(&values);
		let unpacked = unpack(&packed).unwrap();
		assert_eq!(values, unpacked);
	}

	#[test]
	fn int_ordering_matches_byte_ordering() {
		let mut ints = vec![-100i64, -1, 0, 1, 100, i64::MIN, i64::MAX];
		let mut packed: Vec<Vec<u8>> = ints.iter().map(|v| pack(&[Value::Int(*v)])).collect();
		let mut paired: Vec<(i64, Vec<u8>)> = ints.drain(..).zip(packed.drain(..)).collect();
		paired.sort_by(|a, b| a.1.cmp(&b.1));
		let sorted_ints: Vec<i64> = paired.into_iter().map(|(i, _)| i).collect();
		let mut expected = sorted_ints.clone();
		expected.sort();
		assert_eq!(sorted_ints, expected);
	}

	#[test]
	fn tuple_prefix_is_not_ambiguous() {
		let a = pack(&[Value::Str("ab".into())]);
		let b = pack(&[Value::Str("ab".into()), Value::Str("c".into())]);
		assert!(a < b);
		assert!(!b.starts_with(&a) || a.len() < b.len());
	}

	#[test]
	fn strinc_produces_exclusive_upper_bound() {
		let prefix = vec![0x01, 0x02];
		let end = strinc(&prefix);
		assert!(end > prefix);
		let mut under_prefix = prefix.clone();
		under_prefix.push(0xFF);
		assert!(under_prefix < end);
	}

	quickcheck::quickcheck! {
		fn quickcheck_bytes_roundtrip(data: Vec<u8>) -> bool {
			let packed = pack(&[Value::Bytes(data.clone())]);
			unpack(&packed).unwrap() == vec![Value::Bytes(data)]
		}

		fn quickcheck_int_roundtrip(n: i64) -> bool {
			let packed = pack(&[Value::Int(n)]);
			unpack(&packed).unwrap() == vec![Value::Int(n)]
		}
	}
}
