//! Record wire codec.
//!
//! A stable binary format with numbered fields, equivalent to Protocol
//! Buffers' wire rules: varint for unsigned integers, zigzag+varint for
//! signed, little-endian fixed32/fixed64, length-prefixed bytes/strings,
//! packed-repeated for primitive arrays. Builds a typed value out of a raw
//! byte slice plus a length header, tagged by a single header byte that
//! distinguishes what the body holds.
//!
//! Real deployments substitute their own codec for `RecordDescriptor`-driven
//! types; this module exists so this repo's own example/test record types
//! have something concrete to round-trip through.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ErrorKind, Result};

/// Wire type tags, matching the little subset of Protocol Buffers' wire
/// format this codec commits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
	Varint = 0,
	Fixed64 = 1,
	LengthDelimited = 2,
	Fixed32 = 5,
}

pub fn write_tag(out: &mut Vec<u8>, field_number: u32, wire_type: WireType) {
	write_varint(out, ((field_number as u64) << 3) | (wire_type as u64));
}

pub fn read_tag(buf: &[u8]) -> Result<(u32, WireType, usize)> {
	let (v, consumed) = read_varint(buf)?;
	let wire_type = match v & 0x7 {
		0 => WireType::Varint,
		1 => WireType::Fixed64,
		2 => WireType::LengthDelimited,
		5 => WireType::Fixed32,
		other => bail!(ErrorKind::SerializationFailed(format!("unknown wire type {}", other))),
	};
	Ok(((v >> 3) as u32, wire_type, consumed))
}

pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
	loop {
		let byte = (value & 0x7F) as u8;
		value >>= 7;
		if value == 0 {
			out.push(byte);
			break;
		}
		out.push(byte | 0x80);
	}
}

pub fn read_varint(buf: &[u8]) -> Result<(u64, usize)> {
	let mut value = 0u64;
	let mut shift = 0u32;
	for (i, &byte) in buf.iter().enumerate() {
		value |= ((byte & 0x7F) as u64) << shift;
		if byte & 0x80 == 0 {
			return Ok((value, i + 1));
		}
		shift += 7;
		if shift >= 64 {
			bail!(ErrorKind::SerializationFailed("varint too long".into()));
		}
	}
	bail!(ErrorKind::SerializationFailed("truncated varint".into()))
}

pub fn zigzag_encode(v: i64) -> u64 {
	((v << 1) ^ (v >> 63)) as u64
}

pub fn zigzag_decode(v: u64) -> i64 {
	((v >> 1) as i64) ^ -((v & 1) as i64)
}

pub fn write_i32(out: &mut Vec<u8>, field_number: u32, v: i32) {
	write_tag(out, field_number, WireType::Varint);
	write_varint(out, zigzag_encode(v as i64));
}

pub fn write_i64(out: &mut Vec<u8>, field_number: u32, v: i64) {
	write_tag(out, field_number, WireType::Varint);
	write_varint(out, zigzag_encode(v));
}

pub fn write_u64(out: &mut Vec<u8>, field_number: u32, v: u64) {
	write_tag(out, field_number, WireType::Varint);
	write_varint(out, v);
}

pub fn write_f64(out: &mut Vec<u8>, field_number: u32, v: f64) {
	write_tag(out, field_number, WireType::Fixed64);
	let mut buf = [0u8; 8];
	LittleEndian::write_f64(&mut buf, v);
	out.extend_from_slice(&buf);
}

pub fn write_bytes(out: &mut Vec<u8>, field_number: u32, bytes: &[u8]) {
	write_tag(out, field_number, WireType::LengthDelimited);
	write_varint(out, bytes.len() as u64);
	out.extend_from_slice(bytes);
}

pub fn write_str(out: &mut Vec<u8>, field_number: u32, s: &str) {
	write_bytes(out, field_number, s.as_bytes());
}

/// Packed-repeated varints: one tag carrying wire-type 2, payload is the
/// concatenation of each element's varint encoding.
pub fn write_packed_i64(out: &mut Vec<u8>, field_number: u32, values: &[i64]) {
	let mut payload = Vec::new();
	for v in values {
		write_varint(&mut payload, zigzag_encode(*v));
	}
	write_bytes(out, field_number, &payload);
}

pub fn read_length_delimited<'a>(buf: &'a [u8]) -> Result<(&'a [u8], usize)> {
	let (len, consumed) = read_varint(buf)?;
	let len = len as usize;
	if consumed + len > buf.len() {
		bail!(ErrorKind::SerializationFailed("truncated length-delimited field".into()));
	}
	Ok((&buf[consumed..consumed + len], consumed + len))
}

pub fn read_fixed64(buf: &[u8]) -> Result<(f64, usize)> {
	if buf.len() < 8 {
		bail!(ErrorKind::SerializationFailed("truncated fixed64".into()));
	}
	Ok((LittleEndian::read_f64(&buf[..8]), 8))
}

/// Reads every packed varint out of a length-delimited payload.
pub fn unpack_i64(mut payload: &[u8]) -> Result<Vec<i64>> {
	let mut out = Vec::new();
	while !payload.is_empty() {
		let (raw, consumed) = read_varint(payload)?;
		out.push(zigzag_decode(raw));
		payload = &payload[consumed..];
	}
	Ok(out)
}

/// Reads every packed little-endian double out of a length-delimited
/// payload, the counterpart to `FieldValue::RepeatedF64`'s encoding.
pub fn unpack_f64(payload: &[u8]) -> Result<Vec<f64>> {
	if payload.len() % 8 != 0 {
		bail!(ErrorKind::SerializationFailed("packed f64 payload not a multiple of 8 bytes".into()));
	}
	Ok(payload.chunks_exact(8).map(LittleEndian::read_f64).collect())
}

/// A minimal dynamically-typed field value, used by this repo's test record
/// types and by index value encodings (e.g. a vector's components).
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
	I64(i64),
	F64(f64),
	Str(String),
	Bytes(Vec<u8>),
	RepeatedI64(Vec<i64>),
	RepeatedF64(Vec<f64>),
}

impl FieldValue {
	pub fn encode(&self, out: &mut Vec<u8>, field_number: u32) {
		match self {
			FieldValue::I64(v) => write_i64(out, field_number, *v),
			FieldValue::F64(v) => write_f64(out, field_number, *v),
			FieldValue::Str(s) => write_str(out, field_number, s),
			FieldValue::Bytes(b) => write_bytes(out, field_number, b),
			FieldValue::RepeatedI64(values) => write_packed_i64(out, field_number, values),
			FieldValue::RepeatedF64(values) => {
				let mut payload = Vec::with_capacity(values.len() * 8);
				for v in values {
					let mut buf = [0u8; 8];
					LittleEndian::write_f64(&mut buf, *v);
					payload.extend_from_slice(&buf);
				}
				write_bytes(out, field_number, &payload);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn varint_roundtrips_edge_values() {
		for v in [0u64, 1, 127, 128, 16384, u64::MAX] {
			let mut buf = Vec::new();
			write_varint(&mut buf, v);
			let (decoded, consumed) = read_varint(&buf).unwrap();
			assert_eq!(decoded, v);
			assert_eq!(consumed, buf.len());
		}
	}

	#[test]
	fn zigzag_roundtrips_signed_values() {
		for v in [0i64, -1, 1, i64::MIN, i64::MAX] {
			assert_eq!(zigzag_decode(zigzag_encode(v)), v);
		}
	}

	#[test]
	fn tag_roundtrips_field_number_and_wire_type() {
		let mut buf = Vec::new();
		write_tag(&mut buf, 5, WireType::LengthDelimited);
		let (field_number, wire_type, _) = read_tag(&buf).unwrap();
		assert_eq!(field_number, 5);
		assert_eq!(wire_type, WireType::LengthDelimited);
	}

	#[test]
	fn packed_repeated_roundtrips() {
		let mut out = Vec::new();
		write_packed_i64(&mut out, 3, &[1, -2, 3, -4]);
		let (_, _, tag_len) = read_tag(&out).unwrap();
		let (payload, _) = read_length_delimited(&out[tag_len..]).unwrap();
		assert_eq!(unpack_i64(payload).unwrap(), vec![1, -2, 3, -4]);
	}

	#[test]
	fn empty_repeated_field_round_trips() {
		let mut out = Vec::new();
		write_packed_i64(&mut out, 1, &[]);
		let (_, _, tag_len) = read_tag(&out).unwrap();
		let (payload, _) = read_length_delimited(&out[tag_len..]).unwrap();
		assert_eq!(unpack_i64(payload).unwrap(), Vec::<i64>::new());
	}

	quickcheck::quickcheck! {
		fn quickcheck_varint_roundtrip(v: u64) -> bool {
			let mut buf = Vec::new();
			write_varint(&mut buf, v);
			read_varint(&buf).unwrap().0 == v
		}
	}
}
