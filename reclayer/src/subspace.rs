//! Hierarchical key namespaces.
//!
//! A `Subspace` is just a byte prefix plus helpers for packing tuples onto
//! it and computing the `[begin, end)` bound of "everything under this
//! prefix" for a `get_range` call — prefix-relative addressing generalized
//! from a fixed bit-width prefix to an arbitrary byte prefix, so every
//! component addresses its keys through the prefix rather than touching
//! raw bytes directly.

use crate::tuple::{self, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subspace {
	prefix: Vec<u8>,
}

impl Subspace {
	pub fn root(prefix: Vec<u8>) -> Self {
		Subspace { prefix }
	}

	/// Derives a child subspace by appending a literal path segment.
	pub fn child(&self, segment: &str) -> Self {
		let mut key = self.prefix.clone();
		key.extend(tuple::pack(&[Value::Str(segment.to_string())]));
		Subspace { prefix: key }
	}

	/// Derives a child subspace keyed by an arbitrary tuple value (used for
	/// dynamic partition path segments, e.g. a tenant id).
	pub fn child_value(&self, value: Value) -> Self {
		let mut key = self.prefix.clone();
		key.extend(tuple::pack(&[value]));
		Subspace { prefix: key }
	}

	/// Packs `values` onto this subspace's prefix.
	pub fn pack(&self, values: &[Value]) -> Vec<u8> {
		let mut key = self.prefix.clone();
		key.extend(tuple::pack(values));
		key
	}

	/// The raw prefix bytes (the `begin` bound of a full-subspace scan).
	pub fn bytes(&self) -> &[u8] {
		&self.prefix
	}

	/// `[begin, end)` covering every key with this subspace's prefix.
	pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
		(self.prefix.clone(), tuple::strinc(&self.prefix))
	}

	/// Strips this subspace's prefix off `key` and unpacks the remainder as
	/// a tuple, e.g. to recover a primary key from a scanned record key.
	pub fn unpack<'a>(&self, key: &'a [u8]) -> crate::error::Result<Vec<Value>> {
		if !key.starts_with(&self.prefix) {
			bail!(crate::error::ErrorKind::SerializationFailed(
				"key does not belong to this subspace".into()
			));
		}
		tuple::unpack(&key[self.prefix.len()..])
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn child_subspaces_nest() {
		let root = Subspace::root(vec![0xAB]);
		let records = root.child("R").child("User");
		let key = records.pack(&[Value::Int(1)]);
		assert!(key.starts_with(&[0xAB]));
		let unpacked = records.unpack(&key).unwrap();
		assert_eq!(unpacked, vec![Value::Int(1)]);
	}

	#[test]
	fn range_bounds_are_exclusive_of_siblings() {
		let root = Subspace::root(vec![]);
		let a = root.child("A");
		let b = root.child("B");
		let (a_begin, a_end) = a.range();
		let b_key = b.pack(&[Value::Int(0)]);
		assert!(b_key >= a_end || b_key < a_begin);
	}
}
