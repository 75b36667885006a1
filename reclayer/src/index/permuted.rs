//! Permuted index: a value index whose key tuple is a
//! fixed permutation of the record's attributes, serving queries whose
//! predicate/sort prefix matches a non-original field order. Reuses
//! `index::value`'s key-building and uniqueness logic verbatim; the only
//! difference is the order fields are packed in.

use crate::error::Result;
use crate::index::{FieldMap, IndexMaintainer};
use crate::schema::IndexDefinition;
use crate::subspace::Subspace;
use crate::transaction::TransactionContext;
use crate::tuple::Value;

pub struct PermutedIndex {
	definition: IndexDefinition,
	subspace: Subspace,
	permutation: Vec<usize>,
}

impl PermutedIndex {
	pub fn new(definition: IndexDefinition, subspace: Subspace, permutation: Vec<usize>) -> Self {
		PermutedIndex { definition, subspace, permutation }
	}

	fn permuted_values(&self, record: &FieldMap) -> Vec<Value> {
		let natural: Vec<Value> =
			self.definition.key_expression.iter().map(|field| record.get(field).cloned().unwrap_or(Value::Null)).collect();
		self.permutation.iter().map(|&i| natural[i].clone()).collect()
	}

	fn entry_key(&self, permuted: &[Value], primary_key: &[Value]) -> Vec<u8> {
		let mut values = permuted.to_vec();
		values.extend(primary_key.iter().cloned());
		self.subspace.pack(&values)
	}
}

impl IndexMaintainer for PermutedIndex {
	fn update(&self, tx: &mut TransactionContext, primary_key: &[Value], old: Option<&FieldMap>, new: Option<&FieldMap>) -> Result<()> {
		if let Some(old_record) = old {
			tx.clear(&self.entry_key(&self.permuted_values(old_record), primary_key))?;
		}
		if let Some(new_record) = new {
			tx.set(&self.entry_key(&self.permuted_values(new_record), primary_key), &[])?;
		}
		Ok(())
	}

	fn entry_keys(&self, primary_key: &[Value], record: &FieldMap) -> Vec<Vec<u8>> {
		vec![self.entry_key(&self.permuted_values(record), primary_key)]
	}

	fn scan(&self, tx: &mut TransactionContext, snapshot: bool, limit: Option<usize>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
		let (begin, end) = self.subspace.range();
		tx.get_range(&begin, &end, snapshot, limit, false)
	}

	fn primary_key_of(&self, key: &[u8]) -> Result<Vec<Value>> {
		let unpacked = self.subspace.unpack(key)?;
		Ok(unpacked[self.permutation.len()..].to_vec())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kv::memory::MemoryKv;
	use crate::kv::KvStore;
	use crate::schema::{IndexKindOptions, IndexScope};

	#[test]
	fn permutation_reorders_key_fields() {
		let definition = IndexDefinition {
			name: "by_last_first".into(),
			options: IndexKindOptions::Permuted { permutation: vec![1, 0] },
			key_expression: vec!["first".into(), "last".into()],
			grouping_len: 0,
			unique: false,
			scope: IndexScope::Partition,
		};
		let index = PermutedIndex::new(definition, Subspace::root(vec![0xF0]), vec![1, 0]);
		let kv = MemoryKv::new();
		let mut tx = TransactionContext::new(kv.begin());

		let mut record = FieldMap::new();
		record.insert("first".into(), Value::from("Ada"));
		record.insert("last".into(), Value::from("Lovelace"));
		index.update(&mut tx, &[Value::Int(1)], None, Some(&record)).unwrap();

		let entries = index.scan(&mut tx, false, None).unwrap();
		let unpacked = index.subspace.unpack(&entries[0].0).unwrap();
		assert_eq!(unpacked[0], Value::from("Lovelace"));
		assert_eq!(unpacked[1], Value::from("Ada"));
	}
}
