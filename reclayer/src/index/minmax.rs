//! Min / Max index. Key:
//! `I/<name>/<groupingFields...>/<value>/<primaryKey...> -> empty`. Min is
//! the first entry of a group's range, max the last — O(log n) under any
//! group because the KV engine's ordered range read does the work, reducing
//! "first/last matching key" to a bounded range read over an ordered key
//! space.

use crate::error::Result;
use crate::index::{FieldMap, IndexMaintainer};
use crate::schema::IndexDefinition;
use crate::subspace::Subspace;
use crate::transaction::TransactionContext;
use crate::tuple::{self, Value};

enum Kind {
	Min,
	Max,
}

pub struct MinMaxIndex {
	definition: IndexDefinition,
	subspace: Subspace,
	field: String,
	kind: Kind,
}

impl MinMaxIndex {
	pub fn min(definition: IndexDefinition, subspace: Subspace, field: String) -> Self {
		MinMaxIndex { definition, subspace, field, kind: Kind::Min }
	}

	pub fn max(definition: IndexDefinition, subspace: Subspace, field: String) -> Self {
		MinMaxIndex { definition, subspace, field, kind: Kind::Max }
	}

	fn grouping(&self, record: &FieldMap) -> Vec<Value> {
		self.definition
			.grouping_fields()
			.iter()
			.map(|f| record.get(f).cloned().unwrap_or(Value::Null))
			.collect()
	}

	fn entry_key(&self, record: &FieldMap, primary_key: &[Value]) -> Vec<u8> {
		let mut values = self.grouping(record);
		values.push(record.get(&self.field).cloned().unwrap_or(Value::Null));
		values.extend(primary_key.iter().cloned());
		self.subspace.pack(&values)
	}

	/// Reads the current min (or max) value of `grouping`'s group.
	pub fn read_extreme(&self, tx: &mut TransactionContext, grouping: &[Value], snapshot: bool) -> Result<Option<Value>> {
		let group_prefix = self.subspace.pack(grouping);
		let (begin, end) = (group_prefix.clone(), tuple::strinc(&group_prefix));
		let reverse = matches!(self.kind, Kind::Max);
		let rows = tx.get_range(&begin, &end, snapshot, Some(1), reverse)?;
		match rows.into_iter().next() {
			Some((key, _)) => {
				let unpacked = self.subspace.unpack(&key)?;
				Ok(unpacked.get(grouping.len()).cloned())
			}
			None => Ok(None),
		}
	}
}

impl IndexMaintainer for MinMaxIndex {
	fn update(&self, tx: &mut TransactionContext, primary_key: &[Value], old: Option<&FieldMap>, new: Option<&FieldMap>) -> Result<()> {
		if let Some(old_record) = old {
			tx.clear(&self.entry_key(old_record, primary_key))?;
		}
		if let Some(new_record) = new {
			tx.set(&self.entry_key(new_record, primary_key), &[])?;
		}
		Ok(())
	}

	fn entry_keys(&self, primary_key: &[Value], record: &FieldMap) -> Vec<Vec<u8>> {
		vec![self.entry_key(record, primary_key)]
	}

	fn scan(&self, tx: &mut TransactionContext, snapshot: bool, limit: Option<usize>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
		let (begin, end) = self.subspace.range();
		tx.get_range(&begin, &end, snapshot, limit, false)
	}

	fn primary_key_of(&self, key: &[u8]) -> Result<Vec<Value>> {
		let unpacked = self.subspace.unpack(key)?;
		Ok(unpacked[self.definition.grouping_fields().len() + 1..].to_vec())
	}
}
