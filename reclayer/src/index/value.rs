//! Value index. A flat packed tuple
//! `I/<name>/<indexedFields...>/<primaryKey...> -> empty`, chosen so range
//! reads come back already ordered by indexed-field values — a
//! `Subspace`-packed tuple standing in for a fixed bit-width key.

use crate::error::{ErrorKind, Result};
use crate::index::{FieldMap, IndexMaintainer};
use crate::schema::IndexDefinition;
use crate::subspace::Subspace;
use crate::transaction::TransactionContext;
use crate::tuple::{self, Value};

pub struct ValueIndex {
	definition: IndexDefinition,
	subspace: Subspace,
}

impl ValueIndex {
	pub fn new(definition: IndexDefinition, subspace: Subspace) -> Self {
		ValueIndex { definition, subspace }
	}

	fn key_values(&self, record: &FieldMap) -> Vec<Value> {
		self.definition
			.key_expression
			.iter()
			.map(|field| record.get(field).cloned().unwrap_or(Value::Null))
			.collect()
	}

	fn entry_key(&self, indexed: &[Value], primary_key: &[Value]) -> Vec<u8> {
		let mut values = indexed.to_vec();
		values.extend(primary_key.iter().cloned());
		self.subspace.pack(&values)
	}

	fn check_unique(&self, tx: &mut TransactionContext, indexed: &[Value], primary_key: &[Value]) -> Result<()> {
		if !self.definition.unique {
			return Ok(());
		}
		let group_prefix = self.subspace.pack(indexed);
		let (begin, end) = (group_prefix.clone(), tuple::strinc(&group_prefix));
		let existing = tx.get_range(&begin, &end, false, None, false)?;
		for (key, _) in existing {
			let unpacked = self.subspace.unpack(&key)?;
			let existing_pk = &unpacked[indexed.len()..];
			if existing_pk != primary_key {
				bail!(ErrorKind::DuplicateKey(self.definition.name.clone()));
			}
		}
		Ok(())
	}
}

impl IndexMaintainer for ValueIndex {
	fn update(&self, tx: &mut TransactionContext, primary_key: &[Value], old: Option<&FieldMap>, new: Option<&FieldMap>) -> Result<()> {
		if let Some(old_record) = old {
			let old_values = self.key_values(old_record);
			tx.clear(&self.entry_key(&old_values, primary_key))?;
		}
		if let Some(new_record) = new {
			let new_values = self.key_values(new_record);
			self.check_unique(tx, &new_values, primary_key)?;
			tx.set(&self.entry_key(&new_values, primary_key), &[])?;
		}
		Ok(())
	}

	fn entry_keys(&self, primary_key: &[Value], record: &FieldMap) -> Vec<Vec<u8>> {
		vec![self.entry_key(&self.key_values(record), primary_key)]
	}

	fn scan(&self, tx: &mut TransactionContext, snapshot: bool, limit: Option<usize>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
		let (begin, end) = self.subspace.range();
		tx.get_range(&begin, &end, snapshot, limit, false)
	}

	fn primary_key_of(&self, key: &[u8]) -> Result<Vec<Value>> {
		let unpacked = self.subspace.unpack(key)?;
		Ok(unpacked[self.definition.key_expression.len()..].to_vec())
	}
}
