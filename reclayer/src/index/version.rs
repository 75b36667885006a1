//! Version index: the key includes a KV-engine-assigned versionstamp
//! produced by `set_versionstamped`, giving each save a
//! monotonically-increasing, commit-ordered entry — a monotonic token
//! minted once per commit and baked into a key.

use crate::error::Result;
use crate::index::{FieldMap, IndexMaintainer};
use crate::schema::IndexDefinition;
use crate::subspace::Subspace;
use crate::transaction::TransactionContext;
use crate::tuple::Value;

pub struct VersionIndex {
	#[allow(dead_code)]
	definition: IndexDefinition,
	subspace: Subspace,
}

impl VersionIndex {
	pub fn new(definition: IndexDefinition, subspace: Subspace) -> Self {
		VersionIndex { definition, subspace }
	}

	fn key_prefix(&self, primary_key: &[Value]) -> Vec<u8> {
		self.subspace.pack(primary_key)
	}
}

impl IndexMaintainer for VersionIndex {
	fn update(&self, tx: &mut TransactionContext, primary_key: &[Value], old: Option<&FieldMap>, new: Option<&FieldMap>) -> Result<()> {
		// A versionstamped key can't be cleared by reconstructing it (the
		// versionstamp is only known after commit), so a delete just
		// leaves the tombstone entries in place; they carry no live data
		// and are reclaimed by the scrubber when phase 1 finds the
		// primary key gone. The version index is an append log, not a
		// maintained set.
		let _ = old;
		if new.is_some() {
			tx.set_versionstamped(&self.key_prefix(primary_key), &[])?;
		}
		Ok(())
	}

	fn entry_keys(&self, _primary_key: &[Value], _record: &FieldMap) -> Vec<Vec<u8>> {
		// Versionstamp isn't known until commit, so there's no stable
		// entry identity to recompute; scrubbing this kind is out of
		// scope, matching `aggregate`'s reasoning.
		Vec::new()
	}

	fn scan(&self, tx: &mut TransactionContext, snapshot: bool, limit: Option<usize>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
		let (begin, end) = self.subspace.range();
		tx.get_range(&begin, &end, snapshot, limit, false)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kv::memory::MemoryKv;
	use crate::kv::KvStore;
	use crate::schema::{IndexKindOptions, IndexScope};

	#[test]
	fn save_appends_a_versionstamped_entry() {
		let definition = IndexDefinition {
			name: "by_commit".into(),
			options: IndexKindOptions::Version,
			key_expression: vec![],
			grouping_len: 0,
			unique: false,
			scope: IndexScope::Partition,
		};
		let index = VersionIndex::new(definition, Subspace::root(vec![0xEF]));
		let kv = MemoryKv::new();
		let mut tx = TransactionContext::new(kv.begin());
		let record = FieldMap::new();
		index.update(&mut tx, &[Value::Int(1)], None, Some(&record)).unwrap();
		tx.commit().unwrap();

		let mut verify = TransactionContext::new(kv.begin());
		let entries = index.scan(&mut verify, true, None).unwrap();
		assert_eq!(entries.len(), 1);
	}
}
