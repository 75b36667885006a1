//! Index Scrubber: repairs an index that may have drifted from its
//! records — dangling entries left by a partial failure, or missing
//! entries from a gap in maintenance — in two independently resumable
//! phases, reconciling a derived structure (the index) against its source
//! of truth (the records) one bounded batch at a time.

use crate::error::{ErrorKind, Result};
use crate::index::IndexMaintainer;
use crate::indexer::rangeset::ProgressStore;
use crate::indexer::BatchBudget;
use crate::kv::KvStore;
use crate::schema::{IndexDefinition, IndexKindOptions};
use crate::store::RecordStore;
use crate::transaction::TransactionContext;
use crate::tuple;

/// Aggregate/version/rank/vector/spatial kinds have no stable per-record
/// entry identity (`IndexMaintainer::entry_keys` returns empty for them, or
/// `primary_key_of` bails) — the scrubber has nothing to reconcile and
/// skips them entirely.
fn is_scrubbable(options: &IndexKindOptions) -> bool {
	matches!(options, IndexKindOptions::Value | IndexKindOptions::Min { .. } | IndexKindOptions::Max { .. } | IndexKindOptions::Permuted { .. })
}

fn progress_key(index_name: &str, phase: &str) -> String {
	format!("{}/scrub/{}", index_name, phase)
}

/// Phase 1: scans `I/<indexName>/` and deletes entries that no longer point
/// at a live record, or whose stored value no longer matches what that
/// record would currently produce.
pub fn scrub_dangling(kv: &dyn KvStore, store: &RecordStore, index_def: &IndexDefinition, progress: &ProgressStore) -> Result<usize> {
	if !is_scrubbable(&index_def.options) {
		return Ok(0);
	}
	let maintainer = store.index(&index_def.name).expect("a declared index always has a maintainer; qed");
	let (subspace_begin, subspace_end) = store.index_subspace(&index_def.name).range();
	let operation = progress_key(&index_def.name, "dangling");
	let mut repaired = 0usize;
	let mut budget = BatchBudget::default_budget();

	loop {
		let uncovered = {
			let mut tx = TransactionContext::new(kv.begin());
			let range_set = progress.load(&mut tx, &operation)?;
			tx.cancel();
			range_set.next_uncovered(&subspace_begin, &subspace_end)
		};
		let Some((begin, _)) = uncovered else {
			break;
		};

		match run_dangling_batch(kv, store, maintainer, &operation, progress, &begin, &subspace_end, budget) {
			Ok(count) => {
				repaired += count;
				budget = BatchBudget::default_budget();
			}
			Err(e) if e.kind().is_retryable() => {
				if budget.is_floor() {
					bail!(ErrorKind::BudgetExhausted(format!("scrubbing dangling entries for `{}`", index_def.name)));
				}
				budget = budget.halved();
			}
			Err(e) => return Err(e),
		}
	}
	Ok(repaired)
}

fn run_dangling_batch(
	kv: &dyn KvStore,
	store: &RecordStore,
	maintainer: &dyn IndexMaintainer,
	operation: &str,
	progress: &ProgressStore,
	begin: &[u8],
	end: &[u8],
	budget: BatchBudget,
) -> Result<usize> {
	let mut tx = TransactionContext::new(kv.begin());
	let rows = tx.get_range(begin, end, false, Some(budget.records), false)?;

	if rows.is_empty() {
		let mut range_set = progress.load(&mut tx, operation)?;
		range_set.mark_covered(begin.to_vec(), end.to_vec());
		progress.save(&mut tx, operation, &range_set)?;
		tx.commit()?;
		return Ok(0);
	}

	let mut repaired = 0usize;
	let mut last_key = begin.to_vec();
	for (key, _value) in &rows {
		if let Ok(primary_key) = maintainer.primary_key_of(key) {
			let live = store.fetch(&mut tx, &primary_key)?;
			let is_dangling = match live {
				None => true,
				Some(record) => {
					let field_map = record.to_field_map();
					!maintainer.entry_keys(&primary_key, &field_map).contains(key)
				}
			};
			if is_dangling {
				tx.clear(key)?;
				repaired += 1;
			}
		}
		last_key = key.clone();
	}

	let covered_to = if rows.len() < budget.records { end.to_vec() } else { tuple::strinc(&last_key) };
	let mut range_set = progress.load(&mut tx, operation)?;
	range_set.mark_covered(begin.to_vec(), covered_to);
	progress.save(&mut tx, operation, &range_set)?;
	tx.commit()?;
	Ok(repaired)
}

/// Phase 2: scans `R/<type>/` and rewrites any record whose current index
/// entries are incomplete.
pub fn scrub_missing(kv: &dyn KvStore, store: &RecordStore, index_def: &IndexDefinition, progress: &ProgressStore) -> Result<usize> {
	if !is_scrubbable(&index_def.options) {
		return Ok(0);
	}
	let maintainer = store.index(&index_def.name).expect("a declared index always has a maintainer; qed");
	let (subspace_begin, subspace_end) = store.records_subspace().range();
	let operation = progress_key(&index_def.name, "missing");
	let mut repaired = 0usize;
	let mut budget = BatchBudget::default_budget();

	loop {
		let uncovered = {
			let mut tx = TransactionContext::new(kv.begin());
			let range_set = progress.load(&mut tx, &operation)?;
			tx.cancel();
			range_set.next_uncovered(&subspace_begin, &subspace_end)
		};
		let Some((begin, _)) = uncovered else {
			break;
		};

		match run_missing_batch(kv, store, maintainer, &operation, progress, &begin, &subspace_end, budget) {
			Ok(count) => {
				repaired += count;
				budget = BatchBudget::default_budget();
			}
			Err(e) if e.kind().is_retryable() => {
				if budget.is_floor() {
					bail!(ErrorKind::BudgetExhausted(format!("scrubbing missing entries for `{}`", index_def.name)));
				}
				budget = budget.halved();
			}
			Err(e) => return Err(e),
		}
	}
	Ok(repaired)
}

fn run_missing_batch(
	kv: &dyn KvStore,
	store: &RecordStore,
	maintainer: &dyn IndexMaintainer,
	operation: &str,
	progress: &ProgressStore,
	begin: &[u8],
	end: &[u8],
	budget: BatchBudget,
) -> Result<usize> {
	let mut tx = TransactionContext::new(kv.begin());
	let rows = tx.get_range(begin, end, false, Some(budget.records), false)?;

	if rows.is_empty() {
		let mut range_set = progress.load(&mut tx, operation)?;
		range_set.mark_covered(begin.to_vec(), end.to_vec());
		progress.save(&mut tx, operation, &range_set)?;
		tx.commit()?;
		return Ok(0);
	}

	let mut repaired = 0usize;
	let mut last_key = begin.to_vec();
	for (key, value) in &rows {
		let record = store.decode_record(value)?;
		let primary_key = store.records_subspace().unpack(key)?;
		let field_map = record.to_field_map();
		let expected = maintainer.entry_keys(&primary_key, &field_map);
		let missing = expected.iter().any(|entry_key| tx.get(entry_key, false).ok().flatten().is_none());
		if missing {
			maintainer.update(&mut tx, &primary_key, None, Some(&field_map))?;
			repaired += 1;
		}
		last_key = key.clone();
	}

	let covered_to = if rows.len() < budget.records { end.to_vec() } else { tuple::strinc(&last_key) };
	let mut range_set = progress.load(&mut tx, operation)?;
	range_set.mark_covered(begin.to_vec(), covered_to);
	progress.save(&mut tx, operation, &range_set)?;
	tx.commit()?;
	Ok(repaired)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kv::memory::MemoryKv;
	use crate::schema::{FieldDescriptor, IndexScope, PartitionSegment, RecordDescriptor, WireKind};
	use crate::store::RecordData;
	use crate::subspace::Subspace;
	use crate::wire::FieldValue;

	fn descriptor() -> RecordDescriptor {
		RecordDescriptor {
			name: "User".into(),
			primary_key_fields: vec!["id".into()],
			fields: vec![
				FieldDescriptor { name: "id".into(), wire_number: 1, wire_kind: WireKind::ZigzagVarint },
				FieldDescriptor { name: "city".into(), wire_number: 2, wire_kind: WireKind::LengthDelimited },
			],
			indexes: vec![IndexDefinition {
				name: "by_city".into(),
				options: IndexKindOptions::Value,
				key_expression: vec!["city".into()],
				grouping_len: 0,
				unique: false,
				scope: IndexScope::Partition,
			}],
			partition_path: vec![PartitionSegment::Literal("users".into())],
		}
	}

	fn readable(store: &RecordStore, kv: &MemoryKv) {
		use crate::schema::IndexState;
		let mut tx = TransactionContext::new(kv.begin());
		store.set_index_state(&mut tx, "by_city", IndexState::Readable).unwrap();
		tx.commit().unwrap();
	}

	#[test]
	fn dangling_entry_with_no_record_behind_it_is_deleted() {
		let kv = MemoryKv::new();
		let store = RecordStore::open(descriptor(), &Subspace::root(vec![0xF0])).unwrap();
		readable(&store, &kv);
		let index_def = store.descriptor().indexes[0].clone();

		let mut tx = TransactionContext::new(kv.begin());
		let record = RecordData::new().set("id", FieldValue::I64(1)).set("city", FieldValue::Str("Kyoto".into()));
		store.save(&mut tx, record).unwrap();
		tx.commit().unwrap();

		let mut tx = TransactionContext::new(kv.begin());
		store.delete(&mut tx, &[crate::tuple::Value::Int(1)]).unwrap();
		tx.commit().unwrap();

		// Simulate a maintainer bug that left the index entry behind despite
		// the record already being gone.
		let maintainer_subspace = store.index_subspace("by_city");
		let mut tx = TransactionContext::new(kv.begin());
		tx.set(&maintainer_subspace.pack(&[crate::tuple::Value::Str("Kyoto".into()), crate::tuple::Value::Int(1)]), b"").unwrap();
		tx.commit().unwrap();

		let progress = ProgressStore::new(Subspace::root(vec![0xF1]));
		let repaired = scrub_dangling(&kv, &store, &index_def, &progress).unwrap();
		assert_eq!(repaired, 1);

		let mut tx = TransactionContext::new(kv.begin());
		assert_eq!(store.index("by_city").unwrap().scan(&mut tx, false, None).unwrap().len(), 0);
	}

	#[test]
	fn missing_entry_is_rebuilt_from_the_live_record() {
		let kv = MemoryKv::new();
		let store = RecordStore::open(descriptor(), &Subspace::root(vec![0xF2])).unwrap();
		let index_def = store.descriptor().indexes[0].clone();

		// Save while the index is disabled, so no entry is written; then
		// flip to readable without running the online builder.
		let mut tx = TransactionContext::new(kv.begin());
		let record = RecordData::new().set("id", FieldValue::I64(7)).set("city", FieldValue::Str("Lagos".into()));
		store.save(&mut tx, record).unwrap();
		tx.commit().unwrap();
		readable(&store, &kv);

		let progress = ProgressStore::new(Subspace::root(vec![0xF3]));
		let repaired = scrub_missing(&kv, &store, &index_def, &progress).unwrap();
		assert_eq!(repaired, 1);

		let mut tx = TransactionContext::new(kv.begin());
		assert_eq!(store.index("by_city").unwrap().scan(&mut tx, false, None).unwrap().len(), 1);
	}

	#[test]
	fn aggregate_indexes_are_skipped_since_they_have_no_per_record_identity() {
		let count_def = IndexDefinition {
			name: "total".into(),
			options: IndexKindOptions::Count,
			key_expression: vec![],
			grouping_len: 0,
			unique: false,
			scope: IndexScope::Partition,
		};
		let kv = MemoryKv::new();
		let mut descriptor = descriptor();
		descriptor.indexes.push(count_def.clone());
		let store = RecordStore::open(descriptor, &Subspace::root(vec![0xF4])).unwrap();
		let progress = ProgressStore::new(Subspace::root(vec![0xF5]));
		assert_eq!(scrub_dangling(&kv, &store, &count_def, &progress).unwrap(), 0);
		assert_eq!(scrub_missing(&kv, &store, &count_def, &progress).unwrap(), 0);
	}
}
