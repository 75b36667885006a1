//! Online Indexer: builds a newly-declared index across every existing
//! record in bounded, retried batches, then flips the index from
//! `write-only` to `readable`. Each batch drains a bounded amount of
//! pending work and persists how far it got — tracked as the `RangeSet` in
//! `indexer::rangeset` — so a restart resumes instead of reprocessing.

use crate::error::{ErrorKind, Result};
use crate::index::vector::VectorIndex;
use crate::indexer::rangeset::ProgressStore;
use crate::indexer::BatchBudget;
use crate::kv::KvStore;
use crate::schema::{IndexDefinition, IndexKindOptions, IndexState, VectorStrategy};
use crate::store::RecordStore;
use crate::transaction::TransactionContext;
use crate::tuple;

/// Caps how many edges an HNSW node keeps; matches the default used by
/// `VectorIndex::hnsw_insert`'s other callers in this crate (the planner's
/// search arms pass `ef`, not this; this is purely a build-time
/// graph-density knob).
const HNSW_MAX_NEIGHBORS: usize = 16;

fn vector_builder(index_def: &IndexDefinition, store: &RecordStore) -> Result<Option<VectorIndex>> {
	let IndexKindOptions::Vector { dimensions, metric, strategy } = &index_def.options else {
		return Ok(None);
	};
	if !matches!(strategy, VectorStrategy::Hnsw { inline_indexing: false }) {
		return Ok(None);
	}
	let vector_index = VectorIndex::new(index_def.clone(), store.index_subspace(&index_def.name), *dimensions, *metric, *strategy)?;
	Ok(Some(vector_index))
}

/// Runs one bounded batch starting at `begin`, returns the key the caller
/// should treat as newly covered up to (exclusive).
fn run_batch(
	kv: &dyn KvStore,
	store: &RecordStore,
	index_def: &IndexDefinition,
	progress: &ProgressStore,
	begin: &[u8],
	end: &[u8],
	budget: BatchBudget,
) -> Result<Vec<u8>> {
	let started = std::time::Instant::now();
	let mut tx = TransactionContext::new(kv.begin());
	let rows = tx.get_range(begin, end, true, Some(budget.records), false)?;

	if rows.is_empty() {
		let mut range_set = progress.load(&mut tx, &index_def.name)?;
		range_set.mark_covered(begin.to_vec(), end.to_vec());
		progress.save(&mut tx, &index_def.name, &range_set)?;
		tx.commit()?;
		return Ok(end.to_vec());
	}

	let maintainer = store.index(&index_def.name).expect("a declared index always has a maintainer; qed");
	let vector_builder = vector_builder(index_def, store)?;
	let field = index_def.key_expression.first().cloned().unwrap_or_default();

	let mut last_key = begin.to_vec();
	let mut exhausted_by_budget = false;
	for (key, value) in &rows {
		let record = store.decode_record(value)?;
		let primary_key = store.records_subspace().unpack(key)?;
		let field_map = record.to_field_map();
		maintainer.update(&mut tx, &primary_key, None, Some(&field_map))?;

		if let Some(vector) = record.vector_field(&field) {
			maintainer.update_vector(&mut tx, &primary_key, None, Some(&vector))?;
			if let Some(vector_index) = &vector_builder {
				vector_index.hnsw_insert(&mut tx, &primary_key, &vector, HNSW_MAX_NEIGHBORS)?;
			}
		}

		last_key = key.clone();
		if tx.mutation_bytes() > budget.bytes || started.elapsed() > budget.time {
			exhausted_by_budget = true;
			break;
		}
	}

	let covered_to = if !exhausted_by_budget && rows.len() < budget.records {
		end.to_vec()
	} else {
		tuple::strinc(&last_key)
	};

	let mut range_set = progress.load(&mut tx, &index_def.name)?;
	range_set.mark_covered(begin.to_vec(), covered_to.clone());
	progress.save(&mut tx, &index_def.name, &range_set)?;
	tx.commit()?;
	Ok(covered_to)
}

/// Drives the full build of `index_name` to completion: resume progress,
/// claim and process the next uncovered range under a shrinking budget,
/// and flip the index to `readable` once every range is covered.
/// `progress` is typically rooted at `root.child("progress")`, shared by
/// every index the embedder builds.
pub fn build_index(kv: &dyn KvStore, store: &RecordStore, index_name: &str, progress: &ProgressStore) -> Result<()> {
	let index_def = store
		.descriptor()
		.indexes
		.iter()
		.find(|d| d.name == index_name)
		.ok_or_else(|| ErrorKind::IndexNotFound(index_name.to_string()))?
		.clone();

	{
		let mut tx = TransactionContext::new(kv.begin());
		if store.index_state(&mut tx, index_name)? == IndexState::Disabled {
			store.set_index_state(&mut tx, index_name, IndexState::WriteOnly)?;
		}
		tx.commit()?;
	}

	let (subspace_begin, subspace_end) = store.records_subspace().range();
	let mut budget = BatchBudget::default_budget();

	loop {
		let uncovered = {
			let mut tx = TransactionContext::new(kv.begin());
			let range_set = progress.load(&mut tx, index_name)?;
			tx.cancel();
			range_set.next_uncovered(&subspace_begin, &subspace_end)
		};
		let Some((begin, _)) = uncovered else {
			break;
		};

		match run_batch(kv, store, &index_def, progress, &begin, &subspace_end, budget) {
			Ok(_) => budget = BatchBudget::default_budget(),
			Err(e) if e.kind().is_retryable() => {
				if budget.is_floor() {
					bail!(ErrorKind::BudgetExhausted(format!("building index `{}`", index_name)));
				}
				budget = budget.halved();
			}
			Err(e) => return Err(e),
		}
	}

	let mut tx = TransactionContext::new(kv.begin());
	store.transition_index_state(&mut tx, index_name, IndexState::WriteOnly, IndexState::Readable)?;
	progress.clear(&mut tx, index_name)?;
	tx.commit()?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kv::memory::MemoryKv;
	use crate::schema::{FieldDescriptor, IndexScope, PartitionSegment, RecordDescriptor, WireKind};
	use crate::store::RecordData;
	use crate::subspace::Subspace;
	use crate::tuple::Value;
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

	#[test]
	fn builds_an_index_over_records_written_before_it_existed() {
		let kv = MemoryKv::new();
		let store = RecordStore::open(descriptor(), &Subspace::root(vec![0xE0])).unwrap();

		for i in 0..5 {
			let mut tx = TransactionContext::new(kv.begin());
			let record = RecordData::new().set("id", FieldValue::I64(i)).set("city", FieldValue::Str("Tokyo".into()));
			store.save(&mut tx, record).unwrap();
			tx.commit().unwrap();
		}

		let progress = ProgressStore::new(Subspace::root(vec![0xE1]));
		build_index(&kv, &store, "by_city", &progress).unwrap();

		let mut tx = TransactionContext::new(kv.begin());
		assert_eq!(store.index_state(&mut tx, "by_city").unwrap(), IndexState::Readable);
		let entries = store.index("by_city").unwrap().scan(&mut tx, false, None).unwrap();
		assert_eq!(entries.len(), 5);
	}

	#[test]
	fn resumes_from_a_partially_covered_range_set() {
		let kv = MemoryKv::new();
		let store = RecordStore::open(descriptor(), &Subspace::root(vec![0xE2])).unwrap();
		for i in 0..3 {
			let mut tx = TransactionContext::new(kv.begin());
			let record = RecordData::new().set("id", FieldValue::I64(i)).set("city", FieldValue::Str("Oslo".into()));
			store.save(&mut tx, record).unwrap();
			tx.commit().unwrap();
		}

		let progress = ProgressStore::new(Subspace::root(vec![0xE3]));
		let (begin, end) = store.records_subspace().range();
		{
			let mut tx = TransactionContext::new(kv.begin());
			let mut range_set = progress.load(&mut tx, "by_city").unwrap();
			range_set.mark_covered(begin.clone(), begin.clone());
			progress.save(&mut tx, "by_city", &range_set).unwrap();
			tx.commit().unwrap();
		}
		let _ = end;

		build_index(&kv, &store, "by_city", &progress).unwrap();
		let mut tx = TransactionContext::new(kv.begin());
		assert_eq!(store.index_state(&mut tx, "by_city").unwrap(), IndexState::Readable);
	}

	#[test]
	fn unknown_index_name_is_rejected() {
		let kv = MemoryKv::new();
		let store = RecordStore::open(descriptor(), &Subspace::root(vec![0xE4])).unwrap();
		let progress = ProgressStore::new(Subspace::root(vec![0xE5]));
		assert!(build_index(&kv, &store, "not_declared", &progress).is_err());
	}
}
