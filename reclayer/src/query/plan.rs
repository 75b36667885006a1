//! Executable plan tree. Every leaf node here (`IndexScan`, `FullScan`,
//! `RankScan`, `VectorSearch`, `SpatialScan`) reduces to a bounded scan of
//! an ordered key space, and the combinators above it (`Filter`, `Sort`,
//! `Union`, `Intersection`, ...) operate on the resulting rows in memory.

use std::collections::BTreeSet;

use crate::error::{ErrorKind, Result};
use crate::index::rank::RankIndex;
use crate::index::spatial::{self, SpatialIndex};
use crate::index::vector::VectorIndex;
use crate::query::{FilterTree, Predicate, SortSpec};
use crate::schema::{IndexKindOptions, SortOrder};
use crate::store::{RecordData, RecordStore};
use crate::transaction::TransactionContext;
use crate::tuple::{self, Value};
use crate::wire::FieldValue;

/// One row produced by a plan node: the record's primary key plus its
/// fields (possibly partial, for `Covering`).
pub type Row = (Vec<Value>, RecordData);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankScanMode {
	ByRank,
	ByValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	Ascending,
	Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanNode {
	IndexScan { index: String, begin: Vec<Value>, end: Vec<Value>, reverse: bool },
	FullScan,
	/// Applies a residual filter tree the chosen scan didn't already enforce
	///`; generalized to a full tree
	/// so a disjunct's leftover predicates and a `Not`-bearing filter the
	/// planner couldn't index both go through the same node).
	Filter { child: Box<PlanNode>, filter: FilterTree },
	Sort { child: Box<PlanNode>, sort: SortSpec },
	Union { children: Vec<PlanNode> },
	Intersection { children: Vec<PlanNode> },
	InJoin { index: String, field: String, values: Vec<Value> },
	Covering { index: String, field_set: Vec<String> },
	Distinct { child: Box<PlanNode> },
	First { child: Box<PlanNode>, n: usize },
	FlatMap { child: Box<PlanNode> },
	RankScan { index: String, mode: RankScanMode, start: i64, count: usize, direction: Direction },
	VectorSearch { index: String, query: Vec<f64>, k: usize, ef: usize },
	SpatialScan { index: String, center: (f64, f64), radius_meters: f64 },
}

fn value_to_field_value(value: &Value) -> FieldValue {
	match value {
		Value::Int(v) => FieldValue::I64(*v),
		Value::Str(s) => FieldValue::Str(s.clone()),
		Value::Bytes(b) => FieldValue::Bytes(b.clone()),
		Value::Bool(b) => FieldValue::I64(*b as i64),
		Value::Null | Value::Tuple(_) => FieldValue::Bytes(Vec::new()),
	}
}

fn predicate_matches(predicate: &Predicate, record: &RecordData) -> bool {
	let field_value = |name: &str| record.fields.get(name);
	let as_value = |fv: &FieldValue| -> Option<Value> {
		match fv {
			FieldValue::I64(v) => Some(Value::Int(*v)),
			FieldValue::Str(s) => Some(Value::Str(s.clone())),
			FieldValue::Bytes(b) => Some(Value::Bytes(b.clone())),
			FieldValue::F64(_) | FieldValue::RepeatedI64(_) | FieldValue::RepeatedF64(_) => None,
		}
	};
	match predicate {
		Predicate::Eq(f, v) => field_value(f).and_then(as_value).as_ref() == Some(v),
		Predicate::Lt(f, v) => field_value(f).and_then(as_value).map(|fv| fv < *v).unwrap_or(false),
		Predicate::Le(f, v) => field_value(f).and_then(as_value).map(|fv| fv <= *v).unwrap_or(false),
		Predicate::Gt(f, v) => field_value(f).and_then(as_value).map(|fv| fv > *v).unwrap_or(false),
		Predicate::Ge(f, v) => field_value(f).and_then(as_value).map(|fv| fv >= *v).unwrap_or(false),
		Predicate::In(f, values) => field_value(f).and_then(as_value).map(|fv| values.contains(&fv)).unwrap_or(false),
		Predicate::WithinRadius { center, radius_meters, .. } => {
			let (Some(lat), Some(lon)) = (field_value("lat").and_then(as_value), field_value("lon").and_then(as_value)) else {
				return false;
			};
			let (Value::Int(lat), Value::Int(lon)) = (lat, lon) else { return false };
			let point = (lat as f64 / 1_000_000.0, lon as f64 / 1_000_000.0);
			spatial::haversine_meters(*center, point) <= *radius_meters
		}
		Predicate::NearestNeighbors { .. } => true,
	}
}

pub fn filter_matches(filter: &FilterTree, record: &RecordData) -> bool {
	match filter {
		FilterTree::Pred(p) => predicate_matches(p, record),
		FilterTree::And(children) => children.iter().all(|c| filter_matches(c, record)),
		FilterTree::Or(children) => children.iter().any(|c| filter_matches(c, record)),
		FilterTree::Not(child) => !filter_matches(child, record),
	}
}

fn sort_key(record: &RecordData, field: &str) -> Option<Value> {
	match record.fields.get(field)? {
		FieldValue::I64(v) => Some(Value::Int(*v)),
		FieldValue::Str(s) => Some(Value::Str(s.clone())),
		FieldValue::Bytes(b) => Some(Value::Bytes(b.clone())),
		FieldValue::F64(_) | FieldValue::RepeatedI64(_) | FieldValue::RepeatedF64(_) => None,
	}
}

pub fn execute(plan: &PlanNode, store: &RecordStore, tx: &mut TransactionContext, snapshot: bool) -> Result<Vec<Row>> {
	match plan {
		PlanNode::FullScan => {
			let (begin, end) = store.records_subspace().range();
			let rows = tx.get_range(&begin, &end, snapshot, None, false)?;
			rows.into_iter()
				.map(|(key, value)| {
					let pk = store.records_subspace().unpack(&key)?;
					Ok((pk, store.decode_record(&value)?))
				})
				.collect()
		}
		PlanNode::IndexScan { index, begin, end, reverse } => {
			let maintainer = store.index(index).ok_or_else(|| ErrorKind::IndexNotFound(index.clone()))?;
			let subspace = store.index_subspace(index);
			// `begin`/`end` bound an equality prefix over the index's leading
			// fields; an empty pair means "the whole index", same as a plain
			// maintainer scan.
			let (range_begin, range_end) = if begin.is_empty() && end.is_empty() {
				subspace.range()
			} else {
				let packed_begin = subspace.pack(begin);
				let packed_end = if end.is_empty() { subspace.pack(begin) } else { subspace.pack(end) };
				(packed_begin, tuple::strinc(&packed_end))
			};
			let entries = tx.get_range(&range_begin, &range_end, snapshot, None, *reverse)?;
			let mut rows = Vec::new();
			for (key, _) in entries {
				let pk = maintainer.primary_key_of(&key)?;
				if let Some(record) = store.fetch(tx, &pk)? {
					rows.push((pk, record));
				}
			}
			Ok(rows)
		}
		PlanNode::InJoin { index, field, values } => {
			let mut seen = BTreeSet::new();
			let mut rows = Vec::new();
			for value in values {
				let child = execute(
					&PlanNode::Filter {
						child: Box::new(PlanNode::IndexScan { index: index.clone(), begin: vec![], end: vec![], reverse: false }),
						filter: FilterTree::Pred(Predicate::Eq(field.clone(), value.clone())),
					},
					store,
					tx,
					snapshot,
				)?;
				for row in child {
					if seen.insert(row.0.clone()) {
						rows.push(row);
					}
				}
			}
			Ok(rows)
		}
		PlanNode::Covering { index, field_set } => {
			let index_def = store
				.descriptor()
				.index(index)
				.ok_or_else(|| ErrorKind::IndexNotFound(index.clone()))?;
			let maintainer = store.index(index).ok_or_else(|| ErrorKind::IndexNotFound(index.clone()))?;
			let entries = maintainer.scan(tx, snapshot, None)?;
			let subspace = store.index_subspace(index);
			let mut rows = Vec::new();
			for (key, _) in entries {
				let unpacked = subspace.unpack(&key)?;
				let pk = maintainer.primary_key_of(&key)?;
				let mut record = RecordData::new();
				for (i, field_name) in index_def.key_expression.iter().enumerate() {
					if field_set.contains(field_name) {
						if let Some(v) = unpacked.get(i) {
							record = record.set(field_name, value_to_field_value(v));
						}
					}
				}
				rows.push((pk, record));
			}
			Ok(rows)
		}
		PlanNode::RankScan { index, mode, start, count, direction } => {
			let index_def = store
				.descriptor()
				.index(index)
				.ok_or_else(|| ErrorKind::IndexNotFound(index.clone()))?;
			let (field, order) = match &index_def.options {
				IndexKindOptions::Rank { field, order } => (field.clone(), *order),
				_ => bail!(ErrorKind::InvalidDeclaration(format!("`{}` is not a rank index", index))),
			};
			let rank_index = RankIndex::new(index_def.clone(), store.index_subspace(index), field, order);
			let mut rows = Vec::new();
			let descending = matches!(direction, Direction::Descending);
			for i in 0..*count {
				let rank = match (mode, descending) {
					(RankScanMode::ByRank, false) => *start + i as i64,
					(RankScanMode::ByRank, true) => *start - i as i64,
					(RankScanMode::ByValue, _) => *start + i as i64,
				};
				if rank < 0 {
					break;
				}
				if let Some(mut values) = rank_index.select(tx, &[], rank as u64)? {
					// `select` decodes a node key's full tuple: [grouping,
					// "node", value, ...primary_key] — the primary key is
					// everything after the leading 3 fixed entries.
					let pk = values.split_off(3.min(values.len()));
					if let Some(record) = store.fetch(tx, &pk)? {
						rows.push((pk, record));
					}
				} else {
					break;
				}
			}
			Ok(rows)
		}
		PlanNode::VectorSearch { index, query, k, ef } => {
			let index_def = store
				.descriptor()
				.index(index)
				.ok_or_else(|| ErrorKind::IndexNotFound(index.clone()))?;
			let (dimensions, metric, strategy) = match &index_def.options {
				IndexKindOptions::Vector { dimensions, metric, strategy } => (*dimensions, *metric, *strategy),
				_ => bail!(ErrorKind::InvalidDeclaration(format!("`{}` is not a vector index", index))),
			};
			let vector_index = VectorIndex::new(index_def.clone(), store.index_subspace(index), dimensions, metric, strategy)?;
			let matches = if vector_index.requires_offline_build() {
				vector_index.hnsw_search(tx, query, *k, *ef)?
			} else {
				vector_index.flat_search(tx, query, *k)?
			};
			let mut rows = Vec::new();
			for (pk, _distance) in matches {
				if let Some(record) = store.fetch(tx, &pk)? {
					rows.push((pk, record));
				}
			}
			Ok(rows)
		}
		PlanNode::SpatialScan { index, center, radius_meters } => {
			let index_def = store
				.descriptor()
				.index(index)
				.ok_or_else(|| ErrorKind::IndexNotFound(index.clone()))?;
			let (kind, cell_level, coordinate_fields) = match &index_def.options {
				IndexKindOptions::Spatial { kind, cell_level, coordinate_fields } => (*kind, *cell_level, coordinate_fields.clone()),
				_ => bail!(ErrorKind::InvalidDeclaration(format!("`{}` is not a spatial index", index))),
			};
			let spatial_index = SpatialIndex::new(index_def.clone(), store.index_subspace(index), kind, cell_level, coordinate_fields);
			let mut rows = Vec::new();
			let mut seen = BTreeSet::new();
			for cell in spatial_index.cover_cells_for_radius(*center, *radius_meters) {
				for (pk, _) in spatial_index.scan_cell(tx, cell, snapshot)? {
					if seen.insert(pk.clone()) {
						if let Some(record) = store.fetch(tx, &pk)? {
							if predicate_matches(&Predicate::WithinRadius { index: index.clone(), center: *center, radius_meters: *radius_meters }, &record) {
								rows.push((pk, record));
							}
						}
					}
				}
			}
			Ok(rows)
		}
		PlanNode::Filter { child, filter } => {
			let rows = execute(child, store, tx, snapshot)?;
			Ok(rows.into_iter().filter(|(_, record)| filter_matches(filter, record)).collect())
		}
		PlanNode::Sort { child, sort } => {
			let mut rows = execute(child, store, tx, snapshot)?;
			rows.sort_by(|a, b| {
				let ka = sort_key(&a.1, &sort.field);
				let kb = sort_key(&b.1, &sort.field);
				let ordering = ka.cmp(&kb);
				match sort.order {
					SortOrder::Ascending => ordering,
					SortOrder::Descending => ordering.reverse(),
				}
			});
			Ok(rows)
		}
		PlanNode::Union { children } => {
			let mut seen = BTreeSet::new();
			let mut rows = Vec::new();
			for child in children {
				for row in execute(child, store, tx, snapshot)? {
					if seen.insert(row.0.clone()) {
						rows.push(row);
					}
				}
			}
			Ok(rows)
		}
		PlanNode::Intersection { children } => {
			let mut results: Vec<Vec<Row>> = Vec::new();
			for child in children {
				results.push(execute(child, store, tx, snapshot)?);
			}
			let Some((first, rest)) = results.split_first() else {
				return Ok(Vec::new());
			};
			let rest_keys: Vec<BTreeSet<Vec<Value>>> = rest.iter().map(|rows| rows.iter().map(|r| r.0.clone()).collect()).collect();
			Ok(first.iter().filter(|row| rest_keys.iter().all(|keys| keys.contains(&row.0))).cloned().collect())
		}
		PlanNode::Distinct { child } => {
			let mut seen = BTreeSet::new();
			Ok(execute(child, store, tx, snapshot)?.into_iter().filter(|row| seen.insert(row.0.clone())).collect())
		}
		PlanNode::First { child, n } => {
			let mut rows = execute(child, store, tx, snapshot)?;
			rows.truncate(*n);
			Ok(rows)
		}
		PlanNode::FlatMap { child } => execute(child, store, tx, snapshot),
	}
}
