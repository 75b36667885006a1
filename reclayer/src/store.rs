//! Record Store: the typed per-(tenant × collection × type) storage
//! handle. Exposes a `save`/`fetch`/`delete` surface over one record
//! type's subspace, with index maintenance fanned out on every write.

use std::collections::BTreeMap;

use crate::error::{ErrorKind, Result};
use crate::index::state::IndexStateManager;
use crate::index::{self, FieldMap, IndexMaintainer};
use crate::schema::{IndexState, RecordDescriptor, VectorStrategy, WireKind};
use crate::subspace::Subspace;
use crate::transaction::TransactionContext;
use crate::tuple::Value;
use crate::wire::{self, FieldValue, WireType};

/// A record's field values in the flat `FieldMap` shape index maintainers
/// consume, plus its primary key.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordData {
	pub fields: BTreeMap<String, FieldValue>,
}

impl RecordData {
	pub fn new() -> Self {
		RecordData::default()
	}

	pub fn set(mut self, field: &str, value: FieldValue) -> Self {
		self.fields.insert(field.to_string(), value);
		self
	}

	/// Projects onto the flat `Value`-typed map index maintainers expect;
	/// only the scalar shapes a key expression can reference survive. Public
	/// so the online indexer and scrubber can recompute a maintainer's
	/// expected entries directly from a fetched record, the same way `save`
	/// does internally.
	pub fn to_field_map(&self) -> FieldMap {
		let mut map = FieldMap::new();
		for (name, value) in &self.fields {
			let projected = match value {
				FieldValue::I64(v) => Value::Int(*v),
				FieldValue::Str(s) => Value::Str(s.clone()),
				FieldValue::Bytes(b) => Value::Bytes(b.clone()),
				FieldValue::F64(_) | FieldValue::RepeatedI64(_) | FieldValue::RepeatedF64(_) => continue,
			};
			map.insert(name.clone(), projected);
		}
		map
	}

	/// A record's declared vector field, if it carries one. Used by the
	/// inline-HNSW refusal check at save time and by callers maintaining a
	/// vector index directly from a record, bypassing `FieldMap`.
	pub fn vector_field(&self, field: &str) -> Option<Vec<f64>> {
		match self.fields.get(field) {
			Some(FieldValue::RepeatedF64(values)) => Some(values.clone()),
			_ => None,
		}
	}

	fn encode(&self, descriptor: &RecordDescriptor) -> Result<Vec<u8>> {
		let mut out = Vec::new();
		for field in &descriptor.fields {
			if let Some(value) = self.fields.get(&field.name) {
				value.encode(&mut out, field.wire_number);
			}
		}
		Ok(out)
	}

	fn decode(descriptor: &RecordDescriptor, bytes: &[u8]) -> Result<Self> {
		let mut fields = BTreeMap::new();
		let mut rest = bytes;
		while !rest.is_empty() {
			let (field_number, wire_type, tag_len) = wire::read_tag(rest)?;
			let field = descriptor
				.fields
				.iter()
				.find(|f| f.wire_number == field_number)
				.ok_or_else(|| ErrorKind::SerializationFailed(format!("unknown wire number {}", field_number)))?;
			let body = &rest[tag_len..];
			let (value, body_len) = match wire_type {
				WireType::Varint => {
					let (raw, used) = wire::read_varint(body)?;
					(FieldValue::I64(wire::zigzag_decode(raw)), used)
				}
				WireType::Fixed64 => {
					let (v, used) = wire::read_fixed64(body)?;
					(FieldValue::F64(v), used)
				}
				WireType::Fixed32 => {
					bail!(ErrorKind::SerializationFailed("fixed32 fields are not produced by this codec".into()))
				}
				WireType::LengthDelimited => {
					// Str, Bytes, RepeatedI64 and RepeatedF64 are all
					// length-delimited on the wire and indistinguishable from
					// the bytes alone; the field's declared `wire_kind`
					// breaks the tie. A plain `LengthDelimited` field sniffs
					// valid UTF-8, matching what `encode` would have produced
					// for a `FieldValue::Str` in the first place.
					let (payload, used) = wire::read_length_delimited(body)?;
					let value = match field.wire_kind {
						WireKind::PackedRepeatedI64 => FieldValue::RepeatedI64(wire::unpack_i64(payload)?),
						WireKind::PackedRepeatedF64 => FieldValue::RepeatedF64(wire::unpack_f64(payload)?),
						_ => match std::str::from_utf8(payload) {
							Ok(s) => FieldValue::Str(s.to_string()),
							Err(_) => FieldValue::Bytes(payload.to_vec()),
						},
					};
					(value, used)
				}
			};
			fields.insert(field.name.clone(), value);
			rest = &rest[tag_len + body_len..];
		}
		Ok(RecordData { fields })
	}
}

/// One (subspace × record type) pair, the unit the partition manager opens
/// and caches.
pub struct RecordStore {
	descriptor: RecordDescriptor,
	records: Subspace,
	indexes_root: Subspace,
	indexes: BTreeMap<String, Box<dyn IndexMaintainer>>,
	index_states: IndexStateManager,
}

impl RecordStore {
	pub fn open(descriptor: RecordDescriptor, root: &Subspace) -> Result<Self> {
		descriptor.validate()?;
		let records = root.child("R").child(&descriptor.name);
		let indexes_root = root.child("I");
		let mut indexes = BTreeMap::new();
		for index_def in &descriptor.indexes {
			let subspace = indexes_root.child(&index_def.name);
			indexes.insert(index_def.name.clone(), index::build_maintainer(index_def, subspace)?);
		}
		let index_states = IndexStateManager::new(root.child("S"));
		Ok(RecordStore { descriptor, records, indexes_root, indexes, index_states })
	}

	/// The subspace a given index's entries live under, used by planner plan
	/// nodes that need a concretely-typed maintainer (rank/vector/spatial)
	/// rather than the type-erased `IndexMaintainer` this store keeps.
	pub fn index_subspace(&self, index_name: &str) -> Subspace {
		self.indexes_root.child(index_name)
	}

	fn record_key(&self, primary_key: &[Value]) -> Vec<u8> {
		self.records.pack(primary_key)
	}

	fn primary_key_of(&self, record: &RecordData) -> Result<Vec<Value>> {
		let fields = record.to_field_map();
		self.descriptor
			.primary_key_fields
			.iter()
			.map(|field| {
				fields
					.get(field)
					.cloned()
					.ok_or_else(|| ErrorKind::InvalidDeclaration(format!("record missing primary key field `{}`", field)).into())
			})
			.collect()
	}

	/// Refuses a save that would build an HNSW graph inline without the
	/// index having opted in. This is the actual enforcement point, carried
	/// out at the save call since that's where an inline graph write would
	/// otherwise happen.
	fn check_inline_vector_refusal(&self, record: &RecordData) -> Result<()> {
		for index_def in &self.descriptor.indexes {
			if let crate::schema::IndexKindOptions::Vector { strategy: VectorStrategy::Hnsw { inline_indexing: false }, .. } =
				&index_def.options
			{
				let field = index_def.key_expression.first().cloned().unwrap_or_default();
				if record.vector_field(&field).is_some() {
					bail!(ErrorKind::InvalidOptions(
						"inline_indexing",
						format!("index `{}` is hnsw without inline_indexing; vectors build offline via the online indexer", index_def.name)
					));
				}
			}
		}
		Ok(())
	}

	fn maintained_indexes(&self, tx: &mut TransactionContext) -> Result<Vec<(&crate::schema::IndexDefinition, &Box<dyn IndexMaintainer>)>> {
		let mut maintained = Vec::new();
		for index_def in &self.descriptor.indexes {
			let state = self.index_states.get_state(tx, &index_def.name, false)?;
			if state.is_maintained() {
				maintained.push((index_def, self.indexes.get(&index_def.name).expect("every declared index has a maintainer; qed")));
			}
		}
		Ok(maintained)
	}

	/// The field a `Vector`-kind index reads, and the raw vector it wants
	/// from `record`, if the index is declared `Vector`. `None` for every
	/// other kind, since only `update_vector` (not the generic `update`)
	/// can carry a vector's float values.
	fn vector_update_of(index_def: &crate::schema::IndexDefinition, record: &RecordData) -> Option<Vec<f64>> {
		if let crate::schema::IndexKindOptions::Vector { .. } = &index_def.options {
			let field = index_def.key_expression.first().cloned().unwrap_or_default();
			record.vector_field(&field)
		} else {
			None
		}
	}

	pub fn fetch(&self, tx: &mut TransactionContext, primary_key: &[Value]) -> Result<Option<RecordData>> {
		match tx.get(&self.record_key(primary_key), true)? {
			Some(bytes) => Ok(Some(RecordData::decode(&self.descriptor, &bytes)?)),
			None => Ok(None),
		}
	}

	/// Decodes a raw record value read off a plan node's `FullScan`, for
	/// callers that only have the store's public surface.
	pub fn decode_record(&self, bytes: &[u8]) -> Result<RecordData> {
		RecordData::decode(&self.descriptor, bytes)
	}

	pub fn save(&self, tx: &mut TransactionContext, record: RecordData) -> Result<()> {
		self.save_with_expected_version(tx, record, None)
	}

	/// `expected_version` checks the record's own stored version field (by
	/// convention the first primary-key-adjacent field named `"_version"`),
	/// not the transaction's commit version; absent that convention this is
	/// simply an unconditional save.
	pub fn save_with_expected_version(
		&self,
		tx: &mut TransactionContext,
		record: RecordData,
		expected_version: Option<u64>,
	) -> Result<()> {
		self.check_inline_vector_refusal(&record)?;
		let primary_key = self.primary_key_of(&record)?;
		let old = self.fetch(tx, &primary_key)?;

		if let Some(expected) = expected_version {
			let actual = match old.as_ref().and_then(|r| r.fields.get("_version")) {
				Some(FieldValue::I64(v)) => *v as u64,
				_ => 0,
			};
			if actual != expected {
				bail!(ErrorKind::VersionMismatch(expected, actual));
			}
		}

		let old_map = old.as_ref().map(|r| r.to_field_map());
		let new_map = record.to_field_map();
		let encoded = record.encode(&self.descriptor)?;
		tx.set(&self.record_key(&primary_key), &encoded)?;

		for (index_def, maintainer) in self.maintained_indexes(tx)? {
			maintainer.update(tx, &primary_key, old_map.as_ref(), Some(&new_map))?;
			let old_vector = old.as_ref().and_then(|r| Self::vector_update_of(index_def, r));
			let new_vector = Self::vector_update_of(index_def, &record);
			if old_vector.is_some() || new_vector.is_some() {
				maintainer.update_vector(tx, &primary_key, old_vector.as_deref(), new_vector.as_deref())?;
			}
		}
		Ok(())
	}

	pub fn delete(&self, tx: &mut TransactionContext, primary_key: &[Value]) -> Result<bool> {
		let old = self.fetch(tx, primary_key)?;
		let Some(old_record) = old else {
			return Ok(false);
		};
		let old_map = old_record.to_field_map();
		tx.clear(&self.record_key(primary_key))?;
		for (index_def, maintainer) in self.maintained_indexes(tx)? {
			maintainer.update(tx, primary_key, Some(&old_map), None)?;
			if let Some(old_vector) = Self::vector_update_of(index_def, &old_record) {
				maintainer.update_vector(tx, primary_key, Some(&old_vector), None)?;
			}
		}
		Ok(true)
	}

	pub fn descriptor(&self) -> &RecordDescriptor {
		&self.descriptor
	}

	pub fn records_subspace(&self) -> &Subspace {
		&self.records
	}

	pub fn index(&self, name: &str) -> Option<&dyn IndexMaintainer> {
		self.indexes.get(name).map(|b| b.as_ref())
	}

	pub fn index_state(&self, tx: &mut TransactionContext, name: &str) -> Result<IndexState> {
		self.index_states.get_state(tx, name, false)
	}

	pub fn set_index_state(&self, tx: &mut TransactionContext, name: &str, state: IndexState) -> Result<()> {
		self.index_states.set_state(tx, name, state)
	}

	/// Compare-and-swap transition, used by the online indexer to move an
	/// index from `write-only` to `readable` only if nothing else has
	/// already moved it.
	pub fn transition_index_state(&self, tx: &mut TransactionContext, name: &str, expected: IndexState, target: IndexState) -> Result<()> {
		self.index_states.transition(tx, name, expected, target)
	}

	fn index_state_snapshot(&self, tx: &mut TransactionContext) -> Result<BTreeMap<String, IndexState>> {
		let mut states = BTreeMap::new();
		for index_def in &self.descriptor.indexes {
			states.insert(index_def.name.clone(), self.index_state(tx, &index_def.name)?);
		}
		Ok(states)
	}

	/// `store.query()...execute()`'s landing point: plans (or
	/// reuses a cached plan for) `query` against this store's current index
	/// states and runs it. The caller owns `schema_fingerprint` (from
	/// `Schema::fingerprint`) since a bare `RecordStore` doesn't hold the
	/// whole schema.
	pub fn query(
		&self,
		tx: &mut TransactionContext,
		query: &crate::query::Query,
		schema_fingerprint: u64,
		stats: &crate::statistics::Statistics,
		cache: &crate::query::cache::PlanCache,
	) -> Result<Vec<(Vec<Value>, RecordData)>> {
		let plan = match cache.get(query, schema_fingerprint) {
			Some(plan) => plan,
			None => {
				let index_states = self.index_state_snapshot(tx)?;
				let plan = crate::query::planner::plan(query, &self.descriptor, &index_states, stats)?;
				cache.put(query, schema_fingerprint, plan.clone());
				plan
			}
		};
		crate::query::plan::execute(&plan, self, tx, false)
	}

	/// `store.top_n(n, by=field)`: the `n` lowest-ranked records of
	/// whichever index is named, walking ranks `0, 1, 2, ...` upward from
	/// the head of the skip list. Which end of the value range rank `0`
	/// holds is decided entirely by the index's own declared `SortOrder`
	/// (embedders wanting "highest n" declare a `Descending`-ordered
	/// index and call `top_n`).
	pub fn top_n(&self, tx: &mut TransactionContext, index_name: &str, n: usize) -> Result<Vec<(Vec<Value>, RecordData)>> {
		self.rank_scan(tx, index_name, 0, n, crate::query::plan::Direction::Ascending)
	}

	/// `store.bottom_n(n, by=field)`: the `n` highest-ranked records,
	/// walking ranks downward from the tail of the skip list — the
	/// complement of `top_n`, not a duplicate of it. Needs the
	/// grouping's member count to find the tail rank before it can scan
	/// backward from it.
	pub fn bottom_n(&self, tx: &mut TransactionContext, index_name: &str, n: usize) -> Result<Vec<(Vec<Value>, RecordData)>> {
		let index_def = self.descriptor.index(index_name).ok_or_else(|| ErrorKind::IndexNotFound(index_name.to_string()))?;
		let crate::schema::IndexKindOptions::Rank { field: _, order } = &index_def.options else {
			bail!(ErrorKind::InvalidDeclaration(format!("index `{}` is not a rank index", index_name)));
		};
		let field = index_def.key_expression.first().cloned().unwrap_or_default();
		let rank_index = crate::index::rank::RankIndex::new(index_def.clone(), self.index_subspace(index_name), field, *order);
		let len = rank_index.len(tx, &[])?;
		if len == 0 {
			return Ok(Vec::new());
		}
		self.rank_scan(tx, index_name, (len - 1) as i64, n, crate::query::plan::Direction::Descending)
	}

	fn rank_scan(
		&self,
		tx: &mut TransactionContext,
		index_name: &str,
		start: i64,
		count: usize,
		direction: crate::query::plan::Direction,
	) -> Result<Vec<(Vec<Value>, RecordData)>> {
		let plan = crate::query::plan::PlanNode::RankScan {
			index: index_name.to_string(),
			mode: crate::query::plan::RankScanMode::ByRank,
			start,
			count,
			direction,
		};
		crate::query::plan::execute(&plan, self, tx, false)
	}

	/// `store.rank_of(value, by=field)`: the rank of a known
	/// member, not a scan, so it talks to the concrete `RankIndex` directly
	/// rather than going through a `PlanNode`.
	pub fn rank_of(&self, tx: &mut TransactionContext, index_name: &str, value: &Value, primary_key: &[Value]) -> Result<Option<u64>> {
		let index_def = self.descriptor.index(index_name).ok_or_else(|| ErrorKind::IndexNotFound(index_name.to_string()))?;
		let crate::schema::IndexKindOptions::Rank { field: _, order } = &index_def.options else {
			bail!(ErrorKind::InvalidDeclaration(format!("index `{}` is not a rank index", index_name)));
		};
		let rank_index = crate::index::rank::RankIndex::new(index_def.clone(), self.index_subspace(index_name), index_def.key_expression.first().cloned().unwrap_or_default(), *order);
		rank_index.rank_of(tx, &[], value, primary_key)
	}

	/// `store.nearest_neighbors(k, to=vector, using=index_name)`; results
	/// come back in non-decreasing distance order, per the underlying
	/// `VectorIndex` search, but the distances themselves aren't part of
	/// `Row`'s shape.
	pub fn nearest_neighbors(&self, tx: &mut TransactionContext, index_name: &str, query: &[f64], k: usize) -> Result<Vec<(Vec<Value>, RecordData)>> {
		let ef = (2 * k).max(100);
		let plan = crate::query::plan::PlanNode::VectorSearch { index: index_name.to_string(), query: query.to_vec(), k, ef };
		crate::query::plan::execute(&plan, self, tx, false)
	}

	/// `store.within_radius(meters, of=point, on=index_name)`.
	pub fn within_radius(&self, tx: &mut TransactionContext, index_name: &str, center: (f64, f64), radius_meters: f64) -> Result<Vec<(Vec<Value>, RecordData)>> {
		let plan = crate::query::plan::PlanNode::SpatialScan { index: index_name.to_string(), center, radius_meters };
		crate::query::plan::execute(&plan, self, tx, false)
	}
}
