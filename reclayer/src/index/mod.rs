//! Index Maintainer: one polymorphic interface dispatched over a closed
//! tagged variant rather than an open inheritance hierarchy, so the planner
//! reasons over the tag — `IndexKindOptions` (see `schema`) — rather than an
//! abstract interface. Dispatching a tag byte to one of a small closed set
//! of body shapes is the same trick used for on-disk header bytes; here the
//! body shapes are the maintainers below.

pub mod aggregate;
pub mod minmax;
pub mod permuted;
pub mod rank;
pub mod spatial;
pub mod state;
pub mod value;
pub mod vector;
pub mod version;

use crate::error::{ErrorKind, Result};
use crate::schema::{IndexDefinition, IndexKindOptions};
use crate::subspace::Subspace;
use crate::transaction::TransactionContext;
use crate::tuple::Value;

/// The data of one record as seen by an index maintainer: a flat map from
/// field name to its current value. Absent optional fields are simply
/// missing keys. Built by `store::RecordData` when loading the old record
/// (if any) for index diffing.
pub type FieldMap = std::collections::BTreeMap<String, Value>;

/// One polymorphic interface shared by every index kind.
pub trait IndexMaintainer: Send + Sync {
	/// Applies a save (`old=None, new=Some`), a delete (`old=Some,
	/// new=None`), or a re-key/update (`old=Some, new=Some`) to this index,
	/// within the caller's transaction. Gated by index state by the caller:
	/// `disabled` -> no-op, `write-only`/`readable` -> fully maintains.
	fn update(&self, tx: &mut TransactionContext, primary_key: &[Value], old: Option<&FieldMap>, new: Option<&FieldMap>) -> Result<()>;

	/// The index-entry keys this record would currently produce, used by
	/// the scrubber to recompute expected entries and to re-check stored
	/// entries against the live record (phase 1). Aggregate (count/sum) and
	/// version indexes don't have a stable per-record entry identity and
	/// return an empty vec; the scrubber skips those kinds.
	fn entry_keys(&self, primary_key: &[Value], record: &FieldMap) -> Vec<Vec<u8>>;

	/// Raw `(key, value)` pairs directly under this index's subspace,
	/// available to the scrubber and to index-aware plan nodes regardless
	/// of index state: the scrubber uses `scan` directly even on a
	/// `write-only` index; the planner additionally checks state before
	/// choosing a scan node.
	fn scan(&self, tx: &mut TransactionContext, snapshot: bool, limit: Option<usize>) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

	/// Recovers the primary key suffix from a key returned by `scan`, used by
	/// the planner's generic `IndexScan` node. Kinds whose
	/// entries don't carry a recoverable primary key at a fixed offset (rank,
	/// version, vector, spatial — each served by its own dedicated plan node
	/// instead) report that they don't support it.
	fn primary_key_of(&self, _key: &[u8]) -> Result<Vec<Value>> {
		bail!(ErrorKind::InvalidDeclaration(
			"this index kind has no generic IndexScan; use its dedicated scan operator".into()
		))
	}

	/// Maintains a vector index's flat-scan entry directly from a record's
	/// raw float vector, since `Value` has no floating-point variant and so
	/// can never carry one through `FieldMap`/`update`. Every other kind
	/// no-ops; only `vector::VectorIndex` overrides this.
	fn update_vector(&self, _tx: &mut TransactionContext, _primary_key: &[Value], _old: Option<&[f64]>, _new: Option<&[f64]>) -> Result<()> {
		Ok(())
	}
}

/// Given an index definition and the subspace it lives under
/// (`I/<indexName>`), constructs the concrete maintainer for its kind.
pub fn build_maintainer(definition: &IndexDefinition, subspace: Subspace) -> Result<Box<dyn IndexMaintainer>> {
	Ok(match &definition.options {
		IndexKindOptions::Value => Box::new(value::ValueIndex::new(definition.clone(), subspace)),
		IndexKindOptions::Count => Box::new(aggregate::AggregateIndex::count(definition.clone(), subspace)),
		IndexKindOptions::Sum { field } => Box::new(aggregate::AggregateIndex::sum(definition.clone(), subspace, field.clone())),
		IndexKindOptions::Min { field } => Box::new(minmax::MinMaxIndex::min(definition.clone(), subspace, field.clone())),
		IndexKindOptions::Max { field } => Box::new(minmax::MinMaxIndex::max(definition.clone(), subspace, field.clone())),
		IndexKindOptions::Rank { field, order } => Box::new(rank::RankIndex::new(definition.clone(), subspace, field.clone(), *order)),
		IndexKindOptions::Version => Box::new(version::VersionIndex::new(definition.clone(), subspace)),
		IndexKindOptions::Permuted { permutation } => {
			Box::new(permuted::PermutedIndex::new(definition.clone(), subspace, permutation.clone()))
		}
		IndexKindOptions::Vector { dimensions, metric, strategy } => {
			Box::new(vector::VectorIndex::new(definition.clone(), subspace, *dimensions, *metric, *strategy)?)
		}
		IndexKindOptions::Spatial { kind, cell_level, coordinate_fields } => Box::new(spatial::SpatialIndex::new(
			definition.clone(),
			subspace,
			*kind,
			*cell_level,
			coordinate_fields.clone(),
		)),
	})
}
