//! Record descriptors and the runtime schema aggregate: one small versioned
//! aggregate that every other component consults instead of touching raw
//! keys directly. Here the aggregate is a `Schema` of `RecordDescriptor`s
//! and `IndexDefinition`s.

pub mod evolution;

use std::collections::BTreeMap;

use crate::error::{ErrorKind, Result};

/// One field of a record type, by its wire number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
	pub name: String,
	pub wire_number: u32,
	pub wire_kind: WireKind,
}

/// The subset of wire shapes the record codec commits to, used by the
/// evolution validator to reject a changed field's wire type and by
/// `RecordData::decode` to pick a `FieldValue` variant back out of a
/// length-delimited payload, which by itself is just bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
	Varint,
	ZigzagVarint,
	Fixed32,
	Fixed64,
	LengthDelimited,
	PackedRepeatedI64,
	PackedRepeatedF64,
}

/// `disabled -> write-only -> readable`, plus the retirement edge back to
/// `disabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
	Disabled,
	WriteOnly,
	Readable,
}

impl IndexState {
	pub fn as_byte(self) -> u8 {
		match self {
			IndexState::Disabled => 0,
			IndexState::WriteOnly => 1,
			IndexState::Readable => 2,
		}
	}

	pub fn from_byte(b: u8) -> Result<Self> {
		match b {
			0 => Ok(IndexState::Disabled),
			1 => Ok(IndexState::WriteOnly),
			2 => Ok(IndexState::Readable),
			other => bail!(ErrorKind::InvalidDeclaration(format!("unknown index state byte {}", other))),
		}
	}

	/// Whether `update()` must maintain this index on a write.
	pub fn is_maintained(self) -> bool {
		matches!(self, IndexState::WriteOnly | IndexState::Readable)
	}

	/// Whether the planner may choose this index.
	pub fn is_queryable(self) -> bool {
		matches!(self, IndexState::Readable)
	}
}

/// Distance metric for vector indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
	Cosine,
	Euclidean,
	Dot,
}

/// Vector index build strategy. `Hnsw`'s `inline_indexing` flag gates
/// whether a save is allowed to build the graph inline or must go through
/// the offline builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorStrategy {
	FlatScan,
	Hnsw { inline_indexing: bool },
}

/// One of the four supported spatial encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialKind {
	Geo2D,
	Geo3D,
	Cartesian2D,
	Cartesian3D,
}

/// Ordering direction for a rank index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
	Ascending,
	Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexScope {
	Partition,
	Global,
}

/// Kind-specific configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexKindOptions {
	Value,
	Count,
	Sum { field: String },
	Min { field: String },
	Max { field: String },
	Rank { field: String, order: SortOrder },
	Version,
	Permuted { permutation: Vec<usize> },
	Vector { dimensions: usize, metric: DistanceMetric, strategy: VectorStrategy },
	Spatial { kind: SpatialKind, cell_level: u8, coordinate_fields: Vec<String> },
}

impl IndexKindOptions {
	pub fn kind_name(&self) -> &'static str {
		match self {
			IndexKindOptions::Value => "value",
			IndexKindOptions::Count => "count",
			IndexKindOptions::Sum { .. } => "sum",
			IndexKindOptions::Min { .. } => "min",
			IndexKindOptions::Max { .. } => "max",
			IndexKindOptions::Rank { .. } => "rank",
			IndexKindOptions::Version => "version",
			IndexKindOptions::Permuted { .. } => "permuted",
			IndexKindOptions::Vector { .. } => "vector",
			IndexKindOptions::Spatial { .. } => "spatial",
		}
	}
}

/// An index declaration on a record type.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDefinition {
	pub name: String,
	pub options: IndexKindOptions,
	/// Ordered tuple of field references, grouping fields first.
	pub key_expression: Vec<String>,
	/// How many of `key_expression`'s leading fields are the grouping
	/// prefix.
	pub grouping_len: usize,
	pub unique: bool,
	pub scope: IndexScope,
}

impl IndexDefinition {
	pub fn grouping_fields(&self) -> &[String] {
		&self.key_expression[..self.grouping_len]
	}
}

/// The tombstone retained when an index is removed.
#[derive(Debug, Clone, PartialEq)]
pub struct FormerIndex {
	pub name: String,
	pub added_in: SchemaVersion,
	pub removed_in: SchemaVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SchemaVersion {
	pub major: u32,
	pub minor: u32,
	pub patch: u32,
}

/// One path segment of an optional partition directory path.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionSegment {
	Literal(String),
	Field(String),
}

/// Compile-time metadata for a record type; in this repo, hand-built by
/// callers rather than produced by external codegen.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDescriptor {
	pub name: String,
	pub primary_key_fields: Vec<String>,
	pub fields: Vec<FieldDescriptor>,
	pub indexes: Vec<IndexDefinition>,
	pub partition_path: Vec<PartitionSegment>,
}

impl RecordDescriptor {
	pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
		self.fields.iter().find(|f| f.name == name)
	}

	pub fn index(&self, name: &str) -> Option<&IndexDefinition> {
		self.indexes.iter().find(|i| i.name == name)
	}

	/// Validates I-type invariants that don't require comparison against a
	/// previous schema: primary key fields exist, index key-expression
	/// fields exist, and a `.global` index's key carries every partition
	/// field.
	pub fn validate(&self) -> Result<()> {
		if self.primary_key_fields.is_empty() {
			bail!(ErrorKind::InvalidDeclaration(format!("{}: primary key must have at least one field", self.name)));
		}
		for pk in &self.primary_key_fields {
			if self.field(pk).is_none() {
				bail!(ErrorKind::InvalidDeclaration(format!("{}: unknown primary key field `{}`", self.name, pk)));
			}
		}
		for index in &self.indexes {
			for field_name in &index.key_expression {
				if self.field(field_name).is_none() {
					bail!(ErrorKind::InvalidDeclaration(format!(
						"{}: index `{}` references unknown field `{}`",
						self.name, index.name, field_name
					)));
				}
			}
			if index.scope == IndexScope::Global && !self.partition_path.is_empty() {
				let partition_fields: Vec<&String> = self
					.partition_path
					.iter()
					.filter_map(|seg| match seg {
						PartitionSegment::Field(f) => Some(f),
						PartitionSegment::Literal(_) => None,
					})
					.collect();
				for pf in partition_fields {
					if !self.primary_key_fields.contains(pf) {
						bail!(ErrorKind::InvalidDeclaration(format!(
							"{}: global index `{}` requires partition field `{}` in the primary key",
							self.name, index.name, pf
						)));
					}
				}
			}
		}
		Ok(())
	}
}

/// Runtime aggregate of every registered record type.
#[derive(Debug, Clone, Default)]
pub struct Schema {
	pub version: Option<SchemaVersion>,
	record_types: BTreeMap<String, RecordDescriptor>,
	former_indexes: BTreeMap<String, Vec<FormerIndex>>,
}

impl Schema {
	pub fn new() -> Self {
		Schema::default()
	}

	pub fn register(&mut self, descriptor: RecordDescriptor) -> Result<()> {
		descriptor.validate()?;
		self.record_types.insert(descriptor.name.clone(), descriptor);
		Ok(())
	}

	pub fn record_type(&self, name: &str) -> Option<&RecordDescriptor> {
		self.record_types.get(name)
	}

	pub fn record_types(&self) -> impl Iterator<Item = &RecordDescriptor> {
		self.record_types.values()
	}

	pub fn retire_index(&mut self, type_name: &str, index_name: &str, removed_in: SchemaVersion) -> Result<()> {
		let descriptor = self
			.record_types
			.get_mut(type_name)
			.ok_or_else(|| ErrorKind::InvalidDeclaration(format!("unknown record type `{}`", type_name)))?;
		let position = descriptor
			.indexes
			.iter()
			.position(|i| i.name == index_name)
			.ok_or_else(|| ErrorKind::IndexNotFound(index_name.to_string()))?;
		descriptor.indexes.remove(position);
		let added_in = self.version.unwrap_or(SchemaVersion { major: 0, minor: 0, patch: 0 });
		self.former_indexes
			.entry(type_name.to_string())
			.or_default()
			.push(FormerIndex { name: index_name.to_string(), added_in, removed_in });
		Ok(())
	}

	pub fn former_indexes(&self, type_name: &str) -> &[FormerIndex] {
		self.former_indexes.get(type_name).map(|v| v.as_slice()).unwrap_or(&[])
	}

	/// A stable hash of sorted names + wire-numbers + index kinds +
	/// grouping/key shape + former-index list. Used to
	/// compare against the persisted fingerprint at `M/schema_version` and
	/// as part of the planner's cache key.
	pub fn fingerprint(&self) -> u64 {
		use std::hash::{Hash, Hasher};
		let mut hasher = std::collections::hash_map::DefaultHasher::new();
		for (name, descriptor) in &self.record_types {
			name.hash(&mut hasher);
			for field in &descriptor.fields {
				field.name.hash(&mut hasher);
				field.wire_number.hash(&mut hasher);
				(field.wire_kind as u8 as u64).hash(&mut hasher);
			}
			for index in &descriptor.indexes {
				index.name.hash(&mut hasher);
				index.options.kind_name().hash(&mut hasher);
				index.key_expression.hash(&mut hasher);
				index.grouping_len.hash(&mut hasher);
			}
		}
		for (type_name, formers) in &self.former_indexes {
			type_name.hash(&mut hasher);
			for former in formers {
				former.name.hash(&mut hasher);
			}
		}
		hasher.finish()
	}
}
