//! Query specification and filter tree. A `RecordIterator`-style cursor
//! streams matching records out of a scan; the predicate/filter types here
//! decide *which* scan and residual filter that cursor gets wrapped around.

pub mod cache;
pub mod plan;
pub mod planner;

use crate::schema::SortOrder;
use crate::tuple::Value;

/// One atomic test against a field.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
	Eq(String, Value),
	Lt(String, Value),
	Le(String, Value),
	Gt(String, Value),
	Ge(String, Value),
	In(String, Vec<Value>),
	/// Radius query against a spatial index's declared coordinate fields.
	WithinRadius { index: String, center: (f64, f64), radius_meters: f64 },
	/// Approximate k-NN against a vector index.
	NearestNeighbors { index: String, query: Vec<f64>, k: usize },
}

impl Predicate {
	pub fn field(&self) -> Option<&str> {
		match self {
			Predicate::Eq(f, _) | Predicate::Lt(f, _) | Predicate::Le(f, _) | Predicate::Gt(f, _) | Predicate::Ge(f, _) | Predicate::In(f, _) => {
				Some(f)
			}
			Predicate::WithinRadius { .. } | Predicate::NearestNeighbors { .. } => None,
		}
	}
}

/// Boolean combinator tree over atomic predicates.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterTree {
	Pred(Predicate),
	And(Vec<FilterTree>),
	Or(Vec<FilterTree>),
	Not(Box<FilterTree>),
}

/// One sort key: field name plus direction.
#[derive(Debug, Clone, PartialEq)]
pub struct SortSpec {
	pub field: String,
	pub order: SortOrder,
}

/// `{ record-type, filter-tree, sort, limit, required-fields? }`.
#[derive(Debug, Clone, Default)]
pub struct Query {
	pub record_type: String,
	pub filter: Option<FilterTree>,
	pub sort: Option<SortSpec>,
	pub limit: Option<usize>,
	pub required_fields: Option<Vec<String>>,
	/// When set, the planner never falls back to `FullScan` (
	/// "indexed-only" flag); an unplannable query becomes an error instead.
	pub indexed_only: bool,
}

impl Query {
	pub fn new(record_type: &str) -> Self {
		Query { record_type: record_type.to_string(), ..Query::default() }
	}

	pub fn filter(mut self, filter: FilterTree) -> Self {
		self.filter = Some(filter);
		self
	}

	pub fn sort_by(mut self, field: &str, order: SortOrder) -> Self {
		self.sort = Some(SortSpec { field: field.to_string(), order });
		self
	}

	pub fn limit(mut self, limit: usize) -> Self {
		self.limit = Some(limit);
		self
	}

	pub fn indexed_only(mut self) -> Self {
		self.indexed_only = true;
		self
	}

	/// Declares the fields the caller actually reads back from each row,
	/// letting the planner consider a `Covering` scan that answers the
	/// query straight out of an index's key without fetching the record.
	pub fn required_fields(mut self, fields: &[&str]) -> Self {
		self.required_fields = Some(fields.iter().map(|f| f.to_string()).collect());
		self
	}
}
