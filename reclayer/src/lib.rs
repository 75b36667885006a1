//! A typed, indexed record layer over an ordered key-value store.
//!
//! Records are typed by a registered [`schema::RecordDescriptor`], encoded
//! with the packed wire codec in [`wire`], and addressed by keys built from
//! the order-preserving tuple codec in [`tuple`]. Every secondary index
//! (value, count/sum, min/max, rank, version, permuted, vector, spatial) is
//! maintained transactionally alongside the primary record through the
//! [`index`] module's dispatch table, following a three-state lifecycle
//! (disabled -> write-only -> readable) so a new index can be built online
//! without blocking writers. [`store::RecordStore`] is the per-record-type
//! entry point; [`partition::PartitionManager`] opens and caches one
//! `RecordStore` per tenant/collection/record-type triple; [`query`] plans
//! and executes filter/sort/limit queries against whichever indexes are
//! currently readable.
//!
//! [`Database`] ties these together behind one handle: a KV backend, a
//! schema, and validated options in, transactions and queries out.

#![warn(missing_docs)]

#[macro_use]
extern crate error_chain;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

pub mod error;
pub mod index;
pub mod indexer;
pub mod kv;
pub mod options;
pub mod partition;
pub mod query;
pub mod schema;
pub mod statistics;
pub mod store;
pub mod subspace;
pub mod transaction;
pub mod tuple;
pub mod wire;

pub use error::{Error, ErrorKind, Result};
pub use options::Options;
pub use query::{FilterTree, Predicate, Query};
pub use schema::{IndexDefinition, IndexKindOptions, RecordDescriptor, Schema, SchemaVersion, SortOrder};
pub use store::{RecordData, RecordStore};
pub use transaction::TransactionContext;
pub use tuple::Value;

use indexer::rangeset::ProgressStore;
use kv::KvStore;
use options::InternalOptions;
use partition::PartitionManager;
use query::cache::PlanCache;
use statistics::Statistics;
use subspace::Subspace;

/// Top-level handle: one KV backend, one schema, one set of validated
/// options. Everything else (partition cache, plan cache, statistics) is
/// owned by the `Database` and shared by reference with the components that
/// need it, the same shape `PartitionManager` uses for the stores it caches.
pub struct Database {
	kv: Arc<dyn KvStore>,
	schema: Arc<Schema>,
	options: InternalOptions,
	partitions: PartitionManager,
	plan_cache: PlanCache,
	statistics: Mutex<Statistics>,
	progress: ProgressStore,
	commit_counter: AtomicU64,
}

impl Database {
	/// Validates `options`, then opens a `Database` rooted at
	/// `options.root_subspace`. The schema is taken by value and wrapped in
	/// an `Arc` so every cached `RecordStore` can share it without cloning
	/// descriptors per open.
	pub fn open(kv: Arc<dyn KvStore>, schema: Schema, options: Options) -> Result<Self> {
		let internal = InternalOptions::from_external(options)?;
		let schema = Arc::new(schema);
		let root = Subspace::root(internal.external.root_subspace.clone());
		let partitions = PartitionManager::new(root.clone(), schema.clone(), internal.external.store_cache_capacity);
		let plan_cache = PlanCache::new(internal.external.plan_cache_capacity);
		let progress = ProgressStore::new(root.child("Progress"));
		Ok(Database {
			kv,
			schema,
			options: internal,
			partitions,
			plan_cache,
			statistics: Mutex::new(Statistics::new()),
			progress,
			commit_counter: AtomicU64::new(0),
		})
	}

	/// The registered schema.
	pub fn schema(&self) -> &Arc<Schema> {
		&self.schema
	}

	/// Validated construction options.
	pub fn options(&self) -> &Options {
		&self.options.external
	}

	/// The tenant/collection store cache.
	pub fn partitions(&self) -> &PartitionManager {
		&self.partitions
	}

	/// The cross-query plan cache; shared by every `RecordStore::query` call
	/// against this database.
	pub fn plan_cache(&self) -> &PlanCache {
		&self.plan_cache
	}

	/// Row-count / histogram / cardinality estimates the planner consults
	/// for cost-based index selection.
	pub fn statistics(&self) -> &Mutex<Statistics> {
		&self.statistics
	}

	/// Opens a transaction against the underlying KV engine.
	pub fn begin(&self) -> TransactionContext {
		TransactionContext::new(self.kv.begin())
	}

	/// Opens (or returns the cached) `RecordStore` for this
	/// `(tenant, collection, record_type)` triple.
	pub fn store(&self, tenant: &str, collection: &str, record_type: &str) -> Result<Arc<RecordStore>> {
		self.partitions.store(tenant, collection, record_type)
	}

	/// Deletes every key belonging to `tenant`, across every collection and
	/// record type, and evicts every cached store for it.
	pub fn drop_tenant(&self, tenant: &str) -> Result<()> {
		self.partitions.drop_tenant(self.kv.as_ref(), tenant)
	}

	/// Drives the full online build of `index_name` on `store` to
	/// completion: resumes from the persisted progress range set, runs
	/// bounded retried batches, and flips the index to `readable` once
	/// every record has been covered.
	pub fn build_index(&self, store: &RecordStore, index_name: &str) -> Result<()> {
		indexer::online::build_index(self.kv.as_ref(), store, index_name, &self.progress)
	}

	/// Runs phase 1 (dangling entries: present in the index, absent from the
	/// record) of the two-phase scrub for `index_def` on `store`, one
	/// bounded batch per call.
	pub fn scrub_dangling(&self, store: &RecordStore, index_def: &IndexDefinition) -> Result<usize> {
		indexer::scrubber::scrub_dangling(self.kv.as_ref(), store, index_def, &self.progress)
	}

	/// Runs phase 2 (missing entries: present in the record, absent from the
	/// index) of the two-phase scrub for `index_def` on `store`, one
	/// bounded batch per call.
	pub fn scrub_missing(&self, store: &RecordStore, index_def: &IndexDefinition) -> Result<usize> {
		indexer::scrubber::scrub_missing(self.kv.as_ref(), store, index_def, &self.progress)
	}

	/// Monotonically increasing counter bumped on every successful commit
	/// made through [`Database::begin`]'s transactions, used by callers
	/// that want a cheap local activity signal without reading the KV
	/// engine's own versionstamp.
	pub fn record_commit(&self) -> u64 {
		self.commit_counter.fetch_add(1, Ordering::Relaxed) + 1
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use kv::memory::MemoryKv;
	use schema::{FieldDescriptor, IndexScope, PartitionSegment, WireKind};
	use wire::FieldValue;

	fn schema_with_one_type() -> Schema {
		let mut schema = Schema::new();
		schema
			.register(RecordDescriptor {
				name: "User".into(),
				primary_key_fields: vec!["id".into()],
				fields: vec![FieldDescriptor { name: "id".into(), wire_number: 1, wire_kind: WireKind::ZigzagVarint }],
				indexes: vec![IndexDefinition {
					name: "by_id".into(),
					options: IndexKindOptions::Value,
					key_expression: vec!["id".into()],
					grouping_len: 0,
					unique: true,
					scope: IndexScope::Partition,
				}],
				partition_path: vec![PartitionSegment::Literal("users".into())],
			})
			.unwrap();
		schema
	}

	#[test]
	fn open_validates_options_before_returning() {
		let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
		let mut bad = Options::default();
		bad.batch_records = 0;
		assert!(Database::open(kv, schema_with_one_type(), bad).is_err());
	}

	#[test]
	fn save_and_fetch_round_trips_through_the_database_facade() {
		let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
		let db = Database::open(kv, schema_with_one_type(), Options::default()).unwrap();
		let store = db.store("acme", "default", "User").unwrap();

		let mut tx = db.begin();
		store.save(&mut tx, RecordData::new().set("id", FieldValue::I64(7))).unwrap();
		tx.commit().unwrap();
		db.record_commit();

		let mut tx = db.begin();
		let fetched = store.fetch(&mut tx, &[Value::Int(7)]).unwrap();
		assert!(fetched.is_some());
		assert_eq!(db.record_commit(), 2);
	}

	#[test]
	fn drop_tenant_clears_data_reachable_through_the_facade() {
		let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
		let db = Database::open(kv, schema_with_one_type(), Options::default()).unwrap();
		let store = db.store("acme", "default", "User").unwrap();

		let mut tx = db.begin();
		store.save(&mut tx, RecordData::new().set("id", FieldValue::I64(1))).unwrap();
		tx.commit().unwrap();

		db.drop_tenant("acme").unwrap();
		assert_eq!(db.partitions().cached_len(), 0);
	}

	#[test]
	fn building_a_declared_index_makes_it_readable() {
		let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
		let db = Database::open(kv, schema_with_one_type(), Options::default()).unwrap();
		let store = db.store("acme", "default", "User").unwrap();

		let mut tx = db.begin();
		store.save(&mut tx, RecordData::new().set("id", FieldValue::I64(3))).unwrap();
		tx.commit().unwrap();

		db.build_index(&store, "by_id").unwrap();
		let mut tx = db.begin();
		assert_eq!(store.index_state(&mut tx, "by_id").unwrap(), schema::IndexState::Readable);
	}
}
