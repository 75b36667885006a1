//! Partition Manager: derives the subspace for a `(tenant, collection)`
//! pair, opens and caches a `RecordStore` per `(tenant, collection,
//! record-type)`, and tears a whole tenant down in one call. Keeps a
//! fixed-capacity map of opened handles behind a lock and evicts the
//! least-recently-used one on overflow, keyed on the tenant/collection/type
//! triple.
//!
//! There is no separate KV-engine directory layer in this reference
//! backend: a partition's subspace is derived directly by packing
//! `(tenant, collection)` onto the root subspace, the same way
//! `Subspace::child_value` derives any other nested namespace.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::kv::KvStore;
use crate::schema::{RecordDescriptor, Schema};
use crate::store::RecordStore;
use crate::subspace::Subspace;
use crate::transaction::TransactionContext;
use crate::tuple::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StoreKey {
	tenant: String,
	collection: String,
	record_type: String,
}

struct CachedStore {
	key: StoreKey,
	store: Arc<RecordStore>,
}

/// Opens, caches, and tears down per-tenant `RecordStore` handles. One
/// `PartitionManager` is shared process-wide: global state initialized at
/// database-open, torn down at database-close.
pub struct PartitionManager {
	root: Subspace,
	schema: Arc<Schema>,
	capacity: usize,
	stores: Mutex<VecDeque<CachedStore>>,
}

impl PartitionManager {
	pub fn new(root: Subspace, schema: Arc<Schema>, capacity: usize) -> Self {
		PartitionManager { root, schema, capacity: capacity.max(1), stores: Mutex::new(VecDeque::new()) }
	}

	/// The subspace every key of `(tenant, collection)` lives under.
	pub fn partition_subspace(&self, tenant: &str, collection: &str) -> Subspace {
		self.root.child("T").child_value(Value::Str(tenant.to_string())).child_value(Value::Str(collection.to_string()))
	}

	/// Opens (or returns the cached) `RecordStore` for this
	/// `(tenant, collection, record_type)` triple.
	pub fn store(&self, tenant: &str, collection: &str, record_type: &str) -> Result<Arc<RecordStore>> {
		let key = StoreKey { tenant: tenant.to_string(), collection: collection.to_string(), record_type: record_type.to_string() };

		let mut stores = self.stores.lock();
		if let Some(pos) = stores.iter().position(|c| c.key == key) {
			let cached = stores.remove(pos).unwrap();
			let store = cached.store.clone();
			stores.push_front(cached);
			return Ok(store);
		}

		let descriptor = self
			.schema
			.record_type(record_type)
			.ok_or_else(|| crate::error::ErrorKind::InvalidDeclaration(format!("unknown record type `{}`", record_type)))?
			.clone();
		let subspace = self.partition_subspace(tenant, collection);
		let store = Arc::new(RecordStore::open(descriptor, &subspace)?);
		stores.push_front(CachedStore { key, store: store.clone() });
		while stores.len() > self.capacity {
			stores.pop_back();
		}
		Ok(store)
	}

	/// Deletes every key under `tenant`'s subspace, across every
	/// collection and record type, and drops every cached store that
	/// belongs to it.
	pub fn drop_tenant(&self, kv: &dyn KvStore, tenant: &str) -> Result<()> {
		let tenant_subspace = self.root.child("T").child_value(Value::Str(tenant.to_string()));
		let (begin, end) = tenant_subspace.range();
		let mut tx = TransactionContext::new(kv.begin());
		tx.clear_range(&begin, &end)?;
		tx.commit()?;

		self.stores.lock().retain(|c| c.key.tenant != tenant);
		Ok(())
	}

	pub fn cached_len(&self) -> usize {
		self.stores.lock().len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kv::memory::MemoryKv;
	use crate::schema::{FieldDescriptor, IndexDefinition, IndexKindOptions, IndexScope, PartitionSegment, WireKind};
	use crate::store::RecordData;
	use crate::wire::FieldValue;

	fn schema() -> Arc<Schema> {
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
		Arc::new(schema)
	}

	#[test]
	fn opening_the_same_partition_twice_returns_the_cached_store() {
		let manager = PartitionManager::new(Subspace::root(vec![0xA0]), schema(), 8);
		let a = manager.store("acme", "default", "User").unwrap();
		let b = manager.store("acme", "default", "User").unwrap();
		assert!(Arc::ptr_eq(&a, &b));
	}

	#[test]
	fn different_tenants_get_disjoint_subspaces() {
		let manager = PartitionManager::new(Subspace::root(vec![0xA1]), schema(), 8);
		let acme = manager.partition_subspace("acme", "default");
		let globex = manager.partition_subspace("globex", "default");
		assert_ne!(acme.bytes(), globex.bytes());
	}

	#[test]
	fn capacity_evicts_the_least_recently_used_store() {
		let manager = PartitionManager::new(Subspace::root(vec![0xA2]), schema(), 1);
		let first = manager.store("acme", "default", "User").unwrap();
		let second = manager.store("globex", "default", "User").unwrap();
		assert_eq!(manager.cached_len(), 1);
		let refetched = manager.store("globex", "default", "User").unwrap();
		assert!(Arc::ptr_eq(&second, &refetched));
		let _ = first;
	}

	#[test]
	fn drop_tenant_clears_its_keys_and_its_cache_entries() {
		let kv = MemoryKv::new();
		let manager = PartitionManager::new(Subspace::root(vec![0xA3]), schema(), 8);
		let store = manager.store("acme", "default", "User").unwrap();

		let mut tx = TransactionContext::new(kv.begin());
		store.save(&mut tx, RecordData::new().set("id", FieldValue::I64(1))).unwrap();
		tx.commit().unwrap();

		manager.drop_tenant(&kv, "acme").unwrap();
		assert_eq!(manager.cached_len(), 0);

		let mut verify = TransactionContext::new(kv.begin());
		assert_eq!(verify.get_range(&[0xA3], &[0xFF], true, None, false).unwrap().len(), 0);
	}
}
