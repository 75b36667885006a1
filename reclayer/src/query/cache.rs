//! Plan cache: a concurrent LRU keyed on `(record-type-hash, filter-hash,
//! sort, limit, schema-fingerprint)`, invalidated wholesale on a
//! schema-fingerprint change. A fixed-capacity structure with an eviction
//! policy behind a `parking_lot` mutex, the evicted unit here a cached plan.

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;

use crate::query::plan::PlanNode;
use crate::query::Query;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
	record_type_hash: u64,
	filter_hash: u64,
	sort_hash: u64,
	limit: Option<usize>,
	schema_fingerprint: u64,
}

// `Hash` isn't derived on `FilterTree`/`Predicate`/`Value` (the tuple codec
// deliberately keeps `Value` minimal, see `statistics.rs`'s own note on the
// same point), so the cache key hashes each query field's `Debug`
// representation instead of the structured value itself. A `Debug`-string
// collision would only cost a spurious cache hit on an unrelated plan, never
// a correctness issue, since `store::query` always re-validates index state
// before executing a cached node.
fn hash_of_debug<T: std::fmt::Debug>(value: &T) -> u64 {
	let mut hasher = std::collections::hash_map::DefaultHasher::new();
	format!("{:?}", value).hash(&mut hasher);
	hasher.finish()
}

impl CacheKey {
	fn build(query: &Query, schema_fingerprint: u64) -> Self {
		CacheKey {
			record_type_hash: hash_of_debug(&query.record_type),
			filter_hash: hash_of_debug(&query.filter),
			sort_hash: hash_of_debug(&query.sort),
			limit: query.limit,
			schema_fingerprint,
		}
	}
}

struct Entry {
	key: CacheKey,
	plan: PlanNode,
}

/// A capacity-bounded LRU of planned queries. `get`/`put` take a brief lock
/// each; there is no
/// separate lock-free read path here since the reference KV backend this
/// repo ships is itself single-process, but the locking is fine-grained
/// enough not to be a contention point in practice.
pub struct PlanCache {
	capacity: usize,
	entries: Mutex<VecDeque<Entry>>,
	epoch: Mutex<u64>,
}

impl PlanCache {
	pub fn new(capacity: usize) -> Self {
		PlanCache { capacity: capacity.max(1), entries: Mutex::new(VecDeque::new()), epoch: Mutex::new(0) }
	}

	/// Looks up a cached plan for `query` at `schema_fingerprint`. A
	/// fingerprint change naturally misses (it's part of the key), but an
	/// explicit `invalidate` call also drops every entry at once so a
	/// schema-version bump doesn't merely let stale entries linger until
	/// they age out.
	pub fn get(&self, query: &Query, schema_fingerprint: u64) -> Option<PlanNode> {
		let key = CacheKey::build(query, schema_fingerprint);
		let mut entries = self.entries.lock();
		if let Some(pos) = entries.iter().position(|e| e.key == key) {
			let entry = entries.remove(pos).unwrap();
			let plan = entry.plan.clone();
			entries.push_front(entry);
			Some(plan)
		} else {
			None
		}
	}

	pub fn put(&self, query: &Query, schema_fingerprint: u64, plan: PlanNode) {
		let key = CacheKey::build(query, schema_fingerprint);
		let mut entries = self.entries.lock();
		entries.retain(|e| e.key != key);
		entries.push_front(Entry { key, plan });
		while entries.len() > self.capacity {
			entries.pop_back();
		}
	}

	/// Drops every cached plan, used when an index transitions to/from
	/// `disabled`: an index referenced in a cached plan that has since
	/// moved to disabled would make that plan wrong, so this invalidates
	/// the whole cache rather than tracking per-entry index references,
	/// trading a few avoidable re-plans for a much simpler invariant.
	pub fn invalidate_all(&self) {
		self.entries.lock().clear();
		*self.epoch.lock() += 1;
	}

	pub fn epoch(&self) -> u64 {
		*self.epoch.lock()
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::schema::SortOrder;

	#[test]
	fn put_then_get_returns_the_same_plan() {
		let cache = PlanCache::new(8);
		let query = Query::new("User");
		cache.put(&query, 1, PlanNode::FullScan);
		assert_eq!(cache.get(&query, 1), Some(PlanNode::FullScan));
	}

	#[test]
	fn fingerprint_change_misses() {
		let cache = PlanCache::new(8);
		let query = Query::new("User");
		cache.put(&query, 1, PlanNode::FullScan);
		assert_eq!(cache.get(&query, 2), None);
	}

	#[test]
	fn capacity_evicts_least_recently_used() {
		let cache = PlanCache::new(2);
		let a = Query::new("A");
		let b = Query::new("B");
		let c = Query::new("C");
		cache.put(&a, 1, PlanNode::FullScan);
		cache.put(&b, 1, PlanNode::FullScan);
		cache.put(&c, 1, PlanNode::FullScan);
		assert_eq!(cache.get(&a, 1), None);
		assert_eq!(cache.get(&b, 1), Some(PlanNode::FullScan));
		assert_eq!(cache.get(&c, 1), Some(PlanNode::FullScan));
	}

	#[test]
	fn invalidate_all_clears_every_entry() {
		let cache = PlanCache::new(8);
		let query = Query::new("User");
		cache.put(&query, 1, PlanNode::FullScan);
		cache.invalidate_all();
		assert_eq!(cache.get(&query, 1), None);
		assert_eq!(cache.len(), 0);
	}

	#[test]
	fn sort_is_part_of_the_key() {
		let cache = PlanCache::new(8);
		let mut with_sort = Query::new("User");
		with_sort.sort = Some(crate::query::SortSpec { field: "id".into(), order: SortOrder::Ascending });
		cache.put(&with_sort, 1, PlanNode::FullScan);
		assert_eq!(cache.get(&Query::new("User"), 1), None);
	}
}
