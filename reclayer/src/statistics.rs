//! Statistics Manager: per-record-type, per-field cardinality and histogram
//! statistics feeding the planner's cost model. Keeps a small set of
//! running counters — a HyperLogLog sketch and a reservoir-sampled
//! histogram — updated incrementally on every save/delete rather than
//! recomputed from scratch.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use crate::tuple::Value;

const HLL_REGISTER_BITS: u32 = 4;
const HLL_REGISTER_COUNT: usize = 1 << HLL_REGISTER_BITS;

fn value_hash(value: &Value) -> u64 {
	let mut hasher = std::collections::hash_map::DefaultHasher::new();
	value.hash_value(&mut hasher);
	hasher.finish()
}

/// `Value` doesn't derive `Hash` (it holds `f64`-free variants only, so it
/// could, but the tuple codec intentionally keeps `Value` minimal); this
/// trait gives statistics its own stable hash without widening `Value`'s
/// public surface.
trait HashValue {
	fn hash_value<H: Hasher>(&self, state: &mut H);
}

impl HashValue for Value {
	fn hash_value<H: Hasher>(&self, state: &mut H) {
		match self {
			Value::Null => 0u8.hash(state),
			Value::Int(v) => {
				1u8.hash(state);
				v.hash(state);
			}
			Value::Bytes(b) => {
				2u8.hash(state);
				b.hash(state);
			}
			Value::Str(s) => {
				3u8.hash(state);
				s.hash(state);
			}
			Value::Bool(b) => {
				4u8.hash(state);
				b.hash(state);
			}
			Value::Tuple(items) => {
				5u8.hash(state);
				for item in items {
					item.hash_value(state);
				}
			}
		}
	}
}

/// A HyperLogLog sketch for approximate distinct-value counting.
#[derive(Debug, Clone)]
pub struct HyperLogLog {
	registers: [u8; HLL_REGISTER_COUNT],
}

impl Default for HyperLogLog {
	fn default() -> Self {
		HyperLogLog { registers: [0; HLL_REGISTER_COUNT] }
	}
}

impl HyperLogLog {
	pub fn new() -> Self {
		HyperLogLog::default()
	}

	pub fn observe(&mut self, value: &Value) {
		let hash = value_hash(value);
		let bucket = (hash & (HLL_REGISTER_COUNT as u64 - 1)) as usize;
		let rest = hash >> HLL_REGISTER_BITS;
		let rank = (rest.trailing_zeros() + 1).min(64 - HLL_REGISTER_BITS) as u8;
		if rank > self.registers[bucket] {
			self.registers[bucket] = rank;
		}
	}

	/// The standard HLL estimator with the small-range linear-counting
	/// correction; adequate for the planner's order-of-magnitude needs.
	pub fn estimate(&self) -> f64 {
		let m = HLL_REGISTER_COUNT as f64;
		let alpha = 0.673; // alpha_m for m=16
		let sum: f64 = self.registers.iter().map(|&r| 2f64.powi(-(r as i32))).sum();
		let raw = alpha * m * m / sum;
		let zeros = self.registers.iter().filter(|&&r| r == 0).count();
		if raw <= 2.5 * m && zeros > 0 {
			m * (m / zeros as f64).ln()
		} else {
			raw
		}
	}
}

/// An equi-depth histogram over a bounded reservoir sample of observed
/// integer values. Uses a deterministic
/// hash-based replacement decision in place of a random number generator, the
/// same substitution `index::rank` makes for its skip-list levels.
#[derive(Debug, Clone, Default)]
pub struct Histogram {
	capacity: usize,
	sample: Vec<i64>,
	seen: u64,
}

impl Histogram {
	pub fn new(capacity: usize) -> Self {
		Histogram { capacity: capacity.max(1), sample: Vec::new(), seen: 0 }
	}

	pub fn observe(&mut self, value: i64) {
		self.seen += 1;
		if self.sample.len() < self.capacity {
			self.sample.push(value);
			return;
		}
		let mut hasher = std::collections::hash_map::DefaultHasher::new();
		(value, self.seen).hash(&mut hasher);
		let slot = (hasher.finish() % self.seen) as usize;
		if slot < self.capacity {
			self.sample[slot] = value;
		}
	}

	/// `num_buckets` equi-depth bucket upper bounds, sorted.
	fn bucket_bounds(&self, num_buckets: usize) -> Vec<i64> {
		if self.sample.is_empty() {
			return Vec::new();
		}
		let mut sorted = self.sample.clone();
		sorted.sort();
		let buckets = num_buckets.max(1).min(sorted.len());
		(1..=buckets).map(|i| sorted[(i * sorted.len() / buckets) - 1]).collect()
	}

	/// Fraction of the sample falling in `[lo, hi]`, scaled by the observed
	/// row count, for a range predicate's estimated cardinality.
	pub fn estimate_range_count(&self, lo: i64, hi: i64) -> f64 {
		if self.sample.is_empty() {
			return self.seen as f64;
		}
		let matching = self.sample.iter().filter(|&&v| v >= lo && v <= hi).count();
		self.seen as f64 * (matching as f64 / self.sample.len() as f64)
	}

	/// 8-bucket equi-depth boundary list, exposed for diagnostics/tests.
	pub fn buckets(&self) -> Vec<i64> {
		self.bucket_bounds(8)
	}
}

#[derive(Debug, Clone, Default)]
struct FieldStats {
	cardinality: HyperLogLog,
	histogram: Histogram,
}

impl FieldStats {
	fn new() -> Self {
		FieldStats { cardinality: HyperLogLog::new(), histogram: Histogram::new(256) }
	}
}

/// Per-record-type statistics, updated incrementally on every save/delete.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
	row_counts: BTreeMap<String, i64>,
	field_stats: BTreeMap<(String, String), FieldStats>,
}

impl Statistics {
	pub fn new() -> Self {
		Statistics::default()
	}

	pub fn observe_save(&mut self, record_type: &str, fields: &BTreeMap<String, Value>) {
		*self.row_counts.entry(record_type.to_string()).or_insert(0) += 1;
		for (field, value) in fields {
			let stats = self.field_stats.entry((record_type.to_string(), field.clone())).or_insert_with(FieldStats::new);
			stats.cardinality.observe(value);
			if let Value::Int(v) = value {
				stats.histogram.observe(*v);
			}
		}
	}

	pub fn observe_delete(&mut self, record_type: &str) {
		if let Some(count) = self.row_counts.get_mut(record_type) {
			*count -= 1;
		}
	}

	/// Row count via a count index over the empty grouping;
	/// here simply the running counter since this repo's count index and
	/// this counter are updated by the same save/delete events.
	pub fn row_count(&self, record_type: &str) -> u64 {
		self.row_counts.get(record_type).copied().unwrap_or(0).max(0) as u64
	}

	/// Equality-predicate cardinality estimate: row count divided by
	/// distinct-value estimate, floored at 1 row.
	pub fn estimate_equality(&self, record_type: &str, field: &str) -> f64 {
		let rows = self.row_count(record_type) as f64;
		match self.field_stats.get(&(record_type.to_string(), field.to_string())) {
			Some(stats) => {
				let distinct = stats.cardinality.estimate().max(1.0);
				(rows / distinct).max(1.0)
			}
			None => rows.max(1.0),
		}
	}

	/// Range-predicate cardinality estimate via the field's histogram.
	pub fn estimate_range(&self, record_type: &str, field: &str, lo: i64, hi: i64) -> f64 {
		match self.field_stats.get(&(record_type.to_string(), field.to_string())) {
			Some(stats) => stats.histogram.estimate_range_count(lo, hi).max(1.0),
			None => self.row_count(record_type).max(1) as f64,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hyperloglog_estimate_is_within_order_of_magnitude() {
		let mut hll = HyperLogLog::new();
		for i in 0..10_000i64 {
			hll.observe(&Value::Int(i));
		}
		let estimate = hll.estimate();
		assert!(estimate > 2_000.0 && estimate < 50_000.0, "estimate {} out of expected range", estimate);
	}

	#[test]
	fn row_count_tracks_saves_and_deletes() {
		let mut stats = Statistics::new();
		for _ in 0..5 {
			stats.observe_save("User", &BTreeMap::new());
		}
		stats.observe_delete("User");
		assert_eq!(stats.row_count("User"), 4);
	}

	#[test]
	fn histogram_buckets_cover_the_observed_range() {
		let mut histogram = Histogram::new(100);
		for v in 0..1000i64 {
			histogram.observe(v);
		}
		let buckets = histogram.buckets();
		assert_eq!(buckets.len(), 8);
		assert!(*buckets.last().unwrap() >= 900);
	}

	#[test]
	fn equality_estimate_shrinks_as_distinct_count_grows() {
		let mut stats = Statistics::new();
		for i in 0..1000 {
			let mut fields = BTreeMap::new();
			fields.insert("city".to_string(), Value::Str(format!("city-{}", i % 5)));
			stats.observe_save("User", &fields);
		}
		let estimate = stats.estimate_equality("User", "city");
		assert!(estimate < 1000.0);
		assert!(estimate > 50.0);
	}
}
