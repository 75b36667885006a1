//! Resumable progress tracking for the online indexer and scrubber: each
//! build or scrub operation resumes from its own `RangeSet` rather than
//! restarting, the processed extent recorded as a set of covered key
//! ranges instead of a single offset, because builders and scrubbers claim
//! ranges out of order under retry.

use crate::error::Result;
use crate::subspace::Subspace;
use crate::transaction::TransactionContext;
use crate::wire;

/// A set of disjoint, merged `[begin, end)` byte-key ranges already
/// processed. Persisted as one blob per tracked operation; adequate at the
/// scale a single builder/scrubber run covers (thousands to low millions of
/// ranges before the set fully merges into one `[subspace_begin,
/// subspace_end)` span).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeSet {
	ranges: Vec<(Vec<u8>, Vec<u8>)>,
}

impl RangeSet {
	pub fn new() -> Self {
		RangeSet::default()
	}

	fn encode(&self) -> Vec<u8> {
		let mut out = Vec::new();
		wire::write_varint(&mut out, self.ranges.len() as u64);
		for (begin, end) in &self.ranges {
			wire::write_bytes(&mut out, 0, begin);
			wire::write_bytes(&mut out, 0, end);
		}
		out
	}

	fn decode(buf: &[u8]) -> Result<Self> {
		let (count, mut offset) = wire::read_varint(buf)?;
		let mut ranges = Vec::with_capacity(count as usize);
		for _ in 0..count {
			let (begin, end, len) = read_tagged_bytes(&buf[offset..])?;
			offset += len;
			ranges.push((begin, end));
		}
		Ok(RangeSet { ranges })
	}

	/// Marks `[begin, end)` as processed, merging with any adjacent or
	/// overlapping range so the set stays minimal.
	pub fn mark_covered(&mut self, begin: Vec<u8>, end: Vec<u8>) {
		self.ranges.push((begin, end));
		self.ranges.sort();
		let mut merged: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
		for (begin, end) in self.ranges.drain(..) {
			match merged.last_mut() {
				Some((_, last_end)) if begin <= *last_end => {
					if end > *last_end {
						*last_end = end;
					}
				}
				_ => merged.push((begin, end)),
			}
		}
		self.ranges = merged;
	}

	/// The first uncovered sub-range of `[subspace_begin, subspace_end)`, up
	/// to `max_len` bytes wide at the key level (the caller further bounds
	/// the actual batch by record/byte/time budget once it reads the range).
	pub fn next_uncovered(&self, subspace_begin: &[u8], subspace_end: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
		let mut cursor = subspace_begin.to_vec();
		for (begin, end) in &self.ranges {
			if cursor.as_slice() >= subspace_end {
				return None;
			}
			if begin.as_slice() > cursor.as_slice() {
				let stop = if end.as_slice() < subspace_end { begin.clone() } else { subspace_end.to_vec() };
				return Some((cursor, stop.min(subspace_end.to_vec())));
			}
			if end.as_slice() > cursor.as_slice() {
				cursor = end.clone();
			}
		}
		if cursor.as_slice() < subspace_end {
			Some((cursor, subspace_end.to_vec()))
		} else {
			None
		}
	}

	/// Whether `[subspace_begin, subspace_end)` is fully covered — the
	/// build-completion check.
	pub fn fully_covers(&self, subspace_begin: &[u8], subspace_end: &[u8]) -> bool {
		self.next_uncovered(subspace_begin, subspace_end).is_none()
	}
}

fn read_tagged_bytes(buf: &[u8]) -> Result<(Vec<u8>, Vec<u8>, usize)> {
	let (_, _, tag_len) = wire::read_tag(buf)?;
	let (begin, used) = wire::read_length_delimited(&buf[tag_len..])?;
	let begin = begin.to_vec();
	let mut offset = tag_len + used;
	let (_, _, tag_len2) = wire::read_tag(&buf[offset..])?;
	offset += tag_len2;
	let (end, used2) = wire::read_length_delimited(&buf[offset..])?;
	let end = end.to_vec();
	offset += used2;
	Ok((begin, end, offset))
}

/// Persists one `RangeSet` per tracked operation name under a subspace, e.g.
/// `progress/<indexName>` or
/// `progress/<indexName>/scrub/<phase>`.
pub struct ProgressStore {
	subspace: Subspace,
}

impl ProgressStore {
	pub fn new(subspace: Subspace) -> Self {
		ProgressStore { subspace }
	}

	fn key(&self, operation: &str) -> Vec<u8> {
		self.subspace.child(operation).bytes().to_vec()
	}

	pub fn load(&self, tx: &mut TransactionContext, operation: &str) -> Result<RangeSet> {
		match tx.get(&self.key(operation), false)? {
			Some(bytes) => RangeSet::decode(&bytes),
			None => Ok(RangeSet::new()),
		}
	}

	pub fn save(&self, tx: &mut TransactionContext, operation: &str, set: &RangeSet) -> Result<()> {
		tx.set(&self.key(operation), &set.encode())
	}

	/// Deletes the progress record entirely, once the build finishes.
	pub fn clear(&self, tx: &mut TransactionContext, operation: &str) -> Result<()> {
		tx.clear(&self.key(operation))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kv::memory::MemoryKv;
	use crate::kv::KvStore;

	#[test]
	fn uncovered_range_is_the_whole_span_initially() {
		let set = RangeSet::new();
		assert_eq!(set.next_uncovered(b"a", b"z"), Some((b"a".to_vec(), b"z".to_vec())));
	}

	#[test]
	fn marking_covered_shrinks_the_uncovered_span() {
		let mut set = RangeSet::new();
		set.mark_covered(b"a".to_vec(), b"m".to_vec());
		assert_eq!(set.next_uncovered(b"a", b"z"), Some((b"m".to_vec(), b"z".to_vec())));
	}

	#[test]
	fn adjacent_ranges_merge() {
		let mut set = RangeSet::new();
		set.mark_covered(b"a".to_vec(), b"m".to_vec());
		set.mark_covered(b"m".to_vec(), b"z".to_vec());
		assert!(set.fully_covers(b"a", b"z"));
	}

	#[test]
	fn progress_store_round_trips_through_a_transaction() {
		let kv = MemoryKv::new();
		let mut tx = TransactionContext::new(kv.begin());
		let store = ProgressStore::new(Subspace::root(vec![0xD0]));
		let mut set = RangeSet::new();
		set.mark_covered(b"a".to_vec(), b"m".to_vec());
		store.save(&mut tx, "by_email", &set).unwrap();
		let loaded = store.load(&mut tx, "by_email").unwrap();
		assert_eq!(loaded, set);
		store.clear(&mut tx, "by_email").unwrap();
		assert_eq!(store.load(&mut tx, "by_email").unwrap(), RangeSet::new());
	}
}
