//! In-memory reference `KvStore`: commits and reads against a plain
//! ordered map guarded by `parking_lot`, bookkeeping extra state per
//! observed key range to detect conflicts at commit time.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use parking_lot::RwLock;

use crate::error::{ErrorKind, Result};
use crate::options::KV_MAX_TRANSACTION_BYTES;

use super::{AtomicOp, KvStore, KvTransaction};

/// The footprint of one committed transaction's writes, consulted by
/// later-committing transactions to detect conflicts with their reads.
struct WriteFootprint {
	version: u64,
	keys: Vec<Vec<u8>>,
	ranges: Vec<(Vec<u8>, Vec<u8>)>,
}

impl WriteFootprint {
	fn touches_key(&self, key: &[u8]) -> bool {
		self.keys.iter().any(|k| k == key) || self.ranges.iter().any(|(b, e)| key >= b.as_slice() && key < e.as_slice())
	}

	fn touches_range(&self, begin: &[u8], end: &[u8]) -> bool {
		self.keys.iter().any(|k| k.as_slice() >= begin && k.as_slice() < end)
			|| self.ranges.iter().any(|(b, e)| b.as_slice() < end && begin < e.as_slice())
	}
}

enum ReadFootprint {
	Key(Vec<u8>),
	Range(Vec<u8>, Vec<u8>),
}

struct Inner {
	data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
	version: AtomicU64,
	log: RwLock<VecDeque<WriteFootprint>>,
}

const LOG_RETENTION: usize = 4096;

/// An in-memory, order-preserving `KvStore`. Not durable — it exists so the
/// rest of this crate is fully exercisable without wiring in a real
/// distributed KV engine.
#[derive(Clone)]
pub struct MemoryKv {
	inner: Arc<Inner>,
}

impl Default for MemoryKv {
	fn default() -> Self {
		MemoryKv::new()
	}
}

impl MemoryKv {
	pub fn new() -> Self {
		MemoryKv {
			inner: Arc::new(Inner {
				data: RwLock::new(BTreeMap::new()),
				version: AtomicU64::new(1),
				log: RwLock::new(VecDeque::new()),
			}),
		}
	}
}

impl KvStore for MemoryKv {
	fn begin(&self) -> Box<dyn KvTransaction> {
		let snapshot_version = self.inner.version.load(Ordering::SeqCst);
		Box::new(MemoryTransaction {
			inner: self.inner.clone(),
			snapshot_version,
			reads: Vec::new(),
			writes: BTreeMap::new(),
			atomics: Vec::new(),
			versionstamped: Vec::new(),
			mutation_bytes: 0,
			terminal: false,
		})
	}
}

enum PendingWrite {
	Set(Vec<u8>),
	Clear,
}

pub struct MemoryTransaction {
	inner: Arc<Inner>,
	snapshot_version: u64,
	reads: Vec<ReadFootprint>,
	writes: BTreeMap<Vec<u8>, PendingWrite>,
	atomics: Vec<(Vec<u8>, Vec<u8>, AtomicOp)>,
	versionstamped: Vec<(Vec<u8>, Vec<u8>)>,
	mutation_bytes: usize,
	terminal: bool,
}

impl MemoryTransaction {
	fn check_budget(&mut self, added: usize) -> Result<()> {
		self.mutation_bytes += added;
		if self.mutation_bytes > KV_MAX_TRANSACTION_BYTES {
			bail!(ErrorKind::TransactionTooLarge(KV_MAX_TRANSACTION_BYTES, self.mutation_bytes));
		}
		Ok(())
	}

	fn overlay_point(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
		self.writes.get(key).map(|w| match w {
			PendingWrite::Set(v) => Some(v.clone()),
			PendingWrite::Clear => None,
		})
	}
}

impl KvTransaction for MemoryTransaction {
	fn get(&mut self, key: &[u8], snapshot: bool) -> Result<Option<Vec<u8>>> {
		if !snapshot {
			self.reads.push(ReadFootprint::Key(key.to_vec()));
			if let Some(overlay) = self.overlay_point(key) {
				return Ok(overlay);
			}
		}
		Ok(self.inner.data.read().get(key).cloned())
	}

	fn get_range(
		&mut self,
		begin: &[u8],
		end: &[u8],
		snapshot: bool,
		limit: Option<usize>,
		reverse: bool,
	) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
		if !snapshot {
			self.reads.push(ReadFootprint::Range(begin.to_vec(), end.to_vec()));
		}

		let committed: Vec<(Vec<u8>, Vec<u8>)> = {
			let data = self.inner.data.read();
			data.range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
				.map(|(k, v)| (k.clone(), v.clone()))
				.collect()
		};

		let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = committed.into_iter().collect();

		if !snapshot {
			for (key, write) in self.writes.range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end))) {
				match write {
					PendingWrite::Set(v) => {
						merged.insert(key.clone(), v.clone());
					}
					PendingWrite::Clear => {
						merged.remove(key);
					}
				}
			}
		}

		let mut out: Vec<(Vec<u8>, Vec<u8>)> = merged.into_iter().collect();
		if reverse {
			out.reverse();
		}
		if let Some(limit) = limit {
			out.truncate(limit);
		}
		Ok(out)
	}

	fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
		self.check_budget(key.len() + value.len())?;
		self.writes.insert(key.to_vec(), PendingWrite::Set(value.to_vec()));
		Ok(())
	}

	fn clear(&mut self, key: &[u8]) -> Result<()> {
		self.check_budget(key.len())?;
		self.writes.insert(key.to_vec(), PendingWrite::Clear);
		Ok(())
	}

	fn clear_range(&mut self, begin: &[u8], end: &[u8]) -> Result<()> {
		self.check_budget(begin.len() + end.len())?;
		let keys: Vec<Vec<u8>> = {
			let data = self.inner.data.read();
			data.range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
				.map(|(k, _)| k.clone())
				.collect()
		};
		for k in keys {
			self.writes.insert(k, PendingWrite::Clear);
		}
		// also clear anything this transaction itself wrote in-range
		let self_written: Vec<Vec<u8>> = self
			.writes
			.range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
			.map(|(k, _)| k.clone())
			.collect();
		for k in self_written {
			self.writes.insert(k, PendingWrite::Clear);
		}
		Ok(())
	}

	fn atomic(&mut self, key: &[u8], param: &[u8], op: AtomicOp) -> Result<()> {
		self.check_budget(key.len() + param.len())?;
		self.atomics.push((key.to_vec(), param.to_vec(), op));
		Ok(())
	}

	fn set_versionstamped(&mut self, key_prefix: &[u8], value: &[u8]) -> Result<()> {
		self.check_budget(key_prefix.len() + 10 + value.len())?;
		self.versionstamped.push((key_prefix.to_vec(), value.to_vec()));
		Ok(())
	}

	fn mutation_bytes(&self) -> usize {
		self.mutation_bytes
	}

	fn commit(mut self: Box<Self>) -> Result<u64> {
		if self.terminal {
			bail!(ErrorKind::TransactionConflict);
		}
		self.terminal = true;

		// Conflict detection: any committed write since our snapshot that
		// touches a range/key we read aborts us.
		{
			let log = self.inner.log.read();
			for footprint in log.iter() {
				if footprint.version <= self.snapshot_version {
					continue;
				}
				for read in &self.reads {
					let conflicts = match read {
						ReadFootprint::Key(k) => footprint.touches_key(k),
						ReadFootprint::Range(b, e) => footprint.touches_range(b, e),
					};
					if conflicts {
						bail!(ErrorKind::TransactionConflict);
					}
				}
			}
		}

		let mut data = self.inner.data.write();
		let version = self.inner.version.fetch_add(1, Ordering::SeqCst) + 1;

		let mut touched_keys = Vec::new();

		for (key, write) in self.writes.iter() {
			touched_keys.push(key.clone());
			match write {
				PendingWrite::Set(v) => {
					data.insert(key.clone(), v.clone());
				}
				PendingWrite::Clear => {
					data.remove(key);
				}
			}
		}

		for (key, param, op) in &self.atomics {
			touched_keys.push(key.clone());
			let current = data.get(key).cloned().unwrap_or_default();
			let next = apply_atomic(&current, param, *op);
			data.insert(key.clone(), next);
		}

		for (prefix, value) in &self.versionstamped {
			let mut key = prefix.clone();
			let mut vs = [0u8; 10];
			BigEndian::write_u64(&mut vs[..8], version);
			key.extend_from_slice(&vs);
			touched_keys.push(key.clone());
			data.insert(key, value.clone());
		}

		drop(data);

		let mut log = self.inner.log.write();
		log.push_back(WriteFootprint {
			version,
			keys: touched_keys,
			ranges: Vec::new(),
		});
		while log.len() > LOG_RETENTION {
			log.pop_front();
		}

		Ok(version)
	}

	fn cancel(mut self: Box<Self>) {
		self.terminal = true;
	}
}

fn apply_atomic(current: &[u8], param: &[u8], op: AtomicOp) -> Vec<u8> {
	match op {
		AtomicOp::Add => {
			let a = if current.len() >= 8 { BigEndian::read_i64(&current[..8]) } else { 0 };
			let b = if param.len() >= 8 { BigEndian::read_i64(&param[..8]) } else { 0 };
			let mut out = vec![0u8; 8];
			BigEndian::write_i64(&mut out, a.wrapping_add(b));
			out
		}
		AtomicOp::Min => {
			if current.is_empty() || param < current {
				param.to_vec()
			} else {
				current.to_vec()
			}
		}
		AtomicOp::Max => {
			if current.is_empty() || param > current {
				param.to_vec()
			} else {
				current.to_vec()
			}
		}
		AtomicOp::ByteMin => {
			if current.is_empty() || param < current {
				param.to_vec()
			} else {
				current.to_vec()
			}
		}
		AtomicOp::ByteMax => {
			if current.is_empty() || param > current {
				param.to_vec()
			} else {
				current.to_vec()
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn set_then_commit_is_visible_to_later_transactions() {
		let kv = MemoryKv::new();
		let mut tx = kv.begin();
		tx.set(b"k", b"v").unwrap();
		tx.commit().unwrap();

		let mut tx2 = kv.begin();
		assert_eq!(tx2.get(b"k", true).unwrap(), Some(b"v".to_vec()));
	}

	#[test]
	fn serializable_read_sees_own_write() {
		let kv = MemoryKv::new();
		let mut tx = kv.begin();
		tx.set(b"k", b"v1").unwrap();
		assert_eq!(tx.get(b"k", false).unwrap(), Some(b"v1".to_vec()));
	}

	#[test]
	fn snapshot_read_misses_own_write() {
		let kv = MemoryKv::new();
		let mut tx = kv.begin();
		tx.set(b"k", b"v1").unwrap();
		assert_eq!(tx.get(b"k", true).unwrap(), None);
	}

	#[test]
	fn concurrent_writers_to_disjoint_keys_both_commit() {
		let kv = MemoryKv::new();
		let mut tx1 = kv.begin();
		let mut tx2 = kv.begin();
		tx1.get(b"a", false).unwrap();
		tx2.get(b"b", false).unwrap();
		tx1.set(b"a", b"1").unwrap();
		tx2.set(b"b", b"2").unwrap();
		tx1.commit().unwrap();
		tx2.commit().unwrap();
	}

	#[test]
	fn conflicting_readers_of_same_key_one_aborts() {
		let kv = MemoryKv::new();
		kv.begin().set(b"k", b"0").map(|_| ()).unwrap();
		let mut writer_tx = kv.begin();
		writer_tx.set(b"k", b"1").unwrap();
		writer_tx.commit().unwrap();

		let mut reader_tx = kv.begin();
		reader_tx.get(b"k", false).unwrap();

		let mut other_writer = kv.begin();
		other_writer.set(b"k", b"2").unwrap();
		other_writer.commit().unwrap();

		reader_tx.set(b"k", b"3").unwrap();
		assert!(reader_tx.commit().is_err());
	}

	#[test]
	fn atomic_add_accumulates_across_commits() {
		let kv = MemoryKv::new();
		for _ in 0..5 {
			let mut tx = kv.begin();
			let mut delta = vec![0u8; 8];
			BigEndian::write_i64(&mut delta, 1);
			tx.atomic(b"count", &delta, AtomicOp::Add).unwrap();
			tx.commit().unwrap();
		}
		let mut tx = kv.begin();
		let raw = tx.get(b"count", true).unwrap().unwrap();
		assert_eq!(BigEndian::read_i64(&raw), 5);
	}
}
