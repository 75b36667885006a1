//! The KV engine trait boundary, treated as external, plus the one
//! in-process reference backend this repo ships.
//!
//! A `KvStore` opens transactions, commits them, and enforces one global
//! invariant: conflict detection over observed key ranges.

pub mod memory;

use crate::error::Result;

/// An atomic mutation operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
	Add,
	Min,
	Max,
	ByteMin,
	ByteMax,
}

/// One logical KV-engine transaction.
///
/// `snapshot = true` suppresses conflict detection for that read (fire-and-
/// forget lookups, planner statistics, online-builder/scrubber scans);
/// `snapshot = false` registers the read in the transaction's conflict
/// footprint, giving read-your-writes and serializable isolation. Snapshot
/// vs. serializable is a callee decision made per call, not baked into one
/// blanket policy.
pub trait KvTransaction: Send {
	fn get(&mut self, key: &[u8], snapshot: bool) -> Result<Option<Vec<u8>>>;

	fn get_range(
		&mut self,
		begin: &[u8],
		end: &[u8],
		snapshot: bool,
		limit: Option<usize>,
		reverse: bool,
	) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

	fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

	fn clear(&mut self, key: &[u8]) -> Result<()>;

	fn clear_range(&mut self, begin: &[u8], end: &[u8]) -> Result<()>;

	fn atomic(&mut self, key: &[u8], param: &[u8], op: AtomicOp) -> Result<()>;

	/// Assigns a versionstamp-suffixed key: `key_prefix`
	/// followed by the commit-assigned versionstamp, 10 bytes big-endian.
	fn set_versionstamped(&mut self, key_prefix: &[u8], value: &[u8]) -> Result<()>;

	/// Commits the transaction, returning the versionstamp assigned to it.
	fn commit(self: Box<Self>) -> Result<u64>;

	fn cancel(self: Box<Self>);

	/// Total bytes mutated so far (sum of key+value lengths of every
	/// set/clear/atomic/versionstamp call), used by callers to respect the
	/// 10 MB / 5 s transaction budget.
	fn mutation_bytes(&self) -> usize;
}

/// Opens transactions against one logical keyspace.
pub trait KvStore: Send + Sync {
	fn begin(&self) -> Box<dyn KvTransaction>;
}
