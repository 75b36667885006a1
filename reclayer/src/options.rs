use crate::error::{ErrorKind, Result};

/// Validation mode for the schema evolution validator.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ValidationMode {
	/// Reject unsafe schema changes outright.
	Strict,
	/// Warn (via `log::warn!`) but allow unsafe schema changes.
	Permissive,
}

/// Constructor inputs for the record layer.
#[derive(Debug, PartialEq, Clone)]
pub struct Options {
	/// Prefix for all keys; typically a tuple of (app-id).
	pub root_subspace: Vec<u8>,
	/// Client-side per-transaction timeout.
	pub default_read_timeout_ms: u64,
	/// Early-abort threshold, must stay under the KV engine's 10 MB hard cap.
	pub default_size_limit_bytes: usize,
	/// Online-builder / scrubber batch size (record count).
	pub batch_records: usize,
	/// Online-builder / scrubber byte budget per batch.
	pub batch_bytes: usize,
	/// Partition manager LRU bound (number of open record stores).
	pub store_cache_capacity: usize,
	/// Planner LRU bound (number of cached plans).
	pub plan_cache_capacity: usize,
	/// Strict or permissive schema-evolution validation.
	pub validation_mode: ValidationMode,
	/// Whether post-commit hooks run on a background scheduler.
	pub enable_post_commit_hooks: bool,
}

impl Default for Options {
	fn default() -> Self {
		Options {
			root_subspace: Vec::new(),
			default_read_timeout_ms: 5_000,
			default_size_limit_bytes: 5 * 1024 * 1024,
			batch_records: 1_000,
			batch_bytes: 5 * 1024 * 1024,
			store_cache_capacity: 256,
			plan_cache_capacity: 1_000,
			validation_mode: ValidationMode::Strict,
			enable_post_commit_hooks: true,
		}
	}
}

/// Hard limits imposed by the KV engine; `InternalOptions::from_external`
/// validates `Options` against these and against field relationships
/// before any component is built from them.
pub const KV_MAX_TRANSACTION_BYTES: usize = 10 * 1024 * 1024;
pub const KV_MAX_TRANSACTION_MS: u64 = 5_000;
pub const KV_MAX_KEY_BYTES: usize = 10 * 1024;
pub const KV_MAX_VALUE_BYTES: usize = 100 * 1024;

/// `Options` after validation; the half-open values an embedder may not see
/// directly but which every component relies on.
#[derive(Debug, PartialEq, Clone)]
pub struct InternalOptions {
	pub external: Options,
}

impl InternalOptions {
	pub fn from_external(external: Options) -> Result<Self> {
		if external.default_size_limit_bytes == 0
			|| external.default_size_limit_bytes > KV_MAX_TRANSACTION_BYTES
		{
			bail!(ErrorKind::InvalidOptions(
				"default_size_limit_bytes",
				format!(
					"must be in (0, {}], got {}",
					KV_MAX_TRANSACTION_BYTES, external.default_size_limit_bytes
				)
			));
		}
		if external.default_read_timeout_ms == 0 || external.default_read_timeout_ms > KV_MAX_TRANSACTION_MS {
			bail!(ErrorKind::InvalidOptions(
				"default_read_timeout_ms",
				format!("must be in (0, {}], got {}", KV_MAX_TRANSACTION_MS, external.default_read_timeout_ms)
			));
		}
		if external.batch_records == 0 {
			bail!(ErrorKind::InvalidOptions("batch_records", "must not be 0".into()));
		}
		if external.batch_bytes == 0 || external.batch_bytes > KV_MAX_TRANSACTION_BYTES {
			bail!(ErrorKind::InvalidOptions(
				"batch_bytes",
				format!("must be in (0, {}], got {}", KV_MAX_TRANSACTION_BYTES, external.batch_bytes)
			));
		}
		if external.store_cache_capacity == 0 {
			bail!(ErrorKind::InvalidOptions("store_cache_capacity", "must not be 0".into()));
		}
		if external.plan_cache_capacity == 0 {
			bail!(ErrorKind::InvalidOptions("plan_cache_capacity", "must not be 0".into()));
		}

		Ok(InternalOptions { external })
	}

	pub fn builder_batch_records(&self) -> usize {
		self.external.batch_records
	}

	/// Half the configured byte budget, leaving headroom so a batch that
	/// measures slightly over never trips the KV engine's hard cap.
	pub fn builder_batch_bytes(&self) -> usize {
		(self.external.batch_bytes / 2).max(1)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_validate() {
		assert!(InternalOptions::from_external(Options::default()).is_ok());
	}

	#[test]
	fn rejects_oversized_batch_bytes() {
		let mut opts = Options::default();
		opts.batch_bytes = KV_MAX_TRANSACTION_BYTES + 1;
		assert!(InternalOptions::from_external(opts).is_err());
	}

	#[test]
	fn rejects_zero_batch_records() {
		let mut opts = Options::default();
		opts.batch_records = 0;
		assert!(InternalOptions::from_external(opts).is_err());
	}
}
