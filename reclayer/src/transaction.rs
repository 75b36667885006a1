//! Transaction Context: a thin wrapper around one KV-engine transaction
//! exposing snapshot-vs-serializable reads, commit/cancel lifecycle, and
//! pre/post-commit hooks. The underlying `KvTransaction` does the actual
//! batching of reads and writes; this type's job narrows to the hook
//! queues and the active/committed/cancelled state machine around it.

use crate::error::{ErrorKind, Result};
use crate::kv::{AtomicOp, KvTransaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
	Active,
	Committed,
	Cancelled,
}

type PreCommitHook = Box<dyn FnOnce(&mut dyn KvTransaction) -> Result<()> + Send>;
type PostCommitHook = Box<dyn FnOnce(u64) + Send>;

/// Wraps one `Box<dyn KvTransaction>` for the life of one logical
/// operation. Owned exclusively — there is no way to clone or share a
/// `TransactionContext`.
pub struct TransactionContext {
	inner: Option<Box<dyn KvTransaction>>,
	state: State,
	pre_commit_hooks: Vec<PreCommitHook>,
	post_commit_hooks: Vec<PostCommitHook>,
}

impl TransactionContext {
	pub fn new(inner: Box<dyn KvTransaction>) -> Self {
		TransactionContext {
			inner: Some(inner),
			state: State::Active,
			pre_commit_hooks: Vec::new(),
			post_commit_hooks: Vec::new(),
		}
	}

	fn require_active(&self) -> Result<()> {
		if self.state != State::Active {
			bail!(ErrorKind::TransactionConflict);
		}
		Ok(())
	}

	fn kv(&mut self) -> Result<&mut Box<dyn KvTransaction>> {
		self.require_active()?;
		Ok(self.inner.as_mut().expect("Active transaction always holds its KvTransaction; qed"))
	}

	pub fn get(&mut self, key: &[u8], snapshot: bool) -> Result<Option<Vec<u8>>> {
		self.kv()?.get(key, snapshot)
	}

	pub fn get_range(
		&mut self,
		begin: &[u8],
		end: &[u8],
		snapshot: bool,
		limit: Option<usize>,
		reverse: bool,
	) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
		self.kv()?.get_range(begin, end, snapshot, limit, reverse)
	}

	pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
		self.kv()?.set(key, value)
	}

	pub fn clear(&mut self, key: &[u8]) -> Result<()> {
		self.kv()?.clear(key)
	}

	pub fn clear_range(&mut self, begin: &[u8], end: &[u8]) -> Result<()> {
		self.kv()?.clear_range(begin, end)
	}

	pub fn atomic(&mut self, key: &[u8], param: &[u8], op: AtomicOp) -> Result<()> {
		self.kv()?.atomic(key, param, op)
	}

	pub fn set_versionstamped(&mut self, key_prefix: &[u8], value: &[u8]) -> Result<()> {
		self.kv()?.set_versionstamped(key_prefix, value)
	}

	pub fn mutation_bytes(&self) -> usize {
		self.inner.as_ref().map(|tx| tx.mutation_bytes()).unwrap_or(0)
	}

	/// Runs within the same transaction, before commit; may issue further
	/// reads/writes; any error aborts the commit.
	pub fn add_pre_commit_hook<F>(&mut self, hook: F) -> Result<()>
	where
		F: FnOnce(&mut dyn KvTransaction) -> Result<()> + Send + 'static,
	{
		self.require_active()?;
		self.pre_commit_hooks.push(Box::new(hook));
		Ok(())
	}

	/// Runs after successful commit, receiving the committed versionstamp;
	/// errors are reported but cannot roll back. This repo runs them
	/// synchronously on the committing thread; `enable_post_commit_hooks`
	/// gates whether an embedder instead hands them to a background
	/// scheduler, which is the embedder's own responsibility — no executor
	/// is vendored here.
	pub fn add_post_commit_hook<F>(&mut self, hook: F) -> Result<()>
	where
		F: FnOnce(u64) + Send + 'static,
	{
		self.require_active()?;
		self.post_commit_hooks.push(Box::new(hook));
		Ok(())
	}

	/// Commits the transaction. Pre-commit hooks run first, in declaration
	/// order, against the live `KvTransaction`; any hook error aborts the
	/// commit and the context becomes terminal without ever calling the
	/// underlying `commit`. Post-commit hooks then run in declaration
	/// order.
	pub fn commit(mut self) -> Result<u64> {
		self.require_active()?;
		let mut inner = self.inner.take().expect("Active transaction always holds its KvTransaction; qed");

		for hook in self.pre_commit_hooks.drain(..) {
			if let Err(e) = hook(inner.as_mut()) {
				self.state = State::Cancelled;
				inner.cancel();
				return Err(e);
			}
		}

		let version = inner.commit()?;
		self.state = State::Committed;

		for hook in self.post_commit_hooks.drain(..) {
			hook(version);
		}

		Ok(version)
	}

	pub fn cancel(mut self) {
		if self.state == State::Active {
			if let Some(inner) = self.inner.take() {
				inner.cancel();
			}
			self.state = State::Cancelled;
		}
	}
}
