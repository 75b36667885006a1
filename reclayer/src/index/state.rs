//! Index State Manager: persists and reads the three-state status of every
//! index under `S/<indexName>`, plus a compare-and-swap transition
//! primitive that mutates a single status byte under a known key and
//! checks the prior value before committing the new one.

use crate::error::{ErrorKind, Result};
use crate::schema::IndexState;
use crate::subspace::Subspace;
use crate::transaction::TransactionContext;
use crate::tuple::Value;

pub struct IndexStateManager {
	subspace: Subspace,
}

impl IndexStateManager {
	pub fn new(subspace: Subspace) -> Self {
		IndexStateManager { subspace }
	}

	fn key(&self, index_name: &str) -> Vec<u8> {
		self.subspace.pack(&[Value::from(index_name)])
	}

	/// Defaults to `Disabled` when no state has ever been written.
	pub fn get_state(&self, tx: &mut TransactionContext, index_name: &str, snapshot: bool) -> Result<IndexState> {
		match tx.get(&self.key(index_name), snapshot)? {
			Some(bytes) => {
				let byte = *bytes.first().ok_or_else(|| ErrorKind::SerializationFailed("empty index state entry".into()))?;
				IndexState::from_byte(byte)
			}
			None => Ok(IndexState::Disabled),
		}
	}

	pub fn set_state(&self, tx: &mut TransactionContext, index_name: &str, state: IndexState) -> Result<()> {
		tx.set(&self.key(index_name), &[state.as_byte()])
	}

	/// Compare-and-swap: only applies the transition if the stored state
	/// currently equals `expected`.
	pub fn transition(&self, tx: &mut TransactionContext, index_name: &str, expected: IndexState, target: IndexState) -> Result<()> {
		let current = self.get_state(tx, index_name, false)?;
		if current != expected {
			bail!(ErrorKind::InvalidDeclaration(format!(
				"index `{}` expected state {:?}, found {:?}",
				index_name, expected, current
			)));
		}
		self.set_state(tx, index_name, target)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kv::memory::MemoryKv;
	use crate::kv::KvStore;

	#[test]
	fn unset_index_defaults_to_disabled() {
		let manager = IndexStateManager::new(Subspace::root(vec![0x53]));
		let kv = MemoryKv::new();
		let mut tx = TransactionContext::new(kv.begin());
		assert_eq!(manager.get_state(&mut tx, "by_email", true).unwrap(), IndexState::Disabled);
	}

	#[test]
	fn transition_enforces_expected_state() {
		let manager = IndexStateManager::new(Subspace::root(vec![0x53]));
		let kv = MemoryKv::new();
		let mut tx = TransactionContext::new(kv.begin());
		manager.set_state(&mut tx, "by_email", IndexState::WriteOnly).unwrap();

		assert!(manager.transition(&mut tx, "by_email", IndexState::Disabled, IndexState::Readable).is_err());
		manager.transition(&mut tx, "by_email", IndexState::WriteOnly, IndexState::Readable).unwrap();
		assert_eq!(manager.get_state(&mut tx, "by_email", false).unwrap(), IndexState::Readable);
	}
}
