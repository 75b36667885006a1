//! Rank index: a skip list serialized across KV keys so `rank(value) ->
//! index` and `select(index) -> value` are `O(log n)`. Unlike a flat key
//! range, this is itself a persisted tree: a "small node, explicit child
//! pointers, span counts" shape, with a skip list's per-level forward
//! pointers standing in for a trie's fixed branching factor.
//!
//! Node levels are assigned deterministically from a hash of the node's
//! identity rather than by sampling an RNG; this trades perfectly uniform
//! leveling for reproducible builds, which matters more for an index that
//! must rebuild identically after a crash.

use std::collections::BTreeMap;

use crate::error::{ErrorKind, Result};
use crate::index::{FieldMap, IndexMaintainer};
use crate::schema::{IndexDefinition, SortOrder};
use crate::subspace::Subspace;
use crate::transaction::TransactionContext;
use crate::tuple::Value;
use crate::wire;

const MAX_LEVEL: usize = 12;

struct Node {
	forward: Vec<Option<Vec<u8>>>,
	span: Vec<u64>,
}

impl Node {
	fn empty(levels: usize) -> Self {
		Node { forward: vec![None; levels], span: vec![0; levels] }
	}

	fn encode(&self) -> Vec<u8> {
		let mut out = Vec::new();
		wire::write_varint(&mut out, self.forward.len() as u64);
		for (forward, span) in self.forward.iter().zip(self.span.iter()) {
			match forward {
				Some(key) => {
					out.push(1);
					wire::write_bytes(&mut out, 0, key);
				}
				None => out.push(0),
			}
			wire::write_varint(&mut out, *span);
		}
		out
	}

	fn decode(buf: &[u8]) -> Result<Self> {
		let (levels, mut offset) = wire::read_varint(buf)?;
		let mut forward = Vec::with_capacity(levels as usize);
		let mut span = Vec::with_capacity(levels as usize);
		for _ in 0..levels {
			let present = buf[offset];
			offset += 1;
			let key = if present == 1 {
				let (_, _, tag_len) = wire::read_tag(&buf[offset..])?;
				let (payload, consumed) = wire::read_length_delimited(&buf[offset + tag_len..])?;
				let key = payload.to_vec();
				offset += tag_len + consumed;
				Some(key)
			} else {
				None
			};
			let (s, consumed) = wire::read_varint(&buf[offset..])?;
			offset += consumed;
			forward.push(key);
			span.push(s);
		}
		Ok(Node { forward, span })
	}
}

fn node_level(identity: &[u8]) -> usize {
	use std::hash::{Hash, Hasher};
	let mut hasher = std::collections::hash_map::DefaultHasher::new();
	identity.hash(&mut hasher);
	let h = hasher.finish();
	let level = (h.trailing_zeros() as usize / 2).min(MAX_LEVEL - 1);
	level + 1
}

pub struct RankIndex {
	definition: IndexDefinition,
	subspace: Subspace,
	field: String,
	order: SortOrder,
}

impl RankIndex {
	pub fn new(definition: IndexDefinition, subspace: Subspace, field: String, order: SortOrder) -> Self {
		RankIndex { definition, subspace, field, order }
	}

	fn grouping(&self, record: &FieldMap) -> Vec<Value> {
		self.definition
			.grouping_fields()
			.iter()
			.map(|f| record.get(f).cloned().unwrap_or(Value::Null))
			.collect()
	}

	fn head_key(&self, grouping: &[Value]) -> Vec<u8> {
		self.subspace.pack(&[Value::Tuple(grouping.to_vec()), Value::Str("head".into())])
	}

	fn node_key(&self, grouping: &[Value], value: &Value, primary_key: &[Value]) -> Vec<u8> {
		let mut parts = vec![Value::Tuple(grouping.to_vec()), Value::Str("node".into())];
		if self.order == SortOrder::Ascending {
			parts.push(value.clone());
		} else {
			parts.push(negate_for_descending(value));
		}
		parts.extend(primary_key.iter().cloned());
		self.subspace.pack(&parts)
	}

	fn read_node(&self, tx: &mut TransactionContext, key: &[u8]) -> Result<Node> {
		match tx.get(key, false)? {
			Some(bytes) => Node::decode(&bytes),
			None => Ok(Node::empty(1)),
		}
	}

	fn write_node(&self, tx: &mut TransactionContext, key: &[u8], node: &Node) -> Result<()> {
		tx.set(key, &node.encode())
	}

	/// Inserts one `(value, primary_key)` node into the grouping's skip
	/// list, updating forward pointers and span counts classic-skip-list
	/// style.
	fn insert(&self, tx: &mut TransactionContext, grouping: &[Value], value: &Value, primary_key: &[Value]) -> Result<()> {
		let head_key = self.head_key(grouping);
		let mut head = self.read_node(tx, &head_key)?;
		let new_key = self.node_key(grouping, value, primary_key);
		let new_level = node_level(&new_key);

		if new_level > head.forward.len() {
			let extra = new_level - head.forward.len();
			head.forward.extend(std::iter::repeat(None).take(extra));
			head.span.extend(std::iter::repeat(0).take(extra));
		}

		let mut update_keys: Vec<Option<Vec<u8>>> = vec![None; head.forward.len()];
		let mut rank_before = vec![0u64; head.forward.len()];
		let mut current_key = head_key.clone();
		let mut current = Node { forward: head.forward.clone(), span: head.span.clone() };
		let mut rank_so_far = 0u64;

		for level in (0..head.forward.len()).rev() {
			loop {
				match &current.forward[level] {
					Some(next_key) if next_key.as_slice() < new_key.as_slice() => {
						rank_so_far += current.span[level];
						current_key = next_key.clone();
						current = self.read_node(tx, &current_key)?;
					}
					_ => break,
				}
			}
			update_keys[level] = if current_key == head_key { None } else { Some(current_key.clone()) };
			rank_before[level] = rank_so_far;
		}

		let mut new_node = Node::empty(new_level);
		for level in 0..new_level {
			let update_is_head = update_keys[level].is_none();
			let mut update_node = if update_is_head { Node { forward: head.forward.clone(), span: head.span.clone() } } else {
				self.read_node(tx, update_keys[level].as_ref().unwrap())?
			};
			new_node.forward[level] = update_node.forward[level].clone();
			let distance = rank_before[0] - rank_before[level];
			new_node.span[level] = update_node.span[level].saturating_sub(distance);
			update_node.span[level] = distance + 1;
			update_node.forward[level] = Some(new_key.clone());
			if update_is_head {
				head = update_node;
			} else {
				self.write_node(tx, update_keys[level].as_ref().unwrap(), &update_node)?;
			}
		}
		for level in new_level..head.forward.len() {
			if update_keys[level].is_none() {
				head.span[level] += 1;
			} else {
				let key = update_keys[level].as_ref().unwrap();
				let mut node = self.read_node(tx, key)?;
				node.span[level] += 1;
				self.write_node(tx, key, &node)?;
			}
		}

		self.write_node(tx, &new_key, &new_node)?;
		self.write_node(tx, &head_key, &head)?;
		Ok(())
	}

	/// `rank(value) -> index`, 0-based.
	pub fn rank_of(&self, tx: &mut TransactionContext, grouping: &[Value], value: &Value, primary_key: &[Value]) -> Result<Option<u64>> {
		let head_key = self.head_key(grouping);
		let head = self.read_node(tx, &head_key)?;
		let target_key = self.node_key(grouping, value, primary_key);
		let mut current_key = head_key;
		let mut current = head;
		let mut rank = 0u64;

		for level in (0..current.forward.len()).rev() {
			loop {
				match &current.forward[level] {
					Some(next_key) if next_key.as_slice() <= target_key.as_slice() => {
						rank += current.span[level];
						let found = next_key.as_slice() == target_key.as_slice();
						current_key = next_key.clone();
						current = self.read_node(tx, &current_key)?;
						if found {
							return Ok(Some(rank - 1));
						}
					}
					_ => break,
				}
			}
		}
		Ok(None)
	}

	/// `select(index) -> value`, 0-based.
	pub fn select(&self, tx: &mut TransactionContext, grouping: &[Value], index: u64) -> Result<Option<Vec<Value>>> {
		let head_key = self.head_key(grouping);
		let mut current = self.read_node(tx, &head_key)?;
		let target = index + 1;
		let mut rank = 0u64;

		for level in (0..current.forward.len()).rev() {
			loop {
				match &current.forward[level] {
					Some(next_key) if rank + current.span[level] <= target => {
						rank += current.span[level];
						let next_key = next_key.clone();
						current = self.read_node(tx, &next_key)?;
						if rank == target {
							return self.decode_node_key(&next_key).map(Some);
						}
					}
					_ => break,
				}
			}
		}
		Ok(None)
	}

	fn decode_node_key(&self, key: &[u8]) -> Result<Vec<Value>> {
		self.subspace.unpack(key)
	}

	/// Total member count of `grouping`'s skip list: the same
	/// descend-and-sum-spans traversal as `rank_of`/`select`, but with no
	/// target to stop at, so it always keeps advancing along the rightmost
	/// reachable path at each level before dropping down one.
	pub fn len(&self, tx: &mut TransactionContext, grouping: &[Value]) -> Result<u64> {
		let head_key = self.head_key(grouping);
		let mut current = self.read_node(tx, &head_key)?;
		let mut total = 0u64;

		for level in (0..current.forward.len()).rev() {
			loop {
				match &current.forward[level] {
					Some(next_key) => {
						total += current.span[level];
						current = self.read_node(tx, next_key)?;
					}
					None => break,
				}
			}
		}
		Ok(total)
	}

	/// Rebuilds the grouping's entire skip list from scratch, the
	/// documented fallback for delete: a full rebuild on every delete
	/// trades performance for correctness rather than implementing
	/// skip-list node removal.
	///
	/// TODO: implement true skip-list node removal so deletes don't pay
	/// for a full rebuild of the grouping.
	pub fn rebuild(&self, tx: &mut TransactionContext, grouping: &[Value], members: &[(Value, Vec<Value>)]) -> Result<()> {
		let (begin, end) = {
			let prefix = self.subspace.pack(&[Value::Tuple(grouping.to_vec())]);
			(prefix.clone(), crate::tuple::strinc(&prefix))
		};
		let existing = tx.get_range(&begin, &end, false, None, false)?;
		for (key, _) in existing {
			tx.clear(&key)?;
		}
		let mut sorted = members.to_vec();
		sorted.sort_by(|a, b| a.0.cmp(&b.0));
		for (value, primary_key) in sorted {
			self.insert(tx, grouping, &value, &primary_key)?;
		}
		Ok(())
	}
}

fn negate_for_descending(value: &Value) -> Value {
	match value {
		Value::Int(v) => Value::Int(v.checked_neg().unwrap_or(i64::MAX)),
		other => other.clone(),
	}
}

impl IndexMaintainer for RankIndex {
	fn update(&self, tx: &mut TransactionContext, primary_key: &[Value], old: Option<&FieldMap>, new: Option<&FieldMap>) -> Result<()> {
		if old.is_some() {
			// Deletion goes through `rebuild`, driven by the record store
			// (or the caller) because it needs the grouping's full
			// remaining membership, which a single-record `update` call
			// doesn't have. See the rebuild-fallback TODO above.
			bail!(ErrorKind::InvalidRank(
				"rank index delete requires RankIndex::rebuild with the grouping's full membership".into()
			));
		}
		if let Some(new_record) = new {
			let grouping = self.grouping(new_record);
			let value = new_record.get(&self.field).cloned().unwrap_or(Value::Null);
			self.insert(tx, &grouping, &value, primary_key)?;
		}
		Ok(())
	}

	fn entry_keys(&self, primary_key: &[Value], record: &FieldMap) -> Vec<Vec<u8>> {
		let grouping = self.grouping(record);
		let value = record.get(&self.field).cloned().unwrap_or(Value::Null);
		vec![self.node_key(&grouping, &value, primary_key)]
	}

	fn scan(&self, tx: &mut TransactionContext, snapshot: bool, limit: Option<usize>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
		let (begin, end) = self.subspace.range();
		tx.get_range(&begin, &end, snapshot, limit, false)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kv::memory::MemoryKv;
	use crate::kv::KvStore;
	use crate::schema::{IndexKindOptions, IndexScope};

	fn score_index() -> RankIndex {
		let definition = IndexDefinition {
			name: "by_score".into(),
			options: IndexKindOptions::Rank { field: "score".into(), order: SortOrder::Ascending },
			key_expression: vec!["score".into()],
			grouping_len: 0,
			unique: false,
			scope: IndexScope::Partition,
		};
		RankIndex::new(definition, Subspace::root(vec![0xDD]), "score".into(), SortOrder::Ascending)
	}

	#[test]
	fn rank_of_matches_insertion_order_for_distinct_values() {
		let kv = MemoryKv::new();
		let mut tx = TransactionContext::new(kv.begin());
		let index = score_index();

		let mut values: Vec<(Value, Vec<Value>)> = (0..100).map(|i| (Value::Int(10 * i), vec![Value::Int(i)])).collect();
		for (value, pk) in &values {
			index.insert(&mut tx, &[], value, pk).unwrap();
		}

		values.sort_by(|a, b| a.0.cmp(&b.0));
		for (expected_rank, (value, pk)) in values.iter().enumerate() {
			let rank = index.rank_of(&mut tx, &[], value, pk).unwrap();
			assert_eq!(rank, Some(expected_rank as u64));
			let selected = index.select(&mut tx, &[], expected_rank as u64).unwrap().unwrap();
			assert_eq!(selected.last().cloned(), pk.last().cloned());
		}
	}

	#[test]
	fn top_n_via_descending_order_returns_the_highest_scorer_first() {
		let definition = IndexDefinition {
			name: "by_score_desc".into(),
			options: IndexKindOptions::Rank { field: "score".into(), order: SortOrder::Descending },
			key_expression: vec!["score".into()],
			grouping_len: 0,
			unique: false,
			scope: IndexScope::Partition,
		};
		let index = RankIndex::new(definition, Subspace::root(vec![0xEE]), "score".into(), SortOrder::Descending);
		let kv = MemoryKv::new();
		let mut tx = TransactionContext::new(kv.begin());

		for i in 0..100i64 {
			index.insert(&mut tx, &[], &Value::Int(10 * i), &[Value::Int(i)]).unwrap();
		}

		let top = index.select(&mut tx, &[], 0).unwrap().unwrap();
		let top_pk = top.last().cloned().unwrap();
		assert_eq!(top_pk, Value::Int(99));
	}

	#[test]
	fn len_counts_every_inserted_member() {
		let kv = MemoryKv::new();
		let mut tx = TransactionContext::new(kv.begin());
		let index = score_index();

		assert_eq!(index.len(&mut tx, &[]).unwrap(), 0);
		for i in 0..250i64 {
			index.insert(&mut tx, &[], &Value::Int(i), &[Value::Int(i)]).unwrap();
		}
		assert_eq!(index.len(&mut tx, &[]).unwrap(), 250);
	}
}
