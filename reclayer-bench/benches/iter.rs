#![feature(test)]
extern crate test;

extern crate rand;
extern crate reclayer;

use test::Bencher;
use rand::{Rand, SeedableRng, StdRng};

use reclayer::kv::memory::MemoryKv;
use reclayer::kv::KvStore;
use reclayer::schema::{FieldDescriptor, RecordDescriptor, WireKind};
use reclayer::store::{RecordData, RecordStore};
use reclayer::subspace::Subspace;
use reclayer::transaction::TransactionContext;
use reclayer::wire::FieldValue;

fn descriptor() -> RecordDescriptor {
	RecordDescriptor {
		name: "Item".into(),
		primary_key_fields: vec!["id".into()],
		fields: vec![FieldDescriptor { name: "id".into(), wire_number: 1, wire_kind: WireKind::ZigzagVarint }],
		indexes: vec![],
		partition_path: vec![],
	}
}

/// Benchmarks one full scan (a single snapshot `get_range` over the whole
/// records subspace) of a store with `n` entries. The reference in-memory
/// backend has no cursor type to step incrementally, so this times the
/// whole-range read rather than a per-key `.next()`.
fn benchmark_full_scan(b: &mut Bencher, n: u32) {
	let kv = MemoryKv::new();
	let store = RecordStore::open(descriptor(), &Subspace::root(vec![0x04])).unwrap();
	let mut rng = StdRng::from_seed(&[1, 9, 4]);

	let mut tx = TransactionContext::new(kv.begin());
	for _ in 0..n {
		let id: i64 = i64::rand(&mut rng);
		store.save(&mut tx, RecordData::new().set("id", FieldValue::I64(id))).unwrap();
	}
	tx.commit().unwrap();

	let (begin, end) = store.records_subspace().range();
	b.iter(|| {
		let mut tx = TransactionContext::new(kv.begin());
		test::black_box(tx.get_range(&begin, &end, true, None, false).unwrap());
	});
}

#[bench]
fn full_scan_of_a_1000_entry_store(b: &mut Bencher) {
	benchmark_full_scan(b, 1000);
}

#[bench]
fn full_scan_of_a_100000_entry_store(b: &mut Bencher) {
	benchmark_full_scan(b, 100_000);
}
