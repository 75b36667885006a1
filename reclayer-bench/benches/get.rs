#![feature(test)]
extern crate test;

extern crate reclayer;

use test::Bencher;

use reclayer::kv::memory::MemoryKv;
use reclayer::kv::KvStore;
use reclayer::schema::{FieldDescriptor, RecordDescriptor, Schema, WireKind};
use reclayer::subspace::Subspace;
use reclayer::transaction::TransactionContext;
use reclayer::tuple::Value;
use reclayer::wire::FieldValue;
use reclayer::store::{RecordData, RecordStore};

fn single_field_descriptor() -> RecordDescriptor {
	RecordDescriptor {
		name: "Item".into(),
		primary_key_fields: vec!["id".into()],
		fields: vec![FieldDescriptor { name: "id".into(), wire_number: 1, wire_kind: WireKind::ZigzagVarint }],
		indexes: vec![],
		partition_path: vec![],
	}
}

#[bench]
fn fetch_from_a_single_record_store(b: &mut Bencher) {
	let kv = MemoryKv::new();
	let store = RecordStore::open(single_field_descriptor(), &Subspace::root(vec![0x01])).unwrap();

	let mut tx = TransactionContext::new(kv.begin());
	store.save(&mut tx, RecordData::new().set("id", FieldValue::I64(1))).unwrap();
	tx.commit().unwrap();

	b.iter(|| {
		let mut tx = TransactionContext::new(kv.begin());
		test::black_box(store.fetch(&mut tx, &[Value::Int(1)]).unwrap());
	});
}

#[bench]
fn fetch_a_missing_key_from_an_empty_store(b: &mut Bencher) {
	let kv = MemoryKv::new();
	let store = RecordStore::open(single_field_descriptor(), &Subspace::root(vec![0x02])).unwrap();

	b.iter(|| {
		let mut tx = TransactionContext::new(kv.begin());
		test::black_box(store.fetch(&mut tx, &[Value::Int(1)]).unwrap());
	});
}
