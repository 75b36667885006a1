extern crate clap;
extern crate reclayer;

use std::sync::Arc;

use clap::{App, Arg, ArgMatches, SubCommand};
use reclayer::kv::memory::MemoryKv;
use reclayer::kv::KvStore;
use reclayer::schema::{FieldDescriptor, IndexDefinition, IndexKindOptions, IndexScope, PartitionSegment, Schema, SortOrder, WireKind};
use reclayer::wire::FieldValue;
use reclayer::{Database, Options, Query, RecordData, Value};

const RECORD_TYPE: &str = "Item";
const TENANT: &str = "default";
const COLLECTION: &str = "default";

fn item_schema() -> Schema {
	let mut schema = Schema::new();
	schema
		.register(reclayer::RecordDescriptor {
			name: RECORD_TYPE.into(),
			primary_key_fields: vec!["id".into()],
			fields: vec![
				FieldDescriptor { name: "id".into(), wire_number: 1, wire_kind: WireKind::ZigzagVarint },
				FieldDescriptor { name: "name".into(), wire_number: 2, wire_kind: WireKind::LengthDelimited },
			],
			indexes: vec![IndexDefinition {
				name: "by_name".into(),
				options: IndexKindOptions::Value,
				key_expression: vec!["name".into()],
				grouping_len: 0,
				unique: false,
				scope: IndexScope::Partition,
			}],
			partition_path: vec![PartitionSegment::Literal("items".into())],
		})
		.expect("the built-in Item schema is always valid");
	schema
}

/// There is no persistent backend in this reference build: the CLI opens a
/// fresh in-memory `Database` per invocation and seeds it with a small fixed
/// dataset so `get`/`delete`/`query` have rows to act on. A real deployment
/// plugs a durable `KvStore` into the same `Database::open` call.
fn seeded_database() -> Database {
	let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
	let db = Database::open(kv, item_schema(), Options::default()).expect("default options always validate");
	let store = db.store(TENANT, COLLECTION, RECORD_TYPE).expect("Item is a registered record type");
	let mut tx = db.begin();
	for (id, name) in [(1i64, "alpha"), (2, "bravo"), (3, "charlie")] {
		store.save(&mut tx, RecordData::new().set("id", FieldValue::I64(id)).set("name", FieldValue::Str(name.into()))).unwrap();
	}
	tx.commit().unwrap();
	db
}

fn do_get(id: i64) {
	let db = seeded_database();
	let store = db.store(TENANT, COLLECTION, RECORD_TYPE).unwrap();
	let mut tx = db.begin();
	match store.fetch(&mut tx, &[Value::Int(id)]) {
		Ok(Some(record)) => println!("found: {:?}", record.fields),
		Ok(None) => println!("no record with id {}", id),
		Err(err) => println!("get failed: {}", err),
	}
}

fn do_insert(id: i64, name: &str) {
	let db = seeded_database();
	let store = db.store(TENANT, COLLECTION, RECORD_TYPE).unwrap();
	let mut tx = db.begin();
	match store.save(&mut tx, RecordData::new().set("id", FieldValue::I64(id)).set("name", FieldValue::Str(name.into()))) {
		Ok(()) => {
			tx.commit().unwrap();
			println!("inserted id {}", id);
		}
		Err(err) => println!("insert failed: {}", err),
	}
}

fn do_delete(id: i64) {
	let db = seeded_database();
	let store = db.store(TENANT, COLLECTION, RECORD_TYPE).unwrap();
	let mut tx = db.begin();
	match store.delete(&mut tx, &[Value::Int(id)]) {
		Ok(true) => {
			tx.commit().unwrap();
			println!("deleted id {}", id);
		}
		Ok(false) => println!("no record with id {}", id),
		Err(err) => println!("delete failed: {}", err),
	}
}

fn do_query(name: &str) {
	let db = seeded_database();
	let store = db.store(TENANT, COLLECTION, RECORD_TYPE).unwrap();
	let mut tx = db.begin();
	let query = Query::new(RECORD_TYPE)
		.filter(reclayer::FilterTree::Pred(reclayer::Predicate::Eq("name".into(), Value::Str(name.into()))))
		.sort_by("id", SortOrder::Ascending);
	let fingerprint = db.schema().fingerprint();
	let stats = db.statistics().lock();
	match store.query(&mut tx, &query, fingerprint, &stats, db.plan_cache()) {
		Ok(rows) => {
			for (pk, record) in rows {
				println!("{:?} -> {:?}", pk, record.fields);
			}
		}
		Err(err) => println!("query failed: {}", err),
	}
}

fn do_build_index() {
	let db = seeded_database();
	let store = db.store(TENANT, COLLECTION, RECORD_TYPE).unwrap();
	match db.build_index(&store, "by_name") {
		Ok(()) => println!("index `by_name` is now readable"),
		Err(err) => println!("build-index failed: {}", err),
	}
}

fn id_arg<'a, 'b>() -> Arg<'a, 'b> {
	Arg::with_name("ID").short("i").long("id").takes_value(true).required(true)
}

fn parse_id(matches: &ArgMatches) -> i64 {
	matches.value_of("ID").expect("ID is required").parse().expect("ID must be an integer")
}

fn main() {
	let matches = App::new("reclayer-cli")
		.version("0.1.0")
		.about("Reference command-line front end for the reclayer record layer")
		.subcommand(SubCommand::with_name("get").about("Fetch an item by id").arg(id_arg()))
		.subcommand(
			SubCommand::with_name("insert")
				.about("Insert or overwrite an item")
				.arg(id_arg())
				.arg(Arg::with_name("NAME").short("n").long("name").takes_value(true).required(true)),
		)
		.subcommand(SubCommand::with_name("delete").about("Delete an item by id").arg(id_arg()))
		.subcommand(
			SubCommand::with_name("query")
				.about("Find items by exact name match")
				.arg(Arg::with_name("NAME").short("n").long("name").takes_value(true).required(true)),
		)
		.subcommand(SubCommand::with_name("build-index").about("Build the `by_name` value index over the seeded dataset"))
		.get_matches();

	match matches.subcommand() {
		("get", Some(sub_m)) => do_get(parse_id(sub_m)),
		("insert", Some(sub_m)) => do_insert(parse_id(sub_m), sub_m.value_of("NAME").unwrap()),
		("delete", Some(sub_m)) => do_delete(parse_id(sub_m)),
		("query", Some(sub_m)) => do_query(sub_m.value_of("NAME").unwrap()),
		("build-index", Some(_)) => do_build_index(),
		_ => println!("no subcommand given; run with --help for usage"),
	}
}
