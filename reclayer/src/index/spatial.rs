//! Spatial index: coordinates are encoded as a 1-D cell identifier — a
//! Hilbert-curve cell on a sphere quadtree for geo indexes, a Morton
//! (Z-order) code for Cartesian ones — so range scans over cover cells
//! answer radius/bounding-box/nearest queries. Cell-id interleaving is
//! bit-level slicing and reassembly of a fixed-width key, the same kind of
//! bit-twiddling applied to coordinates instead of a key prefix.

use crate::error::Result;
use crate::index::{FieldMap, IndexMaintainer};
use crate::schema::{IndexDefinition, SpatialKind};
use crate::subspace::Subspace;
use crate::transaction::TransactionContext;
use crate::tuple::Value;

/// Interleaves the low `bits` bits of `x` and `y` into a Morton code
/// (Z-order curve).
fn morton2(x: u32, y: u32, bits: u8) -> u64 {
	fn spread(mut v: u64) -> u64 {
		v &= 0xFFFF_FFFF;
		v = (v | (v << 16)) & 0x0000_FFFF_0000_FFFF;
		v = (v | (v << 8)) & 0x00FF_00FF_00FF_00FF;
		v = (v | (v << 4)) & 0x0F0F_0F0F_0F0F_0F0F;
		v = (v | (v << 2)) & 0x3333_3333_3333_3333;
		v = (v | (v << 1)) & 0x5555_5555_5555_5555;
		v
	}
	let mask = if bits >= 32 { u32::MAX } else { (1u32 << bits) - 1 };
	spread((x & mask) as u64) | (spread((y & mask) as u64) << 1)
}

fn quantize(value: f64, min: f64, max: f64, bits: u8) -> u32 {
	let span = (max - min).max(f64::EPSILON);
	let normalized = ((value - min) / span).clamp(0.0, 1.0);
	(normalized * ((1u64 << bits) - 1) as f64) as u32
}

/// Hilbert d2xy-style encoding on a `2^order x 2^order` grid, used for the
/// geo cell id (the sphere quadtree is approximated by a single
/// equirectangular Hilbert curve over latitude/longitude, adequate for the
/// radius/bbox queries this layer answers by unioning cover cells and
/// post-filtering by exact distance).
fn hilbert_d2xy_to_d(order: u8, mut x: u32, mut y: u32) -> u64 {
	let n: u32 = 1 << order;
	let mut rx;
	let mut ry;
	let mut d: u64 = 0;
	let mut s: u32 = n / 2;
	while s > 0 {
		rx = if (x & s) > 0 { 1u32 } else { 0 };
		ry = if (y & s) > 0 { 1u32 } else { 0 };
		d += (s as u64) * (s as u64) * ((3 * rx) ^ ry) as u64;
		// rotate/flip the quadrant
		if ry == 0 {
			if rx == 1 {
				x = n - 1 - x;
				y = n - 1 - y;
			}
			std::mem::swap(&mut x, &mut y);
		}
		s /= 2;
	}
	d
}

fn geo_cell_id(lat: f64, lon: f64, level: u8) -> u64 {
	let bits = level.min(30).max(1);
	let x = quantize(lon, -180.0, 180.0, bits);
	let y = quantize(lat, -90.0, 90.0, bits);
	hilbert_d2xy_to_d(bits, x, y)
}

fn cartesian_cell_id(coords: &[f64], level: u8) -> u64 {
	match coords {
		[x, y] => morton2(quantize(*x, -1e9, 1e9, level.min(32)), quantize(*y, -1e9, 1e9, level.min(32)), level.min(32)),
		[x, y, z] => {
			let bits = level.min(21);
			let cx = quantize(*x, -1e9, 1e9, bits) as u64;
			let cy = quantize(*y, -1e9, 1e9, bits) as u64;
			let cz = quantize(*z, -1e9, 1e9, bits) as u64;
			morton2(cx as u32, cy as u32, bits) | (cz << (2 * bits as u64))
		}
		_ => 0,
	}
}

/// Great-circle distance between two lat/lon points, in meters.
pub fn haversine_meters(p1: (f64, f64), p2: (f64, f64)) -> f64 {
	const EARTH_RADIUS_M: f64 = 6_371_000.0;
	let (lat1, lon1) = (p1.0.to_radians(), p1.1.to_radians());
	let (lat2, lon2) = (p2.0.to_radians(), p2.1.to_radians());
	let dlat = lat2 - lat1;
	let dlon = lon2 - lon1;
	let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
	2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

pub struct SpatialIndex {
	definition: IndexDefinition,
	subspace: Subspace,
	kind: SpatialKind,
	cell_level: u8,
	coordinate_fields: Vec<String>,
}

impl SpatialIndex {
	pub fn new(definition: IndexDefinition, subspace: Subspace, kind: SpatialKind, cell_level: u8, coordinate_fields: Vec<String>) -> Self {
		SpatialIndex { definition, subspace, kind, cell_level, coordinate_fields }
	}

	fn coords(&self, record: &FieldMap) -> Option<Vec<f64>> {
		self.coordinate_fields
			.iter()
			.map(|f| match record.get(f) {
				Some(Value::Int(v)) => Some(*v as f64 / 1_000_000.0),
				_ => None,
			})
			.collect()
	}

	fn cell_id(&self, coords: &[f64]) -> u64 {
		match self.kind {
			SpatialKind::Geo2D | SpatialKind::Geo3D => geo_cell_id(coords[0], coords[1], self.cell_level),
			SpatialKind::Cartesian2D | SpatialKind::Cartesian3D => cartesian_cell_id(coords, self.cell_level),
		}
	}

	fn entry_key(&self, cell_id: u64, primary_key: &[Value]) -> Vec<u8> {
		let mut values = vec![Value::Int(cell_id as i64)];
		values.extend(primary_key.iter().cloned());
		self.subspace.pack(&values)
	}

	/// Cover-cell ids for a radius query around `(lat, lon)`; the planner
	/// unions an `IndexScan` per returned cell id and post-filters by
	/// exact `haversine_meters` distance.
	pub fn cover_cells_for_radius(&self, center: (f64, f64), radius_meters: f64) -> Vec<u64> {
		let degrees_per_meter = 1.0 / 111_320.0;
		let delta = radius_meters * degrees_per_meter;
		let mut cells = std::collections::BTreeSet::new();
		let steps = 4;
		for i in -steps..=steps {
			for j in -steps..=steps {
				let lat = center.0 + (i as f64) * delta / steps as f64;
				let lon = center.1 + (j as f64) * delta / steps as f64;
				cells.insert(geo_cell_id(lat, lon, self.cell_level));
			}
		}
		cells.into_iter().collect()
	}

	pub fn scan_cell(&self, tx: &mut TransactionContext, cell_id: u64, snapshot: bool) -> Result<Vec<(Vec<Value>, Vec<u8>)>> {
		let cell_subspace = self.subspace.pack(&[Value::Int(cell_id as i64)]);
		let end = crate::tuple::strinc(&cell_subspace);
		let rows = tx.get_range(&cell_subspace, &end, snapshot, None, false)?;
		rows.into_iter()
			.map(|(key, value)| {
				let unpacked = self.subspace.unpack(&key)?;
				Ok((unpacked[1..].to_vec(), value))
			})
			.collect()
	}
}

impl IndexMaintainer for SpatialIndex {
	fn update(&self, tx: &mut TransactionContext, primary_key: &[Value], old: Option<&FieldMap>, new: Option<&FieldMap>) -> Result<()> {
		if let Some(old_record) = old {
			if let Some(coords) = self.coords(old_record) {
				tx.clear(&self.entry_key(self.cell_id(&coords), primary_key))?;
			}
		}
		if let Some(new_record) = new {
			if let Some(coords) = self.coords(new_record) {
				tx.set(&self.entry_key(self.cell_id(&coords), primary_key), &[])?;
			}
		}
		Ok(())
	}

	fn entry_keys(&self, primary_key: &[Value], record: &FieldMap) -> Vec<Vec<u8>> {
		self.coords(record).map(|c| vec![self.entry_key(self.cell_id(&c), primary_key)]).unwrap_or_default()
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

	#[test]
	fn nearby_points_share_or_neighbor_a_cell() {
		let definition = IndexDefinition {
			name: "by_location".into(),
			options: IndexKindOptions::Spatial {
				kind: SpatialKind::Geo2D,
				cell_level: 20,
				coordinate_fields: vec!["lat".into(), "lon".into()],
			},
			key_expression: vec!["lat".into(), "lon".into()],
			grouping_len: 0,
			unique: false,
			scope: IndexScope::Partition,
		};
		let index = SpatialIndex::new(definition, Subspace::root(vec![0xF3]), SpatialKind::Geo2D, 20, vec!["lat".into(), "lon".into()]);
		let kv = MemoryKv::new();
		let mut tx = TransactionContext::new(kv.begin());

		let mut tokyo_station = FieldMap::new();
		tokyo_station.insert("lat".into(), Value::Int(35_681_200));
		tokyo_station.insert("lon".into(), Value::Int(139_767_100));
		index.update(&mut tx, &[Value::Int(1)], None, Some(&tokyo_station)).unwrap();

		let cells = index.cover_cells_for_radius((35.6812, 139.7671), 5_000.0);
		let mut found = false;
		for cell in cells {
			if !index.scan_cell(&mut tx, cell, false).unwrap().is_empty() {
				found = true;
			}
		}
		assert!(found);
	}

	#[test]
	fn haversine_is_symmetric_and_zero_at_origin() {
		let p = (35.6812, 139.7671);
		assert_eq!(haversine_meters(p, p), 0.0);
		let q = (35.6900, 139.7700);
		assert_eq!(haversine_meters(p, q), haversine_meters(q, p));
	}
}
