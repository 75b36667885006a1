//! Cost-based query planner: picks between candidate scan strategies by
//! comparing a per-candidate cost model over several plan shapes, driven by
//! `statistics.rs`, rather than committing to a fixed strategy up front.

use std::collections::BTreeMap;

use crate::error::{ErrorKind, Result};
use crate::query::plan::PlanNode;
use crate::query::{FilterTree, Predicate, Query};
use crate::schema::{IndexDefinition, IndexKindOptions, IndexScope, IndexState, RecordDescriptor, SortOrder};
use crate::statistics::Statistics;
use crate::tuple::Value;

const SCAN_COST_PER_ROW: f64 = 1.0;
const FETCH_COST_PER_ROW: f64 = 2.0;

/// A conjunction of atomic predicates; one arm of a filter tree's DNF.
type Conjunct = Vec<Predicate>;

enum Normalized {
	Disjuncts(Vec<Conjunct>),
	/// The tree contains a `Not`; pushing negation through atomic predicates
	/// isn't supported, so the whole tree is kept as one opaque residual
	/// filter instead of being split into index-matchable conjuncts.
	Opaque,
}

fn normalize(filter: &FilterTree) -> Normalized {
	match filter {
		FilterTree::Pred(p) => Normalized::Disjuncts(vec![vec![p.clone()]]),
		FilterTree::Not(_) => Normalized::Opaque,
		FilterTree::And(children) => {
			let mut acc: Vec<Conjunct> = vec![Vec::new()];
			for child in children {
				let disjuncts = match normalize(child) {
					Normalized::Opaque => return Normalized::Opaque,
					Normalized::Disjuncts(d) => d,
				};
				let mut next = Vec::new();
				for existing in &acc {
					for conjunct in &disjuncts {
						let mut combined = existing.clone();
						combined.extend(conjunct.clone());
						next.push(combined);
					}
				}
				acc = next;
			}
			Normalized::Disjuncts(acc)
		}
		FilterTree::Or(children) => {
			let mut acc = Vec::new();
			for child in children {
				match normalize(child) {
					Normalized::Opaque => return Normalized::Opaque,
					Normalized::Disjuncts(d) => acc.extend(d),
				}
			}
			Normalized::Disjuncts(acc)
		}
	}
}

fn equality_value<'a>(conjunct: &'a [Predicate], field: &str) -> Option<&'a Value> {
	conjunct.iter().find_map(|p| match p {
		Predicate::Eq(f, v) if f == field => Some(v),
		_ => None,
	})
}

fn range_bounds(conjunct: &[Predicate], field: &str) -> (Option<i64>, Option<i64>) {
	let mut lo = None;
	let mut hi = None;
	for p in conjunct {
		match p {
			Predicate::Gt(f, Value::Int(v)) if f == field => lo = Some(lo.map_or(*v + 1, |x: i64| x.max(*v + 1))),
			Predicate::Ge(f, Value::Int(v)) if f == field => lo = Some(lo.map_or(*v, |x: i64| x.max(*v))),
			Predicate::Lt(f, Value::Int(v)) if f == field => hi = Some(hi.map_or(*v - 1, |x: i64| x.min(*v - 1))),
			Predicate::Le(f, Value::Int(v)) if f == field => hi = Some(hi.map_or(*v, |x: i64| x.min(*v))),
			_ => {}
		}
	}
	(lo, hi)
}

/// One way to satisfy a conjunct: a plan node plus the subset of the
/// conjunct's predicates it does NOT already enforce (must survive as a
/// residual `Filter`), and the signals the tie-break rules compare on.
struct Candidate {
	node: PlanNode,
	residual: Conjunct,
	covering: bool,
	matches_sort: bool,
	sort_cost: f64,
	union_branches: usize,
	index_name: String,
	cost: f64,
}

/// Longest leading run of `index`'s key fields this conjunct pins to an
/// equality value, e.g. `["tenant", "status"]` out of a 3-field key.
fn equality_prefix(index: &IndexDefinition, conjunct: &Conjunct) -> Vec<Value> {
	let mut values = Vec::new();
	for field in &index.key_expression {
		match equality_value(conjunct, field) {
			Some(v) => values.push(v.clone()),
			None => break,
		}
	}
	values
}

/// Compound equality cardinality: chains single-field equality estimates,
/// each narrowing the running estimate further (an independence assumption,
/// the usual one absent per-combination statistics).
fn equality_cost(record_type: &str, key_expression: &[String], prefix_len: usize, stats: &Statistics) -> f64 {
	let mut cost = stats.row_count(record_type).max(1) as f64;
	for field in key_expression.iter().take(prefix_len) {
		cost = cost.min(stats.estimate_equality(record_type, field));
	}
	cost.max(1.0)
}

fn index_scan_candidate(
	index: &IndexDefinition,
	conjunct: &Conjunct,
	record_type: &str,
	sort: Option<(&str, SortOrder)>,
	stats: &Statistics,
) -> Option<Candidate> {
	let leading_field = index.key_expression.first()?;
	let prefix = equality_prefix(index, conjunct);
	let (begin, end, cardinality) = if !prefix.is_empty() {
		(prefix.clone(), prefix.clone(), equality_cost(record_type, &index.key_expression, prefix.len(), stats))
	} else {
		let (lo, hi) = range_bounds(conjunct, leading_field);
		if lo.is_none() && hi.is_none() {
			return None;
		}
		let begin = lo.map(|v| vec![Value::Int(v)]).unwrap_or_default();
		let end = hi.map(|v| vec![Value::Int(v)]).unwrap_or_default();
		let cardinality = stats.estimate_range(record_type, leading_field, lo.unwrap_or(i64::MIN), hi.unwrap_or(i64::MAX));
		(begin, end, cardinality)
	};

	let matched_fields: Vec<&str> =
		if !prefix.is_empty() { index.key_expression.iter().take(prefix.len()).map(String::as_str).collect() } else { vec![leading_field.as_str()] };
	let residual: Conjunct =
		conjunct.iter().filter(|p| p.field().map(|f| !matched_fields.contains(&f)).unwrap_or(true)).cloned().collect();
	let matches_sort = sort
		.map(|(field, order)| index.key_expression.first().map(|f| f.as_str() == field).unwrap_or(false) && order == SortOrder::Ascending)
		.unwrap_or(true);

	Some(Candidate {
		node: PlanNode::IndexScan { index: index.name.clone(), begin, end, reverse: false },
		residual,
		covering: false,
		matches_sort,
		sort_cost: 0.0,
		union_branches: 1,
		index_name: index.name.clone(),
		cost: cardinality * SCAN_COST_PER_ROW + cardinality * FETCH_COST_PER_ROW,
	})
}

fn spatial_candidate(index: &IndexDefinition, conjunct: &Conjunct, record_type: &str, stats: &Statistics) -> Option<Candidate> {
	let (center, radius_meters) = conjunct.iter().find_map(|p| match p {
		Predicate::WithinRadius { index: name, center, radius_meters } if name == &index.name => Some((*center, *radius_meters)),
		_ => None,
	})?;
	let residual: Conjunct =
		conjunct.iter().filter(|p| !matches!(p, Predicate::WithinRadius { index: name, .. } if name == &index.name)).cloned().collect();
	let cardinality = stats.row_count(record_type).max(1) as f64;
	Some(Candidate {
		node: PlanNode::SpatialScan { index: index.name.clone(), center, radius_meters },
		residual,
		covering: false,
		matches_sort: false,
		sort_cost: 0.0,
		union_branches: 1,
		index_name: index.name.clone(),
		cost: cardinality.sqrt() * SCAN_COST_PER_ROW,
	})
}

fn vector_candidate(index: &IndexDefinition, conjunct: &Conjunct) -> Option<Candidate> {
	let (query, k) = conjunct.iter().find_map(|p| match p {
		Predicate::NearestNeighbors { index: name, query, k } if name == &index.name => Some((query.clone(), *k)),
		_ => None,
	})?;
	let residual: Conjunct =
		conjunct.iter().filter(|p| !matches!(p, Predicate::NearestNeighbors { index: name, .. } if name == &index.name)).cloned().collect();
	Some(Candidate {
		node: PlanNode::VectorSearch { index: index.name.clone(), query, k, ef: (k * 2).max(100) },
		residual,
		covering: false,
		matches_sort: false,
		sort_cost: 0.0,
		union_branches: 1,
		index_name: index.name.clone(),
		cost: (k as f64).max(1.0) * SCAN_COST_PER_ROW,
	})
}

/// A `Covering` candidate: legal only when every field the query actually
/// needs — its declared `required_fields` plus every field the conjunct's
/// own predicates touch — sits in the index's key, so the decoded index
/// key alone answers the query without a `store.fetch`. Disqualified by
/// any predicate with no single field (a spatial/vector predicate), since
/// those need fields `field_set` can't supply.
fn covering_candidate(
	index: &IndexDefinition,
	conjunct: &Conjunct,
	record_type: &str,
	query: &Query,
	sort: Option<(&str, SortOrder)>,
	stats: &Statistics,
) -> Option<Candidate> {
	let required = query.required_fields.as_ref()?;
	let mut field_set: Vec<String> = required.clone();
	for predicate in conjunct {
		let field = predicate.field()?;
		if !field_set.iter().any(|f| f == field) {
			field_set.push(field.to_string());
		}
	}
	if !field_set.iter().all(|f| index.key_expression.contains(f)) {
		return None;
	}
	let matches_sort = sort
		.map(|(field, order)| index.key_expression.first().map(|f| f.as_str() == field).unwrap_or(false) && order == SortOrder::Ascending)
		.unwrap_or(true);
	let cardinality = stats.row_count(record_type).max(1) as f64;

	Some(Candidate {
		node: PlanNode::Covering { index: index.name.clone(), field_set },
		residual: conjunct.clone(),
		covering: true,
		matches_sort,
		sort_cost: 0.0,
		union_branches: 1,
		index_name: index.name.clone(),
		cost: cardinality * SCAN_COST_PER_ROW,
	})
}

fn in_join_candidate(index: &IndexDefinition, conjunct: &Conjunct) -> Option<Candidate> {
	let leading_field = index.key_expression.first()?;
	let values = conjunct.iter().find_map(|p| match p {
		Predicate::In(f, values) if f == leading_field => Some(values.clone()),
		_ => None,
	})?;
	let residual: Conjunct = conjunct.iter().filter(|p| p.field() != Some(leading_field.as_str())).cloned().collect();
	let branches = values.len().max(1);
	Some(Candidate {
		node: PlanNode::InJoin { index: index.name.clone(), field: leading_field.clone(), values },
		residual,
		covering: false,
		matches_sort: false,
		sort_cost: 0.0,
		union_branches: branches,
		index_name: index.name.clone(),
		cost: branches as f64 * FETCH_COST_PER_ROW,
	})
}

fn fallback_candidate(record_type: &str, conjunct: &Conjunct, stats: &Statistics) -> Candidate {
	Candidate {
		node: PlanNode::FullScan,
		residual: conjunct.clone(),
		covering: false,
		matches_sort: false,
		sort_cost: 0.0,
		union_branches: 1,
		index_name: String::new(),
		cost: stats.row_count(record_type).max(1) as f64 * SCAN_COST_PER_ROW,
	}
}

/// Picks the lowest-cost candidate, applying the documented tie-breaks when
/// costs are equal: covering, then sort-matching, then lower sort cost, then
/// fewer union branches, then lexicographically-lower index name.
fn best_candidate(candidates: Vec<Candidate>) -> Candidate {
	candidates
		.into_iter()
		.reduce(|a, b| {
			let a_is_better = a
				.cost
				.partial_cmp(&b.cost)
				.unwrap_or(std::cmp::Ordering::Equal)
				.then_with(|| b.covering.cmp(&a.covering))
				.then_with(|| b.matches_sort.cmp(&a.matches_sort))
				.then_with(|| a.sort_cost.partial_cmp(&b.sort_cost).unwrap_or(std::cmp::Ordering::Equal))
				.then_with(|| a.union_branches.cmp(&b.union_branches))
				.then_with(|| a.index_name.cmp(&b.index_name))
				!= std::cmp::Ordering::Greater;
			if a_is_better {
				a
			} else {
				b
			}
		})
		.expect("the fallback candidate is always present")
}

fn plan_conjunct(
	descriptor: &RecordDescriptor,
	index_states: &BTreeMap<String, IndexState>,
	conjunct: &Conjunct,
	sort: Option<(&str, SortOrder)>,
	query: &Query,
	stats: &Statistics,
) -> Candidate {
	let mut candidates = Vec::new();
	for index in &descriptor.indexes {
		if index.scope == IndexScope::Global {
			continue;
		}
		let readable = index_states.get(&index.name).copied().map(IndexState::is_queryable).unwrap_or(false);
		if !readable {
			continue;
		}
		match &index.options {
			IndexKindOptions::Value | IndexKindOptions::Permuted { .. } => {
				candidates.extend(index_scan_candidate(index, conjunct, &descriptor.name, sort, stats));
				candidates.extend(in_join_candidate(index, conjunct));
				candidates.extend(covering_candidate(index, conjunct, &descriptor.name, query, sort, stats));
			}
			IndexKindOptions::Spatial { .. } => candidates.extend(spatial_candidate(index, conjunct, &descriptor.name, stats)),
			IndexKindOptions::Vector { .. } => candidates.extend(vector_candidate(index, conjunct)),
			_ => {}
		}
	}
	candidates.push(fallback_candidate(&descriptor.name, conjunct, stats));
	best_candidate(candidates)
}

/// Produces an executable plan for `query` against `descriptor`, consulting
/// `index_states` for queryability and `stats` for cost estimation (
/// §4.8's six-step algorithm; caching is `cache.rs`'s concern, layered on
/// top of this function).
pub fn plan(
	query: &Query,
	descriptor: &RecordDescriptor,
	index_states: &BTreeMap<String, IndexState>,
	stats: &Statistics,
) -> Result<PlanNode> {
	let sort = query.sort.as_ref().map(|s| (s.field.as_str(), s.order));

	let filter = match &query.filter {
		None => {
			let fallback = fallback_candidate(&descriptor.name, &Vec::new(), stats);
			return finish(fallback.node, query, fallback.matches_sort);
		}
		Some(f) => f,
	};

	let disjuncts = match normalize(filter) {
		Normalized::Disjuncts(d) => d,
		Normalized::Opaque => {
			if query.indexed_only {
				bail!(ErrorKind::InvalidDeclaration(
					"query is indexed-only but its filter uses NOT, which this planner cannot index".into()
				));
			}
			let node = PlanNode::Filter { child: Box::new(PlanNode::FullScan), filter: filter.clone() };
			return finish(node, query, false);
		}
	};

	let mut branches = Vec::new();
	let mut branch_matches_sort = Vec::new();
	for conjunct in disjuncts {
		let winner = plan_conjunct(descriptor, index_states, &conjunct, sort, query, stats);
		if query.indexed_only && matches!(winner.node, PlanNode::FullScan) {
			bail!(ErrorKind::InvalidDeclaration(format!(
				"query on `{}` is indexed-only but no index matches its filter",
				descriptor.name
			)));
		}
		let matches_sort = winner.matches_sort;
		let mut branch = winner.node;
		if !winner.residual.is_empty() {
			let residual_tree = FilterTree::And(winner.residual.into_iter().map(FilterTree::Pred).collect());
			branch = PlanNode::Filter { child: Box::new(branch), filter: residual_tree };
		}
		branches.push(branch);
		branch_matches_sort.push(matches_sort);
	}

	// A `Union`/`Distinct` merge of several branches doesn't preserve any
	// single branch's order, so only a lone surviving disjunct can carry
	// its candidate's `matches_sort` signal forward.
	let (combined, combined_matches_sort) = if branches.len() == 1 {
		(branches.into_iter().next().unwrap(), branch_matches_sort[0])
	} else {
		(PlanNode::Distinct { child: Box::new(PlanNode::Union { children: branches }) }, false)
	};

	finish(combined, query, combined_matches_sort)
}

fn finish(mut node: PlanNode, query: &Query, matches_sort: bool) -> Result<PlanNode> {
	if let Some(sort) = &query.sort {
		if !matches_sort {
			node = PlanNode::Sort { child: Box::new(node), sort: sort.clone() };
		}
	}
	if let Some(limit) = query.limit {
		node = PlanNode::First { child: Box::new(node), n: limit };
	}
	Ok(node)
}
