//! Schema evolution validator.
//!
//! Compares an old persisted `Schema` with a newly-declared one and, in
//! `strict` mode, refuses changes that would break existing data — a
//! changed field wire type, or an index removal that silently orphans
//! entries. Turns a batch of structural checks into one early `Result`,
//! the same way a constructor validates a batch of option fields before
//! returning.

use crate::error::{ErrorKind, Result};
use crate::options::ValidationMode;
use crate::schema::{RecordDescriptor, Schema};

/// One discrepancy found between the old and new schema. `strict` mode
/// turns every variant into a refusal; `permissive` mode only logs them.
#[derive(Debug, Clone, PartialEq)]
pub enum EvolutionIssue {
	RecordTypeDeleted { type_name: String },
	FieldDeleted { type_name: String, field_name: String },
	FieldWireNumberChanged { type_name: String, field_name: String, old: u32, new: u32 },
	FieldWireKindChanged { type_name: String, field_name: String },
	IndexDeletedWithoutTombstone { type_name: String, index_name: String },
	IndexKeyShapeChanged { type_name: String, index_name: String },
	IndexKindChanged { type_name: String, index_name: String },
}

impl EvolutionIssue {
	fn describe(&self) -> String {
		match self {
			EvolutionIssue::RecordTypeDeleted { type_name } => format!("record type `{}` was deleted", type_name),
			EvolutionIssue::FieldDeleted { type_name, field_name } => {
				format!("field `{}.{}` was deleted", type_name, field_name)
			}
			EvolutionIssue::FieldWireNumberChanged { type_name, field_name, old, new } => format!(
				"field `{}.{}` changed wire number from {} to {}",
				type_name, field_name, old, new
			),
			EvolutionIssue::FieldWireKindChanged { type_name, field_name } => {
				format!("field `{}.{}` changed wire type", type_name, field_name)
			}
			EvolutionIssue::IndexDeletedWithoutTombstone { type_name, index_name } => format!(
				"index `{}.{}` was deleted without a matching FormerIndex",
				type_name, index_name
			),
			EvolutionIssue::IndexKeyShapeChanged { type_name, index_name } => {
				format!("index `{}.{}` changed key shape", type_name, index_name)
			}
			EvolutionIssue::IndexKindChanged { type_name, index_name } => {
				format!("index `{}.{}` changed kind", type_name, index_name)
			}
		}
	}
}

/// Compares `old` against `new`, returning every issue found. Adding record
/// types, fields, indexes, and enum values is always safe and never
/// produces an issue.
pub fn diff(old: &Schema, new: &Schema) -> Vec<EvolutionIssue> {
	let mut issues = Vec::new();

	for old_type in old.record_types() {
		let new_type = match new.record_type(&old_type.name) {
			Some(t) => t,
			None => {
				issues.push(EvolutionIssue::RecordTypeDeleted { type_name: old_type.name.clone() });
				continue;
			}
		};
		diff_record_type(old_type, new_type, new, &mut issues);
	}

	issues
}

fn diff_record_type(old_type: &RecordDescriptor, new_type: &RecordDescriptor, new_schema: &Schema, issues: &mut Vec<EvolutionIssue>) {
	for old_field in &old_type.fields {
		match new_type.field(&old_field.name) {
			None => issues.push(EvolutionIssue::FieldDeleted {
				type_name: old_type.name.clone(),
				field_name: old_field.name.clone(),
			}),
			Some(new_field) => {
				if new_field.wire_number != old_field.wire_number {
					issues.push(EvolutionIssue::FieldWireNumberChanged {
						type_name: old_type.name.clone(),
						field_name: old_field.name.clone(),
						old: old_field.wire_number,
						new: new_field.wire_number,
					});
				}
				if new_field.wire_kind != old_field.wire_kind {
					issues.push(EvolutionIssue::FieldWireKindChanged {
						type_name: old_type.name.clone(),
						field_name: old_field.name.clone(),
					});
				}
			}
		}
	}

	let tombstoned: Vec<&str> = new_schema.former_indexes(&old_type.name).iter().map(|f| f.name.as_str()).collect();

	for old_index in &old_type.indexes {
		match new_type.index(&old_index.name) {
			None => {
				if !tombstoned.contains(&old_index.name.as_str()) {
					issues.push(EvolutionIssue::IndexDeletedWithoutTombstone {
						type_name: old_type.name.clone(),
						index_name: old_index.name.clone(),
					});
				}
			}
			Some(new_index) => {
				if new_index.options.kind_name() != old_index.options.kind_name() {
					issues.push(EvolutionIssue::IndexKindChanged {
						type_name: old_type.name.clone(),
						index_name: old_index.name.clone(),
					});
				} else if new_index.key_expression != old_index.key_expression || new_index.grouping_len != old_index.grouping_len {
					issues.push(EvolutionIssue::IndexKeyShapeChanged {
						type_name: old_type.name.clone(),
						index_name: old_index.name.clone(),
					});
				}
			}
		}
	}
}

/// Runs `diff` and, per `mode`, either refuses (returning
/// `ErrorKind::SchemaEvolutionRefused`) or logs every issue via
/// `log::warn!` and proceeds.
pub fn validate(old: &Schema, new: &Schema, mode: ValidationMode) -> Result<()> {
	let issues = diff(old, new);
	if issues.is_empty() {
		return Ok(());
	}
	match mode {
		ValidationMode::Strict => {
			let summary = issues.iter().map(|i| i.describe()).collect::<Vec<_>>().join("; ");
			bail!(ErrorKind::SchemaEvolutionRefused(summary));
		}
		ValidationMode::Permissive => {
			for issue in &issues {
				log::warn!("schema evolution: {}", issue.describe());
			}
			Ok(())
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::schema::{FieldDescriptor, IndexDefinition, IndexKindOptions, IndexScope, RecordDescriptor, WireKind};

	fn base_schema() -> Schema {
		let mut schema = Schema::new();
		schema
			.register(RecordDescriptor {
				name: "User".into(),
				primary_key_fields: vec!["id".into()],
				fields: vec![
					FieldDescriptor { name: "id".into(), wire_number: 1, wire_kind: WireKind::Varint },
					FieldDescriptor { name: "email".into(), wire_number: 2, wire_kind: WireKind::LengthDelimited },
				],
				indexes: vec![IndexDefinition {
					name: "by_email".into(),
					options: IndexKindOptions::Value,
					key_expression: vec!["email".into()],
					grouping_len: 0,
					unique: true,
					scope: IndexScope::Partition,
				}],
				partition_path: vec![],
			})
			.unwrap();
		schema
	}

	#[test]
	fn identical_schema_has_no_issues() {
		let schema = base_schema();
		assert!(diff(&schema, &schema).is_empty());
	}

	#[test]
	fn adding_a_field_is_safe() {
		let old = base_schema();
		let mut new = base_schema();
		new.record_types.get_mut("User").unwrap().fields.push(FieldDescriptor {
			name: "age".into(),
			wire_number: 3,
			wire_kind: WireKind::Varint,
		});
		assert!(diff(&old, &new).is_empty());
	}

	#[test]
	fn deleting_a_field_is_flagged() {
		let old = base_schema();
		let mut new = base_schema();
		new.record_types.get_mut("User").unwrap().fields.retain(|f| f.name != "email");
		new.record_types.get_mut("User").unwrap().indexes.clear();
		let issues = diff(&old, &new);
		assert!(issues.iter().any(|i| matches!(i, EvolutionIssue::FieldDeleted { .. })));
	}

	#[test]
	fn strict_mode_refuses_deleted_record_type() {
		let old = base_schema();
		let new = Schema::new();
		assert!(validate(&old, &new, ValidationMode::Strict).is_err());
	}

	#[test]
	fn permissive_mode_allows_deleted_record_type() {
		let old = base_schema();
		let new = Schema::new();
		assert!(validate(&old, &new, ValidationMode::Permissive).is_ok());
	}

	#[test]
	fn tombstoned_index_deletion_is_not_flagged() {
		let old = base_schema();
		let mut new = base_schema();
		new.version = Some(crate::schema::SchemaVersion { major: 1, minor: 0, patch: 0 });
		new.retire_index("User", "by_email", crate::schema::SchemaVersion { major: 1, minor: 0, patch: 0 }).unwrap();
		let issues = diff(&old, &new);
		assert!(!issues.iter().any(|i| matches!(i, EvolutionIssue::IndexDeletedWithoutTombstone { .. })));
	}
}
