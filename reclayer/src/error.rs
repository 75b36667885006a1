#![allow(unknown_lints)]
#![allow(missing_docs)]

use std::path::PathBuf;

error_chain! {
	errors {
		/// Primary key did not exist on fetch/delete.
		NotFound {
			description("record not found")
			display("no record for the given primary key"),
		}
		/// `save_with_expected_version` disagreed with the stored version.
		VersionMismatch(expected: u64, actual: u64) {
			description("optimistic version check failed")
			display("expected version {}, found {}", expected, actual),
		}
		/// The wire codec rejected a record.
		SerializationFailed(msg: String) {
			description("record serialization failed")
			display("record serialization failed: {}", msg),
		}
		/// A query or direct API call referenced a non-readable index.
		IndexNotReady(name: String) {
			description("index is not readable")
			display("index `{}` is not readable yet", name),
		}
		/// Named index does not exist.
		IndexNotFound(name: String) {
			description("index not found")
			display("no such index: `{}`", name),
		}
		/// Rank API called with an invalid argument.
		InvalidRank(msg: String) {
			description("invalid rank argument")
			display("invalid rank argument: {}", msg),
		}
		/// Rank API index out of the populated range.
		RankOutOfBounds(rank: i64, len: usize) {
			description("rank out of bounds")
			display("rank {} is out of bounds for a set of size {}", rank, len),
		}
		/// Serializable conflict detected at commit time.
		TransactionConflict {
			description("transaction conflict")
			display("transaction conflicted with a concurrent writer"),
		}
		/// Transaction mutated more than the configured size budget.
		TransactionTooLarge(limit: usize, actual: usize) {
			description("transaction exceeded its size budget")
			display("transaction mutated {} bytes, limit is {}", actual, limit),
		}
		/// Transaction ran longer than its read-version window.
		TransactionTooOld {
			description("transaction read version expired")
			display("transaction exceeded its time budget and must be retried"),
		}
		/// Schema evolution validator refused an unsafe change.
		SchemaEvolutionRefused(msg: String) {
			description("schema evolution refused")
			display("schema evolution refused: {}", msg),
		}
		/// Unique value index constraint violated at save time.
		DuplicateKey(index: String) {
			description("duplicate key for a unique index")
			display("duplicate key for unique index `{}`", index),
		}
		/// A constructor argument was out of its valid range.
		InvalidOptions(field: &'static str, msg: String) {
			description("invalid option value")
			display("invalid value for `{}`: {}", field, msg),
		}
		/// A record type or index declaration was internally inconsistent.
		InvalidDeclaration(msg: String) {
			description("invalid schema declaration")
			display("invalid schema declaration: {}", msg),
		}
		/// An online build or scrub operation could not make progress even
		/// at the minimum batch size.
		BudgetExhausted(operation: String) {
			description("could not shrink batch further")
			display("{}: could not make progress even at the minimum batch size", operation),
		}
		/// A tenant/collection partition path could not be opened.
		PartitionUnavailable(path: PathBuf, msg: String) {
			description("partition directory unavailable")
			display("partition at {} unavailable: {}", path.display(), msg),
		}
	}
}

impl PartialEq for ErrorKind {
	fn eq(&self, other: &Self) -> bool {
		use self::ErrorKind::*;
		match (self, other) {
			(NotFound, NotFound) => true,
			(VersionMismatch(e1, a1), VersionMismatch(e2, a2)) => e1 == e2 && a1 == a2,
			(SerializationFailed(a), SerializationFailed(b)) => a == b,
			(IndexNotReady(a), IndexNotReady(b)) => a == b,
			(IndexNotFound(a), IndexNotFound(b)) => a == b,
			(InvalidRank(a), InvalidRank(b)) => a == b,
			(RankOutOfBounds(r1, l1), RankOutOfBounds(r2, l2)) => r1 == r2 && l1 == l2,
			(TransactionConflict, TransactionConflict) => true,
			(TransactionTooLarge(l1, a1), TransactionTooLarge(l2, a2)) => l1 == l2 && a1 == a2,
			(TransactionTooOld, TransactionTooOld) => true,
			(SchemaEvolutionRefused(a), SchemaEvolutionRefused(b)) => a == b,
			(DuplicateKey(a), DuplicateKey(b)) => a == b,
			(InvalidOptions(f1, m1), InvalidOptions(f2, m2)) => f1 == f2 && m1 == m2,
			(InvalidDeclaration(a), InvalidDeclaration(b)) => a == b,
			(BudgetExhausted(a), BudgetExhausted(b)) => a == b,
			(PartitionUnavailable(p1, m1), PartitionUnavailable(p2, m2)) => p1 == p2 && m1 == m2,
			_ => false,
		}
	}
}

impl ErrorKind {
	/// Whether the transaction driver should retry with backoff rather than
	/// propagate to the caller.
	pub fn is_retryable(&self) -> bool {
		matches!(self, ErrorKind::TransactionConflict | ErrorKind::TransactionTooOld)
	}
}
