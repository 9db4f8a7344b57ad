//! Fan-out of a directory search into one query per object type.
//!
//! A search resolves the object types in scope from its base DN, then runs
//! one branch per object type concurrently. Each branch makes sure the
//! object type's fields are known, compiles the filter, pages through the
//! query results and streams projected entries to the caller. The response
//! is finalized exactly once, as soon as the last branch reports, whether it
//! succeeded or not.

use std::{
	collections::HashSet,
	sync::{
		Arc, Mutex, PoisonError,
		atomic::{AtomicBool, Ordering},
	},
};

use futures::future::join_all;
use itertools::Itertools;

use crate::{
	SkippedErrors,
	dn::DistinguishedName,
	entry::{DirectoryEntry, Projector},
	err::Result,
	filter::{Filter, compile, where_clause},
	mapping::{MappingTable, ObjectTypeMapping},
	schema::{FieldSet, SchemaCache},
	session::Session,
};

/// Field every query selects
const ID_FIELD: &str = "id";

/// A search as delivered by the listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
	/// Base DN of the search
	pub base: String,
	/// Filter expression
	pub filter: Filter,
	/// Requested attribute names; empty means all
	pub attributes: Vec<String>,
}

/// Receiver of a search's results
pub trait EntrySink: Send + Sync {
	/// Deliver one entry
	fn send(&self, entry: DirectoryEntry);
	/// Finalize the response; called exactly once per search with the
	/// object types whose branch failed
	fn end(&self, failed: &[String]);
}

/// Outcome of a search, for logging and tests
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SearchSummary {
	/// Number of entries streamed
	pub entries: usize,
	/// Object types whose branch failed
	pub failed: Vec<String>,
}

/// Tracks the object types of a search that have not reported yet
#[derive(Debug)]
pub struct CompletionTracker {
	/// Object types still running
	pending: Mutex<HashSet<String>>,
	/// Set once the response has been finalized
	finalized: AtomicBool,
}

impl CompletionTracker {
	/// Start tracking `scope`
	#[must_use]
	pub fn new(scope: impl IntoIterator<Item = String>) -> Self {
		Self { pending: Mutex::new(scope.into_iter().collect()), finalized: AtomicBool::new(false) }
	}

	/// Mark an object type as done. Returns `true` for exactly one call: the
	/// one that empties the pending set.
	pub fn complete(&self, object_type: &str) -> bool {
		let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
		pending.remove(object_type);
		pending.is_empty() && self.claim_finalization()
	}

	/// Finalize a search that has nothing pending. Returns `true` if this
	/// call performed the finalization.
	pub fn finalize_if_idle(&self) -> bool {
		let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
		pending.is_empty() && self.claim_finalization()
	}

	/// Whether the response has been finalized
	#[must_use]
	pub fn is_finalized(&self) -> bool {
		self.finalized.load(Ordering::SeqCst)
	}

	/// Flip the finalized flag, reporting whether this call flipped it
	fn claim_finalization(&self) -> bool {
		!self.finalized.swap(true, Ordering::SeqCst)
	}
}

/// A sink guarded by a completion tracker
struct Response<'a> {
	/// Where entries go
	sink: &'a dyn EntrySink,
	/// Completion of the fan-out
	tracker: CompletionTracker,
	/// Object types whose branch failed
	failed: Mutex<Vec<String>>,
}

impl Response<'_> {
	/// Stream an entry unless the response is already finalized
	fn send(&self, entry: DirectoryEntry) {
		if self.tracker.is_finalized() {
			tracing::warn!(dn = %entry.dn, "Dropping entry after the response was finalized");
			return;
		}
		self.sink.send(entry);
	}

	/// Report an object type as done
	fn complete(&self, object_type: &str, succeeded: bool) {
		if !succeeded {
			self.failed.lock().unwrap_or_else(PoisonError::into_inner).push(object_type.to_owned());
		}
		if self.tracker.complete(object_type) {
			let failed = self.failed.lock().unwrap_or_else(PoisonError::into_inner);
			self.sink.end(&failed);
		}
	}
}

/// One object type's share of a search
struct Branch<'a> {
	/// The object type queried
	mapping: &'a ObjectTypeMapping,
	/// Compiled ` WHERE ...` clause, possibly empty
	where_clause: String,
}

impl<'a> Branch<'a> {
	/// Prepare the branch for an object type
	fn new(mapping: &'a ObjectTypeMapping, filter: &Filter) -> Self {
		Self { mapping, where_clause: where_clause(&compile(mapping, filter)) }
	}
}

/// Fields to select for a search: `id`, then the requested attributes mapped
/// to fields the object type actually has. No requested attributes, or `*`,
/// selects every known field.
#[must_use]
pub fn field_list(mapping: &ObjectTypeMapping, requested: &[String], known: &FieldSet) -> Vec<String> {
	let everything = requested.is_empty() || requested.iter().any(|attribute| attribute == "*");
	let candidates: Vec<String> = if everything {
		known.iter().cloned().collect()
	} else {
		requested.iter().map(|attribute| mapping.forward(attribute)).collect()
	};

	std::iter::once(ID_FIELD.to_owned())
		.chain(candidates.into_iter().filter(|field| known.contains(field)))
		.unique()
		.collect()
}

/// Assemble the query for an object type
#[must_use]
pub fn build_query(object_type: &str, fields: &[String], where_clause: &str) -> String {
	format!("SELECT {} FROM {object_type}{where_clause}", fields.join(","))
}

/// Translates directory searches into remote queries
#[derive(Debug, Clone)]
pub struct Gateway {
	/// Object type mappings shared by all connections
	mapping: Arc<MappingTable>,
	/// Entry naming
	projector: Projector,
}

impl Gateway {
	/// Create a gateway over a mapping table
	#[must_use]
	pub fn new(mapping: Arc<MappingTable>, projector: Projector) -> Self {
		Self { mapping, projector }
	}

	/// The mapping table
	#[must_use]
	pub fn mapping(&self) -> &MappingTable {
		&self.mapping
	}

	/// The entry projector
	#[must_use]
	pub fn projector(&self) -> &Projector {
		&self.projector
	}

	/// Object types a search below `base` covers.
	///
	/// An `ou` as the most specific RDN names a single object type in its
	/// plural, capitalized form (`ou=Contacts`); unknown names cover
	/// nothing. Any other base covers every configured object type.
	pub fn resolve_scope(&self, base: &str) -> Result<Vec<&ObjectTypeMapping>> {
		let dn = DistinguishedName::parse(base)?;
		match dn.first() {
			Some((attribute, value)) if attribute.eq_ignore_ascii_case("ou") => {
				let lowered = value.to_lowercase();
				let object_type = lowered.strip_suffix('s').unwrap_or(&lowered);
				Ok(self.mapping.get(object_type).into_iter().collect())
			}
			_ => Ok(self.mapping.object_types().collect()),
		}
	}

	/// Run a search, streaming entries into `sink` and finalizing it once
	/// every object type in scope has reported.
	///
	/// Errors are only returned for failures before the fan-out starts, in
	/// which case `sink` is left untouched. Failed branches are logged, handed
	/// to the sink's `end` and listed in the summary.
	#[tracing::instrument(skip_all, fields(base = %request.base))]
	pub async fn search(
		&self,
		session: &Session,
		schema: &SchemaCache,
		request: &SearchRequest,
		sink: &dyn EntrySink,
	) -> Result<SearchSummary> {
		let scope = self.resolve_scope(&request.base)?;
		tracing::debug!(
			scope = ?scope.iter().map(|mapping| mapping.name()).collect::<Vec<_>>(),
			"Resolved search scope"
		);

		let response = Response {
			sink,
			tracker: CompletionTracker::new(scope.iter().map(|mapping| mapping.name().to_owned())),
			failed: Mutex::new(Vec::new()),
		};
		if response.tracker.finalize_if_idle() {
			sink.end(&[]);
			return Ok(SearchSummary::default());
		}

		let skipped_errors = &SkippedErrors::new();
		let response = &response;
		let branches = scope.into_iter().map(|mapping| Branch::new(mapping, &request.filter));
		let outcomes = join_all(branches.map(|branch| async move {
			let object_type = branch.mapping.name();
			let outcome = self.run_branch(&branch, session, schema, request, response).await;
			if let Err(err) = &outcome {
				skipped_errors.notify_error(format!("Query for `{object_type}` failed: {err}"));
			}
			response.complete(object_type, outcome.is_ok());
			(object_type, outcome)
		}))
		.await;

		let mut summary = SearchSummary::default();
		for (object_type, outcome) in outcomes {
			match outcome {
				Ok(delivered) => summary.entries += delivered,
				Err(_) => summary.failed.push(object_type.to_owned()),
			}
		}
		tracing::info!(
			entries = summary.entries,
			failed = skipped_errors.count(),
			"Search completed"
		);
		Ok(summary)
	}

	/// Query one object type and stream its entries
	#[tracing::instrument(skip_all, fields(object_type = branch.mapping.name()))]
	async fn run_branch(
		&self,
		branch: &Branch<'_>,
		session: &Session,
		schema: &SchemaCache,
		request: &SearchRequest,
		response: &Response<'_>,
	) -> Result<usize> {
		let object_type = branch.mapping.name();
		let known = schema.ensure(object_type, || session.describe(object_type)).await?;
		let fields = field_list(branch.mapping, &request.attributes, &known);
		let query = build_query(object_type, &fields, &branch.where_clause);
		tracing::debug!(%query, "Issuing query");

		let mut page = session.query(&query).await?;
		let mut delivered = 0;
		loop {
			for record in &page.records {
				response.send(self.projector.project(branch.mapping, record));
				delivered += 1;
			}
			let Some(next) = page.next_records_url.take().filter(|_| !page.done) else {
				break;
			};
			page = session.query_more(&next).await?;
		}
		Ok(delivered)
	}
}
