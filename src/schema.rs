//! Per-connection cache of the remote fields known for each object type.

use std::{
	collections::HashMap,
	future::Future,
	sync::{Arc, Mutex, PoisonError},
};

use indexmap::IndexSet;
use tokio::sync::OnceCell;

use crate::{err::Result, rest::DescribeResponse};

/// Lower-cased field names of an object type, in describe order
pub type FieldSet = IndexSet<String>;

/// Lazily populated field names, one entry per object type.
///
/// Entries are populated at most once per connection. Concurrent requests
/// for the same object type wait for a single describe call; a failed
/// describe leaves the entry empty so the next request tries again.
#[derive(Debug, Default)]
pub struct SchemaCache {
	/// Cells by object type
	entries: Mutex<HashMap<String, Arc<OnceCell<Arc<FieldSet>>>>>,
}

impl SchemaCache {
	/// Create an empty cache
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// The cell for an object type, created on first use
	fn cell(&self, object_type: &str) -> Arc<OnceCell<Arc<FieldSet>>> {
		self.entries
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.entry(object_type.to_owned())
			.or_default()
			.clone()
	}

	/// Fields of an object type, if already known
	#[must_use]
	pub fn cached(&self, object_type: &str) -> Option<Arc<FieldSet>> {
		self.entries
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.get(object_type)
			.and_then(|cell| cell.get().cloned())
	}

	/// Fields of an object type, calling `describe` if they are not known yet
	pub async fn ensure<F, Fut>(&self, object_type: &str, describe: F) -> Result<Arc<FieldSet>>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<DescribeResponse>>,
	{
		let cell = self.cell(object_type);
		if let Some(fields) = cell.get() {
			return Ok(fields.clone());
		}

		cell.get_or_try_init(move || async move {
			let response = describe().await?;
			let fields: FieldSet =
				response.fields.into_iter().map(|field| field.name.to_lowercase()).collect();
			tracing::debug!(object_type, count = fields.len(), "Cached object fields");
			Ok(Arc::new(fields))
		})
		.await
		.cloned()
	}
}
