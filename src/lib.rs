//! LDAP gateway in front of a REST object store.
//!
//! Directory clients bind and search as they would against an LDAP server.
//! Every search is compiled into one query per object type in scope, and the
//! returned records are reshaped into directory entries.
use std::sync::{
	Arc,
	atomic::{AtomicUsize, Ordering},
};

use anyhow_ext::{Context, Result};

pub mod config;
pub mod dn;
pub mod entry;
pub mod err;
pub mod filter;
pub mod mapping;
pub mod rest;
pub mod schema;
pub mod search;
pub mod server;
pub mod session;

pub use config::{Config, RemoteConfig};
pub use mapping::MappingTable;
pub use rest::{RemoteApi, RestClient};
pub use search::Gateway;
pub use server::Server;
pub use session::{OAuthIssuer, TokenIssuer};

use crate::entry::Projector;

/// Assemble the gateway from its configuration
#[anyhow_trace::anyhow_trace]
pub fn build_server(config: &Config) -> Result<Server> {
	let mapping = MappingTable::load(&config.mappings_file).context(format!(
		"Failed to load object type mappings from {}",
		config.mappings_file.display()
	))?;
	tracing::info!(object_types = mapping.len(), "Loaded object type mappings");

	let gateway = Gateway::new(
		Arc::new(mapping),
		Projector::new(config.suffix.clone(), config.origin_class_prefix.clone()),
	);
	let api: Arc<dyn RemoteApi> = Arc::new(RestClient::new(&config.remote)?);
	let issuer: Arc<dyn TokenIssuer> = Arc::new(OAuthIssuer::new(config.remote.clone())?);

	Server::new(Arc::new(gateway), issuer, api)
}

/// Run the gateway until the listener fails
#[anyhow_trace::anyhow_trace]
pub async fn run(config: Config) -> Result<()> {
	let server = Arc::new(build_server(&config)?);
	server.listen(config.listen).await
}

/// Counter of errors that were logged and skipped instead of aborting an
/// operation
#[derive(Debug)]
pub struct SkippedErrors(AtomicUsize);

#[allow(missing_docs, clippy::new_without_default)]
impl SkippedErrors {
	#[must_use]
	pub fn new() -> Self {
		Self(AtomicUsize::new(0))
	}
	pub fn notify_error(&self, err: impl AsRef<str>) {
		self.0.fetch_add(1, Ordering::Relaxed);
		tracing::error!("{}", err.as_ref());
	}
	#[must_use]
	pub fn count(&self) -> usize {
		self.0.load(Ordering::Relaxed)
	}
}
