//! Serves directory clients from the configured REST object store.
use std::{path::Path, str::FromStr};

use anyhow_ext::{Context, Result};
use ldap_rest_gateway::{Config, config::CONFIG_PATH_ENV};
use tracing::level_filters::LevelFilter;

#[tokio::main]
#[anyhow_trace::anyhow_trace]
async fn main() -> Result<()> {
	// Config
	let config_path =
		std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "./config.yaml".to_owned());
	let config = Config::new(Path::new(&config_path))?;

	// Tracing
	let subscriber = tracing_subscriber::FmtSubscriber::builder()
		.with_max_level(
			config
				.log_level
				.as_ref()
				.map_or(Ok(LevelFilter::INFO), |s| LevelFilter::from_str(s))?,
		)
		.finish();
	tracing::subscriber::set_global_default(subscriber)
		.context("Setting default tracing subscriber failed")?;

	tracing::info!(listen = %config.listen, suffix = %config.suffix, "Starting gateway");
	ldap_rest_gateway::run(config).await
}
