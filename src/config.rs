//! Gateway configuration.

use std::{
	net::{Ipv4Addr, SocketAddr},
	path::{Path, PathBuf},
};

use anyhow_ext::{Context, Result};
use serde::Deserialize;
use url::Url;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "LDAP_GATEWAY_CONFIG";

/// Prefix of environment variables overriding configuration values
const ENV_PREFIX: &str = "LDAP_GATEWAY";

/// Port served when none is configured
const DEFAULT_PORT: u16 = 1389;

/// Configuration of the gateway process
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
	/// Address the directory listener binds to
	#[serde(default = "default_listen")]
	pub listen: SocketAddr,
	/// Directory suffix under which entries are published
	#[serde(default = "default_suffix")]
	pub suffix: String,
	/// Prefix of the object class tagging each entry's remote object type
	#[serde(default = "default_origin_class_prefix")]
	pub origin_class_prefix: String,
	/// JSON document mapping object types to directory attributes
	pub mappings_file: PathBuf,
	/// Remote API settings
	pub remote: RemoteConfig,
	/// Optional log level
	pub log_level: Option<String>,
}

/// Login server and client registration of the remote API
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RemoteConfig {
	/// Server issuing access tokens
	pub login_server: Url,
	/// OAuth client identifier
	pub client_id: String,
	/// OAuth client secret
	pub client_secret: String,
	/// REST API version, e.g. `22.0`
	#[serde(default = "default_api_version")]
	pub api_version: String,
	/// Timeout for remote requests in seconds
	#[serde(default)]
	pub timeout: Option<u64>,
}

/// Listen on all interfaces
fn default_listen() -> SocketAddr {
	SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT))
}

/// Suffix served by default
fn default_suffix() -> String {
	"dc=salesforce, dc=com".to_owned()
}

/// Prefix of the origin object class
fn default_origin_class_prefix() -> String {
	"salesforce".to_owned()
}

/// Oldest REST API version providing the used endpoints
fn default_api_version() -> String {
	"22.0".to_owned()
}

impl Config {
	/// Load the configuration from a YAML file, with environment variables
	/// taking precedence
	pub fn new(path: &Path) -> Result<Self> {
		let config = config::Config::builder()
			.add_source(config::File::from(path).required(false))
			.add_source(
				config::Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true),
			)
			.build()
			.context("Failed to read configuration")?;

		config.try_deserialize().context("Failed to parse configuration")
	}
}
