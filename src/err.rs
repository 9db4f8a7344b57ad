//! Error taxonomy shared by the translation core.

use thiserror::Error;

/// Errors raised while translating directory operations into remote calls
#[derive(Debug, Error)]
pub enum Error {
	/// The mapping or process configuration is unusable
	#[error("invalid configuration: {0}")]
	Config(String),
	/// The token issuer rejected the credentials
	#[error("authentication against the token issuer failed: {0}")]
	Authentication(String),
	/// The remote API rejected the access token
	#[error("remote session is invalid or expired")]
	SessionInvalid,
	/// The remote API answered with a non-success status
	#[error("remote API responded with status {status}: {body}")]
	Remote {
		/// HTTP status code
		status: u16,
		/// Response body as returned by the API
		body: String,
	},
	/// The HTTP request could not be performed
	#[error("HTTP transport failure")]
	Transport(#[from] reqwest::Error),
	/// A remote response did not have the expected shape
	#[error("failed to decode remote response")]
	Decode(#[from] serde_json::Error),
	/// A remote URL could not be built
	#[error("invalid remote URL")]
	Url(#[from] url::ParseError),
	/// A distinguished name could not be parsed
	#[error("malformed distinguished name `{0}`")]
	InvalidDn(String),
	/// A distinguished name lies outside the served suffix
	#[error("`{0}` is not below the served suffix")]
	OutsideSuffix(String),
	/// The filter uses a construct that has no query equivalent
	#[error("unsupported filter: {0}")]
	UnsupportedFilter(String),
	/// The operation requires an authenticated session
	#[error("operation requires a successful bind")]
	NotBound,
}

impl Error {
	/// Whether the error means the remote session has to be renewed
	#[must_use]
	pub fn is_session_invalid(&self) -> bool {
		matches!(self, Self::SessionInvalid)
	}
}

/// Result alias for the translation core
pub type Result<T> = std::result::Result<T, Error>;
