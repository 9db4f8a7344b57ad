//! Authenticated sessions against the remote API.
//!
//! A session is established by a successful bind and lives as long as the
//! directory connection. Calls that the remote API rejects as unauthorized
//! are retried exactly once after the token has been refreshed.

use std::{
	fmt,
	future::Future,
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use url::Url;

use crate::{
	config::RemoteConfig,
	err::{Error, Result},
	rest::{DescribeResponse, QueryResponse, RemoteApi},
};

/// Path of the token endpoint below the login server
const TOKEN_PATH: &str = "/services/oauth2/token";

/// Username and password presented by the directory client
#[derive(Clone)]
pub struct Credentials {
	/// Remote API username
	pub username: String,
	/// Remote API password
	pub password: String,
}

impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credentials")
			.field("username", &self.username)
			.field("password", &"<redacted>")
			.finish()
	}
}

/// Token granted by the issuer
#[derive(Clone, Deserialize, PartialEq)]
pub struct AccessToken {
	/// Bearer token for the remote API
	pub access_token: String,
	/// Base URL of the API instance serving this session
	pub instance_url: Url,
}

impl fmt::Debug for AccessToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("AccessToken")
			.field("access_token", &"<redacted>")
			.field("instance_url", &self.instance_url.as_str())
			.finish()
	}
}

/// Trades credentials for an access token
#[async_trait]
pub trait TokenIssuer: Send + Sync {
	/// Authenticate with the given credentials
	async fn authenticate(&self, credentials: &Credentials) -> Result<AccessToken>;
}

/// OAuth password-grant token issuer
#[derive(Debug, Clone)]
pub struct OAuthIssuer {
	/// The HTTP client
	http: reqwest::Client,
	/// Login server and client registration
	config: RemoteConfig,
}

impl OAuthIssuer {
	/// Create an issuer for the configured login server
	pub fn new(config: RemoteConfig) -> Result<Self> {
		let mut builder = reqwest::Client::builder();
		if let Some(timeout) = config.timeout {
			builder = builder.timeout(std::time::Duration::from_secs(timeout));
		}
		Ok(Self { http: builder.build()?, config })
	}
}

#[async_trait]
impl TokenIssuer for OAuthIssuer {
	#[tracing::instrument(skip_all, fields(username = %credentials.username))]
	async fn authenticate(&self, credentials: &Credentials) -> Result<AccessToken> {
		let url = self.config.login_server.join(TOKEN_PATH)?;
		let response = self
			.http
			.post(url)
			.form(&[
				("grant_type", "password"),
				("client_id", self.config.client_id.as_str()),
				("client_secret", self.config.client_secret.as_str()),
				("username", credentials.username.as_str()),
				("password", credentials.password.as_str()),
			])
			.send()
			.await?;

		let status = response.status();
		let body = response.bytes().await?;
		if !status.is_success() {
			return Err(Error::Authentication(format!(
				"token endpoint responded with status {status}: {}",
				String::from_utf8_lossy(&body)
			)));
		}
		Ok(serde_json::from_slice(&body)?)
	}
}

/// An authenticated session bound to one directory connection
pub struct Session {
	/// Current token, replaced in place on refresh
	token: RwLock<AccessToken>,
	/// Credentials used for the initial exchange and for refreshes
	credentials: Credentials,
	/// Issuer used to refresh the token; without one, no retry happens
	issuer: Option<Arc<dyn TokenIssuer>>,
	/// The remote API
	api: Arc<dyn RemoteApi>,
	/// Set once the issuer rejected a refresh
	revoked: AtomicBool,
}

impl fmt::Debug for Session {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Session")
			.field("credentials", &self.credentials)
			.field("refreshable", &self.issuer.is_some())
			.field("revoked", &self.is_revoked())
			.finish_non_exhaustive()
	}
}

impl Session {
	/// Exchange the credentials for a token and open a refreshable session
	#[tracing::instrument(skip_all, fields(username = %credentials.username))]
	pub async fn establish(
		issuer: Arc<dyn TokenIssuer>,
		api: Arc<dyn RemoteApi>,
		credentials: Credentials,
	) -> Result<Self> {
		let token = issuer.authenticate(&credentials).await?;
		tracing::info!(instance = %token.instance_url, "Session established");
		Ok(Self::new(token, credentials, Some(issuer), api))
	}

	/// Wrap an existing token. Without an issuer the session is never
	/// refreshed.
	pub fn new(
		token: AccessToken,
		credentials: Credentials,
		issuer: Option<Arc<dyn TokenIssuer>>,
		api: Arc<dyn RemoteApi>,
	) -> Self {
		Self { token: RwLock::new(token), credentials, issuer, api, revoked: AtomicBool::new(false) }
	}

	/// Whether the issuer rejected the credentials on refresh. A revoked
	/// session is never refreshed again.
	#[must_use]
	pub fn is_revoked(&self) -> bool {
		self.revoked.load(Ordering::SeqCst)
	}

	/// The token currently in use
	pub async fn access_token(&self) -> AccessToken {
		self.token.read().await.clone()
	}

	/// Run a remote call, refreshing the token and re-issuing the call once
	/// if the remote API reports the session as invalid.
	pub async fn with_refresh<T, F, Fut>(&self, call: F) -> Result<T>
	where
		F: Fn(AccessToken) -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let token = self.access_token().await;
		match call(token.clone()).await {
			Err(err) if err.is_session_invalid() && self.issuer.is_some() => {
				tracing::warn!("Remote session is invalid, refreshing once");
				let refreshed = self.refresh(&token).await?;
				call(refreshed).await
			}
			result => result,
		}
	}

	/// Replace `stale` with a fresh token.
	///
	/// If another call already replaced `stale`, its token is reused.
	async fn refresh(&self, stale: &AccessToken) -> Result<AccessToken> {
		let Some(issuer) = self.issuer.as_ref().filter(|_| !self.is_revoked()) else {
			return Err(Error::SessionInvalid);
		};

		let mut token = self.token.write().await;
		if token.access_token != stale.access_token {
			return Ok(token.clone());
		}

		let fresh = issuer.authenticate(&self.credentials).await.inspect_err(|err| {
			tracing::error!("Failed to refresh remote session: {err}");
			// Transport failures may be retried by the next call
			if matches!(err, Error::Authentication(_)) {
				self.revoked.store(true, Ordering::SeqCst);
			}
		})?;
		tracing::info!("Refreshed remote session");
		*token = fresh.clone();
		Ok(fresh)
	}

	/// Describe an object type
	pub async fn describe(&self, object_type: &str) -> Result<DescribeResponse> {
		let api = &self.api;
		self.with_refresh(move |token| async move { api.describe(&token, object_type).await }).await
	}

	/// Run a query
	pub async fn query(&self, query: &str) -> Result<QueryResponse> {
		let api = &self.api;
		self.with_refresh(move |token| async move { api.query(&token, query).await }).await
	}

	/// Fetch a follow-up page of a query
	pub async fn query_more(&self, next_records_url: &str) -> Result<QueryResponse> {
		let api = &self.api;
		self.with_refresh(move |token| async move { api.query_more(&token, next_records_url).await })
			.await
	}
}

/// Authentication state of a directory connection
#[derive(Debug, Default)]
pub enum SessionState {
	/// No bind has been attempted yet
	#[default]
	Unauthenticated,
	/// The last bind succeeded
	Authenticated(Arc<Session>),
	/// The last bind was rejected, or its session could not be refreshed
	Failed,
}

impl SessionState {
	/// The session, if the connection is authenticated
	#[must_use]
	pub fn session(&self) -> Option<&Arc<Session>> {
		match self {
			Self::Authenticated(session) => Some(session),
			Self::Unauthenticated | Self::Failed => None,
		}
	}

	/// Drop a session the issuer no longer accepts
	pub fn expire_revoked(&mut self) {
		if self.session().is_some_and(|session| session.is_revoked()) {
			tracing::warn!("Remote session was revoked, client must bind again");
			*self = Self::Failed;
		}
	}
}
