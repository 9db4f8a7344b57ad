//! LDAP listener translating protocol operations into gateway calls.

use std::{net::SocketAddr, sync::Arc};

use anyhow_ext::{Context, Result};
use futures::{SinkExt, StreamExt};
use ldap3_proto::{
	LdapCodec,
	proto::{
		LdapBindCred, LdapBindRequest, LdapBindResponse, LdapExtendedResponse, LdapFilter, LdapMsg,
		LdapOp, LdapPartialAttribute, LdapResult, LdapResultCode, LdapSearchRequest,
		LdapSearchResultEntry,
	},
};
use tokio::{
	io::AsyncWrite,
	net::{TcpListener, TcpStream},
	sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::Instrument;

use crate::{
	dn::DistinguishedName,
	entry::DirectoryEntry,
	err::{self, Error},
	filter::Filter,
	rest::RemoteApi,
	schema::SchemaCache,
	search::{EntrySink, Gateway, SearchRequest},
	session::{Credentials, Session, SessionState, TokenIssuer},
};

/// Per-connection state
#[derive(Debug, Default)]
struct Connection {
	/// Result of the last bind
	state: SessionState,
	/// Fields known per object type, reset on every bind
	schema: SchemaCache,
}

/// Directory server in front of the gateway
pub struct Server {
	/// Search translation shared by all connections
	gateway: Arc<Gateway>,
	/// Exchanges bind credentials for access tokens
	issuer: Arc<dyn TokenIssuer>,
	/// Remote API used by the sessions
	api: Arc<dyn RemoteApi>,
	/// Suffix every search base must lie within
	suffix: DistinguishedName,
}

impl std::fmt::Debug for Server {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Server").field("suffix", &self.suffix).finish_non_exhaustive()
	}
}

impl Server {
	/// Create a server for the gateway's suffix
	pub fn new(
		gateway: Arc<Gateway>,
		issuer: Arc<dyn TokenIssuer>,
		api: Arc<dyn RemoteApi>,
	) -> Result<Self> {
		let suffix = DistinguishedName::parse(gateway.projector().suffix())
			.context("Configured suffix is not a valid DN")?;
		Ok(Self { gateway, issuer, api, suffix })
	}

	/// Bind to `address` and serve clients until the listener fails
	pub async fn listen(self: Arc<Self>, address: SocketAddr) -> Result<()> {
		let listener = TcpListener::bind(address)
			.await
			.context(format!("Failed to listen on {address}"))?;
		self.serve(listener).await
	}

	/// Serve clients connecting to `listener`, one task per connection
	pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
		tracing::info!(address = %listener.local_addr()?, "Accepting directory clients");
		loop {
			let (stream, peer) = match listener.accept().await {
				Ok(accepted) => accepted,
				Err(err) => {
					tracing::warn!("Failed to accept connection: {err}");
					continue;
				}
			};

			let server = Arc::clone(&self);
			tokio::spawn(
				async move {
					tracing::debug!("Client connected");
					match server.handle_connection(stream).await {
						Ok(()) => tracing::debug!("Client disconnected"),
						Err(err) => tracing::warn!("Connection closed: {err:?}"),
					}
				}
				.instrument(tracing::info_span!("connection", %peer)),
			);
		}
	}

	/// Process the operations of one client until it unbinds or hangs up
	async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
		let (reader, writer) = tokio::io::split(stream);
		let mut requests = FramedRead::new(reader, LdapCodec::default());
		let (responses, outbox) = unbounded_channel();
		let writer = tokio::spawn(write_responses(FramedWrite::new(writer, LdapCodec::default()), outbox));

		let mut connection = Connection::default();
		while let Some(message) = requests.next().await {
			let message = message.context("Failed to decode request")?;
			if !self.dispatch(&mut connection, message, &responses).await {
				break;
			}
		}

		drop(responses);
		writer.await.context("Response writer panicked")?
	}

	/// Answer one operation. Returns `false` once the client has unbound.
	async fn dispatch(
		&self,
		connection: &mut Connection,
		message: LdapMsg,
		responses: &UnboundedSender<LdapMsg>,
	) -> bool {
		let LdapMsg { msgid, op, .. } = message;
		let reply = |op| {
			if responses.send(LdapMsg { msgid, op, ctrl: vec![] }).is_err() {
				tracing::debug!("Client went away before the response was sent");
			}
		};

		match op {
			LdapOp::BindRequest(request) => {
				let res = self.bind(connection, &request).await;
				reply(LdapOp::BindResponse(LdapBindResponse { res, saslcreds: None }));
			}
			LdapOp::SearchRequest(request) => {
				let sink = ResponseSink {
					msgid,
					attributes: request.attrs.clone(),
					responses: responses.clone(),
				};
				self.search(connection, &request, &sink).await;
				connection.state.expire_revoked();
			}
			LdapOp::UnbindRequest => {
				connection.state = SessionState::Unauthenticated;
				return false;
			}
			other => {
				tracing::debug!(?other, "Unsupported operation");
				reply(LdapOp::ExtendedResponse(LdapExtendedResponse {
					res: ldap_result(LdapResultCode::UnwillingToPerform),
					name: None,
					value: None,
				}));
			}
		}
		true
	}

	/// Establish a session for the bind credentials
	#[tracing::instrument(skip_all, fields(dn = %request.dn))]
	async fn bind(&self, connection: &mut Connection, request: &LdapBindRequest) -> LdapResult {
		match self.authenticate(request).await {
			Ok(session) => {
				tracing::info!("Bind succeeded");
				connection.state = SessionState::Authenticated(Arc::new(session));
				connection.schema = SchemaCache::new();
				ldap_result(LdapResultCode::Success)
			}
			Err(err) => {
				tracing::warn!("Bind rejected: {err}");
				connection.state = SessionState::Failed;
				ldap_result(LdapResultCode::InvalidCredentials)
			}
		}
	}

	/// Exchange simple bind credentials for a session. The bind DN must lie
	/// below the suffix and its first RDN's value is the username.
	async fn authenticate(&self, request: &LdapBindRequest) -> err::Result<Session> {
		#[allow(unreachable_patterns)]
		let password = match &request.cred {
			LdapBindCred::Simple(password) => password,
			_ => return Err(Error::Authentication("only simple binds are supported".to_owned())),
		};
		let dn = DistinguishedName::parse(&request.dn)
			.map_err(|err| Error::Authentication(err.to_string()))?;
		if dn.is_empty() {
			return Err(Error::Authentication("anonymous binds are not supported".to_owned()));
		}
		if dn.len() <= self.suffix.len() || !dn.is_within(&self.suffix) {
			return Err(Error::Authentication(format!("{} is not below the suffix", request.dn)));
		}
		let Some((_, username)) = dn.first().filter(|(_, username)| !username.is_empty()) else {
			return Err(Error::Authentication("anonymous binds are not supported".to_owned()));
		};
		if password.is_empty() {
			return Err(Error::Authentication("empty password".to_owned()));
		}

		let credentials =
			Credentials { username: username.to_owned(), password: password.clone() };
		Session::establish(self.issuer.clone(), self.api.clone(), credentials).await
	}

	/// Run a search, answering with an error result if it fails before any
	/// entry was streamed
	#[tracing::instrument(skip_all, fields(base = %request.base))]
	async fn search(&self, connection: &Connection, request: &LdapSearchRequest, sink: &ResponseSink) {
		if let Err(err) = self.try_search(connection, request, sink).await {
			tracing::warn!("Search failed: {err}");
			sink.done(result_code(&err));
		}
	}

	/// Validate a search and hand it to the gateway
	async fn try_search(
		&self,
		connection: &Connection,
		request: &LdapSearchRequest,
		sink: &ResponseSink,
	) -> err::Result<()> {
		let Some(session) = connection.state.session() else {
			return Err(Error::NotBound);
		};
		if !DistinguishedName::parse(&request.base)?.is_within(&self.suffix) {
			return Err(Error::OutsideSuffix(request.base.clone()));
		}

		let request = SearchRequest {
			base: request.base.clone(),
			filter: Filter::try_from(&request.filter)?,
			attributes: request.attrs.clone(),
		};
		self.gateway.search(session, &connection.schema, &request, sink).await?;
		Ok(())
	}
}

/// Encode queued responses until every sender is gone
async fn write_responses<W>(
	mut framed: FramedWrite<W, LdapCodec>,
	mut outbox: UnboundedReceiver<LdapMsg>,
) -> Result<()>
where
	W: AsyncWrite + Unpin,
{
	while let Some(message) = outbox.recv().await {
		framed.send(message).await.context("Failed to send response")?;
	}
	Ok(())
}

/// Streams search results of one request back to the client
#[derive(Debug)]
struct ResponseSink {
	/// Message ID of the search request
	msgid: i32,
	/// Attributes the client asked for
	attributes: Vec<String>,
	/// Queue of the connection's response writer
	responses: UnboundedSender<LdapMsg>,
}

impl ResponseSink {
	/// Queue a response to the search request
	fn reply(&self, op: LdapOp) {
		if self.responses.send(LdapMsg { msgid: self.msgid, op, ctrl: vec![] }).is_err() {
			tracing::debug!("Client went away before the response was sent");
		}
	}

	/// Finish the search with a result code
	fn done(&self, code: LdapResultCode) {
		self.reply(LdapOp::SearchResultDone(ldap_result(code)));
	}
}

impl EntrySink for ResponseSink {
	fn send(&self, entry: DirectoryEntry) {
		let attributes = entry
			.select(&self.attributes)
			.into_iter()
			.map(|(atype, vals)| LdapPartialAttribute {
				atype,
				vals: vals.into_iter().map(Into::into).collect(),
			})
			.collect();
		self.reply(LdapOp::SearchResultEntry(LdapSearchResultEntry { dn: entry.dn, attributes }));
	}

	fn end(&self, failed: &[String]) {
		if failed.is_empty() {
			self.done(LdapResultCode::Success);
			return;
		}
		let mut res = ldap_result(LdapResultCode::OperationsError);
		res.message = format!("Query failed for {}", failed.join(", "));
		self.reply(LdapOp::SearchResultDone(res));
	}
}

/// A result without details
fn ldap_result(code: LdapResultCode) -> LdapResult {
	LdapResult { code, matcheddn: String::new(), message: String::new(), referral: vec![] }
}

/// Result code reported for a failed operation
fn result_code(err: &Error) -> LdapResultCode {
	match err {
		Error::Authentication(_) => LdapResultCode::InvalidCredentials,
		Error::OutsideSuffix(_) => LdapResultCode::NoSuchObject,
		_ => LdapResultCode::OperationsError,
	}
}

impl TryFrom<&LdapFilter> for Filter {
	type Error = Error;

	fn try_from(filter: &LdapFilter) -> err::Result<Self> {
		let children = |filters: &[LdapFilter]| {
			filters.iter().map(Filter::try_from).collect::<err::Result<Vec<_>>>()
		};

		Ok(match filter {
			LdapFilter::And(filters) => Self::And(children(filters)?),
			LdapFilter::Or(filters) => Self::Or(children(filters)?),
			LdapFilter::Not(filter) => Self::Not(Box::new(Self::try_from(filter.as_ref())?)),
			LdapFilter::Equality(attribute, value) => Self::Equality(attribute.clone(), value.clone()),
			LdapFilter::Approx(attribute, value) => Self::Approx(attribute.clone(), value.clone()),
			LdapFilter::Present(attribute) => Self::Present(attribute.clone()),
			LdapFilter::Substring(attribute, substring) => Self::Substring {
				attribute: attribute.clone(),
				initial: substring.initial.clone(),
				any: substring.any.clone(),
				final_: substring.final_.clone(),
			},
			LdapFilter::GreaterOrEqual(attribute, value) => {
				Self::GreaterOrEqual(attribute.clone(), value.clone())
			}
			LdapFilter::LessOrEqual(attribute, value) => {
				Self::LessOrEqual(attribute.clone(), value.clone())
			}
			#[allow(unreachable_patterns)]
			other => return Err(Error::UnsupportedFilter(format!("{other:?}"))),
		})
	}
}
