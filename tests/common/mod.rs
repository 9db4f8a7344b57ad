//! Common test helpers

#![cfg(test)]
#![allow(clippy::expect_used, dead_code)]

use std::{io::Write, net::SocketAddr, sync::Arc};

use indoc::{formatdoc, indoc};
use ldap3::{Ldap, LdapConnAsync};
use ldap_rest_gateway::{Config, build_server};
use serde_json::{Value, json};
use tempfile::NamedTempFile;
use tokio::net::TcpListener;
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{body_string_contains, header, method, path, query_param},
};

/// Mapping document used by the integration tests
pub const MAPPINGS: &str = indoc! {r#"
	{
		"contact": {
			"objectclasses": ["top", "person", "organizationalPerson", "inetOrgPerson"],
			"mappings": { "mail": "email", "sn": "lastname", "givenname": "firstname" }
		},
		"user": {
			"objectclasses": ["top", "person"],
			"mappings": { "mail": "email", "uid": "username" }
		}
	}
"#};

/// Password the mocked token endpoint accepts
pub const PASSWORD: &str = "secret";

/// Bind DN of the test user
pub const BIND_DN: &str = "username=alice@example.com, dc=salesforce, dc=com";

/// Path of the mocked query endpoint
pub const QUERY_PATH: &str = "/services/data/v22.0/query/";

/// Mocked login server and REST API
pub struct Remote {
	/// The wiremock server playing both roles
	pub server: MockServer,
}

impl Remote {
	/// Start a remote that hands out `token-1` for the test password
	pub async fn start() -> Self {
		let remote = Self { server: MockServer::start().await };
		remote.issue_tokens(&["token-1"]).await;
		Mock::given(method("POST"))
			.and(path("/services/oauth2/token"))
			.respond_with(ResponseTemplate::new(400).set_body_json(json!({
				"error": "invalid_grant",
				"error_description": "authentication failure"
			})))
			.with_priority(u8::MAX)
			.mount(&remote.server)
			.await;
		remote
	}

	/// Issue `tokens` in order, one per successful login
	pub async fn issue_tokens(&self, tokens: &[&str]) {
		for (n, token) in tokens.iter().enumerate() {
			let priority = u8::try_from(n + 1).expect("few tokens");
			Mock::given(method("POST"))
				.and(path("/services/oauth2/token"))
				.and(body_string_contains(format!("password={PASSWORD}")))
				.respond_with(ResponseTemplate::new(200).set_body_json(json!({
					"access_token": token,
					"instance_url": self.server.uri(),
					"token_type": "Bearer"
				})))
				.with_priority(priority)
				.up_to_n_times(1)
				.mount(&self.server)
				.await;
		}
	}

	/// Serve the fields of an object type
	pub async fn describe(&self, object_type: &str, fields: &[&str]) {
		let fields: Vec<Value> =
			fields.iter().map(|name| json!({ "name": name, "type": "string" })).collect();
		Mock::given(method("GET"))
			.and(path(format!("/services/data/v22.0/sobjects/{object_type}/describe/")))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "fields": fields })))
			.mount(&self.server)
			.await;
	}

	/// Answer `query` with `records` when sent with `token`
	pub async fn query(&self, query: &str, token: &str, records: Value) {
		Mock::given(method("GET"))
			.and(path(QUERY_PATH))
			.and(query_param("q", query))
			.and(header("Authorization", format!("OAuth {token}").as_str()))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"totalSize": records.as_array().map_or(0, Vec::len),
				"done": true,
				"records": records
			})))
			.mount(&self.server)
			.await;
	}

	/// Reject every request made with `token` as an expired session
	pub async fn expire(&self, token: &str) {
		Mock::given(method("GET"))
			.and(header("Authorization", format!("OAuth {token}").as_str()))
			.respond_with(ResponseTemplate::new(401).set_body_json(json!([{
				"message": "Session expired or invalid",
				"errorCode": "INVALID_SESSION_ID"
			}])))
			.with_priority(1)
			.mount(&self.server)
			.await;
	}

	/// Every query string received, in order
	pub async fn queries(&self) -> Vec<String> {
		self.server
			.received_requests()
			.await
			.expect("request recording is enabled")
			.into_iter()
			.filter(|request| request.url.path() == QUERY_PATH)
			.filter_map(|request| {
				request.url.query_pairs().find(|(key, _)| key == "q").map(|(_, q)| q.into_owned())
			})
			.collect()
	}
}

/// Write the mapping document to a temporary file
pub fn mappings_file() -> NamedTempFile {
	let mut file = NamedTempFile::new().expect("temp file");
	file.write_all(MAPPINGS.as_bytes()).expect("write mappings");
	file
}

/// Gateway configuration pointing at `remote`
pub fn config(remote: &Remote, mappings: &NamedTempFile) -> Config {
	serde_yaml::from_str(&formatdoc! {r#"
		listen: 127.0.0.1:0
		mappings_file: {mappings}
		remote:
		  login_server: {login_server}
		  client_id: gateway
		  client_secret: client-secret
		  timeout: 5
		log_level: debug
	"#,
		mappings = mappings.path().display(),
		login_server = remote.server.uri(),
	})
	.expect("valid config")
}

/// Start a gateway on an ephemeral port
pub async fn spawn_gateway(config: &Config) -> SocketAddr {
	let server = Arc::new(build_server(config).expect("gateway starts"));
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
	let address = listener.local_addr().expect("listener address");
	tokio::spawn(server.serve(listener));
	address
}

/// Connect a directory client to the gateway
pub async fn connect(address: SocketAddr) -> Ldap {
	let (conn, ldap) =
		LdapConnAsync::new(&format!("ldap://{address}")).await.expect("could not connect");
	ldap3::drive!(conn);
	ldap
}
