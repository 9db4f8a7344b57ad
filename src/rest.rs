//! Client for the remote object store's REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, header};
use serde::{Deserialize, de::DeserializeOwned};
use url::Url;

use crate::{
	config::RemoteConfig,
	err::{Error, Result},
	session::AccessToken,
};

/// A single record as returned by the query endpoint
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Response of the describe endpoint
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DescribeResponse {
	/// Fields known for the object type
	#[serde(default)]
	pub fields: Vec<FieldDescription>,
}

/// Description of a single remote field
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FieldDescription {
	/// Field name as the API spells it
	pub name: String,
	/// Field data type
	#[serde(rename = "type", default)]
	pub field_type: Option<String>,
}

/// One page of query results
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
	/// Whether this is the last page
	#[serde(default = "default_done")]
	pub done: bool,
	/// Location of the next page, if any
	#[serde(default)]
	pub next_records_url: Option<String>,
	/// Records of this page
	#[serde(default)]
	pub records: Vec<Record>,
}

/// Pages without a `done` marker are complete
const fn default_done() -> bool {
	true
}

/// Read access to the remote object store
#[async_trait]
pub trait RemoteApi: Send + Sync {
	/// Describe the fields of an object type
	async fn describe(&self, token: &AccessToken, object_type: &str) -> Result<DescribeResponse>;

	/// Run a query
	async fn query(&self, token: &AccessToken, query: &str) -> Result<QueryResponse>;

	/// Fetch a follow-up page of a previous query
	async fn query_more(&self, token: &AccessToken, next_records_url: &str)
	-> Result<QueryResponse>;
}

/// HTTP implementation of [`RemoteApi`]
#[derive(Debug, Clone)]
pub struct RestClient {
	/// The HTTP client
	http: reqwest::Client,
	/// REST API version, e.g. `22.0`
	api_version: String,
}

impl RestClient {
	/// Create a client for the configured API version
	pub fn new(config: &RemoteConfig) -> Result<Self> {
		let mut builder = reqwest::Client::builder();
		if let Some(timeout) = config.timeout {
			builder = builder.timeout(Duration::from_secs(timeout));
		}
		Ok(Self { http: builder.build()?, api_version: config.api_version.clone() })
	}

	/// Build an API URL below the session's instance
	fn endpoint(&self, token: &AccessToken, path: &str) -> Result<Url> {
		Ok(token.instance_url.join(&format!("/services/data/v{}/{path}", self.api_version))?)
	}

	/// Perform an authenticated GET and decode the JSON body
	async fn get<T: DeserializeOwned>(
		&self,
		token: &AccessToken,
		url: Url,
		query: Option<&str>,
	) -> Result<T> {
		let mut request = self
			.http
			.get(url)
			.header(header::ACCEPT, "application/json")
			.header(header::AUTHORIZATION, format!("OAuth {}", token.access_token));
		if let Some(query) = query {
			request = request.query(&[("q", query)]);
		}

		let response = request.send().await?;
		let status = response.status();
		if status == StatusCode::UNAUTHORIZED {
			tracing::debug!("Remote API rejected the session");
			return Err(Error::SessionInvalid);
		}

		let body = response.bytes().await?;
		if !status.is_success() {
			return Err(Error::Remote {
				status: status.as_u16(),
				body: String::from_utf8_lossy(&body).into_owned(),
			});
		}
		Ok(serde_json::from_slice(&body)?)
	}
}

#[async_trait]
impl RemoteApi for RestClient {
	#[tracing::instrument(skip(self, token))]
	async fn describe(&self, token: &AccessToken, object_type: &str) -> Result<DescribeResponse> {
		let url = self.endpoint(token, &format!("sobjects/{object_type}/describe/"))?;
		self.get(token, url, None).await
	}

	#[tracing::instrument(skip(self, token))]
	async fn query(&self, token: &AccessToken, query: &str) -> Result<QueryResponse> {
		let url = self.endpoint(token, "query/")?;
		self.get(token, url, Some(query)).await
	}

	#[tracing::instrument(skip(self, token))]
	async fn query_more(
		&self,
		token: &AccessToken,
		next_records_url: &str,
	) -> Result<QueryResponse> {
		let url = token.instance_url.join(next_records_url)?;
		self.get(token, url, None).await
	}
}


#[cfg(test)]
mod tests {
	use serde_json::json;
	use test_log::test;
	use wiremock::{
		Mock, MockServer, ResponseTemplate,
		matchers::{header, method, path, query_param},
	};

	use super::*;

	fn client() -> RestClient {
		RestClient { http: reqwest::Client::new(), api_version: "22.0".to_owned() }
	}

	fn token(server: &MockServer) -> AccessToken {
		AccessToken {
			access_token: "token".to_owned(),
			instance_url: Url::parse(&server.uri()).expect("valid mock URL"),
		}
	}

	#[test(tokio::test)]
	async fn test_describe() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/services/data/v22.0/sobjects/contact/describe/"))
			.and(header("Authorization", "OAuth token"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"name": "Contact",
				"fields": [
					{ "name": "Id", "type": "id" },
					{ "name": "Email", "type": "email" }
				]
			})))
			.expect(1)
			.mount(&server)
			.await;

		let describe = client().describe(&token(&server), "contact").await.expect("describe");
		let names: Vec<_> = describe.fields.iter().map(|field| field.name.as_str()).collect();
		assert_eq!(names, ["Id", "Email"]);
		assert_eq!(describe.fields[1].field_type.as_deref(), Some("email"));
	}

	#[test(tokio::test)]
	async fn test_query_sends_query_string() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/services/data/v22.0/query/"))
			.and(query_param("q", "SELECT id,email FROM contact WHERE email='a@b.com'"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"totalSize": 1,
				"done": false,
				"nextRecordsUrl": "/services/data/v22.0/query/01g-2000",
				"records": [{ "attributes": { "type": "Contact" }, "Id": "1", "Email": "a@b.com" }]
			})))
			.expect(1)
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/services/data/v22.0/query/01g-2000"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"done": true,
				"records": []
			})))
			.expect(1)
			.mount(&server)
			.await;

		let client = client();
		let token = token(&server);
		let page = client
			.query(&token, "SELECT id,email FROM contact WHERE email='a@b.com'")
			.await
			.expect("query");
		assert!(!page.done);
		assert_eq!(page.records.len(), 1);
		assert_eq!(page.records[0]["Email"], "a@b.com");

		let next = page.next_records_url.expect("next page");
		let last = client.query_more(&token, &next).await.expect("next page");
		assert!(last.done);
		assert!(last.records.is_empty());
	}

	#[test(tokio::test)]
	async fn test_unauthorized_is_session_invalid() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.respond_with(ResponseTemplate::new(401).set_body_json(json!([{
				"message": "Session expired or invalid",
				"errorCode": "INVALID_SESSION_ID"
			}])))
			.mount(&server)
			.await;

		let error = client().query(&token(&server), "SELECT id FROM contact").await;
		assert!(matches!(error, Err(Error::SessionInvalid)), "unexpected result {error:?}");
	}

	#[test(tokio::test)]
	async fn test_server_error_is_remote_error() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.respond_with(ResponseTemplate::new(400).set_body_string("MALFORMED_QUERY"))
			.mount(&server)
			.await;

		match client().describe(&token(&server), "contact").await {
			Err(Error::Remote { status, body }) => {
				assert_eq!(status, 400);
				assert_eq!(body, "MALFORMED_QUERY");
			}
			other => panic!("unexpected result {other:?}"),
		}
	}

	#[test(tokio::test)]
	async fn test_malformed_body_is_decode_error() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
			.mount(&server)
			.await;

		let error = client().describe(&token(&server), "contact").await;
		assert!(matches!(error, Err(Error::Decode(_))), "unexpected result {error:?}");
	}
}
