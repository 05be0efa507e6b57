use crate::error::GatewayError;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Header carrying the acting user's subject key.
pub const SUBJECT_HEADER: &str = "username";

pub fn build_gateway_client() -> Client {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(READ_TIMEOUT)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Thin request/response wrapper shared by the REST gateways. No retries:
/// callers decide what a failure means.
#[derive(Debug, Clone)]
pub struct RestClient {
    base: Url,
    client: Client,
    api_key: Option<String>,
}

impl RestClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, GatewayError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        let base = Url::parse(&format!("{trimmed}/"))
            .map_err(|e| GatewayError::Endpoint(format!("{base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(GatewayError::Endpoint(base_url.to_string()));
        }
        Ok(Self {
            base,
            client: build_gateway_client(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Resolves a relative path template against the base URL.
    pub fn endpoint(&self, path: &str) -> Result<Url, GatewayError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| GatewayError::Endpoint(format!("{path}: {e}")))
    }

    pub fn request(&self, method: Method, url: Url, subject: &str) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/json");
        if !subject.is_empty() {
            builder = builder.header(SUBJECT_HEADER, subject);
        }
        if let Some(key) = &self.api_key {
            builder = builder.header(reqwest::header::AUTHORIZATION, format!("APIKEY {key}"));
        }
        builder
    }

    /// Sends the request and fails on transport errors and non-2xx status.
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, GatewayError> {
        let request = builder.build().map_err(|e| GatewayError::Request {
            url: String::new(),
            message: e.to_string(),
        })?;
        let url = request.url().to_string();
        let method = request.method().clone();

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| GatewayError::Request {
                url: url.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(method = %method, url = url.as_str(), status = status.as_u16(), "Gateway call rejected");
            return Err(GatewayError::Status {
                url,
                status: status.as_u16(),
                body: truncate(&body, 256),
            });
        }
        Ok(response)
    }

    pub async fn send_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> Result<T, GatewayError> {
        let response = self.send(builder).await?;
        let url = response.url().to_string();
        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::Response {
                url,
                message: e.to_string(),
            })
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn endpoint_joins_relative_paths() {
        let client = RestClient::new("http://jacs:8180/api/rest-v2", None).unwrap();
        assert_eq!(
            client.endpoint("/workspace/neuron").unwrap().as_str(),
            "http://jacs:8180/api/rest-v2/workspace/neuron"
        );
    }

    #[test]
    fn rejects_invalid_base() {
        assert!(RestClient::new("not a url", None).is_err());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("ok", 10), "ok");
    }

    #[tokio::test]
    async fn non_2xx_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/things"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let client = RestClient::new(&server.uri(), None).unwrap();
        let url = client.endpoint("things").unwrap();
        let err = client
            .send(client.request(Method::GET, url, "user:alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn attaches_subject_and_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/things"))
            .and(header(SUBJECT_HEADER, "user:alice"))
            .and(header("authorization", "APIKEY k1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .expect(1)
            .mount(&server)
            .await;

        let client = RestClient::new(&server.uri(), Some("k1".into())).unwrap();
        let url = client.endpoint("things").unwrap();
        let items: Vec<i64> = client
            .send_json(client.request(Method::GET, url, "user:alice"))
            .await
            .unwrap();
        assert!(items.is_empty());
    }
}
