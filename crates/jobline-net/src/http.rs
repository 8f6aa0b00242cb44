use std::time::Duration;

use async_trait::async_trait;
use jobline_core::{ApiError, ApiRequest, ErrorCategory, Method, Transport};
use reqwest::{Client, header::RETRY_AFTER};
use serde_json::Value;
use tracing::{debug, trace};
use url::Url;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_ERROR_BODY_CHARS: usize = 200;

/// [`Transport`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ApiError::internal("client_build_error", err.to_string()))?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve `endpoint` below the base URL, keeping any base path prefix.
    pub fn endpoint_url(&self, endpoint: &str) -> Result<Url, ApiError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let endpoint = endpoint.trim_start_matches('/');
        Url::parse(&format!("{base}/{endpoint}")).map_err(|err| {
            ApiError::new(
                ErrorCategory::Client,
                "invalid_endpoint",
                format!("cannot build url for '{endpoint}': {err}"),
            )
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        let url = self.endpoint_url(&request.endpoint)?;
        trace!(method = %request.method, %url, "sending request");

        let mut builder = self.client.request(to_reqwest_method(request.method), url);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        if !(200..300).contains(&status) {
            debug!(status, endpoint = %request.endpoint, "engine rejected request");
            let mut err = ApiError::http(status, error_message(status, &body));
            if let Some(delay) = retry_after {
                err = err.with_retry_after(delay);
            }
            return Err(err);
        }

        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body).map_err(|err| {
            ApiError::parse(format!(
                "invalid json from {} {}: {err}",
                request.method, request.endpoint
            ))
        })
    }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Head => reqwest::Method::HEAD,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::new(ErrorCategory::Network, "timeout", err.to_string())
    } else if err.is_decode() {
        ApiError::parse(err.to_string())
    } else if err.is_builder() {
        ApiError::internal("request_build_error", err.to_string())
    } else {
        ApiError::network(err.to_string())
    }
}

/// Only the delay-seconds form is honored; HTTP dates are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn error_message(status: u16, body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        for key in ["message", "error", "detail"] {
            if let Some(text) = value.get(key).and_then(Value::as_str) {
                return text.to_owned();
            }
        }
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        format!("engine responded with status {status}")
    } else {
        text.chars().take(MAX_ERROR_BODY_CHARS).collect()
    }
}
