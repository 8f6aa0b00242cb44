//! Single entry point for request/response calls to the engine.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use jobline_platform::{
    Breadcrumb, BreadcrumbLevel, DiagnosticsSink, TracingDiagnostics, record_best_effort,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::{
    cache::ResponseCache,
    error::ApiError,
    inflight::{DEFAULT_INFLIGHT_GRACE, InFlightRegistry},
    retry::{RetryPolicy, run_with_retry},
    signature::RequestSignature,
    types::{ApiRequest, Method},
};

const BREADCRUMB_CATEGORY: &str = "http";

/// Raw request/response call to the engine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue one call. Non-success responses must be returned as
    /// [`ApiError::http`]; failures without a response as [`ApiError::network`].
    async fn call(&self, request: &ApiRequest) -> Result<Value, ApiError>;
}

/// Per-call caching and retry opt-ins. Both apply to read-only calls only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    pub cache_ttl: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl DispatchOptions {
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// How long a settled read-only request keeps absorbing duplicates.
    pub inflight_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            inflight_grace: DEFAULT_INFLIGHT_GRACE,
        }
    }
}

/// Composes the response cache, in-flight registry and retry engine around a
/// [`Transport`]. Clones share the same cache and registry.
#[derive(Clone)]
pub struct RequestDispatcher {
    transport: Arc<dyn Transport>,
    cache: Arc<ResponseCache>,
    inflight: InFlightRegistry,
    diagnostics: Arc<dyn DiagnosticsSink>,
}

impl RequestDispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, DispatcherConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: DispatcherConfig) -> Self {
        Self {
            transport,
            cache: Arc::new(ResponseCache::new()),
            inflight: InFlightRegistry::new(config.inflight_grace),
            diagnostics: Arc::new(TracingDiagnostics),
        }
    }

    /// Route breadcrumbs to a different diagnostics sink.
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Issue one call.
    ///
    /// Read-only calls consult the cache when `cache_ttl` is set, then join
    /// an identical call that is running or settled within the grace period.
    /// A joiner gets the producer's outcome as is: the producer's own options
    /// decide whether the payload was retried and cached, and the joiner's
    /// `retry` and `cache_ttl` are not applied. A settled call older than the
    /// joiner's `cache_ttl` is not joined; a fresh call is made instead.
    ///
    /// Mutating calls go straight to the transport, once.
    pub async fn dispatch(
        &self,
        request: ApiRequest,
        options: DispatchOptions,
    ) -> Result<Value, ApiError> {
        if !request.method.is_read_only() {
            if options != DispatchOptions::default() {
                debug!(
                    method = %request.method,
                    endpoint = %request.endpoint,
                    "ignoring cache/retry options for mutating call"
                );
            }
            return call_once(self.transport.as_ref(), self.diagnostics.as_ref(), &request).await;
        }

        let signature = RequestSignature::of(&request);
        if options.cache_ttl.is_some()
            && let Some(payload) = self.cache.get(&signature)
        {
            debug!(%signature, "cache hit");
            return Ok(payload);
        }

        let transport = self.transport.clone();
        let diagnostics = self.diagnostics.clone();
        let cache = self.cache.clone();
        let key = signature.clone();
        let DispatchOptions { cache_ttl, retry } = options;

        self.inflight
            .begin_or_join_fresh(signature, cache_ttl, move || async move {
                let result = match retry {
                    Some(policy) => {
                        run_with_retry(&policy, || {
                            call_once(transport.as_ref(), diagnostics.as_ref(), &request)
                        })
                        .await
                    }
                    None => call_once(transport.as_ref(), diagnostics.as_ref(), &request).await,
                };

                if let (Ok(payload), Some(ttl)) = (&result, cache_ttl) {
                    cache.set(key, payload.clone(), ttl);
                }
                result
            })
            .await
    }

    /// Dispatch and deserialize the payload, surfacing decode failures as parse errors.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
        options: DispatchOptions,
    ) -> Result<T, ApiError> {
        let endpoint = request.endpoint.clone();
        let payload = self.dispatch(request, options).await?;
        serde_json::from_value(payload).map_err(|err| {
            ApiError::parse(format!("unexpected response shape from {endpoint}: {err}"))
        })
    }

    pub async fn get(&self, endpoint: &str, options: DispatchOptions) -> Result<Value, ApiError> {
        self.dispatch(ApiRequest::new(Method::Get, endpoint), options)
            .await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: DispatchOptions,
    ) -> Result<T, ApiError> {
        self.send_json(ApiRequest::new(Method::Get, endpoint), options)
            .await
    }

    pub async fn post(&self, endpoint: &str, body: Value) -> Result<Value, ApiError> {
        self.mutate(Method::Post, endpoint, Some(body)).await
    }

    pub async fn put(&self, endpoint: &str, body: Value) -> Result<Value, ApiError> {
        self.mutate(Method::Put, endpoint, Some(body)).await
    }

    pub async fn patch(&self, endpoint: &str, body: Value) -> Result<Value, ApiError> {
        self.mutate(Method::Patch, endpoint, Some(body)).await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<Value, ApiError> {
        self.mutate(Method::Delete, endpoint, None).await
    }

    /// Drop every cached response (logout/reset), including settled
    /// coalesced outcomes still inside their grace period.
    pub fn clear_cache(&self) {
        self.cache.clear();
        self.inflight.clear_settled();
    }

    /// Drop the cached response for one read-only call so the next read goes
    /// to the network. Returns whether anything was dropped.
    pub fn invalidate(&self, method: Method, endpoint: &str, body: Option<&Value>) -> bool {
        let signature = RequestSignature::new(method, endpoint, body);
        let cached = self.cache.remove(&signature);
        let settled = self.inflight.forget_settled(&signature);
        cached || settled
    }

    async fn mutate(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<Value, ApiError> {
        let mut request = ApiRequest::new(method, endpoint);
        request.body = body;
        self.dispatch(request, DispatchOptions::default()).await
    }
}

async fn call_once(
    transport: &dyn Transport,
    diagnostics: &dyn DiagnosticsSink,
    request: &ApiRequest,
) -> Result<Value, ApiError> {
    let crumb = Breadcrumb::new(
        BREADCRUMB_CATEGORY,
        BreadcrumbLevel::Info,
        format!("{} {}", request.method, request.endpoint),
    )
    .with_data("method", request.method)
    .with_data("endpoint", &request.endpoint);
    let request_id = crumb.id;
    record_best_effort(diagnostics, crumb);

    let result = transport.call(request).await;
    if let Err(err) = &result {
        let status = err
            .status
            .map(|status| status.to_string())
            .unwrap_or_else(|| "network".to_owned());
        record_best_effort(
            diagnostics,
            Breadcrumb::new(BREADCRUMB_CATEGORY, BreadcrumbLevel::Error, err.message.clone())
                .with_data("request_id", request_id)
                .with_data("endpoint", &request.endpoint)
                .with_data("status", status)
                .with_data("code", &err.code),
        );
    }
    result
}
