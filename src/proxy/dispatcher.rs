// ────────────────────────────────
// src/proxy/dispatcher.rs
// Forwards one inbound request to a selected backend, with retries
// ────────────────────────────────

use super::backend::{Backend, LoadGuard};
use super::headers::{self, X_REQUEST_ID};
use super::registry::Registry;
use super::upstream::Upstream;
use crate::lifecycle::Lifecycle;
use crate::load_balancer::Selector;
use crate::metrics::{MetricsCollector, Timer};
use crate::retry::{RetryDecision, RetryStrategy};
use futures::FutureExt;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::http::request::Parts;
use hyper::{Body, Request, Response, StatusCode, Uri};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    #[error("No healthy backends available")]
    NoBackendAvailable,

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NoBackendAvailable | ProxyError::ServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

// Every error reaches the client as a plain-text response.
impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let mut response = Response::new(Body::from(format!("{}\n", err)));
        *response.status_mut() = err.status_code();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}

/// The inbound request, buffered so each attempt can replay it.
struct BufferedRequest {
    parts: Parts,
    body: Bytes,
    client_addr: Option<SocketAddr>,
    request_id: String,
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    selector: Arc<dyn Selector>,
    upstream: Arc<dyn Upstream>,
    retry: RetryStrategy,
    request_timeout: Duration,
    metrics: Arc<MetricsCollector>,
    lifecycle: Arc<Lifecycle>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        selector: Arc<dyn Selector>,
        upstream: Arc<dyn Upstream>,
        retry: RetryStrategy,
        request_timeout: Duration,
        metrics: Arc<MetricsCollector>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            registry,
            selector,
            upstream,
            retry,
            request_timeout,
            metrics,
            lifecycle,
        }
    }

    /// Forward `req` to a healthy backend, retrying on other backends until
    /// the attempt budget is spent.
    pub async fn dispatch(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<Body>, ProxyError> {
        let Some(_admission) = self.lifecycle.admit() else {
            debug!("Rejecting request during shutdown");
            return Err(ProxyError::ServiceUnavailable(
                "load balancer is shutting down".into(),
            ));
        };
        let _active = self.metrics.begin_request();

        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let span = tracing::info_span!(
            "dispatch",
            request_id = %request_id,
            method = %req.method(),
            path = %req.uri().path(),
            client = headers::client_ip(req.headers(), client_addr).as_deref().unwrap_or("-"),
        );

        self.dispatch_admitted(req, client_addr, request_id)
            .instrument(span)
            .await
    }

    async fn dispatch_admitted(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
        request_id: String,
    ) -> Result<Response<Body>, ProxyError> {
        let timer = Timer::new();
        let (parts, body) = req.into_parts();
        let method = parts.method.clone();

        let body = match hyper::body::to_bytes(body).await {
            Ok(body) => body,
            Err(e) => {
                self.metrics.record_failure();
                return Err(ProxyError::BadRequest(format!("failed to read request body: {}", e)));
            }
        };

        let request = BufferedRequest {
            parts,
            body,
            client_addr,
            request_id,
        };

        // Shared by reference with every attempt future, which must stay Send.
        let tried = Mutex::new(Vec::new());
        let (request, tried) = (&request, &tried);
        let outcome = self
            .retry
            .execute(move |attempt| self.attempt(attempt, request, tried))
            .await;

        match outcome {
            Ok(response) => {
                self.metrics
                    .record_request(method.as_str(), response.status().as_u16(), timer.elapsed());
                Ok(response)
            }
            Err(last_error) => {
                self.metrics.record_failure();
                self.metrics.record_request(
                    method.as_str(),
                    StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                    timer.elapsed(),
                );
                warn!(attempts = self.retry.max_attempts(), error = %last_error, "Request failed");
                Err(ProxyError::ServiceUnavailable(format!(
                    "no backend could serve the request after {} attempts",
                    self.retry.max_attempts()
                )))
            }
        }
    }

    /// One attempt: select, take load, forward, release load.
    ///
    /// Backends already tried for this request are skipped while any other
    /// candidate remains.
    async fn attempt(
        &self,
        attempt: u32,
        request: &BufferedRequest,
        tried: &Mutex<Vec<Arc<Backend>>>,
    ) -> Result<Response<Body>, ProxyError> {
        let snapshot = self.registry.snapshot();
        let untried: Vec<Arc<Backend>> = {
            let tried = tried.lock();
            snapshot
                .iter()
                .filter(|b| !tried.iter().any(|t| Arc::ptr_eq(t, b)))
                .cloned()
                .collect()
        };
        let backend = self
            .selector
            .select_backend(&untried)
            .or_else(|| self.selector.select_backend(&snapshot))
            .ok_or(ProxyError::NoBackendAvailable)?;
        tried.lock().push(backend.clone());

        // Load is taken before forwarding so concurrent selections already
        // see this backend as busier.
        let guard = backend.try_acquire().ok_or_else(|| {
            ProxyError::Upstream(format!("{} is draining", backend.address()))
        })?;
        self.metrics.update_backend_load(guard.address(), guard.load());
        debug!(attempt, backend = %guard.address(), load = guard.load(), strategy = self.selector.name(), "Forwarding");

        let timer = Timer::new();
        let result = self.forward(&guard, request).await;
        let elapsed = timer.elapsed();

        let result = match result {
            Ok(response) => {
                guard.record_latency(elapsed);
                match RetryStrategy::is_retryable_status(response.status()) {
                    RetryDecision::NoRetry => Ok(response),
                    RetryDecision::Retry => Err(ProxyError::Upstream(format!(
                        "{} responded with {}",
                        guard.address(),
                        response.status()
                    ))),
                }
            }
            Err(e) => Err(e),
        };

        self.metrics
            .record_backend_request(guard.address(), result.is_ok(), elapsed);

        let address = guard.address().to_string();
        drop(guard);
        self.metrics.update_backend_load(&address, backend.load());

        result
    }

    /// Send the request and buffer the whole response within the attempt
    /// timeout. Panics in the transport become an upstream failure.
    async fn forward(&self, guard: &LoadGuard, request: &BufferedRequest) -> Result<Response<Body>, ProxyError> {
        let outbound = build_outbound(guard, request)?;
        let exchange = async {
            let response = self.upstream.send(outbound).await?;
            let (parts, body) = response.into_parts();
            let body = hyper::body::to_bytes(body)
                .await
                .map_err(|e| ProxyError::Upstream(format!("failed to read response body: {}", e)))?;
            Ok::<_, ProxyError>((parts, body))
        };

        let result = AssertUnwindSafe(tokio::time::timeout(self.request_timeout, exchange))
            .catch_unwind()
            .await;

        let (parts, body) = match result {
            Ok(Ok(exchange)) => exchange?,
            Ok(Err(_)) => {
                return Err(ProxyError::Upstream(format!(
                    "{} timed out after {:?}",
                    guard.address(),
                    self.request_timeout
                )))
            }
            Err(_) => {
                return Err(ProxyError::Upstream(format!(
                    "unexpected failure while forwarding to {}",
                    guard.address()
                )))
            }
        };

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = parts.status;
        let mut relayed = HeaderMap::with_capacity(parts.headers.len());
        headers::copy_headers(&parts.headers, &mut relayed);
        *response.headers_mut() = relayed;
        Ok(response)
    }
}

fn build_outbound(guard: &LoadGuard, request: &BufferedRequest) -> Result<Request<Body>, ProxyError> {
    let path_and_query = request
        .parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = format!("{}{}", guard.address(), path_and_query)
        .parse()
        .map_err(|e| ProxyError::Upstream(format!("invalid upstream URI: {}", e)))?;

    let mut headers = headers::outbound_request_headers(&request.parts.headers);
    if let Some(peer) = request.client_addr {
        headers::append_forwarded_for(&mut headers, peer.ip());
    }
    // The outbound id is always the one logged for this request.
    match HeaderValue::from_str(&request.request_id) {
        Ok(value) => {
            headers.insert(X_REQUEST_ID, value);
        }
        Err(_) => {
            headers.remove(X_REQUEST_ID);
        }
    }

    let mut outbound = Request::new(Body::from(request.body.clone()));
    *outbound.method_mut() = request.parts.method.clone();
    *outbound.uri_mut() = uri;
    *outbound.headers_mut() = headers;
    Ok(outbound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoadBalancerAlgorithm, RetryConfig};
    use crate::load_balancer::create_selector;
    use crate::metrics::MetricsRegistry;
    use async_trait::async_trait;

    /// Scripted upstream: records which backends were contacted and answers
    /// according to a per-authority rule.
    struct ScriptedUpstream {
        calls: Mutex<Vec<String>>,
        rule: fn(&str) -> Result<StatusCode, ProxyError>,
    }

    impl ScriptedUpstream {
        fn new(rule: fn(&str) -> Result<StatusCode, ProxyError>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                rule,
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn send(&self, request: Request<Body>) -> Result<Response<Body>, ProxyError> {
            let authority = request.uri().authority().map(|a| a.to_string()).unwrap_or_default();
            self.calls.lock().push(authority.clone());
            if authority.ends_with(":9999") {
                panic!("transport bug");
            }
            let status = (self.rule)(&authority)?;
            let mut response = Response::new(Body::from(format!("from {}", authority)));
            *response.status_mut() = status;
            Ok(response)
        }
    }

    fn dispatcher(
        addresses: &[&str],
        upstream: Arc<dyn Upstream>,
    ) -> (Dispatcher, Arc<Registry>, Arc<MetricsCollector>, Arc<Lifecycle>) {
        let registry = Arc::new(Registry::new());
        for address in addresses {
            registry.add(address).unwrap();
        }
        let metrics = MetricsRegistry::new().unwrap().collector();
        let lifecycle = Arc::new(Lifecycle::new());
        let retry = RetryStrategy::new(RetryConfig {
            max_attempts: 3,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        });

        let dispatcher = Dispatcher::new(
            registry.clone(),
            create_selector(LoadBalancerAlgorithm::RoundRobin),
            upstream,
            retry,
            Duration::from_secs(5),
            metrics.clone(),
            lifecycle.clone(),
        );
        (dispatcher, registry, metrics, lifecycle)
    }

    fn get(path: &str) -> Request<Body> {
        Request::get(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn retries_on_another_backend() {
        let upstream = ScriptedUpstream::new(|authority| {
            if authority.ends_with(":8001") {
                Err(ProxyError::Upstream("connection refused".into()))
            } else {
                Ok(StatusCode::OK)
            }
        });
        let (dispatcher, registry, metrics, _) =
            dispatcher(&["http://a:8001", "http://b:8002"], upstream.clone());

        let response = dispatcher.dispatch(get("/x"), None).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(upstream.calls(), vec!["a:8001", "b:8002"]);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.failed_requests, 0);
        assert_eq!(snapshot.active_connections, 0);
        assert!(registry.snapshot().iter().all(|b| b.load() == 0));
    }

    #[tokio::test]
    async fn exhaustion_counts_one_failure() {
        let upstream = ScriptedUpstream::new(|_| Err(ProxyError::Upstream("refused".into())));
        let (dispatcher, registry, metrics, _) = dispatcher(
            &["http://a:8001", "http://b:8002", "http://c:8003"],
            upstream.clone(),
        );

        let err = dispatcher.dispatch(get("/"), None).await.unwrap_err();
        assert!(matches!(err, ProxyError::ServiceUnavailable(_)));
        assert_eq!(upstream.calls().len(), 3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.active_connections, 0);
        assert!(registry.snapshot().iter().all(|b| b.load() == 0));
    }

    #[tokio::test]
    async fn server_errors_are_retried_client_errors_relayed() {
        let upstream = ScriptedUpstream::new(|authority| {
            if authority.ends_with(":8001") {
                Ok(StatusCode::BAD_GATEWAY)
            } else {
                Ok(StatusCode::NOT_FOUND)
            }
        });
        let (dispatcher, _, metrics, _) =
            dispatcher(&["http://a:8001", "http://b:8002"], upstream.clone());

        let response = dispatcher.dispatch(get("/missing"), None).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(upstream.calls().len(), 2);
        assert_eq!(metrics.snapshot().failed_requests, 0);
    }

    #[tokio::test]
    async fn unhealthy_backends_are_never_contacted() {
        let upstream = ScriptedUpstream::new(|_| Ok(StatusCode::OK));
        let (dispatcher, registry, metrics, _) =
            dispatcher(&["http://a:8001", "http://b:8002"], upstream.clone());
        registry.snapshot().iter().for_each(|b| {
            b.set_health(false);
        });

        let err = dispatcher.dispatch(get("/"), None).await.unwrap_err();
        assert!(matches!(err, ProxyError::ServiceUnavailable(_)));
        assert!(upstream.calls().is_empty());
        assert_eq!(metrics.snapshot().failed_requests, 1);
    }

    #[tokio::test]
    async fn panicking_transport_is_an_attempt_failure() {
        let upstream = ScriptedUpstream::new(|_| Ok(StatusCode::OK));
        let (dispatcher, registry, _, _) =
            dispatcher(&["http://a:9999", "http://b:8002"], upstream.clone());

        let response = dispatcher.dispatch(get("/"), None).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(upstream.calls(), vec!["a:9999", "b:8002"]);
        assert!(registry.snapshot().iter().all(|b| b.load() == 0));
    }

    #[tokio::test]
    async fn rejects_after_shutdown_without_counting() {
        let upstream = ScriptedUpstream::new(|_| Ok(StatusCode::OK));
        let (dispatcher, _, metrics, lifecycle) = dispatcher(&["http://a:8001"], upstream.clone());
        lifecycle.shutdown().await;

        let err = dispatcher.dispatch(get("/"), None).await.unwrap_err();
        assert!(matches!(err, ProxyError::ServiceUnavailable(_)));
        assert!(upstream.calls().is_empty());
        assert_eq!(metrics.snapshot().total_requests, 0);
    }

    #[test]
    fn outbound_request_targets_backend() {
        let registry = Registry::new();
        let backend = registry.add("http://127.0.0.1:8001").unwrap();
        let guard = backend.try_acquire().unwrap();

        let (parts, _) = Request::post("http://lb.local/api/items?page=2")
            .header("host", "lb.local")
            .header("x-custom", "1")
            .body(Body::empty())
            .unwrap()
            .into_parts();
        let request = BufferedRequest {
            parts,
            body: Bytes::from_static(b"payload"),
            client_addr: Some("10.1.2.3:5555".parse().unwrap()),
            request_id: "req-1".into(),
        };

        let outbound = build_outbound(&guard, &request).unwrap();
        assert_eq!(outbound.method(), hyper::Method::POST);
        assert_eq!(outbound.uri(), "http://127.0.0.1:8001/api/items?page=2");
        assert!(outbound.headers().get("host").is_none());
        assert_eq!(outbound.headers().get("x-custom").unwrap(), "1");
        assert_eq!(outbound.headers().get("x-forwarded-for").unwrap(), "10.1.2.3");
        assert_eq!(outbound.headers().get(X_REQUEST_ID).unwrap(), "req-1");
    }

    #[test]
    fn outbound_request_id_matches_logged_id() {
        let registry = Registry::new();
        let backend = registry.add("http://127.0.0.1:8001").unwrap();
        let guard = backend.try_acquire().unwrap();

        let (parts, _) = Request::get("/")
            .header(X_REQUEST_ID, HeaderValue::from_bytes(b"id-\xff").unwrap())
            .body(Body::empty())
            .unwrap()
            .into_parts();
        let request = BufferedRequest {
            parts,
            body: Bytes::new(),
            client_addr: None,
            request_id: "generated-id".into(),
        };

        let outbound = build_outbound(&guard, &request).unwrap();
        assert_eq!(outbound.headers().get(X_REQUEST_ID).unwrap(), "generated-id");
        assert_eq!(outbound.headers().get_all(X_REQUEST_ID).iter().count(), 1);
    }

    #[test]
    fn errors_map_to_plain_text_responses() {
        let response: Response<Body> = ProxyError::ServiceUnavailable("draining".into()).into();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );

        let response: Response<Body> = ProxyError::BadRequest("body".into()).into();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
