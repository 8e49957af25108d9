// src/proxy/upstream.rs
use super::dispatcher::ProxyError;
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Request, Response};
use hyper_tls::HttpsConnector;

/// Transport used to reach a backend. The dispatcher owns retries, load
/// accounting and timeouts; an `Upstream` only performs one exchange.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(&self, request: Request<Body>) -> Result<Response<Body>, ProxyError>;
}

/// Pooled hyper client speaking plain HTTP or HTTPS.
#[derive(Clone)]
pub struct HyperUpstream {
    client: Client<HttpsConnector<HttpConnector>, Body>,
}

impl HyperUpstream {
    pub fn new() -> Self {
        let client = Client::builder().build(HttpsConnector::new());
        Self { client }
    }
}

impl Default for HyperUpstream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Upstream for HyperUpstream {
    async fn send(&self, request: Request<Body>) -> Result<Response<Body>, ProxyError> {
        self.client
            .request(request)
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))
    }
}
