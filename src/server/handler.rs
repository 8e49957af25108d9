// src/server/handler.rs
use hyper::{Body, Request, Response};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::Service;

use crate::balancer::Balancer;

/// Reverse-proxy entry point. Every request gets a response: proxied
/// output on success, a plain-text error otherwise.
#[derive(Clone)]
pub struct RequestHandler {
    balancer: Arc<Balancer>,
}

impl RequestHandler {
    pub fn new(balancer: Arc<Balancer>) -> Self {
        Self { balancer }
    }
}

impl Service<Request<Body>> for RequestHandler {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let balancer = self.balancer.clone();
        // The accept loop stores the peer address in the request extensions.
        let peer = req.extensions().get::<SocketAddr>().copied();

        Box::pin(async move {
            match balancer.dispatch(req, peer).await {
                Ok(response) => Ok(response),
                Err(e) => {
                    tracing::debug!(%e, "proxy error");
                    Ok(e.into())
                }
            }
        })
    }
}
