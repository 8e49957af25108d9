// src/server/admin.rs
//! Administrative HTTP surface: Prometheus scrape, JSON stats and runtime
//! backend management.

use crate::balancer::Balancer;
use crate::metrics::MetricsRegistry;
use crate::proxy::RegistryError;
use anyhow::{Context, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct AdminState {
    pub balancer: Arc<Balancer>,
    pub metrics: Arc<MetricsRegistry>,
    pub metrics_path: Arc<str>,
}

/// Bind the admin server and run it in the background until `signal`
/// resolves.
pub fn start_admin_server<S>(addr: SocketAddr, state: AdminState, signal: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let metrics_path = state.metrics_path.clone();
    let make_service = make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(route(&state, req).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("Failed to bind admin server on {}", addr))?
        .serve(make_service)
        .with_graceful_shutdown(signal);

    info!("Admin server listening on http://{}{}", addr, metrics_path);

    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Admin server error: {}", e);
        }
    });

    Ok(())
}

pub async fn route(state: &AdminState, req: Request<Body>) -> Response<Body> {
    let path = req.uri().path();

    match (req.method(), path) {
        (&Method::GET, p) if p == &*state.metrics_path => match state.metrics.gather() {
            Ok(body) => with_content_type(
                Response::new(Body::from(body)),
                "text/plain; version=0.0.4",
            ),
            Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to encode metrics: {}", e)),
        },
        (&Method::GET, "/stats") => match serde_json::to_vec(&state.balancer.status()) {
            Ok(body) => with_content_type(Response::new(Body::from(body)), "application/json"),
            Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to encode stats: {}", e)),
        },
        (&Method::POST, "/backends") => match address_param(&req) {
            Some(address) => match state.balancer.add_server(&address) {
                Ok(()) => text(StatusCode::CREATED, format!("added {}", address)),
                Err(e) => registry_error(e),
            },
            None => text(StatusCode::BAD_REQUEST, "missing address parameter"),
        },
        (&Method::DELETE, "/backends") => match address_param(&req) {
            Some(address) => match state.balancer.remove_server(&address).await {
                Ok(()) => text(StatusCode::OK, format!("removed {}", address)),
                Err(e) => registry_error(e),
            },
            None => text(StatusCode::BAD_REQUEST, "missing address parameter"),
        },
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn address_param(req: &Request<Body>) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "address")
        .map(|(_, value)| value.into_owned())
}

fn registry_error(err: RegistryError) -> Response<Body> {
    let status = match err {
        RegistryError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
        RegistryError::DuplicateBackend(_) => StatusCode::CONFLICT,
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
    };
    text(status, err.to_string())
}

fn text(status: StatusCode, body: impl Into<String>) -> Response<Body> {
    let mut response = Response::new(Body::from(body.into()));
    *response.status_mut() = status;
    with_content_type(response, "text/plain; charset=utf-8")
}

fn with_content_type(mut response: Response<Body>, content_type: &'static str) -> Response<Body> {
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
