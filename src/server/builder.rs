// ────────────────────────────────
// src/server/builder.rs
// ────────────────────────────────
use crate::server::listener::bind_tcp;
use std::future::Future;
use std::net::SocketAddr;
use anyhow::{Context, Result};
use hyper::{server::conn::Http, Body, Request, Response};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower::{Service, ServiceBuilder};

/// Builder pattern so `main.rs` can inject its request handler.
pub struct ServerBuilder<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + Send + Clone + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    addr: SocketAddr,
    handler: Option<H>,
}

impl<H> ServerBuilder<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + Send + Clone + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, handler: None }
    }

    pub fn with_handler(mut self, handler: H) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Accept connections until `signal` resolves, then let every open
    /// connection finish its current request and close.
    pub async fn serve_with_shutdown<S>(self, signal: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let handler = self.handler.context("handler must be set via with_handler()")?;

        let listener = bind_tcp(self.addr).await?;
        tracing::info!("HTTP server listening on {}", self.addr);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            tracing::warn!(%err, "accept failed");
                            continue;
                        }
                    };

                    let svc = ServiceBuilder::new()
                        .map_request(move |mut req: Request<Body>| {
                            req.extensions_mut().insert(peer);
                            req
                        })
                        .service(handler.clone());
                    let mut stop_rx = stop_rx.clone();

                    // One Tokio task per connection.
                    connections.spawn(async move {
                        let conn = Http::new().serve_connection(stream, svc);
                        tokio::pin!(conn);

                        tokio::select! {
                            res = conn.as_mut() => {
                                if let Err(err) = res {
                                    tracing::warn!(%peer, %err, "connection error");
                                }
                            }
                            _ = stop_rx.changed() => {
                                conn.as_mut().graceful_shutdown();
                                if let Err(err) = conn.await {
                                    tracing::warn!(%peer, %err, "connection error during shutdown");
                                }
                            }
                        }
                    });
                }
            }
        }

        tracing::info!(open = connections.len(), "Stopped accepting connections");
        let _ = stop_tx.send(true);
        while connections.join_next().await.is_some() {}

        Ok(())
    }
}
