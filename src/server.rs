//! Listener and connection handling
//!
//! Accepts connections on one TCP port and serves each with hyper, upgrades
//! enabled, handing every request to the [`Router`]. On shutdown the accept
//! loop stops, open connections are told to finish gracefully and `serve`
//! returns once the last one has closed.

use crate::engine::ClientAddr;
use crate::lifecycle::{announce, shutdown_requested};
use crate::router::Router;
use anyhow::{Context, Result, anyhow};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// Listener configuration
#[derive(Clone)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8000 }
    }
}

/// The front door: one listener, one router
pub struct Server {
    config: ServerConfig,
    router: Arc<Router>,
}

impl Server {
    pub fn new(config: ServerConfig, router: Router) -> Self {
        Self {
            config,
            router: Arc::new(router),
        }
    }

    /// Bind the configured port and serve until shutdown
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.port).parse()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        self.serve(listener, shutdown).await
    }

    /// Serve an already bound listener until shutdown
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let local_addr = listener.local_addr()?;
        announce(local_addr);

        // Every connection task holds a sender; recv() yields None once all are gone.
        let (drain_tx, mut drain_rx) = mpsc::channel::<()>(1);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    let router = self.router.clone();
                    let shutdown = shutdown.clone();
                    let drain = drain_tx.clone();
                    let span = info_span!("conn", id = %Uuid::new_v4(), peer = %remote_addr);

                    tokio::spawn(
                        async move {
                            if let Err(e) = Self::handle_connection(stream, remote_addr, router, shutdown).await {
                                debug!("Connection closed: {}", e);
                            }
                            drop(drain);
                        }
                        .instrument(span),
                    );
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        drop(listener);
        info!(addr = %local_addr, "Listener closed, draining connections");

        drop(drain_tx);
        let _ = drain_rx.recv().await;
        info!("All connections closed");

        Ok(())
    }

    /// Handle a single HTTP connection
    async fn handle_connection(
        stream: TcpStream,
        remote_addr: SocketAddr,
        router: Arc<Router>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let io = TokioIo::new(stream);

        let service = service_fn(move |mut req: Request<Incoming>| {
            let router = router.clone();
            req.extensions_mut().insert(ClientAddr(remote_addr));
            async move { router.handle(req).await }
        });

        let conn = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(io, service)
            .with_upgrades();
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = shutdown_requested(&mut shutdown) => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };

        result.map_err(|e| anyhow!("HTTP service error: {}", e))
    }
}
