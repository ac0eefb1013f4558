//! Process start-up banner and signal-driven shutdown

use anyhow::{Context, Result};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing::{info, warn};

/// Termination signals that stop the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Interrupt,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Terminate => f.write_str("SIGTERM"),
            Signal::Interrupt => f.write_str("SIGINT"),
        }
    }
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
pub async fn wait_for_signal() -> Result<Signal> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => Ok(Signal::Terminate),
        _ = sigint.recv() => Ok(Signal::Interrupt),
    }
}

/// Wait for Ctrl+C
#[cfg(not(unix))]
pub async fn wait_for_signal() -> Result<Signal> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    Ok(Signal::Interrupt)
}

/// Resolve once `rx` reads `true`; never resolves if the sender is gone
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let sender_gone = rx.wait_for(|stop| *stop).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}

fn local_time() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

/// Log the start-up banner once the listener is bound
pub fn announce(addr: SocketAddr) {
    info!("Welcome to Doge V4, user!");
    info!(
        status = "Active",
        port = addr.port(),
        time = %local_time(),
        version = env!("CARGO_PKG_VERSION"),
        "Server listening"
    );
    info!("URL: http://localhost:{}", addr.port());
}

/// Owns the shutdown channel every server task listens on
pub struct Supervisor {
    tx: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Receiver that turns `true` when shutdown starts
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    /// Run `server` until `stop` yields a signal, then shut it down
    ///
    /// The server future must stop accepting and drain its connections once
    /// its receiver reads `true`. Returns after the server has finished.
    pub async fn supervise<S, F>(&self, stop: S, server: F) -> Result<()>
    where
        S: Future<Output = Result<Signal>>,
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let mut server = tokio::spawn(server);

        let signal = tokio::select! {
            signal = stop => signal?,
            finished = &mut server => {
                warn!("Server stopped without a shutdown signal");
                return finished.context("Server task panicked")?;
            }
        };

        info!(signal = %signal, time = %local_time(), "Shutting down");
        info!("Performing graceful exit...");
        self.tx.send_replace(true);

        server.await.context("Server task panicked")??;
        info!("Server has been closed");

        Ok(())
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
