//! Time-bounded cache for a single remotely hosted resource
//!
//! The cache refreshes at most once per TTL window. Fetches are single-flight:
//! while a fetch runs, every caller that finds the entry empty or stale awaits
//! that same fetch instead of starting its own, and is never handed the stale
//! body. The fetch runs on its own task so callers that give up do not cancel
//! it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// Why a fetch of the remote resource failed
///
/// `Clone` because one outcome is handed to every caller waiting on the fetch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream answered with status {0}")]
    Status(u16),

    #[error("fetch task ended before completing: {0}")]
    Aborted(String),
}

/// Source of the cached resource
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Bytes, FetchError>;
}

/// Fetches the resource over HTTP(S); only a `200 OK` counts as success
pub struct HttpFetcher {
    client: reqwest::Client,
    url: Url,
}

impl HttpFetcher {
    /// Create a fetcher whose requests give up after `timeout`
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self) -> Result<Bytes, FetchError> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(FetchError::Status(status.as_u16()));
        }

        response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))
    }
}

/// Observable state of the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Empty,
    Fetching,
    Populated,
    Stale,
}

type InFlight = Shared<BoxFuture<'static, Result<Bytes, FetchError>>>;

struct Entry {
    body: Bytes,
    fetched_at: Instant,
}

#[derive(Default)]
struct State {
    entry: Option<Entry>,
    in_flight: Option<InFlight>,
}

/// Memoizes one remote resource for a fixed time-to-live
pub struct RemoteResourceCache {
    fetcher: Arc<dyn ResourceFetcher>,
    ttl: Duration,
    state: Arc<Mutex<State>>,
}

impl RemoteResourceCache {
    /// Create an empty cache
    pub fn new(fetcher: Arc<dyn ResourceFetcher>, ttl: Duration) -> Self {
        Self {
            fetcher,
            ttl,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Current position in the Empty/Fetching/Populated/Stale cycle
    pub fn status(&self) -> CacheStatus {
        let state = self.state.lock();
        if state.in_flight.is_some() {
            return CacheStatus::Fetching;
        }
        match &state.entry {
            None => CacheStatus::Empty,
            Some(entry) if entry.fetched_at.elapsed() < self.ttl => CacheStatus::Populated,
            Some(_) => CacheStatus::Stale,
        }
    }

    /// Return the cached body, fetching it first when empty or stale
    pub async fn get(&self) -> Result<Bytes, FetchError> {
        let fetch = {
            let mut state = self.state.lock();

            if let Some(entry) = &state.entry {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.body.clone());
                }
            }

            if let Some(fetch) = state.in_flight.clone() {
                debug!("Joining in-flight fetch");
                fetch
            } else {
                let fetch = self.start_fetch();
                state.in_flight = Some(fetch.clone());
                fetch
            }
        };

        fetch.await
    }

    /// Spawn the fetch task; the caller stores the handle under the lock
    fn start_fetch(&self) -> InFlight {
        let fetcher = self.fetcher.clone();
        let state = self.state.clone();

        debug!("Fetching remote resource");

        let task = tokio::spawn({
            let state = state.clone();
            async move {
                let result = fetcher.fetch().await;

                let mut state = state.lock();
                state.in_flight = None;
                match &result {
                    Ok(body) => {
                        info!(bytes = body.len(), "Remote resource refreshed");
                        state.entry = Some(Entry {
                            body: body.clone(),
                            fetched_at: Instant::now(),
                        });
                    }
                    Err(e) => warn!(error = %e, "Remote resource fetch failed"),
                }

                result
            }
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    // The task never reached its own cleanup.
                    state.lock().in_flight = None;
                    Err(FetchError::Aborted(e.to_string()))
                }
            }
        }
        .boxed()
        .shared()
    }
}
