//! Request and upgrade dispatch
//!
//! Every request is classified once and handed to exactly one handler. The
//! bare engine is asked first and its claim beats every static route. Plain
//! requests then fall through the fixed redirect, the cached worker script,
//! the route table and the static mounts before ending in the 404 page.
//! Upgrades that neither engine takes are refused by closing the transport.

use crate::cache::RemoteResourceCache;
use crate::engine::{BareEngine, TunnelEngine};
use crate::response::{ServerBody, bytes_response, error_response, html_response, redirect_response};
use crate::routes::{RouteEntry, RouteTable, StaticAsset, StaticMount, content_type};
use bytes::Bytes;
use hyper::body::Incoming;
use hyper::header::{CONNECTION, HeaderValue, UPGRADE};
use hyper::http::request::Parts;
use hyper::{Method, Request, Response, StatusCode};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

pub const STUDENT_PATH: &str = "/student";
pub const PORTAL_PATH: &str = "/portal";
pub const WORKER_PATH: &str = "/worker.js";
pub const WORKER_CONTENT_TYPE: &str = "text/javascript";
pub const WORKER_FETCH_ERROR: &str = "Error fetching worker script";
pub const DEFAULT_TUNNEL_SUFFIX: &str = "/wisp/";

/// Errors returned to hyper; each one drops the connection without a response
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("upgrade to {path} rejected: no engine claims it")]
    UpgradeRejected { path: String },
}

/// Where a plain request goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification<'a> {
    BareClaimed,
    StudentRedirect,
    WorkerScript,
    StaticMatch(&'a RouteEntry),
    /// Static mounts, then the 404 page
    Unmatched,
}

/// Where an upgrade handshake goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeClassification {
    BareClaimed,
    TunnelUpgrade,
    Rejected,
}

/// Whether the request asks to switch protocols
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    connection_upgrade && req.headers().contains_key(UPGRADE)
}

/// Routing state shared by every connection
pub struct Router {
    bare: Arc<dyn BareEngine>,
    tunnel: Arc<dyn TunnelEngine>,
    worker: RemoteResourceCache,
    routes: RouteTable,
    mounts: Vec<StaticMount>,
    not_found: Bytes,
    tunnel_suffix: String,
}

impl Router {
    /// Create a router with an empty route table and no static mounts
    pub fn new(
        bare: Arc<dyn BareEngine>,
        tunnel: Arc<dyn TunnelEngine>,
        worker: RemoteResourceCache,
    ) -> Self {
        Self {
            bare,
            tunnel,
            worker,
            routes: RouteTable::default(),
            mounts: Vec::new(),
            not_found: Bytes::from_static(b"Not Found"),
            tunnel_suffix: DEFAULT_TUNNEL_SUFFIX.to_string(),
        }
    }

    pub fn with_routes(mut self, routes: RouteTable) -> Self {
        self.routes = routes;
        self
    }

    /// Static mounts, tried in order after the route table
    pub fn with_mounts(mut self, mounts: Vec<StaticMount>) -> Self {
        self.mounts = mounts;
        self
    }

    pub fn with_not_found(mut self, body: Bytes) -> Self {
        self.not_found = body;
        self
    }

    pub fn with_tunnel_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.tunnel_suffix = suffix.into();
        self
    }

    /// Entry point for hyper: upgrades and plain requests part ways here
    pub async fn handle(&self, req: Request<Incoming>) -> Result<Response<ServerBody>, RouteError> {
        if is_upgrade_request(&req) {
            self.route_upgrade(req).await
        } else {
            Ok(self.dispatch(req).await)
        }
    }

    pub fn classify(&self, head: &Parts) -> Classification<'_> {
        if self.bare.should_route(head) {
            return Classification::BareClaimed;
        }

        if head.method != Method::GET && head.method != Method::HEAD {
            return Classification::Unmatched;
        }

        match head.uri.path() {
            STUDENT_PATH => Classification::StudentRedirect,
            WORKER_PATH => Classification::WorkerScript,
            path => match self.routes.lookup(path) {
                Some(entry) => Classification::StaticMatch(entry),
                None => Classification::Unmatched,
            },
        }
    }

    pub fn classify_upgrade(&self, head: &Parts) -> UpgradeClassification {
        if self.bare.should_route(head) {
            UpgradeClassification::BareClaimed
        } else if head.uri.path().ends_with(&self.tunnel_suffix) {
            UpgradeClassification::TunnelUpgrade
        } else {
            UpgradeClassification::Rejected
        }
    }

    /// Produce the single response for a plain request
    pub async fn dispatch(&self, req: Request<Incoming>) -> Response<ServerBody> {
        let (head, body) = req.into_parts();
        let classification = self.classify(&head);
        debug!(method = %head.method, path = head.uri.path(), ?classification, "Dispatching request");

        match classification {
            Classification::BareClaimed => {
                self.bare
                    .route_request(Request::from_parts(head, body))
                    .await
            }
            Classification::StudentRedirect => {
                redirect_response(StatusCode::FOUND, HeaderValue::from_static(PORTAL_PATH))
            }
            Classification::WorkerScript => self.serve_worker().await,
            Classification::StaticMatch(entry) => self.serve_route(entry).await,
            Classification::Unmatched => self.serve_fallback(&head).await,
        }
    }

    /// Hand an upgrade to its engine, or refuse it
    pub async fn route_upgrade(&self, req: Request<Incoming>) -> Result<Response<ServerBody>, RouteError> {
        let (head, body) = req.into_parts();
        let classification = self.classify_upgrade(&head);
        debug!(path = head.uri.path(), ?classification, "Routing upgrade");

        let req = Request::from_parts(head, body);
        match classification {
            UpgradeClassification::BareClaimed => Ok(self.bare.route_upgrade(req).await),
            UpgradeClassification::TunnelUpgrade => Ok(self.tunnel.route_upgrade(req).await),
            UpgradeClassification::Rejected => Err(RouteError::UpgradeRejected {
                path: req.uri().path().to_string(),
            }),
        }
    }

    async fn serve_worker(&self) -> Response<ServerBody> {
        match self.worker.get().await {
            Ok(body) => bytes_response(StatusCode::OK, body, WORKER_CONTENT_TYPE),
            Err(e) => {
                warn!(error = %e, "Serving worker script failed");
                html_response(StatusCode::INTERNAL_SERVER_ERROR, WORKER_FETCH_ERROR)
            }
        }
    }

    async fn serve_route(&self, entry: &RouteEntry) -> Response<ServerBody> {
        match tokio::fs::read(&entry.file).await {
            Ok(bytes) => bytes_response(StatusCode::OK, bytes, content_type(&entry.file)),
            Err(e) => {
                error!(
                    path = %entry.path,
                    file = %entry.file.display(),
                    error = %e,
                    "Route file unavailable"
                );
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }

    async fn serve_fallback(&self, head: &Parts) -> Response<ServerBody> {
        if head.method == Method::GET || head.method == Method::HEAD {
            let path = head.uri.path();
            for mount in &self.mounts {
                match mount.load(path).await {
                    Ok(Some(StaticAsset::File { body, content_type: ct })) => {
                        return bytes_response(StatusCode::OK, body, ct);
                    }
                    Ok(Some(StaticAsset::Redirect(target))) => {
                        if let Some(location) = directory_location(&target, head) {
                            return redirect_response(StatusCode::MOVED_PERMANENTLY, location);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(path, mount = mount.prefix(), error = %e, "Static asset unreadable");
                        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
                    }
                }
            }
        }

        html_response(StatusCode::NOT_FOUND, self.not_found.clone())
    }
}

/// Location for a directory redirect, keeping the query string
fn directory_location(target: &str, head: &Parts) -> Option<HeaderValue> {
    let location = match head.uri.query() {
        Some(query) => format!("{}?{}", target, query),
        None => target.to_string(),
    };
    HeaderValue::from_str(&location).ok()
}
