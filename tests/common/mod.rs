#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use dogeproxy::cache::{FetchError, ResourceFetcher};
use dogeproxy::response::{empty_body, text_response};
use dogeproxy::routes::load_not_found_page;
use dogeproxy::{
    BareEngine, ClientAddr, HttpFetcher, RemoteResourceCache, RouteTable, Router, Server,
    ServerBody, ServerConfig, StaticMount, TunnelEngine,
};
use futures_util::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::header::{CONNECTION, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::http::request::Parts;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use url::Url;

pub const INDEX_HTML: &str = "<!DOCTYPE html><h1>Doge</h1>";
pub const LOADER_HTML: &str = "<!DOCTYPE html><h1>Loading portal</h1>";
pub const NOT_FOUND_HTML: &str = "<!DOCTYPE html><h1>Lost?</h1>";

/// A running server under test
pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: watch::Sender<bool>,
    pub handle: JoinHandle<anyhow::Result<()>>,
    pub server: Arc<Server>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.send_replace(true);
        self.handle.await?
    }
}

/// Serve `router` on an ephemeral local port
pub async fn start_server(router: Router) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = watch::channel(false);

    let server = Arc::new(Server::new(ServerConfig { port: addr.port() }, router));
    let handle = tokio::spawn(server.clone().serve(listener, rx));

    TestServer {
        addr,
        shutdown,
        handle,
        server,
    }
}

/// Static directory with the pages the default route table expects
pub fn static_site() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let files = [
        ("index.html", INDEX_HTML),
        ("loader.html", LOADER_HTML),
        ("apps.html", "apps"),
        ("gms.html", "gms"),
        ("agloader.html", "lessons"),
        ("info.html", "info"),
        ("loading.html", "edu"),
        ("404.html", NOT_FOUND_HTML),
    ];
    for (name, content) in files {
        std::fs::write(dir.path().join(name), content).unwrap();
    }
    dir
}

/// Router over `static_dir` with the given engines and worker cache
pub fn router_for(
    static_dir: &Path,
    bare: Arc<dyn BareEngine>,
    tunnel: Arc<dyn TunnelEngine>,
    worker: RemoteResourceCache,
) -> Router {
    Router::new(bare, tunnel, worker)
        .with_routes(RouteTable::with_defaults(static_dir))
        .with_mounts(vec![StaticMount::new("/", static_dir)])
        .with_not_found(load_not_found_page(static_dir))
}

/// Worker cache backed by a real HTTP fetch of `url`
pub fn http_worker(url: &str, ttl: Duration) -> RemoteResourceCache {
    let fetcher = HttpFetcher::new(Url::parse(url).unwrap(), Duration::from_secs(5)).unwrap();
    RemoteResourceCache::new(Arc::new(fetcher), ttl)
}

/// Worker cache that fails every fetch
pub fn unreachable_worker() -> RemoteResourceCache {
    RemoteResourceCache::new(Arc::new(FailingFetcher), Duration::from_secs(60))
}

pub struct FailingFetcher;

#[async_trait]
impl ResourceFetcher for FailingFetcher {
    async fn fetch(&self) -> Result<Bytes, FetchError> {
        Err(FetchError::Transport("connection refused".to_string()))
    }
}

/// Bare engine that claims a prefix and counts what it is handed
pub struct CountingBare {
    prefix: &'static str,
    delay: Duration,
    pub requests: AtomicUsize,
    pub upgrades: AtomicUsize,
}

impl CountingBare {
    pub fn new(prefix: &'static str) -> Arc<Self> {
        Self::with_delay(prefix, Duration::ZERO)
    }

    pub fn with_delay(prefix: &'static str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            prefix,
            delay,
            requests: AtomicUsize::new(0),
            upgrades: AtomicUsize::new(0),
        })
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn upgrades(&self) -> usize {
        self.upgrades.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BareEngine for CountingBare {
    fn should_route(&self, head: &Parts) -> bool {
        head.uri.path().starts_with(self.prefix)
    }

    async fn route_request(&self, req: Request<Incoming>) -> Response<ServerBody> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        let peer = req
            .extensions()
            .get::<ClientAddr>()
            .map(|ClientAddr(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "none".to_string());
        let body = format!("bare|{} {}|peer={}", req.method(), req.uri().path(), peer);
        text_response(StatusCode::OK, &body)
    }

    async fn route_upgrade(&self, _req: Request<Incoming>) -> Response<ServerBody> {
        self.upgrades.fetch_add(1, Ordering::SeqCst);
        text_response(StatusCode::OK, "bare-upgrade")
    }
}

/// Tunnel engine that completes WebSocket handshakes and echoes messages
pub struct EchoTunnel {
    pub upgrades: AtomicUsize,
}

impl EchoTunnel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            upgrades: AtomicUsize::new(0),
        })
    }

    pub fn upgrades(&self) -> usize {
        self.upgrades.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelEngine for EchoTunnel {
    async fn route_upgrade(&self, mut req: Request<Incoming>) -> Response<ServerBody> {
        self.upgrades.fetch_add(1, Ordering::SeqCst);

        let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
            return text_response(StatusCode::BAD_REQUEST, "missing websocket key");
        };
        let accept = derive_accept_key(key.as_bytes());

        let on_upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            if let Ok(upgraded) = on_upgrade.await {
                let mut ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                while let Some(Ok(msg)) = ws.next().await {
                    if (msg.is_text() || msg.is_binary()) && ws.send(msg).await.is_err() {
                        break;
                    }
                }
            }
        });

        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = response.headers_mut();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(SEC_WEBSOCKET_ACCEPT, HeaderValue::from_str(&accept).unwrap());
        response
    }
}

/// Raw HTTP/1.1 upgrade handshake for `path`
pub fn raw_upgrade_request(path: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        path
    )
}
