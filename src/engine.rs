//! Protocol engines the routers delegate to
//!
//! The bare engine claims requests and upgrades by its own URL convention; the
//! tunnel engine takes the upgrades the router sends it. Both are traits so
//! the routers never depend on how an engine works. The adapters in this
//! module hand the traffic to upstream servers that implement the protocols.

use crate::response::{ServerBody, empty_body, error_response};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HOST, HeaderName, HeaderValue};
use hyper::http::request::Parts;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};
use url::Url;

/// Largest upstream upgrade response head we are willing to buffer
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

/// Address of the client that opened the connection, stored in request extensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// The URL-rewriting proxy engine
#[async_trait]
pub trait BareEngine: Send + Sync {
    /// Whether this engine owns the request or upgrade described by `head`
    fn should_route(&self, head: &Parts) -> bool;

    async fn route_request(&self, req: Request<Incoming>) -> Response<ServerBody>;

    async fn route_upgrade(&self, req: Request<Incoming>) -> Response<ServerBody>;
}

/// The raw stream tunneling engine
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    async fn route_upgrade(&self, req: Request<Incoming>) -> Response<ServerBody>;
}

/// An upstream server reached over plain TCP
#[derive(Debug, Clone)]
pub struct Upstream {
    host: String,
    port: u16,
}

impl Upstream {
    pub fn from_url(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("Upstream URL has no host: {}", url))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow!("Upstream URL has no port: {}", url))?;

        Ok(Self { host, port })
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn connect(&self) -> std::io::Result<TcpStream> {
        TcpStream::connect(self.authority()).await
    }
}

/// Bare engine that forwards everything below `prefix` to an upstream bare server
pub struct UpstreamBareEngine {
    prefix: String,
    upstream: Upstream,
}

impl UpstreamBareEngine {
    pub fn new(prefix: impl Into<String>, upstream: Upstream) -> Self {
        Self {
            prefix: prefix.into(),
            upstream,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[async_trait]
impl BareEngine for UpstreamBareEngine {
    fn should_route(&self, head: &Parts) -> bool {
        head.uri.path().starts_with(&self.prefix)
    }

    async fn route_request(&self, req: Request<Incoming>) -> Response<ServerBody> {
        forward_request(req, &self.upstream)
            .await
            .unwrap_or_else(|e| bad_gateway(&self.upstream, e))
    }

    async fn route_upgrade(&self, req: Request<Incoming>) -> Response<ServerBody> {
        forward_upgrade(req, &self.upstream)
            .await
            .unwrap_or_else(|e| bad_gateway(&self.upstream, e))
    }
}

/// Tunnel engine that forwards upgrades to an upstream wisp server
pub struct UpstreamTunnelEngine {
    upstream: Upstream,
}

impl UpstreamTunnelEngine {
    pub fn new(upstream: Upstream) -> Self {
        Self { upstream }
    }
}

#[async_trait]
impl TunnelEngine for UpstreamTunnelEngine {
    async fn route_upgrade(&self, req: Request<Incoming>) -> Response<ServerBody> {
        forward_upgrade(req, &self.upstream)
            .await
            .unwrap_or_else(|e| bad_gateway(&self.upstream, e))
    }
}

fn bad_gateway(upstream: &Upstream, e: anyhow::Error) -> Response<ServerBody> {
    error!(upstream = %upstream.authority(), error = %e, "Upstream engine failed");
    error_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
}

/// Forward a plain request, streaming both bodies
async fn forward_request(req: Request<Incoming>, upstream: &Upstream) -> Result<Response<ServerBody>> {
    let stream = upstream
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", upstream.authority()))?;

    let client_addr = req.extensions().get::<ClientAddr>().copied();
    let (parts, body) = req.into_parts();

    let original_host = parts
        .headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = path_and_query.parse().context("Invalid URI")?;

    debug!(upstream = %upstream.authority(), uri = %uri, "Forwarding request");

    let mut builder = Request::builder()
        .method(parts.method)
        .uri(uri)
        .version(Version::HTTP_11);

    for (key, value) in parts.headers.iter() {
        if key != HOST {
            builder = builder.header(key, value);
        }
    }

    let host = if original_host.is_empty() {
        upstream.authority()
    } else {
        original_host.clone()
    };
    builder = builder.header(HOST, &host);
    if let Some(ClientAddr(addr)) = client_addr {
        builder = builder.header("X-Forwarded-For", addr.ip().to_string());
    }
    builder = builder.header("X-Forwarded-Host", &host);
    builder = builder.header("X-Forwarded-Proto", "http");

    let proxy_req = builder.body(body).context("Failed to build proxy request")?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .context("Failed to establish connection to upstream")?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection error: {}", e);
        }
    });

    let response = sender
        .send_request(proxy_req)
        .await
        .context("Failed to send request to upstream")?;

    Ok(response.map(|body| body.boxed()))
}

/// Replay an upgrade handshake upstream and splice the sockets after `101`
async fn forward_upgrade(req: Request<Incoming>, upstream: &Upstream) -> Result<Response<ServerBody>> {
    let mut backend = upstream
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", upstream.authority()))?;

    backend
        .write_all(&build_upgrade_request(&req, upstream))
        .await
        .context("Failed to send upgrade request")?;

    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = backend
            .read(&mut chunk)
            .await
            .context("Failed to read upgrade response")?;
        if n == 0 {
            bail!("Upstream closed connection before responding to upgrade");
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            break end;
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            bail!("Upstream upgrade response head too large");
        }
    };

    let (status, headers) =
        parse_response_head(&buf[..head_end]).ok_or_else(|| anyhow!("Invalid upgrade response from upstream"))?;

    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    for (name, value) in headers {
        if status == StatusCode::SWITCHING_PROTOCOLS
            && (name == hyper::header::CONTENT_LENGTH || name == hyper::header::TRANSFER_ENCODING)
        {
            continue;
        }
        response.headers_mut().append(name, value);
    }

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(upstream = %upstream.authority(), status = %status, "Upstream rejected upgrade");
        return Ok(response);
    }

    // Anything read past the head already belongs to the upgraded stream.
    let early = buf.split_off(head_end);
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => splice(upgraded, backend, early).await,
            Err(e) => debug!(error = %e, "Client upgrade failed"),
        }
    });

    Ok(response)
}

async fn splice(client: Upgraded, mut backend: TcpStream, early: Vec<u8>) {
    let mut client = TokioIo::new(client);

    if !early.is_empty() {
        if let Err(e) = client.write_all(&early).await {
            debug!(error = %e, "Failed to flush early upstream bytes");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((to_upstream, to_client)) => {
            debug!(to_upstream, to_client, "Upgraded connection closed");
        }
        Err(e) => debug!(error = %e, "Upgraded connection closed with error"),
    }
}

/// Build the raw handshake sent upstream
fn build_upgrade_request<B>(req: &Request<B>, upstream: &Upstream) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut head = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", req.method(), path, upstream.authority());

    for (name, value) in req.headers() {
        if name == HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            head.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    if let Some(ClientAddr(addr)) = req.extensions().get::<ClientAddr>() {
        head.push_str(&format!("X-Forwarded-For: {}\r\n", addr.ip()));
    }
    head.push_str("\r\n");

    head.into_bytes()
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Parse `HTTP/1.1 101 Switching Protocols` plus headers
fn parse_response_head(head: &[u8]) -> Option<(StatusCode, Vec<(HeaderName, HeaderValue)>)> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    let status = StatusCode::from_bytes(parts.next()?.as_bytes()).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = HeaderName::from_bytes(name.trim().as_bytes()).ok()?;
            let value = HeaderValue::from_str(value.trim()).ok()?;
            headers.push((name, value));
        }
    }

    Some((status, headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(uri: &str) -> Parts {
        Request::builder().uri(uri).body(()).unwrap().into_parts().0
    }

    fn upstream() -> Upstream {
        Upstream::from_url(&Url::parse("http://127.0.0.1:8001").unwrap()).unwrap()
    }

    #[test]
    fn test_upstream_from_url() {
        let up = Upstream::from_url(&Url::parse("http://bare.internal").unwrap()).unwrap();
        assert_eq!(up.authority(), "bare.internal:80");
        assert_eq!(upstream().authority(), "127.0.0.1:8001");
    }

    #[test]
    fn test_bare_claims_prefix_only() {
        let bare = UpstreamBareEngine::new("/bear/", upstream());

        assert!(bare.should_route(&head("/bear/")));
        assert!(bare.should_route(&head("/bear/v3/?x=1")));
        assert!(!bare.should_route(&head("/bear")));
        assert!(!bare.should_route(&head("/app")));
        assert!(!bare.should_route(&head("/wisp/")));
    }

    #[test]
    fn test_build_upgrade_request() {
        let mut req = Request::builder()
            .uri("/wisp/?v=2")
            .header(HOST, "localhost:8000")
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .body(())
            .unwrap();
        req.extensions_mut()
            .insert(ClientAddr("10.0.0.7:5000".parse().unwrap()));

        let raw = String::from_utf8(build_upgrade_request(&req, &upstream())).unwrap();

        assert!(raw.starts_with("GET /wisp/?v=2 HTTP/1.1\r\nHost: 127.0.0.1:8001\r\n"));
        assert!(raw.contains("upgrade: websocket\r\n"));
        assert!(raw.contains("X-Forwarded-For: 10.0.0.7\r\n"));
        assert!(!raw.contains("localhost:8000"));
        assert!(raw.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_response_head() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let end = find_head_end(raw).unwrap();
        assert_eq!(end, raw.len());

        let (status, headers) = parse_response_head(&raw[..end]).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].0, hyper::header::UPGRADE);
        assert_eq!(headers[0].1, "websocket");
    }

    #[test]
    fn test_parse_response_head_rejects_garbage() {
        assert!(parse_response_head(b"SSH-2.0-OpenSSH\r\n\r\n").is_none());
        assert!(find_head_end(b"HTTP/1.1 101 Switching").is_none());
    }
}
