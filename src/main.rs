//! DogeProxy - Main entry point

use anyhow::Result;
use clap::Parser;
use dogeproxy::lifecycle::wait_for_signal;
use dogeproxy::routes::load_not_found_page;
use dogeproxy::{
    HttpFetcher, RemoteResourceCache, RouteTable, Router, Server, ServerConfig, StaticMount,
    Supervisor, Upstream, UpstreamBareEngine, UpstreamTunnelEngine,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use url::Url;

/// DogeProxy - routes requests to the bare engine, the wisp tunnel or static content
#[derive(Parser, Debug)]
#[command(name = "dogeproxy")]
#[command(author = "DogeProxy Contributors")]
#[command(version)]
#[command(about = "Front door for the bare engine, the wisp tunnel and static content")]
struct Args {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8000")]
    port: u16,

    /// Directory holding the static pages
    #[arg(long, env = "STATIC_DIR", default_value = "./static")]
    static_dir: PathBuf,

    /// Extra static directory served below a prefix, as PREFIX=DIR
    #[arg(long = "mount", env = "STATIC_MOUNTS", value_delimiter = ',', value_parser = StaticMount::parse)]
    mounts: Vec<StaticMount>,

    /// Remote worker script served at /worker.js
    #[arg(long, env = "WORKER_URL", default_value = "https://cdn.surfdoge.pro/worker.js")]
    worker_url: Url,

    /// How long a fetched worker script stays fresh
    #[arg(long, env = "WORKER_TTL_SECS", default_value = "3600")]
    worker_ttl_secs: u64,

    /// Transport timeout for fetching the worker script
    #[arg(long, env = "WORKER_TIMEOUT_SECS", default_value = "30")]
    worker_timeout_secs: u64,

    /// URL prefix claimed by the bare engine
    #[arg(long, env = "BARE_PREFIX", default_value = "/bear/")]
    bare_prefix: String,

    /// Upstream bare server
    #[arg(long, env = "BARE_UPSTREAM", default_value = "http://127.0.0.1:8001")]
    bare_upstream: Url,

    /// Path suffix of upgrades handed to the tunnel engine
    #[arg(long, env = "TUNNEL_SUFFIX", default_value = "/wisp/")]
    tunnel_suffix: String,

    /// Upstream wisp server
    #[arg(long, env = "TUNNEL_UPSTREAM", default_value = "http://127.0.0.1:8002")]
    tunnel_upstream: Url,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting DogeProxy v{}", env!("CARGO_PKG_VERSION"));

    let routes = RouteTable::with_defaults(&args.static_dir);
    for entry in routes.missing_files() {
        error!(path = %entry.path, file = %entry.file.display(), "Route file missing");
    }

    // Static directory last so explicit mounts win
    let mut mounts = args.mounts;
    mounts.push(StaticMount::new("/", &args.static_dir));

    let fetcher = HttpFetcher::new(args.worker_url, Duration::from_secs(args.worker_timeout_secs))?;
    info!(url = %fetcher.url(), ttl_secs = args.worker_ttl_secs, "Worker script cache ready");
    let worker = RemoteResourceCache::new(Arc::new(fetcher), Duration::from_secs(args.worker_ttl_secs));

    let bare = UpstreamBareEngine::new(args.bare_prefix, Upstream::from_url(&args.bare_upstream)?);
    let tunnel = UpstreamTunnelEngine::new(Upstream::from_url(&args.tunnel_upstream)?);
    info!(
        prefix = bare.prefix(),
        bare_upstream = %args.bare_upstream,
        tunnel_suffix = %args.tunnel_suffix,
        tunnel_upstream = %args.tunnel_upstream,
        "Engines configured"
    );

    let router = Router::new(Arc::new(bare), Arc::new(tunnel), worker)
        .with_routes(routes)
        .with_mounts(mounts)
        .with_not_found(load_not_found_page(&args.static_dir))
        .with_tunnel_suffix(args.tunnel_suffix);

    let server = Arc::new(Server::new(ServerConfig { port: args.port }, router));
    let supervisor = Supervisor::new();
    let shutdown = supervisor.subscribe();

    supervisor
        .supervise(wait_for_signal(), server.run(shutdown))
        .await?;

    Ok(())
}
