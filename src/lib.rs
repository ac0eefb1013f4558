//! DogeProxy - front door of a multi-protocol web proxy
//!
//! A single listener decides, per request or upgrade, who owns the connection:
//! - The bare engine, for everything below its URL prefix
//! - The wisp tunnel, for upgrades ending in `/wisp/`
//! - Static pages, a redirect and a cached remote worker script otherwise

pub mod cache;
pub mod engine;
pub mod lifecycle;
pub mod response;
pub mod router;
pub mod routes;
pub mod server;

pub use cache::{CacheStatus, FetchError, HttpFetcher, RemoteResourceCache, ResourceFetcher};
pub use engine::{BareEngine, ClientAddr, TunnelEngine, Upstream, UpstreamBareEngine, UpstreamTunnelEngine};
pub use lifecycle::{Signal, Supervisor};
pub use response::ServerBody;
pub use router::{Classification, RouteError, Router, UpgradeClassification};
pub use routes::{RouteEntry, RouteTable, StaticAsset, StaticMount};
pub use server::{Server, ServerConfig};
