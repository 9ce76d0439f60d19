pub mod app;
pub mod client;
pub mod config;
pub mod http;
pub mod management;
pub mod proxy;
pub mod registry;
pub mod routeservice;
pub mod telemetry;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

pub use config::Config;

/// Everything the data plane needs, assembled once at startup and shared by every connection.
pub struct ProxyInputs {
	pub cfg: Arc<Config>,
	pub registry: Arc<registry::Registry>,
	pub metrics: Arc<telemetry::metrics::Metrics>,
	pub upstream: client::Client,
	pub route_service_codec: Option<Arc<routeservice::Codec>>,
	/// Where the internal mTLS hairpin listener ended up; None when it failed to come up.
	pub loopback_addr: Option<SocketAddr>,
}
