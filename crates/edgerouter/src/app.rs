use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use edge_core::signal::ShutdownMode;
use edge_core::{drain, readiness, signal};
use prometheus_client::registry::Registry as PromRegistry;
use rustls_pki_types::CertificateDer;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::management::{Health, HealthState};
use crate::proxy::{BoundListener, Gateway};
use crate::registry::subscriber::{RegistryEvent, Subscriber};
use crate::registry::{Registry, SelectionPolicy};
use crate::routeservice::Codec;
use crate::telemetry::metrics::Metrics;
use crate::transport::tls;
use crate::{Config, ProxyInputs, client, management};

pub async fn run(cfg: Arc<Config>) -> anyhow::Result<Bound> {
	let shutdown = signal::Shutdown::new();
	// Setup a drain channel. drain_tx is used to trigger a drain, which will complete
	// once all drain_rx handlers are dropped.
	let (drain_tx, drain_rx) = drain::new();
	// The management plane drains later than the data plane: an upstream balancer must keep seeing
	// 503 from /health for as long as requests are still finishing.
	let (mgmt_drain_tx, mgmt_drain_rx) = drain::new();

	let ready = readiness::Ready::new();
	let initial_routes = ready.register_task("initial routes");

	let mut prom = PromRegistry::default();
	let metrics = Arc::new(Metrics::new(prom.sub_registry_with_prefix("edgerouter")));
	let health = Health::new();

	let registry = Arc::new(Registry::new(SelectionPolicy {
		algorithm: cfg.balancing_algorithm,
		overload: cfg.overload,
	}));

	let route_service_codec = cfg.route_services.secret.as_ref().map(|secret| {
		Arc::new(Codec::new(
			secret,
			cfg.route_services.previous_secret.as_ref(),
			cfg.route_services.timeout,
		))
	});

	let provider = tls::provider(cfg.cipher_suites.as_deref()).context("crypto provider")?;

	// Frontend TLS, when an HTTPS listener is configured.
	let frontend_tls = if cfg.ssl_port.is_some() {
		let mut keypairs = Vec::new();
		for files in &cfg.tls_keypair_files {
			let cert = std::fs::read(&files.cert_file)
				.with_context(|| format!("reading {}", files.cert_file.display()))?;
			let key = std::fs::read(&files.key_file)
				.with_context(|| format!("reading {}", files.key_file.display()))?;
			keypairs.push(tls::Keypair::from_pem(&cert, &key)?);
		}
		let client_ca = match &cfg.client_ca_file {
			Some(path) => Some(load_pem_certs(path)?),
			None => None,
		};
		Some(tls::server_config(
			provider.clone(),
			keypairs,
			cfg.client_cert_validation,
			client_ca,
		)?)
	} else {
		None
	};

	let extra_roots = match &cfg.ca_certs_file {
		Some(path) => load_pem_certs(path)?,
		None => Vec::new(),
	};
	let backend_tls =
		tls::backend_client_config(provider.clone(), extra_roots, cfg.skip_ssl_validation)?;

	// The loopback hairpin listener: ephemeral port, runtime-generated mTLS identity.
	let loopback = tls::generate_loopback_identity(provider.clone()).context("loopback identity")?;
	let loopback_listener = TcpListener::bind(SocketAddr::new(
		IpAddr::V4(Ipv4Addr::LOCALHOST),
		0,
	))
	.await
	.context("binding loopback listener")?;
	let loopback_addr = loopback_listener.local_addr()?;

	let upstream = client::Client::new(
		backend_tls,
		Some(loopback.client.clone()),
		cfg.connect_timeout,
		cfg.backend_idle_timeout,
	);

	// Bind frontends now: a busy port is a startup failure, not something to discover later.
	let mut listeners = vec![BoundListener {
		name: "loopback".to_string(),
		listener: loopback_listener,
		tls: Some(loopback.server.clone()),
		proxy_protocol: false,
		loopback: true,
	}];
	let mut http_addr = None;
	let mut https_addr = None;
	if let Some(port) = cfg.port {
		let listener = TcpListener::bind(SocketAddr::new(cfg.ip, port))
			.await
			.with_context(|| format!("binding http listener on port {port}"))?;
		http_addr = Some(listener.local_addr()?);
		listeners.push(BoundListener {
			name: "http".to_string(),
			listener,
			tls: None,
			proxy_protocol: cfg.enable_proxy_protocol,
			loopback: false,
		});
	}
	if let Some(ssl_port) = cfg.ssl_port {
		let listener = TcpListener::bind(SocketAddr::new(cfg.ip, ssl_port))
			.await
			.with_context(|| format!("binding https listener on port {ssl_port}"))?;
		https_addr = Some(listener.local_addr()?);
		listeners.push(BoundListener {
			name: "https".to_string(),
			listener,
			tls: frontend_tls.clone(),
			proxy_protocol: cfg.enable_proxy_protocol,
			loopback: false,
		});
	}

	let pi = Arc::new(ProxyInputs {
		cfg: cfg.clone(),
		registry: registry.clone(),
		metrics: metrics.clone(),
		upstream,
		route_service_codec,
		loopback_addr: Some(loopback_addr),
	});

	// Route intake: seed the table from configuration, then follow the bus.
	let subscriber = Subscriber::new(registry.clone(), metrics.clone(), cfg.default_stale_threshold);
	for msg in &cfg.static_routes {
		if let Err(e) = subscriber.apply(&RegistryEvent::Register(msg.clone())) {
			anyhow::bail!("invalid static route: {e}");
		}
	}
	drop(initial_routes);
	let (events_tx, events_rx) = mpsc::channel(1024);
	tokio::spawn(subscriber.run(events_rx, drain_rx.clone()));

	registry.clone().start_pruning(cfg.prune_interval, drain_rx.clone());

	let health_server = management::health_server::Server::new(
		cfg.health_addr,
		mgmt_drain_rx.clone(),
		health.clone(),
		ready.clone(),
	)
	.await
	.context("health server starts")?;
	let health_addr = health_server.address();
	health_server.spawn();

	let mut admin_addr = None;
	match (&cfg.admin_user, &cfg.admin_pass) {
		(Some(user), Some(pass)) => {
			let admin = management::admin::Server::new(
				cfg.admin_addr,
				mgmt_drain_rx.clone(),
				registry.clone(),
				metrics.clone(),
				user,
				pass,
			)
			.await
			.context("admin server starts")?;
			admin_addr = Some(admin.address());
			admin.spawn();
		},
		_ => info!("admin credentials not configured; /routes and /varz are disabled"),
	}

	let gw = Gateway::new(pi, listeners, drain_rx.clone());
	tokio::spawn(gw.run());

	Ok(Bound {
		shutdown,
		drain_tx,
		mgmt_drain_tx,
		health,
		events: events_tx,
		drain_timeout: cfg.drain_timeout,
		http_addr,
		https_addr,
		health_addr,
		admin_addr,
		loopback_addr,
	})
}

pub struct Bound {
	pub shutdown: signal::Shutdown,
	drain_tx: drain::DrainTrigger,
	mgmt_drain_tx: drain::DrainTrigger,
	health: Health,
	events: mpsc::Sender<RegistryEvent>,
	drain_timeout: Duration,
	pub http_addr: Option<SocketAddr>,
	pub https_addr: Option<SocketAddr>,
	pub health_addr: SocketAddr,
	pub admin_addr: Option<SocketAddr>,
	pub loopback_addr: SocketAddr,
}

impl Bound {
	/// The channel an external bus binding pushes register/unregister events into.
	pub fn event_sender(&self) -> mpsc::Sender<RegistryEvent> {
		self.events.clone()
	}

	pub async fn wait_termination(self) -> anyhow::Result<()> {
		let mode = self.shutdown.wait().await;
		// Flip health first so the upstream balancer stops sending us traffic either way.
		self.health.set(HealthState::Draining);
		match mode {
			ShutdownMode::Graceful => {
				info!("drain started");
				if tokio::time::timeout(
					self.drain_timeout,
					self.drain_tx.start_drain_and_wait(drain::DrainMode::Graceful),
				)
				.await
				.is_err()
				{
					// Operators see this; requests that were still in flight were cut off.
					warn!("drain deadline exceeded, terminating with requests in flight");
				}
			},
			ShutdownMode::Immediate => {
				let _ = tokio::time::timeout(
					Duration::from_secs(5),
					self.drain_tx.start_drain_and_wait(drain::DrainMode::Immediate),
				)
				.await;
			},
		}
		// The data plane is quiet; now the management surfaces may go too.
		let _ = tokio::time::timeout(
			Duration::from_secs(2),
			self
				.mgmt_drain_tx
				.start_drain_and_wait(drain::DrainMode::Immediate),
		)
		.await;
		Ok(())
	}
}

fn load_pem_certs(path: &std::path::Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
	let pem = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
	let certs = rustls_pemfile::certs(&mut std::io::Cursor::new(pem))
		.collect::<Result<Vec<_>, _>>()
		.with_context(|| format!("parsing certificates from {}", path.display()))?;
	anyhow::ensure!(!certs.is_empty(), "no certificates in {}", path.display());
	Ok(certs)
}
