use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use edge_core::drain;
use edge_core::drain::DrainWatcher;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, info_span, warn};

use super::httpproxy::HttpProxy;
use crate::ProxyInputs;
use crate::transport::stream::{LoggingMode, LoopbackMarker, Socket, TlsConnectionInfo};
use crate::transport::{proxyprotocol, tls};

/// A listener bound at startup. Binding happens before the gateway runs so a bind failure is a
/// startup failure, not a runtime surprise.
pub struct BoundListener {
	pub name: String,
	pub listener: TcpListener,
	pub tls: Option<Arc<rustls::ServerConfig>>,
	pub proxy_protocol: bool,
	/// The internal hairpin listener: mTLS-only, and connections with a verified peer certificate
	/// are marked as having arrived from this process.
	pub loopback: bool,
}

pub struct Gateway {
	pi: Arc<ProxyInputs>,
	listeners: Vec<BoundListener>,
	drain: DrainWatcher,
}

impl Gateway {
	pub fn new(pi: Arc<ProxyInputs>, listeners: Vec<BoundListener>, drain: DrainWatcher) -> Gateway {
		Gateway {
			pi,
			listeners,
			drain,
		}
	}

	pub async fn run(self) {
		let proxy = HttpProxy::new(self.pi.clone());
		let mut js = JoinSet::new();
		for bound in self.listeners {
			let span = info_span!("listener", name = bound.name.as_str());
			js.spawn(
				Self::run_listener(self.pi.clone(), proxy.clone(), bound, self.drain.clone())
					.instrument(span),
			);
		}
		while let Some(res) = js.join_next().await {
			if let Err(e) = res {
				warn!("listener task failed: {e}");
			}
		}
		info!("all listeners drained");
	}

	async fn run_listener(
		pi: Arc<ProxyInputs>,
		proxy: HttpProxy,
		bound: BoundListener,
		drain: DrainWatcher,
	) {
		let name = bound.name.clone();
		let addr = bound
			.listener
			.local_addr()
			.map(|a| a.to_string())
			.unwrap_or_default();
		info!(%addr, "listener established");
		let deadline = pi.cfg.drain_wait;
		let accept = async move |drain: DrainWatcher, mut force_shutdown: watch::Receiver<()>| {
			let wait = drain.clone().wait_for_drain();
			tokio::pin!(wait);
			// Transient accept errors back off instead of killing the listener.
			let mut backoff = Duration::from_millis(5);
			let shutdown = loop {
				tokio::select! {
					res = bound.listener.accept() => match res {
						Ok((stream, peer)) => {
							backoff = Duration::from_millis(5);
							debug!(%peer, "connection accepted");
							let pi = pi.clone();
							let proxy = proxy.clone();
							let tls = bound.tls.clone();
							let conn_drain = drain.clone();
							let force_shutdown = force_shutdown.clone();
							let proxy_protocol = bound.proxy_protocol;
							let loopback = bound.loopback;
							tokio::spawn(async move {
								handle_connection(
									pi,
									proxy,
									stream,
									tls,
									proxy_protocol,
									loopback,
									conn_drain,
									force_shutdown,
								)
								.await;
							});
						},
						Err(e) => {
							warn!("accept failed: {e}");
							tokio::time::sleep(backoff).await;
							backoff = (backoff * 2).min(Duration::from_secs(1));
						},
					},
					shutdown = &mut wait => break shutdown,
				}
			};
			info!("drain started, no longer accepting connections");
			// Release every handle this loop holds so the drain can complete as soon as the
			// spawned connections finish; completing this future early would force-terminate them.
			drop(bound);
			drop(shutdown);
			drop(drain);
			let _ = force_shutdown.changed().await;
		};
		drain::run_with_drain(format!("listener {name}"), drain, deadline, accept).await;
	}
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
	pi: Arc<ProxyInputs>,
	proxy: HttpProxy,
	stream: tokio::net::TcpStream,
	tls_config: Option<Arc<rustls::ServerConfig>>,
	proxy_protocol: bool,
	loopback: bool,
	conn_drain: DrainWatcher,
	mut force_shutdown: watch::Receiver<()>,
) {
	let mut socket = match Socket::from_tcp(stream) {
		Ok(s) => s,
		Err(e) => {
			warn!("failed to set up connection: {e}");
			return;
		},
	};
	socket.with_logging(LoggingMode::Downstream);
	let peer = socket.tcp().peer_addr;

	if proxy_protocol {
		match proxyprotocol::parse(&mut socket).await {
			Ok(Some(info)) => {
				socket.ext_mut().insert(info);
			},
			Ok(None) => {},
			Err(e) => {
				warn!(%peer, "rejecting connection with bad proxy protocol preamble: {e}");
				return;
			},
		}
	}

	let socket = match tls_config {
		Some(cfg) => match tls::accept(socket, cfg).await {
			Ok(s) => s,
			Err(e) => {
				// A failed handshake closes this connection; the listener is untouched.
				warn!(%peer, "TLS handshake failed: {e}");
				return;
			},
		},
		None => socket,
	};

	let mut socket = socket;
	if loopback {
		let verified = socket
			.ext::<TlsConnectionInfo>()
			.is_some_and(|t| t.peer_certificate.is_some());
		if verified {
			socket.ext_mut().insert(LoopbackMarker);
		}
	}

	let connection = Arc::new(socket.get_ext());
	let mut builder = auto::Builder::new(TokioExecutor::new());
	builder
		.http1()
		.timer(TokioTimer::new())
		.header_read_timeout(pi.cfg.read_header_timeout);
	builder.http2().timer(TokioTimer::new());
	let serve = builder.serve_connection_with_upgrades(
		TokioIo::new(socket),
		hyper::service::service_fn(move |req| {
			let proxy = proxy.clone();
			let connection = connection.clone();
			async move { Ok::<_, Infallible>(proxy.proxy(connection, req).await) }
		}),
	);
	tokio::pin!(serve);

	let drain_started = conn_drain.clone().wait_for_drain();
	tokio::select! {
		res = &mut serve => {
			if let Err(e) = res {
				debug!(%peer, "connection closed with error: {e}");
			}
		},
		shutdown = drain_started => {
			// Finish in-flight requests (GOAWAY for h2, `Connection: close` for h1), but give up
			// entirely once the hard deadline fires.
			serve.as_mut().graceful_shutdown();
			tokio::select! {
				res = &mut serve => {
					if let Err(e) = res {
						debug!(%peer, "connection closed during drain: {e}");
					}
				},
				_ = force_shutdown.changed() => {
					info!(%peer, "connection forcefully terminated");
				}
			}
			drop(shutdown);
		}
	}
	drop(conn_drain);
}
