use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use edge_core::drain::DrainWatcher;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::endpoint::{BackendProtocol, EndpointDetails, EndpointKey, EndpointSpec};
use super::{Registry, RouteUri};
use crate::telemetry::metrics::Metrics;

/// The payload carried on both the register and unregister subjects of the bus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryMessage {
	pub host: String,
	#[serde(default)]
	pub port: u16,
	#[serde(default)]
	pub uris: Vec<String>,
	#[serde(default)]
	pub app: String,
	#[serde(default)]
	pub private_instance_id: String,
	#[serde(default)]
	pub private_instance_index: String,
	#[serde(default)]
	pub tags: BTreeMap<String, String>,
	#[serde(default)]
	pub stale_threshold_in_seconds: Option<u64>,
	#[serde(default)]
	pub route_service_url: String,
	#[serde(default)]
	pub server_cert_domain_san: String,
	#[serde(default)]
	pub tls_port: u16,
	#[serde(default)]
	pub protocol: String,
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
	Register(RegistryMessage),
	Unregister(RegistryMessage),
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum SubscribeError {
	#[error("registration without a usable port")]
	InvalidPort,
	#[error("route service url must be https: {0}")]
	InsecureRouteService(String),
	#[error("invalid uri {0:?}")]
	InvalidUri(String),
	#[error("unknown protocol {0:?}")]
	InvalidProtocol(String),
}

/// Subscriber applies bus messages to the registry. The transport (NATS or anything else that is
/// at-least-once and ordered per publisher) lives outside this crate; whatever it is, it feeds an
/// mpsc channel of events. Duplicates are harmless (register is idempotent) and loss heals itself
/// because every app re-registers within its stale threshold.
pub struct Subscriber {
	registry: Arc<Registry>,
	metrics: Arc<Metrics>,
	default_stale_threshold: Duration,
}

impl Subscriber {
	pub fn new(
		registry: Arc<Registry>,
		metrics: Arc<Metrics>,
		default_stale_threshold: Duration,
	) -> Subscriber {
		Subscriber {
			registry,
			metrics,
			default_stale_threshold,
		}
	}

	pub async fn run(self, mut rx: mpsc::Receiver<RegistryEvent>, drain: DrainWatcher) {
		let wait = drain.wait_for_drain();
		tokio::pin!(wait);
		loop {
			tokio::select! {
				event = rx.recv() => {
					let Some(event) = event else {
						debug!("event stream closed");
						return;
					};
					if let Err(e) = self.apply(&event) {
						self.metrics.registration_errors.inc();
						warn!("rejecting registry message: {e}");
					}
				}
				_ = &mut wait => {
					info!("route subscriber stopped");
					return;
				}
			}
		}
	}

	/// apply validates one message and mutates the registry. Rejected messages leave the registry
	/// untouched.
	pub fn apply(&self, event: &RegistryEvent) -> Result<(), SubscribeError> {
		match event {
			RegistryEvent::Register(msg) => self.apply_register(msg),
			RegistryEvent::Unregister(msg) => self.apply_unregister(msg),
		}
	}

	fn apply_register(&self, msg: &RegistryMessage) -> Result<(), SubscribeError> {
		let (spec, route_service_url, uris) = self.convert(msg)?;
		for uri in &uris {
			self
				.registry
				.register(uri, spec.clone(), route_service_url.clone());
		}
		self.metrics.registrations.inc();
		self.metrics.routes.set(self.registry.len() as i64);
		Ok(())
	}

	fn apply_unregister(&self, msg: &RegistryMessage) -> Result<(), SubscribeError> {
		let (spec, _, uris) = self.convert(msg)?;
		let key: EndpointKey = spec.key();
		for uri in &uris {
			self.registry.unregister(uri, &key);
		}
		self.metrics.unregistrations.inc();
		self.metrics.routes.set(self.registry.len() as i64);
		Ok(())
	}

	/// convert validates the wire message into an endpoint spec plus its parsed URIs.
	fn convert(
		&self,
		msg: &RegistryMessage,
	) -> Result<(EndpointSpec, Option<String>, Vec<RouteUri>), SubscribeError> {
		// A non-zero tls_port selects the TLS listener of the app over the plaintext one.
		let (port, use_tls) = if msg.tls_port > 0 {
			(msg.tls_port, true)
		} else {
			(msg.port, false)
		};
		if port == 0 {
			return Err(SubscribeError::InvalidPort);
		}

		let route_service_url = match msg.route_service_url.as_str() {
			"" => None,
			url if url.starts_with("https://") => Some(url.to_string()),
			url => return Err(SubscribeError::InsecureRouteService(url.to_string())),
		};

		let protocol = match msg.protocol.as_str() {
			"" => None,
			"http1" => Some(BackendProtocol::Http1),
			"http2" => Some(BackendProtocol::Http2),
			other => return Err(SubscribeError::InvalidProtocol(other.to_string())),
		};

		let uris = msg
			.uris
			.iter()
			.map(|u| RouteUri::parse(u).map_err(|_| SubscribeError::InvalidUri(u.clone())))
			.collect::<Result<Vec<_>, _>>()?;

		let spec = EndpointSpec {
			application_id: msg.app.clone(),
			host: msg.host.clone(),
			port,
			private_instance_id: msg.private_instance_id.clone(),
			private_instance_index: msg.private_instance_index.clone(),
			tags: msg.tags.clone(),
			details: EndpointDetails {
				use_tls,
				server_cert_san: match msg.server_cert_domain_san.as_str() {
					"" => None,
					san => Some(san.to_string()),
				},
				protocol,
				stale_threshold: msg
					.stale_threshold_in_seconds
					.map(Duration::from_secs)
					.unwrap_or(self.default_stale_threshold),
			},
		};
		Ok((spec, route_service_url, uris))
	}
}
