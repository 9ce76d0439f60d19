use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use edge_core::drain::DrainWatcher;
use hyper::Request;
use hyper::body::Incoming;
use secrecy::{ExposeSecret, SecretString};

use super::hyper_helpers;
use crate::http::{Body, Response};
use crate::registry::Registry;
use crate::telemetry::metrics::Metrics;

/// Basic-auth-protected diagnostics: the route table snapshot and the varz counters.
pub struct Server {
	s: hyper_helpers::Server<State>,
}

struct State {
	registry: Arc<Registry>,
	metrics: Arc<Metrics>,
	// Precomputed `Basic <credentials>` value requests must present.
	expected_authorization: String,
}

impl Server {
	pub async fn new(
		address: SocketAddr,
		drain_rx: DrainWatcher,
		registry: Arc<Registry>,
		metrics: Arc<Metrics>,
		user: &str,
		pass: &SecretString,
	) -> anyhow::Result<Self> {
		let expected_authorization = format!(
			"Basic {}",
			STANDARD.encode(format!("{user}:{}", pass.expose_secret()))
		);
		hyper_helpers::Server::bind(
			"admin",
			address,
			drain_rx,
			State {
				registry,
				metrics,
				expected_authorization,
			},
		)
		.await
		.map(|s| Server { s })
	}

	pub fn address(&self) -> SocketAddr {
		self.s.address()
	}

	pub fn spawn(self) {
		self.s.spawn(|state, req| async move {
			if !authorized(&state, &req) {
				return Ok(
					::http::Response::builder()
						.status(hyper::StatusCode::UNAUTHORIZED)
						.header(hyper::header::WWW_AUTHENTICATE, "Basic realm=\"edgerouter\"")
						.body(Body::empty())
						.expect("builder with known status code should not fail"),
				);
			}
			match req.uri().path() {
				"/routes" => json_response(serde_json::to_value(state.registry.snapshot())?),
				"/varz" => {
					let mut varz = state.metrics.varz();
					varz["registered_uris"] = state.registry.len().into();
					json_response(varz)
				},
				_ => Ok(hyper_helpers::empty_response(hyper::StatusCode::NOT_FOUND)),
			}
		})
	}
}

fn authorized(state: &State, req: &Request<Incoming>) -> bool {
	req
		.headers()
		.get(hyper::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.map(|v| v == state.expected_authorization)
		.unwrap_or(false)
}

fn json_response(value: serde_json::Value) -> anyhow::Result<Response> {
	Ok(
		::http::Response::builder()
			.status(hyper::StatusCode::OK)
			.header(hyper::header::CONTENT_TYPE, "application/json")
			.body(Body::from(serde_json::to_vec(&value)?))
			.expect("builder with known status code should not fail"),
	)
}
