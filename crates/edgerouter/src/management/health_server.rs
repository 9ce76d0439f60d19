use std::net::SocketAddr;

use edge_core::drain::DrainWatcher;
use edge_core::readiness;
use hyper::Request;
use hyper::body::Incoming;

use super::hyper_helpers;
use super::{Health, HealthState};
use crate::http::Response;

/// The surface an upstream load balancer watches. `/health` reflects readiness and drain state;
/// the liveness endpoint only proves the process is running and must never be used for balancing.
pub struct Server {
	s: hyper_helpers::Server<State>,
}

struct State {
	health: Health,
	ready: readiness::Ready,
}

impl Server {
	pub async fn new(
		address: SocketAddr,
		drain_rx: DrainWatcher,
		health: Health,
		ready: readiness::Ready,
	) -> anyhow::Result<Self> {
		hyper_helpers::Server::bind("health", address, drain_rx, State { health, ready })
			.await
			.map(|s| Server { s })
	}

	pub fn address(&self) -> SocketAddr {
		self.s.address()
	}

	pub fn spawn(self) {
		self.s.spawn(|state, req| async move {
			match req.uri().path() {
				"/health" => Ok(handle_health(&state, req)),
				"/is-process-alive-do-not-use-for-loadbalancing" => {
					Ok(hyper_helpers::plaintext_response(
						hyper::StatusCode::OK,
						"ok\n".to_string(),
					))
				},
				_ => Ok(hyper_helpers::empty_response(hyper::StatusCode::NOT_FOUND)),
			}
		})
	}
}

fn handle_health(state: &State, req: Request<Incoming>) -> Response {
	if req.method() != hyper::Method::GET {
		return hyper_helpers::empty_response(hyper::StatusCode::METHOD_NOT_ALLOWED);
	}
	if !state.ready.is_ready() {
		return hyper_helpers::plaintext_response(
			hyper::StatusCode::SERVICE_UNAVAILABLE,
			"initializing\n".to_string(),
		);
	}
	match state.health.get() {
		HealthState::Healthy => {
			hyper_helpers::plaintext_response(hyper::StatusCode::OK, "ok\n".to_string())
		},
		HealthState::Degraded => hyper_helpers::plaintext_response(
			hyper::StatusCode::SERVICE_UNAVAILABLE,
			"degraded\n".to_string(),
		),
		HealthState::Draining => hyper_helpers::plaintext_response(
			hyper::StatusCode::SERVICE_UNAVAILABLE,
			"draining\n".to_string(),
		),
	}
}
