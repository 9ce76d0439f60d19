use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Router data-plane metrics. Registered under the `edgerouter` prefix; `/varz` renders the same
/// counters as JSON for the legacy diagnostics surface.
#[derive(Debug, Default)]
pub struct Metrics {
	pub requests: Counter,
	pub responses_2xx: Counter,
	pub responses_3xx: Counter,
	pub responses_4xx: Counter,
	pub responses_5xx: Counter,
	pub route_misses: Counter,
	pub bad_gateways: Counter,
	pub backend_retries: Counter,
	pub backend_failures: Counter,
	pub websocket_upgrades: Counter,
	pub route_service_errors: Counter,
	pub registrations: Counter,
	pub unregistrations: Counter,
	pub registration_errors: Counter,
	pub routes: Gauge,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Metrics {
		let m = Metrics::default();
		registry.register(
			"requests",
			"Total requests received",
			m.requests.clone(),
		);
		registry.register(
			"responses_2xx",
			"Responses with a 2xx status",
			m.responses_2xx.clone(),
		);
		registry.register(
			"responses_3xx",
			"Responses with a 3xx status",
			m.responses_3xx.clone(),
		);
		registry.register(
			"responses_4xx",
			"Responses with a 4xx status",
			m.responses_4xx.clone(),
		);
		registry.register(
			"responses_5xx",
			"Responses with a 5xx status",
			m.responses_5xx.clone(),
		);
		registry.register(
			"route_misses",
			"Requests with no matching route",
			m.route_misses.clone(),
		);
		registry.register(
			"bad_gateways",
			"Requests that exhausted all backend attempts",
			m.bad_gateways.clone(),
		);
		registry.register(
			"backend_retries",
			"Backend attempts retried against another endpoint",
			m.backend_retries.clone(),
		);
		registry.register(
			"backend_failures",
			"Backend attempts that failed",
			m.backend_failures.clone(),
		);
		registry.register(
			"websocket_upgrades",
			"Successfully established websocket upgrades",
			m.websocket_upgrades.clone(),
		);
		registry.register(
			"route_service_errors",
			"Route service envelopes that failed validation",
			m.route_service_errors.clone(),
		);
		registry.register(
			"registrations",
			"Route registration messages applied",
			m.registrations.clone(),
		);
		registry.register(
			"unregistrations",
			"Route unregistration messages applied",
			m.unregistrations.clone(),
		);
		registry.register(
			"registration_errors",
			"Registration messages rejected by validation",
			m.registration_errors.clone(),
		);
		registry.register("routes", "Registered route URIs", m.routes.clone());
		m
	}

	pub fn observe_status(&self, status: http::StatusCode) {
		match status.as_u16() {
			200..=299 => self.responses_2xx.inc(),
			300..=399 => self.responses_3xx.inc(),
			400..=499 => self.responses_4xx.inc(),
			_ => self.responses_5xx.inc(),
		};
	}

	/// varz renders the counters for the basic-auth diagnostics endpoint.
	pub fn varz(&self) -> serde_json::Value {
		serde_json::json!({
			"uptime_seconds": edge_core::telemetry::APPLICATION_START_TIME.elapsed().as_secs(),
			"requests": self.requests.get(),
			"responses_2xx": self.responses_2xx.get(),
			"responses_3xx": self.responses_3xx.get(),
			"responses_4xx": self.responses_4xx.get(),
			"responses_5xx": self.responses_5xx.get(),
			"route_misses": self.route_misses.get(),
			"bad_gateways": self.bad_gateways.get(),
			"backend_retries": self.backend_retries.get(),
			"backend_failures": self.backend_failures.get(),
			"websocket_upgrades": self.websocket_upgrades.get(),
			"route_service_errors": self.route_service_errors.get(),
			"registrations": self.registrations.get(),
			"unregistrations": self.unregistrations.get(),
			"registration_errors": self.registration_errors.get(),
			"routes": self.routes.get(),
		})
	}
}
