pub mod admin;
pub mod health_server;
mod hyper_helpers;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Process health as reported to an upstream load balancer: healthy serves 200, anything else
/// serves 503 so the balancer takes this instance out of rotation before it stops serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
	Healthy = 0,
	Degraded = 1,
	Draining = 2,
}

#[derive(Debug, Clone, Default)]
pub struct Health(Arc<AtomicU8>);

impl Health {
	pub fn new() -> Health {
		Health::default()
	}

	pub fn set(&self, state: HealthState) {
		self.0.store(state as u8, Ordering::Relaxed);
	}

	pub fn get(&self) -> HealthState {
		match self.0.load(Ordering::Relaxed) {
			0 => HealthState::Healthy,
			1 => HealthState::Degraded,
			_ => HealthState::Draining,
		}
	}

	pub fn is_healthy(&self) -> bool {
		self.get() == HealthState::Healthy
	}
}
