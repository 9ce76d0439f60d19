use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Identity of an endpoint. Two registrations referring to the same (host, port,
/// private_instance_id) triple are the same endpoint, whatever else changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
	pub host: String,
	pub port: u16,
	pub private_instance_id: String,
}

impl fmt::Display for EndpointKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&format_authority(&self.host, self.port))
	}
}

/// Hosts are IPv4/IPv6 literals or names off the bus; IPv6 literals must be bracketed before a
/// port can be appended or the result is not a parseable authority.
pub fn format_authority(host: &str, port: u16) -> String {
	if host.contains(':') && !host.starts_with('[') {
		format!("[{host}]:{port}")
	} else {
		format!("{host}:{port}")
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendProtocol {
	Http1,
	Http2,
}

/// Fields a re-registration may change without changing endpoint identity.
#[derive(Debug, Clone)]
pub struct EndpointDetails {
	pub use_tls: bool,
	pub server_cert_san: Option<String>,
	pub protocol: Option<BackendProtocol>,
	pub stale_threshold: Duration,
}

/// Inputs for creating (or refreshing) an endpoint in a pool.
#[derive(Debug, Clone)]
pub struct EndpointSpec {
	pub application_id: String,
	pub host: String,
	pub port: u16,
	pub private_instance_id: String,
	pub private_instance_index: String,
	pub tags: BTreeMap<String, String>,
	pub details: EndpointDetails,
}

impl EndpointSpec {
	pub fn key(&self) -> EndpointKey {
		EndpointKey {
			host: self.host.clone(),
			port: self.port,
			private_instance_id: self.private_instance_id.clone(),
		}
	}
}

/// A single backend instance. Identity is immutable; health bookkeeping and the re-registerable
/// details live behind short locks so selectors can hold a plain `Arc<Endpoint>` across a request
/// even if the pool membership changes underneath them.
#[derive(Debug)]
pub struct Endpoint {
	pub application_id: String,
	pub host: String,
	pub port: u16,
	pub private_instance_id: String,
	pub private_instance_index: String,
	pub tags: BTreeMap<String, String>,

	details: RwLock<EndpointDetails>,
	updated_at: Mutex<Instant>,
	fail_count: AtomicU32,
	failed_at: Mutex<Option<Instant>>,
	inflight: AtomicUsize,
}

impl PartialEq for Endpoint {
	fn eq(&self, other: &Self) -> bool {
		self.host == other.host
			&& self.port == other.port
			&& self.private_instance_id == other.private_instance_id
	}
}
impl Eq for Endpoint {}

impl Endpoint {
	pub fn new(spec: EndpointSpec) -> Endpoint {
		Endpoint {
			application_id: spec.application_id,
			host: spec.host,
			port: spec.port,
			private_instance_id: spec.private_instance_id,
			private_instance_index: spec.private_instance_index,
			tags: spec.tags,
			details: RwLock::new(spec.details),
			updated_at: Mutex::new(Instant::now()),
			fail_count: AtomicU32::new(0),
			failed_at: Mutex::new(None),
			inflight: AtomicUsize::new(0),
		}
	}

	pub fn key(&self) -> EndpointKey {
		EndpointKey {
			host: self.host.clone(),
			port: self.port,
			private_instance_id: self.private_instance_id.clone(),
		}
	}

	pub fn address(&self) -> String {
		format_authority(&self.host, self.port)
	}

	pub fn details(&self) -> EndpointDetails {
		self.details.read().clone()
	}

	/// refresh applies a re-registration: the mutable details are replaced and the freshness
	/// timestamp advances.
	pub fn refresh(&self, details: EndpointDetails) {
		*self.details.write() = details;
		*self.updated_at.lock() = Instant::now();
	}

	pub fn updated_at(&self) -> Instant {
		*self.updated_at.lock()
	}

	pub fn is_stale(&self, now: Instant) -> bool {
		let threshold = self.details.read().stale_threshold;
		now.saturating_duration_since(self.updated_at()) > threshold
	}

	pub fn mark_failed(&self) {
		self.fail_count.fetch_add(1, Ordering::Relaxed);
		*self.failed_at.lock() = Some(Instant::now());
	}

	pub fn mark_success(&self) {
		self.fail_count.store(0, Ordering::Relaxed);
		*self.failed_at.lock() = None;
	}

	pub fn fail_count(&self) -> u32 {
		self.fail_count.load(Ordering::Relaxed)
	}

	/// An endpoint is overloaded when it has accumulated too many failures and the most recent one
	/// is still within the cool-down window. Once the window passes it becomes eligible again
	/// (keeping its fail count until a success resets it).
	pub fn is_overloaded(&self, policy: &OverloadPolicy, now: Instant) -> bool {
		if self.fail_count.load(Ordering::Relaxed) < policy.max_fails {
			return false;
		}
		match *self.failed_at.lock() {
			Some(failed_at) => now.saturating_duration_since(failed_at) < policy.cooldown,
			None => false,
		}
	}

	pub fn inflight(&self) -> usize {
		self.inflight.load(Ordering::Relaxed)
	}

	/// Tracks an in-flight request for least-connection balancing. The guard decrements on drop.
	pub fn start_request(self: &Arc<Self>) -> InflightGuard {
		self.inflight.fetch_add(1, Ordering::Relaxed);
		InflightGuard(self.clone())
	}
}

/// When endpoints are skipped for having failed too recently.
#[derive(Debug, Clone, Copy)]
pub struct OverloadPolicy {
	pub max_fails: u32,
	pub cooldown: Duration,
}

impl Default for OverloadPolicy {
	fn default() -> Self {
		OverloadPolicy {
			max_fails: 3,
			cooldown: Duration::from_secs(30),
		}
	}
}

pub struct InflightGuard(Arc<Endpoint>);

impl Drop for InflightGuard {
	fn drop(&mut self) {
		self.0.inflight.fetch_sub(1, Ordering::Relaxed);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn spec(host: &str, port: u16, id: &str) -> EndpointSpec {
		EndpointSpec {
			application_id: "app".to_string(),
			host: host.to_string(),
			port,
			private_instance_id: id.to_string(),
			private_instance_index: "0".to_string(),
			tags: Default::default(),
			details: EndpointDetails {
				use_tls: false,
				server_cert_san: None,
				protocol: None,
				stale_threshold: Duration::from_secs(120),
			},
		}
	}

	#[test]
	fn equality_ignores_details() {
		let a = Endpoint::new(spec("10.0.0.1", 8080, "a"));
		let mut b_spec = spec("10.0.0.1", 8080, "a");
		b_spec.details.use_tls = true;
		b_spec.application_id = "other".to_string();
		let b = Endpoint::new(b_spec);
		assert_eq!(a, b);
		let c = Endpoint::new(spec("10.0.0.1", 8080, "c"));
		assert_ne!(a, c);
	}

	#[test]
	fn ipv6_hosts_are_bracketed() {
		let ep = Endpoint::new(spec("::1", 8080, "a"));
		assert_eq!(ep.address(), "[::1]:8080");
		assert_eq!(ep.key().to_string(), "[::1]:8080");
		assert_eq!(
			Endpoint::new(spec("10.0.0.1", 8080, "a")).address(),
			"10.0.0.1:8080"
		);
		// An already-bracketed host is not double-wrapped.
		assert_eq!(format_authority("[::1]", 8080), "[::1]:8080");
	}

	#[test]
	fn refresh_advances_updated_at() {
		let ep = Endpoint::new(spec("10.0.0.1", 8080, "a"));
		let before = ep.updated_at();
		std::thread::sleep(Duration::from_millis(5));
		ep.refresh(ep.details());
		assert!(ep.updated_at() > before);
	}

	#[test]
	fn overload_requires_recent_failures() {
		let policy = OverloadPolicy {
			max_fails: 2,
			cooldown: Duration::from_secs(30),
		};
		let ep = Endpoint::new(spec("10.0.0.1", 8080, "a"));
		let now = Instant::now();
		assert!(!ep.is_overloaded(&policy, now));
		ep.mark_failed();
		assert!(!ep.is_overloaded(&policy, now));
		ep.mark_failed();
		assert!(ep.is_overloaded(&policy, Instant::now()));
		// Past the cool-down the endpoint is retried again.
		assert!(!ep.is_overloaded(&policy, Instant::now() + Duration::from_secs(31)));
		ep.mark_success();
		assert_eq!(ep.fail_count(), 0);
	}

	#[test]
	fn inflight_guard_counts() {
		let ep = Arc::new(Endpoint::new(spec("10.0.0.1", 8080, "a")));
		assert_eq!(ep.inflight(), 0);
		let g1 = ep.start_request();
		let g2 = ep.start_request();
		assert_eq!(ep.inflight(), 2);
		drop(g1);
		assert_eq!(ep.inflight(), 1);
		drop(g2);
		assert_eq!(ep.inflight(), 0);
	}
}
