use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;

use super::endpoint::{Endpoint, EndpointKey, EndpointSpec, OverloadPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancingAlgorithm {
	#[default]
	RoundRobin,
	LeastConnection,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionPolicy {
	pub algorithm: BalancingAlgorithm,
	pub overload: OverloadPolicy,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
	Added,
	Refreshed,
}

struct PoolInner {
	endpoints: Vec<Arc<Endpoint>>,
	// Iteration snapshot, rebuilt on mutation. Readers clone the Arc under the lock and iterate
	// outside it.
	snapshot: Arc<[Arc<Endpoint>]>,
}

impl PoolInner {
	fn rebuild(&mut self) {
		self.snapshot = self.endpoints.clone().into();
	}

	fn position(&self, key: &EndpointKey) -> Option<usize> {
		self.endpoints.iter().position(|e| {
			e.host == key.host && e.port == key.port && e.private_instance_id == key.private_instance_id
		})
	}
}

/// The set of endpoints serving one registered URI. Endpoints are kept in insertion order so
/// round-robin stays deterministic; mutation swaps a copy-on-write snapshot under a short lock.
pub struct Pool {
	inner: Mutex<PoolInner>,
	route_service_url: Mutex<Option<String>>,
	last_updated: Mutex<Instant>,
	cursor: AtomicUsize,
	policy: SelectionPolicy,
}

impl Pool {
	pub fn new(policy: SelectionPolicy) -> Pool {
		Pool {
			inner: Mutex::new(PoolInner {
				endpoints: Vec::new(),
				snapshot: Vec::new().into(),
			}),
			route_service_url: Mutex::new(None),
			last_updated: Mutex::new(Instant::now()),
			cursor: AtomicUsize::new(rand::rng().random_range(0..usize::MAX / 2)),
			policy,
		}
	}

	/// add_or_refresh registers an endpoint. A repeat registration (by endpoint equality) refreshes
	/// the freshness timestamp and the mutable details instead of growing the pool.
	pub fn add_or_refresh(
		&self,
		spec: EndpointSpec,
		route_service_url: Option<String>,
	) -> RegisterOutcome {
		let outcome = {
			let mut inner = self.inner.lock();
			match inner.position(&spec.key()) {
				Some(i) => {
					inner.endpoints[i].refresh(spec.details);
					RegisterOutcome::Refreshed
				},
				None => {
					inner.endpoints.push(Arc::new(Endpoint::new(spec)));
					inner.rebuild();
					RegisterOutcome::Added
				},
			}
		};
		// All endpoints of a pool must agree on the route service URL; the latest registration wins.
		{
			let mut current = self.route_service_url.lock();
			if *current != route_service_url {
				*current = route_service_url;
			}
		}
		*self.last_updated.lock() = Instant::now();
		outcome
	}

	pub fn remove(&self, key: &EndpointKey) -> bool {
		let mut inner = self.inner.lock();
		match inner.position(key) {
			Some(i) => {
				inner.endpoints.remove(i);
				inner.rebuild();
				*self.last_updated.lock() = Instant::now();
				true
			},
			None => false,
		}
	}

	/// prune drops endpoints whose age exceeds their own stale threshold. Returns how many were
	/// removed.
	pub fn prune(&self, now: Instant) -> usize {
		let mut inner = self.inner.lock();
		let before = inner.endpoints.len();
		inner.endpoints.retain(|e| !e.is_stale(now));
		let removed = before - inner.endpoints.len();
		if removed > 0 {
			inner.rebuild();
		}
		removed
	}

	pub fn snapshot(&self) -> Arc<[Arc<Endpoint>]> {
		self.inner.lock().snapshot.clone()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().endpoints.is_empty()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().endpoints.len()
	}

	pub fn route_service_url(&self) -> Option<String> {
		self.route_service_url.lock().clone()
	}

	pub fn last_updated(&self) -> Instant {
		*self.last_updated.lock()
	}

	/// select picks an endpoint for one request. A sticky hint wins when that instance is present
	/// and healthy; otherwise the configured strategy applies over the endpoints that are neither
	/// excluded (already attempted this request) nor overloaded.
	pub fn select(
		&self,
		sticky: Option<&str>,
		exclude: &HashSet<EndpointKey>,
	) -> Option<Arc<Endpoint>> {
		let snapshot = self.snapshot();
		let now = Instant::now();
		let live: Vec<&Arc<Endpoint>> = snapshot
			.iter()
			.filter(|e| !exclude.contains(&e.key()))
			.filter(|e| !e.is_overloaded(&self.policy.overload, now))
			.collect();
		if live.is_empty() {
			return None;
		}
		if let Some(id) = sticky
			&& let Some(found) = live.iter().find(|e| e.private_instance_id == id)
		{
			return Some(Arc::clone(found));
		}
		let chosen = match self.policy.algorithm {
			BalancingAlgorithm::RoundRobin => {
				let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % live.len();
				live[idx]
			},
			BalancingAlgorithm::LeastConnection => live
				.iter()
				.min_by_key(|e| e.inflight())
				.expect("live is non-empty"),
		};
		Some(Arc::clone(chosen))
	}
}

#[derive(Serialize)]
pub struct PoolSnapshot {
	pub endpoints: Vec<EndpointSnapshot>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub route_service_url: Option<String>,
	pub last_updated_ago_ms: u128,
}

#[derive(Serialize)]
pub struct EndpointSnapshot {
	pub address: String,
	pub app: String,
	pub private_instance_index: String,
	pub tls: bool,
	pub fail_count: u32,
	pub age_ms: u128,
}

impl Pool {
	pub fn dump(&self) -> PoolSnapshot {
		let now = Instant::now();
		PoolSnapshot {
			endpoints: self
				.snapshot()
				.iter()
				.map(|e| EndpointSnapshot {
					address: e.address(),
					app: e.application_id.clone(),
					private_instance_index: e.private_instance_index.clone(),
					tls: e.details().use_tls,
					fail_count: e.fail_count(),
					age_ms: now.saturating_duration_since(e.updated_at()).as_millis(),
				})
				.collect(),
			route_service_url: self.route_service_url(),
			last_updated_ago_ms: now.saturating_duration_since(self.last_updated()).as_millis(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::registry::endpoint::{BackendProtocol, EndpointDetails};
	use std::time::Duration;

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
	fn register_is_idempotent() {
		let pool = Pool::new(SelectionPolicy::default());
		assert_eq!(
			pool.add_or_refresh(spec("10.0.0.1", 8080, "a"), None),
			RegisterOutcome::Added
		);
		assert_eq!(
			pool.add_or_refresh(spec("10.0.0.1", 8080, "a"), None),
			RegisterOutcome::Refreshed
		);
		assert_eq!(pool.len(), 1);
	}

	#[test]
	fn refresh_updates_details() {
		let pool = Pool::new(SelectionPolicy::default());
		pool.add_or_refresh(spec("10.0.0.1", 8080, "a"), None);
		let mut updated = spec("10.0.0.1", 8080, "a");
		updated.details.use_tls = true;
		updated.details.protocol = Some(BackendProtocol::Http2);
		pool.add_or_refresh(updated, None);
		let ep = &pool.snapshot()[0];
		let details = ep.details();
		assert!(details.use_tls);
		assert_eq!(details.protocol, Some(BackendProtocol::Http2));
	}

	#[test]
	fn latest_route_service_url_wins() {
		let pool = Pool::new(SelectionPolicy::default());
		pool.add_or_refresh(
			spec("10.0.0.1", 8080, "a"),
			Some("https://rs1.example.com".to_string()),
		);
		pool.add_or_refresh(
			spec("10.0.0.2", 8080, "b"),
			Some("https://rs2.example.com".to_string()),
		);
		assert_eq!(
			pool.route_service_url().as_deref(),
			Some("https://rs2.example.com")
		);
	}

	#[test]
	fn round_robin_rotates_in_insertion_order() {
		let pool = Pool::new(SelectionPolicy::default());
		pool.add_or_refresh(spec("10.0.0.1", 8080, "a"), None);
		pool.add_or_refresh(spec("10.0.0.2", 8080, "b"), None);
		pool.add_or_refresh(spec("10.0.0.3", 8080, "c"), None);
		let picks: Vec<String> = (0..6)
			.map(|_| pool.select(None, &HashSet::new()).unwrap().address())
			.collect();
		// Rotation starts at an arbitrary offset but must visit each endpoint before repeating.
		let unique: HashSet<&String> = picks[..3].iter().collect();
		assert_eq!(unique.len(), 3);
		assert_eq!(picks[0], picks[3]);
		assert_eq!(picks[1], picks[4]);
	}

	#[test]
	fn sticky_hint_wins_and_falls_back() {
		let pool = Pool::new(SelectionPolicy::default());
		pool.add_or_refresh(spec("10.0.0.1", 8080, "a"), None);
		pool.add_or_refresh(spec("10.0.0.2", 8080, "b"), None);
		for _ in 0..4 {
			let picked = pool.select(Some("b"), &HashSet::new()).unwrap();
			assert_eq!(picked.address(), "10.0.0.2:8080");
		}
		// Hint for an instance that is gone routes normally instead of failing.
		assert!(pool.select(Some("gone"), &HashSet::new()).is_some());
	}

	#[test]
	fn overloaded_endpoints_are_skipped() {
		let pool = Pool::new(SelectionPolicy {
			algorithm: BalancingAlgorithm::RoundRobin,
			overload: OverloadPolicy {
				max_fails: 1,
				cooldown: Duration::from_secs(60),
			},
		});
		pool.add_or_refresh(spec("10.0.0.1", 8080, "a"), None);
		pool.add_or_refresh(spec("10.0.0.2", 8080, "b"), None);
		let bad = pool.snapshot()[0].clone();
		bad.mark_failed();
		for _ in 0..4 {
			let picked = pool.select(None, &HashSet::new()).unwrap();
			assert_eq!(picked.address(), "10.0.0.2:8080");
		}
		// All endpoints overloaded: nothing to select.
		pool.snapshot()[1].mark_failed();
		assert!(pool.select(None, &HashSet::new()).is_none());
	}

	#[test]
	fn least_connection_prefers_idle() {
		let pool = Pool::new(SelectionPolicy {
			algorithm: BalancingAlgorithm::LeastConnection,
			overload: OverloadPolicy::default(),
		});
		pool.add_or_refresh(spec("10.0.0.1", 8080, "a"), None);
		pool.add_or_refresh(spec("10.0.0.2", 8080, "b"), None);
		let busy = pool.snapshot()[0].clone();
		let _guard = busy.start_request();
		let picked = pool.select(None, &HashSet::new()).unwrap();
		assert_eq!(picked.address(), "10.0.0.2:8080");
	}

	#[test]
	fn prune_removes_stale_endpoints() {
		let pool = Pool::new(SelectionPolicy::default());
		let mut short = spec("10.0.0.1", 8080, "a");
		short.details.stale_threshold = Duration::from_millis(0);
		pool.add_or_refresh(short, None);
		pool.add_or_refresh(spec("10.0.0.2", 8080, "b"), None);
		std::thread::sleep(Duration::from_millis(5));
		// A selection taken before the prune stays valid for its request.
		let held = pool.select(None, &HashSet::new());
		assert_eq!(pool.prune(Instant::now()), 1);
		assert_eq!(pool.len(), 1);
		assert!(held.is_some());
	}
}
