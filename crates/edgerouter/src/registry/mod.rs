pub mod endpoint;
pub mod pool;
pub mod subscriber;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use edge_core::drain::DrainWatcher;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, trace};

pub use endpoint::{Endpoint, EndpointKey, EndpointSpec, OverloadPolicy};
pub use pool::{BalancingAlgorithm, Pool, RegisterOutcome, SelectionPolicy};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum RouteUriError {
	#[error("empty host")]
	EmptyHost,
	#[error("invalid uri: {0}")]
	Invalid(String),
}

/// A normalized route key: lowercased host with an optional path, e.g. `app.example.com` or
/// `app.example.com/v2`. Path segments are preserved verbatim; a trailing slash and trailing host
/// dot are dropped so equivalent registrations collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteUri(String);

impl RouteUri {
	pub fn parse(raw: &str) -> Result<RouteUri, RouteUriError> {
		let raw = raw.trim();
		let (host, path) = match raw.find('/') {
			Some(i) => (&raw[..i], raw[i..].trim_end_matches('/')),
			None => (raw, ""),
		};
		let host = host.trim_end_matches('.');
		if host.is_empty() {
			return Err(RouteUriError::EmptyHost);
		}
		if host.contains(char::is_whitespace) {
			return Err(RouteUriError::Invalid(raw.to_string()));
		}
		let mut key = host.to_ascii_lowercase();
		key.push_str(path);
		Ok(RouteUri(key))
	}

	/// Builds the deepest lookup key for a request host + path.
	pub fn for_request(host: &str, path: &str) -> Result<RouteUri, RouteUriError> {
		let path = path.trim_end_matches('/');
		let mut raw = String::with_capacity(host.len() + path.len());
		raw.push_str(host);
		raw.push_str(path);
		RouteUri::parse(&raw)
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Pops the last `/`-separated segment: `h/a/b` -> `h/a` -> `h` -> None.
	pub fn next_prefix(&self) -> Option<RouteUri> {
		self
			.0
			.rfind('/')
			.map(|i| RouteUri(self.0[..i].to_string()))
	}
}

impl std::fmt::Display for RouteUri {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

/// The route table: URI -> pool, fed by the pub/sub subscriber and consulted on every request.
/// Writers (register/unregister/prune) serialize on the top-level write lock; lookups take the
/// read lock briefly and then work on pool snapshots, so a slow writer never stalls the data path.
pub struct Registry {
	routes: RwLock<HashMap<RouteUri, Arc<Pool>>>,
	policy: SelectionPolicy,
}

impl Registry {
	pub fn new(policy: SelectionPolicy) -> Registry {
		Registry {
			routes: RwLock::new(HashMap::new()),
			policy,
		}
	}

	/// register adds (or refreshes) an endpoint under a URI, creating the pool on first sight.
	pub fn register(
		&self,
		uri: &RouteUri,
		spec: EndpointSpec,
		route_service_url: Option<String>,
	) -> RegisterOutcome {
		let mut routes = self.routes.write();
		let pool = routes
			.entry(uri.clone())
			.or_insert_with(|| Arc::new(Pool::new(self.policy)));
		let outcome = pool.add_or_refresh(spec, route_service_url);
		if outcome == RegisterOutcome::Added {
			debug!(uri = %uri, "endpoint registered");
		}
		outcome
	}

	/// unregister removes the endpoint; the pool goes away with its last member.
	pub fn unregister(&self, uri: &RouteUri, key: &EndpointKey) -> bool {
		let mut routes = self.routes.write();
		let Some(pool) = routes.get(uri) else {
			return false;
		};
		let removed = pool.remove(key);
		if removed {
			debug!(uri = %uri, endpoint = %key, "endpoint unregistered");
		}
		if pool.is_empty() {
			routes.remove(uri);
		}
		removed
	}

	/// lookup finds the pool whose URI is the longest prefix of host+path on `/` boundaries. Empty
	/// pools never match; the walk continues to shorter prefixes. O(path depth), not O(routes).
	pub fn lookup(&self, host: &str, path: &str) -> Option<Arc<Pool>> {
		let mut key = RouteUri::for_request(host, path).ok()?;
		let routes = self.routes.read();
		loop {
			if let Some(pool) = routes.get(&key)
				&& !pool.is_empty()
			{
				trace!(uri = %key, "route matched");
				return Some(pool.clone());
			}
			key = key.next_prefix()?;
		}
	}

	/// lookup_all returns every pool along the prefix chain, deepest first. For introspection.
	pub fn lookup_all(&self, host: &str, path: &str) -> Vec<(RouteUri, Arc<Pool>)> {
		let mut out = Vec::new();
		let Ok(mut key) = RouteUri::for_request(host, path) else {
			return out;
		};
		let routes = self.routes.read();
		loop {
			if let Some(pool) = routes.get(&key) {
				out.push((key.clone(), pool.clone()));
			}
			match key.next_prefix() {
				Some(next) => key = next,
				None => return out,
			}
		}
	}

	pub fn len(&self) -> usize {
		self.routes.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.routes.read().is_empty()
	}

	/// prune walks every pool, dropping endpoints past their stale threshold and then any pool left
	/// empty. Returns (endpoints removed, pools removed).
	pub fn prune(&self) -> (usize, usize) {
		let now = Instant::now();
		let mut routes = self.routes.write();
		let before = routes.len();
		let mut endpoints_removed = 0;
		routes.retain(|uri, pool| {
			endpoints_removed += pool.prune(now);
			let keep = !pool.is_empty();
			if !keep {
				debug!(uri = %uri, "pruned empty pool");
			}
			keep
		});
		(endpoints_removed, before - routes.len())
	}

	/// start_pruning runs the prune loop until drain.
	pub fn start_pruning(self: Arc<Self>, interval: Duration, drain: DrainWatcher) {
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			let wait = drain.wait_for_drain();
			tokio::pin!(wait);
			loop {
				tokio::select! {
					_ = ticker.tick() => {
						let (endpoints, _) = self.prune();
						if endpoints > 0 {
							info!(pruned = endpoints, "pruned stale endpoints");
						}
					}
					_ = &mut wait => {
						debug!("route pruning stopped");
						return;
					}
				}
			}
		});
	}

	/// snapshot captures a consistent view of the table for `/routes`.
	pub fn snapshot(&self) -> RegistrySnapshot {
		let pools: Vec<(RouteUri, Arc<Pool>)> = {
			let routes = self.routes.read();
			routes.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
		};
		RegistrySnapshot {
			routes: pools
				.into_iter()
				.map(|(uri, pool)| (uri.0, pool.dump()))
				.collect(),
		}
	}
}

#[derive(Serialize)]
pub struct RegistrySnapshot {
	#[serde(flatten)]
	pub routes: BTreeMap<String, pool::PoolSnapshot>,
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
