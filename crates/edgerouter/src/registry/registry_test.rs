use std::sync::Arc;
use std::time::Duration;

use super::endpoint::{EndpointDetails, EndpointSpec};
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

fn uri(raw: &str) -> RouteUri {
	RouteUri::parse(raw).unwrap()
}

#[test]
fn route_uri_normalization() {
	assert_eq!(uri("App.Example.COM").as_str(), "app.example.com");
	assert_eq!(uri("app.example.com.").as_str(), "app.example.com");
	assert_eq!(uri("app.example.com/v2/").as_str(), "app.example.com/v2");
	// Path segments are preserved verbatim, only the host lowercases.
	assert_eq!(uri("app.example.com/V2").as_str(), "app.example.com/V2");
	assert_eq!(RouteUri::parse(""), Err(RouteUriError::EmptyHost));
	assert_eq!(RouteUri::parse("/path"), Err(RouteUriError::EmptyHost));
}

#[test]
fn next_prefix_walks_segments() {
	let deep = uri("h/a/b/c");
	let chain: Vec<String> = std::iter::successors(Some(deep), |u| u.next_prefix())
		.map(|u| u.as_str().to_string())
		.collect();
	assert_eq!(chain, vec!["h/a/b/c", "h/a/b", "h/a", "h"]);
}

#[test]
fn longest_prefix_wins() {
	let registry = Registry::new(SelectionPolicy::default());
	registry.register(&uri("app.example.com"), spec("10.0.0.1", 8080, "base"), None);
	registry.register(&uri("app.example.com/v2"), spec("10.0.0.2", 8080, "v2"), None);

	let base = registry.lookup("app.example.com", "/v1/users/1").unwrap();
	assert_eq!(base.snapshot()[0].address(), "10.0.0.1:8080");

	let v2 = registry.lookup("app.example.com", "/v2/users/1").unwrap();
	assert_eq!(v2.snapshot()[0].address(), "10.0.0.2:8080");

	let v2_exact = registry.lookup("app.example.com", "/v2").unwrap();
	assert_eq!(v2_exact.snapshot()[0].address(), "10.0.0.2:8080");
}

#[test]
fn prefix_matches_on_segment_boundaries_only() {
	let registry = Registry::new(SelectionPolicy::default());
	registry.register(&uri("h/foo"), spec("10.0.0.1", 8080, "a"), None);
	// `/foobar` shares a string prefix with `/foo` but not a path prefix.
	assert!(registry.lookup("h", "/foobar").is_none());
	assert!(registry.lookup("h", "/foo/bar").is_some());
}

#[test]
fn lookup_ignores_unknown_hosts() {
	let registry = Registry::new(SelectionPolicy::default());
	registry.register(&uri("app.example.com"), spec("10.0.0.1", 8080, "a"), None);
	assert!(registry.lookup("other.example.com", "/").is_none());
}

#[test]
fn register_is_idempotent_and_refreshes() {
	let registry = Registry::new(SelectionPolicy::default());
	let u = uri("app.example.com");
	assert_eq!(
		registry.register(&u, spec("10.0.0.1", 8080, "a"), None),
		RegisterOutcome::Added
	);
	let first_seen = registry.lookup("app.example.com", "/").unwrap().snapshot()[0].updated_at();
	std::thread::sleep(Duration::from_millis(5));
	assert_eq!(
		registry.register(&u, spec("10.0.0.1", 8080, "a"), None),
		RegisterOutcome::Refreshed
	);
	let pool = registry.lookup("app.example.com", "/").unwrap();
	assert_eq!(pool.len(), 1);
	assert!(pool.snapshot()[0].updated_at() > first_seen);
}

#[test]
fn unregister_drops_empty_pools() {
	let registry = Registry::new(SelectionPolicy::default());
	let u = uri("app.example.com");
	registry.register(&u, spec("10.0.0.1", 8080, "a"), None);
	registry.register(&u, spec("10.0.0.2", 8080, "b"), None);
	assert!(registry.unregister(&u, &spec("10.0.0.1", 8080, "a").key()));
	assert_eq!(registry.len(), 1);
	assert!(registry.unregister(&u, &spec("10.0.0.2", 8080, "b").key()));
	assert_eq!(registry.len(), 0);
	assert!(registry.lookup("app.example.com", "/").is_none());
	// Unregistering something unknown is a no-op.
	assert!(!registry.unregister(&u, &spec("10.0.0.9", 8080, "x").key()));
}

#[test]
fn prune_drops_stale_endpoints_and_empty_pools() {
	let registry = Registry::new(SelectionPolicy::default());
	let mut stale = spec("10.0.0.1", 8080, "a");
	stale.details.stale_threshold = Duration::from_millis(0);
	registry.register(&uri("stale.example.com"), stale, None);
	registry.register(&uri("fresh.example.com"), spec("10.0.0.2", 8080, "b"), None);
	std::thread::sleep(Duration::from_millis(5));
	let (endpoints, pools) = registry.prune();
	assert_eq!(endpoints, 1);
	assert_eq!(pools, 1);
	assert!(registry.lookup("stale.example.com", "/").is_none());
	assert!(registry.lookup("fresh.example.com", "/").is_some());
}

#[test]
fn prune_never_surfaces_stale_endpoints_to_lookups() {
	// Registrations and prunes race with lookups; a lookup may hold an endpoint selected just
	// before the prune, but must never observe one that was already stale when the pool snapshot
	// was taken after the prune finished.
	let registry = Arc::new(Registry::new(SelectionPolicy::default()));
	let u = uri("app.example.com");
	let mut stale = spec("10.0.0.1", 8080, "stale");
	stale.details.stale_threshold = Duration::from_millis(0);
	registry.register(&u, stale, None);
	registry.register(&u, spec("10.0.0.2", 8080, "live"), None);
	std::thread::sleep(Duration::from_millis(5));
	registry.prune();
	for _ in 0..32 {
		let pool = registry.lookup("app.example.com", "/").unwrap();
		for ep in pool.snapshot().iter() {
			assert_eq!(ep.private_instance_id, "live");
		}
	}
}

#[test]
fn concurrent_registers_and_lookups() {
	let registry = Arc::new(Registry::new(SelectionPolicy::default()));
	for i in 0..8 {
		registry.register(
			&uri(&format!("app{i}.example.com")),
			spec("10.0.0.1", 8080, &format!("seed{i}")),
			None,
		);
	}
	let mut handles = Vec::new();
	for t in 0..4 {
		let registry = registry.clone();
		handles.push(std::thread::spawn(move || {
			for i in 0..200 {
				let host = format!("w{t}-{i}.example.com");
				registry.register(&uri(&host), spec("10.0.0.1", 8080, "w"), None);
			}
		}));
	}
	for t in 0..4 {
		let registry = registry.clone();
		handles.push(std::thread::spawn(move || {
			for i in 0..200 {
				let host = format!("app{}.example.com", i % 8);
				assert!(registry.lookup(&host, "/some/path").is_some());
			}
		}));
	}
	for h in handles {
		h.join().unwrap();
	}
	assert_eq!(registry.len(), 8 + 4 * 200);
}
