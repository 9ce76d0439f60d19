use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use prometheus_client::registry::Registry as PromRegistry;
use secrecy::SecretString;

use super::*;
use crate::http::Body;
use crate::proxy::ProxyError;
use crate::registry::endpoint::{EndpointDetails, EndpointSpec};
use crate::registry::{Registry, RouteUri, SelectionPolicy};
use crate::routeservice::{Codec, DEFAULT_TIMEOUT};
use crate::telemetry::log::RequestLog;
use crate::telemetry::metrics::Metrics;
use crate::transport::stream::TcpConnectionInfo;

fn metrics() -> Arc<Metrics> {
	Arc::new(Metrics::new(&mut PromRegistry::default()))
}

fn log() -> RequestLog {
	RequestLog::new(
		metrics(),
		Instant::now(),
		TcpConnectionInfo {
			peer_addr: "203.0.113.7:55555".parse().unwrap(),
			local_addr: "127.0.0.1:80".parse().unwrap(),
			start: Instant::now(),
		},
	)
}

fn ctx() -> RequestCtx {
	RequestCtx {
		client_addr: "203.0.113.7:55555".parse().unwrap(),
		authoritative_client_addr: false,
		inbound_tls: false,
		mtls_peer: None,
		via_loopback: false,
		host: String::new(),
		original_authority: String::new(),
		original_url: String::new(),
		sticky: None,
		pool: None,
		route_service: None,
		selected: None,
	}
}

fn request(uri: &str) -> Request {
	::http::Request::builder()
		.uri(uri)
		.body(Body::empty())
		.unwrap()
}

fn endpoint_spec(host: &str, port: u16, id: &str) -> EndpointSpec {
	EndpointSpec {
		application_id: "app-guid".to_string(),
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

fn registry_with(uri: &str, spec: EndpointSpec, rs_url: Option<&str>) -> Arc<Registry> {
	let registry = Arc::new(Registry::new(SelectionPolicy::default()));
	registry.register(
		&RouteUri::parse(uri).unwrap(),
		spec,
		rs_url.map(|s| s.to_string()),
	);
	registry
}

fn leaf_cert() -> rustls_pki_types::CertificateDer<'static> {
	let key = rcgen::KeyPair::generate().unwrap();
	let params = rcgen::CertificateParams::new(vec!["client.example.com".to_string()]).unwrap();
	params.self_signed(&key).unwrap().der().clone()
}

mod host_normalizer {
	use super::*;

	#[test]
	fn lowercases_and_strips_port_and_dot() {
		let stage = HostNormalizer;
		let mut ctx = ctx();
		let mut req = request("http://App.Example.COM.:8081/Some/Path?q=1");
		stage.on_request(&mut ctx, &mut req, &mut log()).unwrap();
		assert_eq!(ctx.host, "app.example.com");
		assert_eq!(ctx.original_authority, "app.example.com.:8081");
		assert_eq!(
			ctx.original_url,
			"http://app.example.com.:8081/Some/Path?q=1"
		);
	}

	#[test]
	fn https_scheme_follows_tls() {
		let stage = HostNormalizer;
		let mut ctx = ctx();
		ctx.inbound_tls = true;
		let mut req = request("http://app.example.com/");
		stage.on_request(&mut ctx, &mut req, &mut log()).unwrap();
		assert_eq!(ctx.original_url, "https://app.example.com/");
	}

	#[test]
	fn missing_host_is_a_route_miss() {
		let stage = HostNormalizer;
		let mut req = ::http::Request::builder()
			.uri("/relative/only")
			.body(Body::empty())
			.unwrap();
		assert!(matches!(
			stage.on_request(&mut ctx(), &mut req, &mut log()),
			Err(ProxyError::RouteNotFound)
		));
	}
}

mod request_id {
	use super::*;
	use crate::http::x_headers::X_VCAP_REQUEST_ID;

	#[test]
	fn stamps_a_uuid() {
		let stage = RequestIdStamper;
		let mut req = request("http://app.example.com/");
		let mut log = log();
		stage.on_request(&mut ctx(), &mut req, &mut log).unwrap();
		let value = req.headers().get(X_VCAP_REQUEST_ID).unwrap().to_str().unwrap();
		assert!(uuid::Uuid::parse_str(value).is_ok());
		assert_eq!(log.request_id.as_deref(), Some(value));
		assert!(log.prior_request_id.is_none());
	}

	#[test]
	fn client_supplied_ids_are_overwritten() {
		let stage = RequestIdStamper;
		let mut req = request("http://app.example.com/");
		req
			.headers_mut()
			.insert(X_VCAP_REQUEST_ID, HeaderValue::from_static("BOGUS"));
		let mut log = log();
		stage.on_request(&mut ctx(), &mut req, &mut log).unwrap();
		let value = req.headers().get(X_VCAP_REQUEST_ID).unwrap().to_str().unwrap();
		assert_ne!(value, "BOGUS");
		assert!(uuid::Uuid::parse_str(value).is_ok());
		assert_eq!(log.prior_request_id.as_deref(), Some("BOGUS"));
	}
}

mod forwarded_headers {
	use super::*;
	use crate::http::x_headers::{X_FORWARDED_FOR, X_FORWARDED_HOST, X_FORWARDED_PROTO};

	fn normalized(mut ctx: RequestCtx, mut req: Request) -> (RequestCtx, Request) {
		HostNormalizer
			.on_request(&mut ctx, &mut req, &mut log())
			.unwrap();
		ForwardedHeaders
			.on_request(&mut ctx, &mut req, &mut log())
			.unwrap();
		(ctx, req)
	}

	#[test]
	fn appends_client_ip() {
		let mut req = request("http://app.example.com/");
		req
			.headers_mut()
			.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.1.1.1"));
		let (_, req) = normalized(ctx(), req);
		assert_eq!(
			req.headers().get(X_FORWARDED_FOR).unwrap(),
			"10.1.1.1, 203.0.113.7"
		);
		assert_eq!(req.headers().get(X_FORWARDED_PROTO).unwrap(), "http");
		assert_eq!(
			req.headers().get(X_FORWARDED_HOST).unwrap(),
			"app.example.com"
		);
	}

	#[test]
	fn proxy_protocol_address_replaces_the_chain() {
		let mut ctx = ctx();
		ctx.authoritative_client_addr = true;
		let mut req = request("http://app.example.com/");
		req
			.headers_mut()
			.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.1.1.1"));
		let (_, req) = normalized(ctx, req);
		assert_eq!(req.headers().get(X_FORWARDED_FOR).unwrap(), "203.0.113.7");
	}

	#[test]
	fn tls_yields_https_proto() {
		let mut ctx = ctx();
		ctx.inbound_tls = true;
		let (_, req) = normalized(ctx, request("http://app.example.com/"));
		assert_eq!(req.headers().get(X_FORWARDED_PROTO).unwrap(), "https");
	}

	#[test]
	fn existing_forwarded_host_is_preserved() {
		let mut req = request("http://app.example.com/");
		req
			.headers_mut()
			.insert(X_FORWARDED_HOST, HeaderValue::from_static("edge.example.com"));
		let (_, req) = normalized(ctx(), req);
		assert_eq!(
			req.headers().get(X_FORWARDED_HOST).unwrap(),
			"edge.example.com"
		);
	}
}

mod client_cert_forwarding {
	use super::*;
	use crate::http::x_headers::X_FORWARDED_CLIENT_CERT;

	fn req_with_xfcc() -> Request {
		let mut req = request("http://app.example.com/");
		req.headers_mut().insert(
			X_FORWARDED_CLIENT_CERT,
			HeaderValue::from_static("client-supplied"),
		);
		req
	}

	#[test]
	fn always_forward_leaves_the_header() {
		let stage = ClientCertForwarding {
			mode: XfccMode::AlwaysForward,
		};
		let mut req = req_with_xfcc();
		stage.on_request(&mut ctx(), &mut req, &mut log()).unwrap();
		assert_eq!(
			req.headers().get(X_FORWARDED_CLIENT_CERT).unwrap(),
			"client-supplied"
		);
	}

	#[test]
	fn forward_strips_without_mtls() {
		let stage = ClientCertForwarding {
			mode: XfccMode::Forward,
		};
		let mut req = req_with_xfcc();
		stage.on_request(&mut ctx(), &mut req, &mut log()).unwrap();
		assert!(req.headers().get(X_FORWARDED_CLIENT_CERT).is_none());
	}

	#[test]
	fn forward_keeps_with_mtls() {
		let stage = ClientCertForwarding {
			mode: XfccMode::Forward,
		};
		let mut ctx = ctx();
		ctx.mtls_peer = Some(leaf_cert());
		let mut req = req_with_xfcc();
		stage.on_request(&mut ctx, &mut req, &mut log()).unwrap();
		assert_eq!(
			req.headers().get(X_FORWARDED_CLIENT_CERT).unwrap(),
			"client-supplied"
		);
	}

	#[test]
	fn sanitize_set_replaces_with_leaf_der() {
		let stage = ClientCertForwarding {
			mode: XfccMode::SanitizeSet,
		};
		let mut ctx = ctx();
		let cert = leaf_cert();
		ctx.mtls_peer = Some(cert.clone());
		let mut req = req_with_xfcc();
		stage.on_request(&mut ctx, &mut req, &mut log()).unwrap();
		assert_eq!(
			req.headers().get(X_FORWARDED_CLIENT_CERT).unwrap(),
			STANDARD.encode(cert.as_ref()).as_str()
		);
	}

	#[test]
	fn sanitize_set_strips_without_mtls() {
		let stage = ClientCertForwarding {
			mode: XfccMode::SanitizeSet,
		};
		let mut req = req_with_xfcc();
		stage.on_request(&mut ctx(), &mut req, &mut log()).unwrap();
		assert!(req.headers().get(X_FORWARDED_CLIENT_CERT).is_none());
	}
}

mod sticky {
	use super::*;

	fn stage() -> StickyLookup {
		StickyLookup {
			cookie_names: vec!["JSESSIONID".to_string()],
		}
	}

	#[test]
	fn both_cookies_yield_a_hint() {
		let mut req = request("http://app.example.com/");
		req.headers_mut().insert(
			::http::header::COOKIE,
			HeaderValue::from_static("JSESSIONID=abc; __VCAP_ID__=instance-2"),
		);
		let mut ctx = ctx();
		stage().on_request(&mut ctx, &mut req, &mut log()).unwrap();
		assert_eq!(ctx.sticky.as_deref(), Some("instance-2"));
	}

	#[test]
	fn vcap_cookie_alone_is_ignored() {
		let mut req = request("http://app.example.com/");
		req.headers_mut().insert(
			::http::header::COOKIE,
			HeaderValue::from_static("__VCAP_ID__=instance-2"),
		);
		let mut ctx = ctx();
		stage().on_request(&mut ctx, &mut req, &mut log()).unwrap();
		assert!(ctx.sticky.is_none());
	}

	#[test]
	fn app_cookie_alone_is_ignored() {
		let mut req = request("http://app.example.com/");
		req.headers_mut().insert(
			::http::header::COOKIE,
			HeaderValue::from_static("JSESSIONID=abc"),
		);
		let mut ctx = ctx();
		stage().on_request(&mut ctx, &mut req, &mut log()).unwrap();
		assert!(ctx.sticky.is_none());
	}

	#[test]
	fn response_affinity_cookie_is_set() {
		let registry = registry_with(
			"app.example.com",
			endpoint_spec("10.0.0.1", 8080, "instance-1"),
			None,
		);
		let pool = registry.lookup("app.example.com", "/").unwrap();
		let mut ctx = ctx();
		ctx.selected = pool.select(None, &Default::default());

		let mut resp = ::http::Response::builder()
			.status(200)
			.header(::http::header::SET_COOKIE, "JSESSIONID=abc; Path=/")
			.body(Body::empty())
			.unwrap();
		stage().on_response(&ctx, &mut resp, &mut log());
		let cookies: Vec<_> = resp
			.headers()
			.get_all(::http::header::SET_COOKIE)
			.iter()
			.map(|v| v.to_str().unwrap().to_string())
			.collect();
		assert!(cookies.contains(&"__VCAP_ID__=instance-1; Path=/".to_string()));
	}

	#[test]
	fn no_affinity_cookie_without_app_cookie() {
		let registry = registry_with(
			"app.example.com",
			endpoint_spec("10.0.0.1", 8080, "instance-1"),
			None,
		);
		let pool = registry.lookup("app.example.com", "/").unwrap();
		let mut ctx = ctx();
		ctx.selected = pool.select(None, &Default::default());

		let mut resp = ::http::Response::builder()
			.status(200)
			.body(Body::empty())
			.unwrap();
		stage().on_response(&ctx, &mut resp, &mut log());
		assert!(resp.headers().get(::http::header::SET_COOKIE).is_none());
	}
}

mod registry_lookup {
	use super::*;

	#[test]
	fn miss_is_404_and_counted() {
		let m = metrics();
		let stage = RegistryLookup {
			registry: Arc::new(Registry::new(SelectionPolicy::default())),
			metrics: m.clone(),
		};
		let mut ctx = ctx();
		ctx.host = "unknown.example.com".to_string();
		let mut req = request("http://unknown.example.com/");
		assert!(matches!(
			stage.on_request(&mut ctx, &mut req, &mut log()),
			Err(ProxyError::RouteNotFound)
		));
		assert_eq!(m.route_misses.get(), 1);
	}

	#[test]
	fn hit_attaches_the_pool() {
		let registry = registry_with(
			"app.example.com",
			endpoint_spec("10.0.0.1", 8080, "a"),
			None,
		);
		let stage = RegistryLookup {
			registry,
			metrics: metrics(),
		};
		let mut ctx = ctx();
		ctx.host = "app.example.com".to_string();
		let mut req = request("http://app.example.com/some/path");
		stage.on_request(&mut ctx, &mut req, &mut log()).unwrap();
		assert!(ctx.pool.is_some());
	}
}

mod route_service {
	use super::*;
	use crate::http::x_headers::{
		X_CF_FORWARDED_URL, X_CF_PROXY_METADATA, X_CF_PROXY_SIGNATURE,
	};

	fn codec() -> Arc<Codec> {
		Arc::new(Codec::new(
			&SecretString::from("shared-secret".to_string()),
			None,
			DEFAULT_TIMEOUT,
		))
	}

	fn dispatcher(registry: Arc<Registry>, codec: Option<Arc<Codec>>) -> RouteServiceDispatcher {
		RouteServiceDispatcher {
			codec,
			registry,
			metrics: metrics(),
		}
	}

	fn rs_ctx(registry: &Arc<Registry>) -> RequestCtx {
		let mut ctx = ctx();
		ctx.host = "app.example.com".to_string();
		ctx.original_url = "http://app.example.com/".to_string();
		ctx.original_authority = "app.example.com".to_string();
		ctx.pool = registry.lookup("app.example.com", "/");
		ctx
	}

	#[test]
	fn outbound_hop_sets_envelope_headers() {
		let registry = registry_with(
			"app.example.com",
			endpoint_spec("10.0.0.1", 8080, "a"),
			Some("https://rs.example.com/filter"),
		);
		let stage = dispatcher(registry.clone(), Some(codec()));
		let mut ctx = rs_ctx(&registry);
		let mut req = request("http://app.example.com/");
		stage.on_request(&mut ctx, &mut req, &mut log()).unwrap();

		assert!(req.headers().contains_key(X_CF_PROXY_SIGNATURE));
		assert!(req.headers().contains_key(X_CF_PROXY_METADATA));
		assert_eq!(
			req.headers().get(X_CF_FORWARDED_URL).unwrap(),
			"http://app.example.com/"
		);
		let target = ctx.route_service.expect("target set");
		assert_eq!(target.uri.host(), Some("rs.example.com"));
		assert!(!target.hairpin);
	}

	#[test]
	fn return_hop_validates_and_strips_headers() {
		let registry = registry_with(
			"app.example.com",
			endpoint_spec("10.0.0.1", 8080, "a"),
			Some("https://rs.example.com"),
		);
		let c = codec();
		let envelope = c.create_request("http://app.example.com/").unwrap();
		let stage = dispatcher(registry.clone(), Some(c));
		let mut ctx = rs_ctx(&registry);
		let mut req = request("http://app.example.com/");
		req.headers_mut().insert(
			X_CF_PROXY_SIGNATURE,
			HeaderValue::try_from(envelope.signature).unwrap(),
		);
		req.headers_mut().insert(
			X_CF_PROXY_METADATA,
			HeaderValue::try_from(envelope.metadata).unwrap(),
		);
		stage.on_request(&mut ctx, &mut req, &mut log()).unwrap();
		// Back to normal backend routing, without leaking the envelope downstream.
		assert!(ctx.route_service.is_none());
		assert!(!req.headers().contains_key(X_CF_PROXY_SIGNATURE));
		assert!(!req.headers().contains_key(X_CF_PROXY_METADATA));
	}

	#[test]
	fn forwarded_url_mismatch_is_rejected() {
		let registry = registry_with(
			"app.example.com",
			endpoint_spec("10.0.0.1", 8080, "a"),
			Some("https://rs.example.com"),
		);
		let c = codec();
		let envelope = c.create_request("http://other.example.com/").unwrap();
		let stage = dispatcher(registry.clone(), Some(c));
		let mut ctx = rs_ctx(&registry);
		let mut req = request("http://app.example.com/");
		req.headers_mut().insert(
			X_CF_PROXY_SIGNATURE,
			HeaderValue::try_from(envelope.signature).unwrap(),
		);
		req.headers_mut().insert(
			X_CF_PROXY_METADATA,
			HeaderValue::try_from(envelope.metadata).unwrap(),
		);
		assert!(matches!(
			stage.on_request(&mut ctx, &mut req, &mut log()),
			Err(ProxyError::ForwardedUrlMismatch)
		));
	}

	#[test]
	fn expired_envelope_is_a_signature_error() {
		let registry = registry_with(
			"app.example.com",
			endpoint_spec("10.0.0.1", 8080, "a"),
			Some("https://rs.example.com"),
		);
		let strict = Arc::new(Codec::new(
			&SecretString::from("shared-secret".to_string()),
			None,
			Duration::ZERO,
		));
		let envelope = strict.create_request("http://app.example.com/").unwrap();
		std::thread::sleep(Duration::from_millis(5));
		let stage = dispatcher(registry.clone(), Some(strict));
		let mut ctx = rs_ctx(&registry);
		let mut req = request("http://app.example.com/");
		req.headers_mut().insert(
			X_CF_PROXY_SIGNATURE,
			HeaderValue::try_from(envelope.signature).unwrap(),
		);
		req.headers_mut().insert(
			X_CF_PROXY_METADATA,
			HeaderValue::try_from(envelope.metadata).unwrap(),
		);
		assert!(matches!(
			stage.on_request(&mut ctx, &mut req, &mut log()),
			Err(ProxyError::RouteServiceSignature(_))
		));
	}

	#[test]
	fn hairpin_detected_for_registered_route_service_host() {
		let registry = registry_with(
			"app.example.com",
			endpoint_spec("10.0.0.1", 8080, "a"),
			Some("https://rs.example.com"),
		);
		// The route service is itself an app routed by us.
		registry.register(
			&RouteUri::parse("rs.example.com").unwrap(),
			endpoint_spec("10.0.0.9", 9090, "rs"),
			None,
		);
		let stage = dispatcher(registry.clone(), Some(codec()));
		let mut ctx = rs_ctx(&registry);
		let mut req = request("http://app.example.com/");
		stage.on_request(&mut ctx, &mut req, &mut log()).unwrap();
		assert!(ctx.route_service.unwrap().hairpin);
	}

	#[test]
	fn loopback_arrivals_pass_through() {
		let registry = registry_with(
			"app.example.com",
			endpoint_spec("10.0.0.1", 8080, "a"),
			Some("https://rs.example.com"),
		);
		let stage = dispatcher(registry.clone(), Some(codec()));
		let mut ctx = rs_ctx(&registry);
		ctx.via_loopback = true;
		let mut req = request("http://app.example.com/");
		stage.on_request(&mut ctx, &mut req, &mut log()).unwrap();
		assert!(ctx.route_service.is_none());
	}

	#[test]
	fn missing_codec_is_an_error() {
		let registry = registry_with(
			"app.example.com",
			endpoint_spec("10.0.0.1", 8080, "a"),
			Some("https://rs.example.com"),
		);
		let stage = dispatcher(registry.clone(), None);
		let mut ctx = rs_ctx(&registry);
		let mut req = request("http://app.example.com/");
		assert!(matches!(
			stage.on_request(&mut ctx, &mut req, &mut log()),
			Err(ProxyError::RouteServiceUnsupported)
		));
	}
}

mod full_chain {
	use super::*;
	use crate::http::x_headers::{X_FORWARDED_FOR, X_VCAP_REQUEST_ID};

	#[test]
	fn standard_pipeline_prepares_a_request() {
		let registry = registry_with(
			"app.example.com",
			endpoint_spec("10.0.0.1", 8080, "a"),
			None,
		);
		let pipeline = Pipeline::standard(
			registry,
			None,
			metrics(),
			vec!["JSESSIONID".to_string()],
			XfccMode::SanitizeSet,
		);
		let mut ctx = ctx();
		let mut req = request("http://App.Example.Com/v1/users?id=7");
		let mut log = log();
		let short_circuit = pipeline.run_request(&mut ctx, &mut req, &mut log).unwrap();
		assert!(short_circuit.is_none());
		assert!(ctx.pool.is_some());
		assert_eq!(ctx.host, "app.example.com");
		assert!(req.headers().contains_key(X_VCAP_REQUEST_ID));
		assert_eq!(req.headers().get(X_FORWARDED_FOR).unwrap(), "203.0.113.7");
	}
}
