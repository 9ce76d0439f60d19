use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use headers::HeaderMapExt;
use rustls_pki_types::CertificateDer;
use tracing::debug;

use crate::http::x_headers::*;
use crate::http::{HeaderValue, Request, Response, Uri, strip_port};
use crate::proxy::ProxyError;
use crate::registry::pool::Pool;
use crate::registry::{Endpoint, Registry};
use crate::routeservice::Codec;
use crate::telemetry::log::RequestLog;
use crate::telemetry::metrics::Metrics;
use crate::transport::stream::{
	Extension, LoopbackMarker, ProxyProtocolInfo, TcpConnectionInfo, TlsConnectionInfo,
};

/// The cookie this router sets on responses to record which instance served the session. Clients
/// replay it together with the application's own session cookie to get sticky routing.
pub const VCAP_ID_COOKIE: &str = "__VCAP_ID__";

/// Everything the stages learn about one request, threaded through the chain.
pub struct RequestCtx {
	pub client_addr: SocketAddr,
	/// The client address came from a proxy-protocol preamble and overrides anything the request
	/// headers claim.
	pub authoritative_client_addr: bool,
	pub inbound_tls: bool,
	pub mtls_peer: Option<CertificateDer<'static>>,
	pub via_loopback: bool,

	pub host: String,
	pub original_authority: String,
	pub original_url: String,
	pub sticky: Option<String>,
	pub pool: Option<Arc<Pool>>,
	pub route_service: Option<RouteServiceTarget>,
	pub selected: Option<Arc<Endpoint>>,
}

pub struct RouteServiceTarget {
	pub uri: Uri,
	/// The route service's host is itself registered here, so the request must hairpin through the
	/// internal loopback listener rather than leave the process.
	pub hairpin: bool,
}

impl RequestCtx {
	pub fn new(connection: &Extension) -> RequestCtx {
		let tcp = connection
			.get::<TcpConnectionInfo>()
			.expect("tcp connection info must be set");
		let pp = connection.get::<ProxyProtocolInfo>();
		let tls = connection.get::<TlsConnectionInfo>();
		RequestCtx {
			client_addr: pp.map(|p| p.client_addr).unwrap_or(tcp.peer_addr),
			authoritative_client_addr: pp.is_some(),
			inbound_tls: tls.is_some() || pp.map(|p| p.tls).unwrap_or(false),
			mtls_peer: tls.and_then(|t| t.peer_certificate.clone()),
			via_loopback: connection.get::<LoopbackMarker>().is_some(),
			host: String::new(),
			original_authority: String::new(),
			original_url: String::new(),
			sticky: None,
			pool: None,
			route_service: None,
			selected: None,
		}
	}
}

pub enum StageFlow {
	Continue,
	Respond(Response),
}

/// One pipeline stage: a request hook that may mutate, short-circuit, or pass, and a response hook
/// run in reverse declaration order on the way out.
pub trait Stage: Send + Sync {
	fn name(&self) -> &'static str;

	fn on_request(
		&self,
		ctx: &mut RequestCtx,
		req: &mut Request,
		log: &mut RequestLog,
	) -> Result<StageFlow, ProxyError>;

	fn on_response(&self, _ctx: &RequestCtx, _resp: &mut Response, _log: &mut RequestLog) {}
}

pub struct Pipeline {
	stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
	pub fn new(stages: Vec<Box<dyn Stage>>) -> Pipeline {
		Pipeline { stages }
	}

	/// The declared stage order for this router.
	pub fn standard(
		registry: Arc<Registry>,
		codec: Option<Arc<Codec>>,
		metrics: Arc<Metrics>,
		sticky_cookie_names: Vec<String>,
		xfcc: XfccMode,
	) -> Pipeline {
		Pipeline::new(vec![
			Box::new(HostNormalizer),
			Box::new(RequestIdStamper),
			Box::new(ForwardedHeaders),
			Box::new(ClientCertForwarding { mode: xfcc }),
			Box::new(StickyLookup {
				cookie_names: sticky_cookie_names,
			}),
			Box::new(RegistryLookup {
				registry: registry.clone(),
				metrics: metrics.clone(),
			}),
			Box::new(RouteServiceDispatcher {
				codec,
				registry,
				metrics,
			}),
		])
	}

	pub fn run_request(
		&self,
		ctx: &mut RequestCtx,
		req: &mut Request,
		log: &mut RequestLog,
	) -> Result<Option<Response>, ProxyError> {
		for stage in &self.stages {
			match stage.on_request(ctx, req, log)? {
				StageFlow::Continue => {},
				StageFlow::Respond(resp) => {
					debug!(stage = stage.name(), "short-circuit");
					return Ok(Some(resp));
				},
			}
		}
		Ok(None)
	}

	pub fn run_response(&self, ctx: &RequestCtx, resp: &mut Response, log: &mut RequestLog) {
		for stage in self.stages.iter().rev() {
			stage.on_response(ctx, resp, log);
		}
	}
}

/// Lowercases the host, strips the trailing dot and the port, and records the absolute URL the
/// client asked for (needed verbatim later for the route service envelope).
pub struct HostNormalizer;

impl Stage for HostNormalizer {
	fn name(&self) -> &'static str {
		"host_normalizer"
	}

	fn on_request(
		&self,
		ctx: &mut RequestCtx,
		req: &mut Request,
		log: &mut RequestLog,
	) -> Result<StageFlow, ProxyError> {
		let Some(authority) = req.uri().authority() else {
			// No Host at all: nothing can ever match.
			return Err(ProxyError::RouteNotFound);
		};
		let authority = authority.as_str().to_ascii_lowercase();
		let host = strip_port(&authority).trim_end_matches('.').to_string();
		if host.is_empty() {
			return Err(ProxyError::RouteNotFound);
		}
		let scheme = if ctx.inbound_tls { "https" } else { "http" };
		let path_and_query = req
			.uri()
			.path_and_query()
			.map(|pq| pq.as_str())
			.unwrap_or("/");
		ctx.original_url = format!("{scheme}://{authority}{path_and_query}");
		ctx.original_authority = authority;
		log.host = Some(host.clone());
		log.path = Some(req.uri().path().to_string());
		log.method = Some(req.method().clone());
		log.version = Some(req.version());
		ctx.host = host;
		Ok(StageFlow::Continue)
	}
}

/// Always stamps a fresh request id; a client-supplied value is recorded for the access log but
/// never trusted downstream.
pub struct RequestIdStamper;

impl Stage for RequestIdStamper {
	fn name(&self) -> &'static str {
		"request_id"
	}

	fn on_request(
		&self,
		_ctx: &mut RequestCtx,
		req: &mut Request,
		log: &mut RequestLog,
	) -> Result<StageFlow, ProxyError> {
		if let Some(prior) = req.headers().get(X_VCAP_REQUEST_ID) {
			log.prior_request_id = prior.to_str().ok().map(|s| s.to_string());
		}
		let id = uuid::Uuid::new_v4().to_string();
		req.headers_mut().insert(
			X_VCAP_REQUEST_ID,
			HeaderValue::try_from(id.as_str()).expect("uuid is a valid header value"),
		);
		log.request_id = Some(id);
		Ok(StageFlow::Continue)
	}
}

/// X-Forwarded-For/Proto/Host bookkeeping. The client IP appends to any existing chain unless
/// proxy-protocol supplied an authoritative address, in which case the chain restarts from it.
pub struct ForwardedHeaders;

impl Stage for ForwardedHeaders {
	fn name(&self) -> &'static str {
		"forwarded_headers"
	}

	fn on_request(
		&self,
		ctx: &mut RequestCtx,
		req: &mut Request,
		_log: &mut RequestLog,
	) -> Result<StageFlow, ProxyError> {
		let client_ip = ctx.client_addr.ip().to_string();
		let xff = if ctx.authoritative_client_addr {
			client_ip.clone()
		} else {
			match req.headers().get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
				Some(existing) if !existing.is_empty() => format!("{existing}, {client_ip}"),
				_ => client_ip.clone(),
			}
		};
		req.headers_mut().insert(
			X_FORWARDED_FOR,
			HeaderValue::try_from(xff).map_err(|_| ProxyError::InvalidRequest)?,
		);

		let proto = if ctx.inbound_tls { "https" } else { "http" };
		req
			.headers_mut()
			.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

		if !req.headers().contains_key(X_FORWARDED_HOST) {
			req.headers_mut().insert(
				X_FORWARDED_HOST,
				HeaderValue::try_from(ctx.original_authority.as_str())
					.map_err(|_| ProxyError::InvalidRequest)?,
			);
		}
		Ok(StageFlow::Continue)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XfccMode {
	/// Leave whatever the client sent untouched.
	AlwaysForward,
	/// Keep the client's value only behind verified mTLS; strip it otherwise.
	Forward,
	/// Strip the inbound header unconditionally; replace it with the verified leaf cert when the
	/// connection was mTLS.
	#[default]
	SanitizeSet,
}

pub struct ClientCertForwarding {
	pub mode: XfccMode,
}

impl Stage for ClientCertForwarding {
	fn name(&self) -> &'static str {
		"client_cert_forwarding"
	}

	fn on_request(
		&self,
		ctx: &mut RequestCtx,
		req: &mut Request,
		_log: &mut RequestLog,
	) -> Result<StageFlow, ProxyError> {
		match self.mode {
			XfccMode::AlwaysForward => {},
			XfccMode::Forward => {
				if ctx.mtls_peer.is_none() {
					req.headers_mut().remove(X_FORWARDED_CLIENT_CERT);
				}
			},
			XfccMode::SanitizeSet => {
				req.headers_mut().remove(X_FORWARDED_CLIENT_CERT);
				if let Some(cert) = &ctx.mtls_peer {
					let encoded = STANDARD.encode(cert.as_ref());
					req.headers_mut().insert(
						X_FORWARDED_CLIENT_CERT,
						HeaderValue::try_from(encoded).map_err(|_| ProxyError::InvalidRequest)?,
					);
				}
			},
		}
		Ok(StageFlow::Continue)
	}
}

/// Sticky affinity is cookie-paired: the application's own session cookie says affinity is wanted,
/// and this router's `__VCAP_ID__` cookie says where. One without the other does nothing.
pub struct StickyLookup {
	pub cookie_names: Vec<String>,
}

impl StickyLookup {
	fn has_app_cookie(&self, cookies: &headers::Cookie) -> bool {
		self.cookie_names.iter().any(|n| cookies.get(n).is_some())
	}
}

impl Stage for StickyLookup {
	fn name(&self) -> &'static str {
		"sticky_lookup"
	}

	fn on_request(
		&self,
		ctx: &mut RequestCtx,
		req: &mut Request,
		_log: &mut RequestLog,
	) -> Result<StageFlow, ProxyError> {
		let Some(cookies) = req.headers().typed_get::<headers::Cookie>() else {
			return Ok(StageFlow::Continue);
		};
		if let Some(vcap) = cookies.get(VCAP_ID_COOKIE)
			&& self.has_app_cookie(&cookies)
		{
			ctx.sticky = Some(vcap.to_string());
		}
		Ok(StageFlow::Continue)
	}

	fn on_response(&self, ctx: &RequestCtx, resp: &mut Response, _log: &mut RequestLog) {
		let Some(endpoint) = &ctx.selected else {
			return;
		};
		if endpoint.private_instance_id.is_empty() {
			return;
		}
		let sets_app_cookie = resp
			.headers()
			.get_all(::http::header::SET_COOKIE)
			.iter()
			.filter_map(|v| v.to_str().ok())
			.filter_map(|v| v.split(';').next())
			.filter_map(|nv| nv.split_once('='))
			.any(|(name, _)| self.cookie_names.iter().any(|n| n == name.trim()));
		if !sets_app_cookie {
			return;
		}
		let cookie = format!(
			"{VCAP_ID_COOKIE}={}; Path=/",
			endpoint.private_instance_id
		);
		if let Ok(value) = HeaderValue::try_from(cookie) {
			resp.headers_mut().append(::http::header::SET_COOKIE, value);
		}
	}
}

/// Looks the normalized host + path up in the route table; no pool means 404.
pub struct RegistryLookup {
	pub registry: Arc<Registry>,
	pub metrics: Arc<Metrics>,
}

impl Stage for RegistryLookup {
	fn name(&self) -> &'static str {
		"registry_lookup"
	}

	fn on_request(
		&self,
		ctx: &mut RequestCtx,
		req: &mut Request,
		_log: &mut RequestLog,
	) -> Result<StageFlow, ProxyError> {
		match self.registry.lookup(&ctx.host, req.uri().path()) {
			Some(pool) => {
				ctx.pool = Some(pool);
				Ok(StageFlow::Continue)
			},
			None => {
				self.metrics.route_misses.inc();
				Err(ProxyError::RouteNotFound)
			},
		}
	}
}

/// When the matched pool names a route service, outbound requests are wrapped in the signed
/// envelope and redirected there; requests coming back from the route service are validated and
/// fall through to normal backend selection.
pub struct RouteServiceDispatcher {
	pub codec: Option<Arc<Codec>>,
	pub registry: Arc<Registry>,
	pub metrics: Arc<Metrics>,
}

impl Stage for RouteServiceDispatcher {
	fn name(&self) -> &'static str {
		"route_service"
	}

	fn on_request(
		&self,
		ctx: &mut RequestCtx,
		req: &mut Request,
		log: &mut RequestLog,
	) -> Result<StageFlow, ProxyError> {
		let Some(pool) = &ctx.pool else {
			return Ok(StageFlow::Continue);
		};
		let Some(rs_url) = pool.route_service_url() else {
			return Ok(StageFlow::Continue);
		};

		let has_signature = req.headers().contains_key(X_CF_PROXY_SIGNATURE);
		if has_signature {
			// Return hop: the route service is sending the request back at us.
			let codec = self
				.codec
				.as_ref()
				.ok_or(ProxyError::RouteServiceUnsupported)?;
			let signature = header_str(req, X_CF_PROXY_SIGNATURE)?;
			let metadata = header_str(req, X_CF_PROXY_METADATA)?;
			let validated = codec.validate_request(&signature, &metadata).map_err(|e| {
				self.metrics.route_service_errors.inc();
				ProxyError::RouteServiceSignature(e)
			})?;
			// A route service must not swing the request to a different app.
			if validated.forwarded_url != ctx.original_url {
				self.metrics.route_service_errors.inc();
				debug!(
					embedded = validated.forwarded_url,
					request = ctx.original_url,
					"forwarded url mismatch"
				);
				return Err(ProxyError::ForwardedUrlMismatch);
			}
			req.headers_mut().remove(X_CF_PROXY_SIGNATURE);
			req.headers_mut().remove(X_CF_PROXY_METADATA);
			req.headers_mut().remove(X_CF_FORWARDED_URL);
			return Ok(StageFlow::Continue);
		}

		if ctx.via_loopback {
			// Hairpinned arrival: this request already went through us on its way out.
			return Ok(StageFlow::Continue);
		}

		let codec = self
			.codec
			.as_ref()
			.ok_or(ProxyError::RouteServiceUnsupported)?;
		let rs_uri: Uri = rs_url
			.parse()
			.map_err(|e| ProxyError::Processing(anyhow::anyhow!("bad route service url: {e}")))?;
		let envelope = codec
			.create_request(&ctx.original_url)
			.map_err(ProxyError::Processing)?;

		req.headers_mut().insert(
			X_CF_PROXY_SIGNATURE,
			HeaderValue::try_from(envelope.signature).map_err(|_| ProxyError::InvalidRequest)?,
		);
		req.headers_mut().insert(
			X_CF_PROXY_METADATA,
			HeaderValue::try_from(envelope.metadata).map_err(|_| ProxyError::InvalidRequest)?,
		);
		req.headers_mut().insert(
			X_CF_FORWARDED_URL,
			HeaderValue::try_from(ctx.original_url.as_str()).map_err(|_| ProxyError::InvalidRequest)?,
		);

		let rs_host = rs_uri
			.host()
			.ok_or_else(|| ProxyError::Processing(anyhow::anyhow!("route service url has no host")))?
			.to_string();
		let hairpin = self.registry.lookup(&rs_host, rs_uri.path()).is_some();

		log.route_service = Some(rs_url.clone());
		ctx.route_service = Some(RouteServiceTarget {
			uri: rs_uri,
			hairpin,
		});
		Ok(StageFlow::Continue)
	}
}

fn header_str(req: &Request, name: ::http::HeaderName) -> Result<String, ProxyError> {
	req
		.headers()
		.get(&name)
		.and_then(|v| v.to_str().ok())
		.map(|s| s.to_string())
		.ok_or_else(|| {
			ProxyError::RouteServiceSignature(crate::routeservice::ValidateError::Malformed(format!(
				"missing {name} header"
			)))
		})
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod tests;
