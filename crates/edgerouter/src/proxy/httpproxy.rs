use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use ::http::{HeaderMap, header};
use headers::HeaderMapExt;
use http_body::Body as HttpBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tracing::{debug, error, warn};

use crate::client::{Call, Transport};
use crate::http::timeout::BodyTimeout;
use crate::http::{
	Authority, Body, HeaderName, HeaderValue, Request, Response, Scheme, StatusCode, Uri,
};
use crate::proxy::ProxyError;
use crate::proxy::pipeline::{Pipeline, RequestCtx, RouteServiceTarget};
use crate::registry::endpoint::BackendProtocol;
use crate::ProxyInputs;
use crate::telemetry::log::{DropOnLog, LogBody, RequestLog};
use crate::transport::stream::{Extension, TcpConnectionInfo};

/// Request bodies up to this size are buffered so a failed attempt can be replayed against another
/// endpoint. Anything larger streams through and forfeits retries.
const MAX_BUFFERED_BYTES: u64 = 64 * 1024;

#[derive(Clone)]
pub struct HttpProxy {
	inputs: Arc<ProxyInputs>,
	pipeline: Arc<Pipeline>,
}

impl HttpProxy {
	pub fn new(inputs: Arc<ProxyInputs>) -> HttpProxy {
		let pipeline = Arc::new(Pipeline::standard(
			inputs.registry.clone(),
			inputs.route_service_codec.clone(),
			inputs.metrics.clone(),
			inputs.cfg.sticky_session_cookie_names.clone(),
			inputs.cfg.forwarded_client_cert,
		));
		HttpProxy { inputs, pipeline }
	}

	pub async fn proxy(&self, connection: Arc<Extension>, req: ::http::Request<Incoming>) -> Response {
		let start = Instant::now();
		let tcp = connection
			.get::<TcpConnectionInfo>()
			.expect("tcp connection info must be set")
			.clone();
		let mut log: DropOnLog =
			RequestLog::new(self.inputs.metrics.clone(), start, tcp).into();

		let mut ctx = RequestCtx::new(&connection);
		let ret = self
			.proxy_internal(&mut ctx, req, log.as_mut().expect("log is set"))
			.await;

		log.with(|l| l.error = ret.as_ref().err().map(|e| e.to_string()));
		let resp = ret.unwrap_or_else(|err| {
			if matches!(
				err,
				ProxyError::NoHealthyEndpoints | ProxyError::UpstreamCallFailed(_)
			) {
				self.inputs.metrics.bad_gateways.inc();
			}
			err.as_response()
		});

		log.with(|l| l.status = Some(resp.status()));
		// The log guard rides inside the body so the record is emitted when the response actually
		// finishes streaming.
		resp.map(move |b| Body::new(LogBody::new(b, log)))
	}

	async fn proxy_internal(
		&self,
		ctx: &mut RequestCtx,
		req: ::http::Request<Incoming>,
		log: &mut RequestLog,
	) -> Result<Response, ProxyError> {
		let mut req = req.map(Body::new);
		// A request without any host can never match a route.
		normalize_uri(ctx, &mut req).map_err(|_| ProxyError::RouteNotFound)?;
		let mut req_upgrade = hop_by_hop_headers(&mut req);

		if let Some(resp) = self.pipeline.run_request(ctx, &mut req, log)? {
			return Ok(resp);
		}

		let mut resp = if let Some(rs) = ctx.route_service.take() {
			self.route_service_trip(ctx, rs, req, log).await?
		} else {
			self.round_trip(ctx, req, &mut req_upgrade, log).await?
		};

		if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
			self.inputs.metrics.websocket_upgrades.inc();
			log.upgrade = true;
			return handle_upgrade(&mut req_upgrade, resp).await;
		}

		self.pipeline.run_response(ctx, &mut resp, log);
		strip_response_hop_headers(&mut resp);
		Ok(resp)
	}

	/// Dispatch to an external route service (or hairpin back through our own loopback listener
	/// when the route service is an app we route ourselves).
	async fn route_service_trip(
		&self,
		ctx: &mut RequestCtx,
		rs: RouteServiceTarget,
		mut req: Request,
		log: &mut RequestLog,
	) -> Result<Response, ProxyError> {
		let host = rs
			.uri
			.host()
			.ok_or_else(|| ProxyError::Processing(anyhow::anyhow!("route service url has no host")))?;
		let rs_authority = match rs.uri.port_u16() {
			Some(p) => format!("{host}:{p}"),
			None => format!("{host}:443"),
		};
		// Point the request at the route service, keeping its URL's path and query.
		let path_and_query = rs
			.uri
			.path_and_query()
			.map(|pq| pq.as_str().to_string())
			.unwrap_or_else(|| "/".to_string());
		crate::http::modify_req_uri(&mut req, |uri| {
			uri.scheme = Some(Scheme::HTTPS);
			uri.authority = Some(rs_authority.parse()?);
			uri.path_and_query = Some(path_and_query.parse()?);
			Ok(())
		})
		.map_err(ProxyError::Processing)?;
		req.headers_mut().insert(
			header::HOST,
			HeaderValue::try_from(rs_authority.as_str()).map_err(|_| ProxyError::InvalidRequest)?,
		);

		let (authority, transport) = if rs.hairpin {
			let loopback = self
				.inputs
				.loopback_addr
				.ok_or(ProxyError::RouteServiceUnsupported)?;
			(loopback.to_string(), Transport::Loopback)
		} else {
			(
				rs_authority,
				Transport::Tls {
					server_name: host.to_string(),
					h2: false,
				},
			)
		};

		debug!(target = %authority, hairpin = rs.hairpin, "dispatching to route service");
		let deadline = tokio::time::Instant::now() + self.inputs.cfg.endpoint_timeout;
		let call = self.inputs.upstream.call(Call {
			req,
			authority,
			transport,
		});
		let resp = tokio::time::timeout_at(deadline, call)
			.await
			.map_err(|_| ProxyError::RouteServiceTimeout)??;
		Ok(BodyTimeout::Deadline(deadline).apply(resp))
	}

	/// Select an endpoint and forward, retrying transport-level failures against other endpoints
	/// while no response byte has been produced.
	async fn round_trip(
		&self,
		ctx: &mut RequestCtx,
		req: Request,
		req_upgrade: &mut Option<RequestUpgrade>,
		log: &mut RequestLog,
	) -> Result<Response, ProxyError> {
		let pool = ctx.pool.clone().ok_or(ProxyError::RouteNotFound)?;
		let (head, body) = req.into_parts();

		// A request body we cannot replay rules out retries entirely.
		let (replay, mut streaming_body): (Option<bytes::Bytes>, Option<Body>) =
			if body.is_end_stream() {
				(Some(bytes::Bytes::new()), None)
			} else if body
				.size_hint()
				.exact()
				.is_some_and(|n| n <= MAX_BUFFERED_BYTES)
			{
				let collected = body.collect().await.map_err(|e| {
					ProxyError::Processing(anyhow::anyhow!("request body failed: {e}"))
				})?;
				(Some(collected.to_bytes()), None)
			} else {
				debug!("request body too large to buffer, disabling retries");
				(None, Some(body))
			};

		let max_attempts = if replay.is_some() {
			self.inputs.cfg.max_retries.max(1)
		} else {
			1
		};
		let mut excluded: HashSet<crate::registry::EndpointKey> = HashSet::new();
		let mut last_err = ProxyError::NoHealthyEndpoints;

		for attempt in 0..max_attempts {
			let Some(endpoint) = pool.select(ctx.sticky.as_deref(), &excluded) else {
				break;
			};
			let inflight = endpoint.start_request();
			let details = endpoint.details();
			if attempt > 0 {
				log.retries = attempt as u32;
				self.inputs.metrics.backend_retries.inc();
				debug!(endpoint = %endpoint.address(), attempt, "retrying against another endpoint");
			}

			let mut head = head.clone();
			let body = match (&replay, streaming_body.take()) {
				(Some(bytes), _) => Body::from(bytes.clone()),
				(None, Some(body)) => body,
				(None, None) => unreachable!("streaming bodies get exactly one attempt"),
			};
			// The backend sees the client's Host, but the connection goes to the endpoint.
			head.headers.insert(
				header::HOST,
				HeaderValue::try_from(ctx.original_authority.as_str())
					.map_err(|_| ProxyError::InvalidRequest)?,
			);
			let mut req = Request::from_parts(head, body);
			let transport = if details.use_tls {
				Transport::Tls {
					server_name: details
						.server_cert_san
						.clone()
						.unwrap_or_else(|| endpoint.host.clone()),
					h2: details.protocol == Some(BackendProtocol::Http2),
				}
			} else {
				Transport::Plaintext
			};
			if details.protocol == Some(BackendProtocol::Http2) {
				req.headers_mut().remove(header::TRANSFER_ENCODING);
				*req.version_mut() = ::http::Version::HTTP_2;
			}

			let deadline = tokio::time::Instant::now() + self.inputs.cfg.endpoint_timeout;
			let call = self.inputs.upstream.call(Call {
				req,
				authority: endpoint.address(),
				transport,
			});
			let res = match tokio::time::timeout_at(deadline, call).await {
				Ok(res) => res,
				Err(_) => Err(ProxyError::RequestTimeout),
			};

			match res {
				Ok(mut resp) => {
					endpoint.mark_success();
					log.endpoint = Some(endpoint.address());
					log.application_id = Some(endpoint.application_id.clone());
					log.instance_index = Some(endpoint.private_instance_index.clone());
					ctx.selected = Some(endpoint);
					// The in-flight count covers the whole exchange, so the guard rides along with
					// the response.
					resp.extensions_mut().insert(Arc::new(inflight));
					// Upgrades detach from the deadline once the 101 is delivered.
					if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
						return Ok(resp);
					}
					return Ok(BodyTimeout::Deadline(deadline).apply(resp));
				},
				Err(e) => {
					if e.is_retryable() {
						self.inputs.metrics.backend_failures.inc();
						endpoint.mark_failed();
						warn!(endpoint = %endpoint.address(), error = %e, "backend attempt failed");
						excluded.insert(endpoint.key());
						last_err = e;
						continue;
					}
					return Err(e);
				},
			}
		}
		Err(last_err)
	}
}

async fn handle_upgrade(
	req_upgrade_type: &mut Option<RequestUpgrade>,
	mut resp: Response,
) -> Result<Response, ProxyError> {
	let Some(RequestUpgrade {
		upgrade_type,
		upgrade,
	}) = std::mem::take(req_upgrade_type)
	else {
		return Err(ProxyError::UpgradeFailed(None, None));
	};
	let resp_upgrade_type = upgrade_type_of(resp.headers());
	if Some(&upgrade_type) != resp_upgrade_type.as_ref() {
		return Err(ProxyError::UpgradeFailed(
			Some(upgrade_type),
			resp_upgrade_type,
		));
	}
	let response_upgraded = resp
		.extensions_mut()
		.remove::<OnUpgrade>()
		.ok_or_else(|| ProxyError::ProcessingString("backend sent 101 without an upgrade".to_string()))?
		.await
		.map_err(|e| ProxyError::ProcessingString(format!("upgrade failed: {e:?}")))?;
	tokio::task::spawn(async move {
		let request_upgraded = match upgrade.await {
			Ok(u) => u,
			Err(e) => {
				error!("client upgrade error: {e}");
				return;
			},
		};
		// Two copy loops, one per direction, until either side hangs up.
		let _ = tokio::io::copy_bidirectional(
			&mut TokioIo::new(request_upgraded),
			&mut TokioIo::new(response_upgraded),
		)
		.await;
	});
	Ok(resp)
}

// Hop-by-hop headers. These are removed when sent to the backend.
// As of RFC 7230, hop-by-hop headers are required to appear in the
// Connection header field. These are the headers defined by the
// obsoleted RFC 2616 (section 13.5.1) and are used for backward
// compatibility.
static HOP_HEADERS: [HeaderName; 9] = [
	header::CONNECTION,
	// non-standard but still sent by libcurl and rejected by e.g. google
	HeaderName::from_static("proxy-connection"),
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

pub struct RequestUpgrade {
	upgrade_type: HeaderValue,
	upgrade: OnUpgrade,
}

fn hop_by_hop_headers(req: &mut Request) -> Option<RequestUpgrade> {
	let trailers = req
		.headers()
		.get(header::TE)
		.and_then(|h| h.to_str().ok())
		.map(|s| s.contains("trailers"))
		.unwrap_or(false);
	let upgrade_type = upgrade_type_of(req.headers());
	for h in HOP_HEADERS.iter() {
		req.headers_mut().remove(h);
	}
	// If the incoming request supports trailers, the downstream one will as well
	if trailers {
		req.headers_mut().typed_insert(headers::Te::trailers());
	}
	// After stripping all the hop-by-hop connection headers above, add back any
	// necessary for protocol upgrades, such as for websockets.
	if let Some(upgrade_type) = upgrade_type.clone() {
		req
			.headers_mut()
			.typed_insert(headers::Connection::upgrade());
		req.headers_mut().insert(header::UPGRADE, upgrade_type);
	}
	let on_upgrade = req.extensions_mut().remove::<OnUpgrade>();
	if let Some(t) = upgrade_type
		&& let Some(u) = on_upgrade
	{
		Some(RequestUpgrade {
			upgrade_type: t,
			upgrade: u,
		})
	} else {
		None
	}
}

fn upgrade_type_of(headers: &HeaderMap) -> Option<HeaderValue> {
	if let Some(con) = headers.typed_get::<headers::Connection>() {
		if con.contains(header::UPGRADE) {
			headers.get(header::UPGRADE).cloned()
		} else {
			None
		}
	} else {
		None
	}
}

fn strip_response_hop_headers(resp: &mut Response) {
	for h in HOP_HEADERS.iter() {
		resp.headers_mut().remove(h);
	}
}

// The http library will not put the authority into req.uri().authority for HTTP/1. Normalize so
// the rest of the code doesn't need to worry about it.
fn normalize_uri(ctx: &RequestCtx, req: &mut Request) -> anyhow::Result<()> {
	debug!("request before normalization: {req:?}");
	if let ::http::Version::HTTP_10 | ::http::Version::HTTP_11 = req.version()
		&& req.uri().authority().is_none()
	{
		let host = req
			.headers()
			.get(header::HOST)
			.and_then(|h| h.to_str().ok())
			.and_then(|h| h.parse::<Authority>().ok())
			.ok_or_else(|| anyhow::anyhow!("no authority or host"))?;
		req.headers_mut().remove(header::HOST);
		let mut parts = std::mem::take(req.uri_mut()).into_parts();
		parts.authority = Some(host);
		if parts.path_and_query.is_some() {
			parts.scheme = Some(if ctx.inbound_tls {
				Scheme::HTTPS
			} else {
				Scheme::HTTP
			});
		}
		*req.uri_mut() = Uri::from_parts(parts)?;
	}
	debug!("request after normalization: {req:?}");
	Ok(())
}
