use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Instant;

use http_body::{Body, Frame, SizeHint};
use tracing::event;

use crate::telemetry::metrics::Metrics;
use crate::transport::stream::TcpConnectionInfo;

/// One access-log record. Filled in as the request moves through the pipeline; emitted (and
/// counted) when the response body completes, not when the handler returns, so streamed and
/// upgraded responses report their real duration.
#[derive(Debug)]
pub struct RequestLog {
	pub metrics: Arc<Metrics>,
	pub start: Instant,
	pub tcp_info: TcpConnectionInfo,

	pub host: Option<String>,
	pub method: Option<::http::Method>,
	pub path: Option<String>,
	pub version: Option<::http::Version>,
	pub status: Option<crate::http::StatusCode>,

	pub endpoint: Option<String>,
	pub application_id: Option<String>,
	pub instance_index: Option<String>,

	pub request_id: Option<String>,
	pub prior_request_id: Option<String>,

	pub route_service: Option<String>,
	pub retries: u32,
	pub upgrade: bool,
	pub error: Option<String>,
}

impl RequestLog {
	pub fn new(metrics: Arc<Metrics>, start: Instant, tcp_info: TcpConnectionInfo) -> RequestLog {
		metrics.requests.inc();
		RequestLog {
			metrics,
			start,
			tcp_info,
			host: None,
			method: None,
			path: None,
			version: None,
			status: None,
			endpoint: None,
			application_id: None,
			instance_index: None,
			request_id: None,
			prior_request_id: None,
			route_service: None,
			retries: 0,
			upgrade: false,
			error: None,
		}
	}
}

/// Owns a RequestLog and emits it exactly once, whenever it is dropped.
pub struct DropOnLog {
	log: Option<RequestLog>,
}

impl DropOnLog {
	pub fn as_mut(&mut self) -> Option<&mut RequestLog> {
		self.log.as_mut()
	}

	pub fn with(&mut self, f: impl FnOnce(&mut RequestLog)) {
		if let Some(log) = self.log.as_mut() {
			f(log)
		}
	}
}

impl From<RequestLog> for DropOnLog {
	fn from(log: RequestLog) -> Self {
		DropOnLog { log: Some(log) }
	}
}

impl Debug for DropOnLog {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DropOnLog").finish_non_exhaustive()
	}
}

impl Drop for DropOnLog {
	fn drop(&mut self) {
		let Some(log) = self.log.take() else {
			return;
		};

		if let Some(status) = log.status {
			log.metrics.observe_status(status);
		}

		let dur = format!("{}ms", log.start.elapsed().as_millis());
		event!(
			target: "request",
			parent: None,
			tracing::Level::INFO,

			src.addr = %log.tcp_info.peer_addr,
			http.method = log.method.as_ref().map(tracing::field::display),
			http.host = log.host.as_deref(),
			http.path = log.path.as_deref(),
			http.version = log.version.as_ref().map(tracing::field::debug),
			http.status = log.status.map(|s| s.as_u16()),

			endpoint = log.endpoint.as_deref(),
			app = log.application_id.as_deref(),
			instance = log.instance_index.as_deref(),

			request.id = log.request_id.as_deref(),
			request.id.prior = log.prior_request_id.as_deref(),
			route_service = log.route_service.as_deref(),
			retries = if log.retries > 0 { Some(log.retries) } else { None },
			upgrade = if log.upgrade { Some(true) } else { None },
			error = log.error.as_deref(),

			duration = %dur,
		);
	}
}

pin_project_lite::pin_project! {
	/// Carries the access-log guard inside the response body so the record is emitted when the
	/// stream finishes (or is abandoned), and trailer frames are still observed.
	#[derive(Debug)]
	pub struct LogBody<B> {
		#[pin]
		body: B,
		log: DropOnLog,
	}
}

impl<B> LogBody<B> {
	pub fn new(body: B, log: DropOnLog) -> Self {
		Self { body, log }
	}
}

impl<B: Body> Body for LogBody<B> {
	type Data = B::Data;
	type Error = B::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		let result = ready!(this.body.poll_frame(cx));
		Poll::Ready(result)
	}

	fn is_end_stream(&self) -> bool {
		self.body.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.body.size_hint()
	}
}
