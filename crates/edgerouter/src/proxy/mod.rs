pub mod gateway;
pub mod httpproxy;
pub mod pipeline;

pub use gateway::{BoundListener, Gateway};

use crate::http::{Body, HeaderValue, Response, StatusCode};
use crate::routeservice::ValidateError;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("route not found")]
	RouteNotFound,
	#[error("no healthy endpoints")]
	NoHealthyEndpoints,
	#[error("upstream call failed: {0}")]
	UpstreamCallFailed(hyper_util::client::legacy::Error),
	#[error("request timeout")]
	RequestTimeout,
	#[error("route service timeout")]
	RouteServiceTimeout,
	#[error("route services are not configured")]
	RouteServiceUnsupported,
	#[error("route service signature invalid: {0}")]
	RouteServiceSignature(#[from] ValidateError),
	#[error("route service forwarded url mismatch")]
	ForwardedUrlMismatch,
	#[error("invalid request")]
	InvalidRequest,
	#[error("request upgrade failed, backend tried {1:?} but {0:?} was requested")]
	UpgradeFailed(Option<HeaderValue>, Option<HeaderValue>),
	#[error("processing failed: {0}")]
	Processing(anyhow::Error),
	#[error("processing failed: {0}")]
	ProcessingString(String),
}

impl ProxyError {
	/// Retriable errors are the ones where the backend never produced a byte of response: the dial
	/// was refused, the connection reset before the status line, or its TLS handshake failed. All
	/// of those surface as a transport error from the pooled client before any response exists.
	/// Timeouts are not retried; a second attempt would double the worst case.
	pub fn is_retryable(&self) -> bool {
		matches!(self, ProxyError::UpstreamCallFailed(_))
	}

	pub fn as_response(&self) -> Response {
		let code = match self {
			ProxyError::RouteNotFound => StatusCode::NOT_FOUND,

			ProxyError::NoHealthyEndpoints => StatusCode::BAD_GATEWAY,
			ProxyError::UpstreamCallFailed(_) => StatusCode::BAD_GATEWAY,
			ProxyError::RequestTimeout => StatusCode::BAD_GATEWAY,
			ProxyError::RouteServiceTimeout => StatusCode::BAD_GATEWAY,
			ProxyError::RouteServiceUnsupported => StatusCode::BAD_GATEWAY,
			ProxyError::UpgradeFailed(_, _) => StatusCode::BAD_GATEWAY,

			ProxyError::RouteServiceSignature(_) => StatusCode::BAD_REQUEST,
			ProxyError::ForwardedUrlMismatch => StatusCode::BAD_REQUEST,
			ProxyError::InvalidRequest => StatusCode::BAD_REQUEST,

			ProxyError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::ProcessingString(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		::http::Response::builder()
			.status(code)
			.header(::http::header::CONTENT_TYPE, "text/plain")
			.body(Body::from(self.to_string()))
			.expect("builder with known status code should not fail")
	}
}
