pub mod timeout;

pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;
pub use ::http::uri::{Authority, Scheme};
pub use ::http::{
	HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, status, uri,
};

/// Headers this router reads or writes beyond the standard set.
pub mod x_headers {
	use http::HeaderName;

	pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
	pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
	pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
	pub const X_FORWARDED_CLIENT_CERT: HeaderName = HeaderName::from_static("x-forwarded-client-cert");
	pub const X_VCAP_REQUEST_ID: HeaderName = HeaderName::from_static("x-vcap-request-id");
	pub const X_CF_PROXY_SIGNATURE: HeaderName = HeaderName::from_static("x-cf-proxy-signature");
	pub const X_CF_PROXY_METADATA: HeaderName = HeaderName::from_static("x-cf-proxy-metadata");
	pub const X_CF_FORWARDED_URL: HeaderName = HeaderName::from_static("x-cf-forwarded-url");
}

pub fn modify_req_uri(
	req: &mut Request,
	f: impl FnOnce(&mut uri::Parts) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
	let nreq = std::mem::take(req);
	let (mut head, body) = nreq.into_parts();
	let mut parts = head.uri.into_parts();
	f(&mut parts)?;
	head.uri = Uri::from_parts(parts)?;
	*req = Request::from_parts(head, body);
	Ok(())
}

// copied from private `http` method
pub fn strip_port(auth: &str) -> &str {
	let host_port = auth
		.rsplit('@')
		.next()
		.expect("split always has at least 1 item");

	if host_port.as_bytes()[0] == b'[' {
		let i = host_port
			.find(']')
			.expect("parsing should validate brackets");
		&host_port[0..i + 1]
	} else {
		host_port
			.split(':')
			.next()
			.expect("split always has at least 1 item")
	}
}

pub fn empty_response(code: StatusCode) -> Response {
	::http::Response::builder()
		.status(code)
		.body(Body::empty())
		.expect("builder with known status code should not fail")
}

pub fn plaintext_response(code: StatusCode, body: impl Into<Body>) -> Response {
	::http::Response::builder()
		.status(code)
		.header(header::CONTENT_TYPE, "text/plain")
		.body(body.into())
		.expect("builder with known status code should not fail")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strip_port_variants() {
		assert_eq!(strip_port("example.com"), "example.com");
		assert_eq!(strip_port("example.com:8080"), "example.com");
		assert_eq!(strip_port("[::1]:8080"), "[::1]");
		assert_eq!(strip_port("[::1]"), "[::1]");
	}
}
