use std::io::{Error, IoSlice};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use rustls_pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::event;

#[derive(Debug, Clone)]
pub struct TcpConnectionInfo {
	pub peer_addr: SocketAddr,
	pub local_addr: SocketAddr,
	pub start: Instant,
}

#[derive(Debug, Clone, Eq, PartialEq, Copy)]
pub enum Alpn {
	Http11,
	H2,
	Other,
}

impl From<&[u8]> for Alpn {
	fn from(value: &[u8]) -> Self {
		if value == b"h2" {
			Alpn::H2
		} else if value == b"http/1.1" {
			Alpn::Http11
		} else {
			Alpn::Other
		}
	}
}

#[derive(Debug, Clone)]
pub struct TlsConnectionInfo {
	pub server_name: Option<String>,
	pub negotiated_alpn: Option<Alpn>,
	/// Leaf certificate the peer presented, when client auth ran.
	pub peer_certificate: Option<CertificateDer<'static>>,
}

/// Marks a connection accepted on the internal loopback listener with a verified client
/// certificate; requests on it arrived from this process.
#[derive(Debug, Clone, Copy)]
pub struct LoopbackMarker;

/// The observed client address according to a proxy-protocol preamble. Authoritative: replaces the
/// TCP peer address for forwarding decisions.
#[derive(Debug, Clone, Copy)]
pub struct ProxyProtocolInfo {
	pub client_addr: SocketAddr,
	pub tls: bool,
}

#[derive(Debug, Default)]
pub struct Metrics {
	counter: Option<BytesCounter>,
	logging: LoggingMode,
}

impl Metrics {
	fn with_counter() -> Metrics {
		Self {
			counter: Some(Default::default()),
			logging: LoggingMode::default(),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum LoggingMode {
	#[default]
	None,
	Downstream,
	Upstream,
}

/// A downstream connection: raw TCP or TLS-wrapped TCP. Carries per-connection info as typed
/// extensions and counts bytes in both directions.
pub struct Socket {
	ext: Extension,
	inner: SocketType,
	metrics: Metrics,
}

impl Socket {
	pub fn into_parts(self) -> (Extension, Metrics, SocketType) {
		(self.ext, self.metrics, self.inner)
	}

	pub fn from_tcp(stream: TcpStream) -> anyhow::Result<Self> {
		let mut ext = Extension::new();
		stream.set_nodelay(true)?;
		ext.insert(TcpConnectionInfo {
			peer_addr: to_canonical(stream.peer_addr()?),
			local_addr: to_canonical(stream.local_addr()?),
			start: Instant::now(),
		});
		Ok(Socket {
			ext,
			inner: SocketType::Tcp(stream),
			metrics: Metrics::with_counter(),
		})
	}

	pub fn from_tls(
		mut ext: Extension,
		metrics: Metrics,
		tls: tokio_rustls::server::TlsStream<Box<SocketType>>,
	) -> Self {
		let info = {
			let (_, conn) = tls.get_ref();
			TlsConnectionInfo {
				server_name: conn.server_name().map(|s| s.to_string()),
				negotiated_alpn: conn.alpn_protocol().map(Alpn::from),
				peer_certificate: conn
					.peer_certificates()
					.and_then(|certs| certs.first())
					.map(|c| c.clone().into_owned()),
			}
		};
		ext.insert(info);
		Socket {
			ext,
			inner: SocketType::Tls(Box::new(tls)),
			metrics,
		}
	}

	pub fn with_logging(&mut self, l: LoggingMode) {
		self.metrics.logging = l;
	}

	pub fn get_ext(&self) -> Extension {
		self.ext.clone()
	}

	pub fn ext_mut(&mut self) -> &mut Extension {
		&mut self.ext
	}

	pub fn ext<T: Send + Sync + 'static>(&self) -> Option<&T> {
		self.ext.get::<T>()
	}

	pub fn tcp(&self) -> &TcpConnectionInfo {
		self
			.ext
			.get::<TcpConnectionInfo>()
			.expect("tcp connection info must be set")
	}
}

pub enum SocketType {
	Tcp(TcpStream),
	Tls(Box<tokio_rustls::server::TlsStream<Box<SocketType>>>),
}

impl AsyncRead for SocketType {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_read(cx, buf),
			SocketType::Tls(inner) => Pin::new(inner).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for SocketType {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<Result<usize, std::io::Error>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_write(cx, buf),
			SocketType::Tls(inner) => Pin::new(inner).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_flush(cx),
			SocketType::Tls(inner) => Pin::new(inner).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_shutdown(cx),
			SocketType::Tls(inner) => Pin::new(inner).poll_shutdown(cx),
		}
	}

	fn poll_write_vectored(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<Result<usize, std::io::Error>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
			SocketType::Tls(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
		}
	}

	fn is_write_vectored(&self) -> bool {
		match &self {
			SocketType::Tcp(inner) => inner.is_write_vectored(),
			SocketType::Tls(inner) => inner.is_write_vectored(),
		}
	}
}

impl AsyncRead for Socket {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		let bytes = buf.filled().len();
		let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
		let bytes = buf.filled().len() - bytes;
		if let Some(c) = &self.metrics.counter {
			c.recv(bytes);
		}
		poll
	}
}

impl AsyncWrite for Socket {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<Result<usize, Error>> {
		let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
		if let Some(c) = &self.metrics.counter
			&& let Poll::Ready(Ok(bytes)) = poll
		{
			c.sent(bytes);
		};
		poll
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}

	fn poll_write_vectored(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<Result<usize, Error>> {
		let poll = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
		if let Some(c) = &self.metrics.counter
			&& let Poll::Ready(Ok(bytes)) = poll
		{
			c.sent(bytes);
		};
		poll
	}

	fn is_write_vectored(&self) -> bool {
		self.inner.is_write_vectored()
	}
}

#[derive(Debug, Clone, Default)]
pub struct Extension(http::Extensions);

impl Extension {
	pub fn new() -> Self {
		Extension(http::Extensions::new())
	}

	pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, val: T) -> Option<T> {
		self.0.insert(val)
	}

	pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
		self.0.get::<T>()
	}
}

fn to_canonical(addr: SocketAddr) -> SocketAddr {
	let ip = addr.ip().to_canonical();
	SocketAddr::from((ip, addr.port()))
}

#[derive(Default, Debug, Clone)]
pub struct BytesCounter {
	counts: Arc<(AtomicU64, AtomicU64)>,
}

impl BytesCounter {
	pub fn sent(&self, amt: usize) {
		self.counts.0.fetch_add(amt as u64, Ordering::Relaxed);
	}
	pub fn recv(&self, amt: usize) {
		self.counts.1.fetch_add(amt as u64, Ordering::Relaxed);
	}
	pub fn load(&self) -> (u64, u64) {
		(
			self.counts.0.load(Ordering::Relaxed),
			self.counts.1.load(Ordering::Relaxed),
		)
	}
}

impl Drop for Metrics {
	fn drop(&mut self) {
		if self.logging == LoggingMode::None {
			return;
		}
		let (sent, recv) = match self.counter.take().map(|counter| counter.load()) {
			Some((a, b)) => (Some(a), Some(b)),
			None => (None, None),
		};
		match self.logging {
			LoggingMode::None => {},
			LoggingMode::Upstream => {
				event!(
					target: "upstream connection",
					parent: None,
					tracing::Level::DEBUG,

					sent,
					recv,

					"closed"
				);
			},
			LoggingMode::Downstream => {
				event!(
					target: "downstream connection",
					parent: None,
					tracing::Level::DEBUG,

					sent,
					recv,

					"closed"
				);
			},
		}
	}
}
