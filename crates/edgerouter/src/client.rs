use std::collections::HashMap;
use std::io::{Error as IoError, IoSlice};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use ::http::Uri;
use ::http::uri::Scheme;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use parking_lot::Mutex;
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{event, trace};

use crate::http::{self, Body, Request, Response};
use crate::proxy::ProxyError;

/// How to reach one destination authority.
#[derive(Debug, Clone)]
pub enum Transport {
	Plaintext,
	/// TLS where the certificate is expected to carry `server_name` (the registered SAN for
	/// TLS-enabled backends, or simply the dialed hostname). `h2` asks for HTTP/2 via ALPN.
	Tls { server_name: String, h2: bool },
	/// The internal mTLS hop to our own loopback listener.
	Loopback,
}

impl Transport {
	pub fn scheme(&self) -> Scheme {
		match self {
			Transport::Plaintext => Scheme::HTTP,
			Transport::Tls { .. } => Scheme::HTTPS,
			Transport::Loopback => Scheme::HTTPS,
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			Transport::Plaintext => "plaintext",
			Transport::Tls { .. } => "tls",
			Transport::Loopback => "loopback",
		}
	}
}

pub struct Call {
	pub req: Request,
	/// host:port to dial; also the connection pool key.
	pub authority: String,
	pub transport: Transport,
}

#[derive(Debug, Clone)]
enum TransportParams {
	Tls { server_name: String, h2: bool },
	Loopback,
}

/// The upstream HTTP client. One pooled hyper client, keyed by scheme+authority, which lands every
/// backend on its own connection pool since requests dial endpoint authorities directly. TLS
/// parameters that cannot ride in the URI (SAN pinning, ALPN, the loopback identity) are parked in
/// a shared map the connector consults at dial time.
#[derive(Clone)]
pub struct Client {
	client: hyper_util::client::legacy::Client<Connector, Body>,
	params: Arc<Mutex<HashMap<String, TransportParams>>>,
}

impl std::fmt::Debug for Client {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Client").finish()
	}
}

impl Client {
	pub fn new(
		backend_tls: Arc<ClientConfig>,
		loopback_tls: Option<Arc<ClientConfig>>,
		connect_timeout: Duration,
		idle_timeout: Duration,
	) -> Client {
		let params: Arc<Mutex<HashMap<String, TransportParams>>> = Default::default();
		let mut backend_tls_h2 = (*backend_tls).clone();
		backend_tls_h2.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
		let connector = Connector {
			backend_tls,
			backend_tls_h2: Arc::new(backend_tls_h2),
			loopback_tls,
			connect_timeout,
			params: params.clone(),
		};
		let client = hyper_util::client::legacy::Client::builder(TokioExecutor::new())
			.timer(TokioTimer::new())
			.pool_idle_timeout(idle_timeout)
			.build(connector);
		Client { client, params }
	}

	pub async fn call(&self, call: Call) -> Result<Response, ProxyError> {
		let start = std::time::Instant::now();
		let Call {
			mut req,
			authority,
			transport,
		} = call;
		http::modify_req_uri(&mut req, |uri| {
			uri.scheme = Some(transport.scheme());
			uri.authority = Some(authority.parse()?);
			Ok(())
		})
		.map_err(ProxyError::Processing)?;

		match &transport {
			Transport::Plaintext => {},
			Transport::Tls { server_name, h2 } => {
				self.park(
					&authority,
					TransportParams::Tls {
						server_name: server_name.clone(),
						h2: *h2,
					},
				);
			},
			Transport::Loopback => self.park(&authority, TransportParams::Loopback),
		}

		trace!(?req, "sending request");
		let method = req.method().clone();
		let uri = req.uri().clone();
		let version = req.version();
		let transport_name = transport.name();
		let resp = self.client.request(req).await;
		let dur = format!("{}ms", start.elapsed().as_millis());
		event!(
			target: "upstream request",
			parent: None,
			tracing::Level::DEBUG,

			endpoint = %authority,
			transport = %transport_name,

			http.method = %method,
			http.path = %uri.path(),
			http.version = ?version,
			http.status = resp.as_ref().ok().map(|s| s.status().as_u16()),

			duration = dur,
		);
		Ok(
			resp
				.map_err(ProxyError::UpstreamCallFailed)?
				.map(Body::new),
		)
	}

	fn park(&self, authority: &str, p: TransportParams) {
		let mut params = self.params.lock();
		// The map tracks distinct endpoint authorities; endpoint churn over a long uptime could
		// grow it unbounded, so shed everything once in a while. A miss only costs default TLS
		// parameters on the next dial of a pooled-out authority.
		if params.len() > 4096 {
			params.clear();
		}
		params.insert(authority.to_string(), p);
	}
}

#[derive(Clone)]
struct Connector {
	backend_tls: Arc<ClientConfig>,
	backend_tls_h2: Arc<ClientConfig>,
	loopback_tls: Option<Arc<ClientConfig>>,
	connect_timeout: Duration,
	params: Arc<Mutex<HashMap<String, TransportParams>>>,
}

impl tower::Service<Uri> for Connector {
	type Response = TokioIo<ClientSocket>;
	type Error = crate::http::Error;
	type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

	fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, dst: Uri) -> Self::Future {
		let this = self.clone();
		Box::pin(async move {
			tokio::time::timeout(this.connect_timeout, this.connect(dst))
				.await
				.map_err(|_| {
					crate::http::Error::new(std::io::Error::new(
						std::io::ErrorKind::TimedOut,
						"connect timeout",
					))
				})?
		})
	}
}

impl Connector {
	async fn connect(self, dst: Uri) -> Result<TokioIo<ClientSocket>, crate::http::Error> {
		let host = dst
			.host()
			.ok_or_else(|| crate::http::Error::new(anyhow::anyhow!("no host in {dst}")))?
			.to_string();
		let is_tls = dst.scheme() == Some(&Scheme::HTTPS);
		let port = dst
			.port_u16()
			.unwrap_or(if is_tls { 443 } else { 80 });
		let authority = dst
			.authority()
			.expect("authority follows from host")
			.to_string();

		let addr = resolve(&host, port).await.map_err(crate::http::Error::new)?;
		let stream = TcpStream::connect(addr)
			.await
			.map_err(crate::http::Error::new)?;
		stream.set_nodelay(true).map_err(crate::http::Error::new)?;

		if !is_tls {
			return Ok(TokioIo::new(ClientSocket {
				inner: ClientSocketType::Tcp(stream),
			}));
		}

		let params = self.params.lock().get(&authority).cloned();
		let (config, server_name) = match params {
			Some(TransportParams::Loopback) => {
				let config = self
					.loopback_tls
					.clone()
					.ok_or_else(|| crate::http::Error::new(anyhow::anyhow!("loopback transport disabled")))?;
				(config, "localhost".to_string())
			},
			Some(TransportParams::Tls { server_name, h2 }) => {
				let config = if h2 {
					self.backend_tls_h2.clone()
				} else {
					self.backend_tls.clone()
				};
				(config, server_name)
			},
			None => (self.backend_tls.clone(), strip_brackets(&host).to_string()),
		};
		let server_name = ServerName::try_from(server_name).map_err(crate::http::Error::new)?;
		let tls = tokio_rustls::TlsConnector::from(config)
			.connect(server_name, stream)
			.await
			.map_err(crate::http::Error::new)?;
		Ok(TokioIo::new(ClientSocket {
			inner: ClientSocketType::Tls(Box::new(tls)),
		}))
	}
}

async fn resolve(host: &str, port: u16) -> std::io::Result<SocketAddr> {
	// Endpoint hosts are almost always literal addresses off the bus; route services are the
	// hostname case. Either way the system resolver is fine here. IPv6 literals arrive bracketed
	// from the URI authority.
	let host = strip_brackets(host);
	if let Ok(ip) = host.parse::<std::net::IpAddr>() {
		return Ok(SocketAddr::from((ip, port)));
	}
	tokio::net::lookup_host((host, port))
		.await?
		.next()
		.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved"))
}

fn strip_brackets(host: &str) -> &str {
	host
		.strip_prefix('[')
		.and_then(|h| h.strip_suffix(']'))
		.unwrap_or(host)
}

pub struct ClientSocket {
	inner: ClientSocketType,
}

enum ClientSocketType {
	Tcp(TcpStream),
	Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Connection for ClientSocket {
	fn connected(&self) -> Connected {
		let mut connected = Connected::new();
		if let ClientSocketType::Tls(tls) = &self.inner {
			let (_, conn) = tls.get_ref();
			if conn.alpn_protocol() == Some(b"h2") {
				connected = connected.negotiated_h2();
			}
		}
		connected
	}
}

impl AsyncRead for ClientSocket {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		match &mut self.inner {
			ClientSocketType::Tcp(s) => Pin::new(s).poll_read(cx, buf),
			ClientSocketType::Tls(s) => Pin::new(s).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for ClientSocket {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<Result<usize, IoError>> {
		match &mut self.inner {
			ClientSocketType::Tcp(s) => Pin::new(s).poll_write(cx, buf),
			ClientSocketType::Tls(s) => Pin::new(s).poll_write(cx, buf),
		}
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IoError>> {
		match &mut self.inner {
			ClientSocketType::Tcp(s) => Pin::new(s).poll_flush(cx),
			ClientSocketType::Tls(s) => Pin::new(s).poll_flush(cx),
		}
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IoError>> {
		match &mut self.inner {
			ClientSocketType::Tcp(s) => Pin::new(s).poll_shutdown(cx),
			ClientSocketType::Tls(s) => Pin::new(s).poll_shutdown(cx),
		}
	}

	fn poll_write_vectored(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<Result<usize, IoError>> {
		match &mut self.inner {
			ClientSocketType::Tcp(s) => Pin::new(s).poll_write_vectored(cx, bufs),
			ClientSocketType::Tls(s) => Pin::new(s).poll_write_vectored(cx, bufs),
		}
	}

	fn is_write_vectored(&self) -> bool {
		match &self.inner {
			ClientSocketType::Tcp(s) => s.is_write_vectored(),
			ClientSocketType::Tls(s) => s.is_write_vectored(),
		}
	}
}
