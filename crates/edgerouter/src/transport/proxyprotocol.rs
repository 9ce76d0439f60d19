use std::io;
use std::net::SocketAddr;

use ppp::v1;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::stream::ProxyProtocolInfo;

// "PROXY UNKNOWN" with two full IPv6 addresses tops out at 107 bytes including CRLF.
const MAX_HEADER: usize = 107;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("io error: {0}")]
	Io(#[from] io::Error),
	#[error("truncated header (read {0} bytes)")]
	Incomplete(usize),
	#[error("parse error: {0}")]
	Parse(String),
	#[error("header is not utf-8")]
	Encoding,
}

/// parse reads a proxy-protocol v1 preamble off the front of the stream and reports the client
/// address it names. The preamble is consumed byte-for-byte up to its terminating CRLF so no
/// request data is swallowed; a malformed preamble is an error and the caller closes the
/// connection.
pub async fn parse<IO: AsyncRead + Unpin>(
	source_stream: &mut IO,
) -> Result<Option<ProxyProtocolInfo>, Error> {
	let mut buf = Vec::with_capacity(MAX_HEADER);
	loop {
		let b = source_stream.read_u8().await.map_err(|e| {
			if e.kind() == io::ErrorKind::UnexpectedEof {
				Error::Incomplete(buf.len())
			} else {
				Error::Io(e)
			}
		})?;
		buf.push(b);
		if b == b'\n' {
			break;
		}
		if buf.len() >= MAX_HEADER {
			return Err(Error::Incomplete(buf.len()));
		}
	}
	let text = std::str::from_utf8(&buf).map_err(|_| Error::Encoding)?;
	let header = v1::Header::try_from(text).map_err(|e| Error::Parse(e.to_string()))?;
	let addr: Option<SocketAddr> = match header.addresses {
		v1::Addresses::Tcp4(a) => Some(SocketAddr::from((a.source_address, a.source_port))),
		v1::Addresses::Tcp6(a) => Some(SocketAddr::from((a.source_address, a.source_port))),
		// "PROXY UNKNOWN": the balancer saw a non-TCP client; fall back to the socket peer.
		v1::Addresses::Unknown => None,
	};
	Ok(addr.map(|client_addr| ProxyProtocolInfo {
		client_addr,
		tls: false,
	}))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn parses_tcp4_preamble() {
		let input = b"PROXY TCP4 203.0.113.7 10.0.0.1 56324 80\r\nGET / HTTP/1.1\r\n";
		let mut stream = &input[..];
		let info = parse(&mut stream).await.unwrap().unwrap();
		assert_eq!(info.client_addr, "203.0.113.7:56324".parse().unwrap());
		// The rest of the stream is untouched request data.
		let mut rest = Vec::new();
		tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut rest)
			.await
			.unwrap();
		assert_eq!(&rest, b"GET / HTTP/1.1\r\n");
	}

	#[tokio::test]
	async fn parses_tcp6_preamble() {
		let input = b"PROXY TCP6 2001:db8::1 2001:db8::2 56324 443\r\n";
		let mut stream = &input[..];
		let info = parse(&mut stream).await.unwrap().unwrap();
		assert_eq!(info.client_addr, "[2001:db8::1]:56324".parse().unwrap());
	}

	#[tokio::test]
	async fn unknown_preamble_keeps_socket_address() {
		let input = b"PROXY UNKNOWN\r\n";
		let mut stream = &input[..];
		assert!(parse(&mut stream).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn malformed_preamble_is_rejected() {
		let input = b"NOT A PREAMBLE\r\n";
		let mut stream = &input[..];
		assert!(parse(&mut stream).await.is_err());
	}

	#[tokio::test]
	async fn truncated_preamble_is_rejected() {
		let input = b"PROXY TCP4 203.0.113.7";
		let mut stream = &input[..];
		assert!(matches!(
			parse(&mut stream).await,
			Err(Error::Incomplete(_))
		));
	}
}
