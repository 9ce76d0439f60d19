pub mod proxyprotocol;
pub mod stream;
pub mod tls;
