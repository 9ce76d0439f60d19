use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use futures_util::TryFutureExt;
use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{debug, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::transport::stream::Socket;

/// The certificate resolver falls back to the chain whose common name is literally `default`.
pub const DEFAULT_CERT_NAME: &str = "default";

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("tls handshake error: {0:?}")]
	Handshake(std::io::Error),
	#[error("{0}")]
	Anyhow(#[from] anyhow::Error),
}

/// provider returns the ring crypto provider, optionally restricted to an allowlisted set of
/// cipher suites (matched by their standard names, e.g. `TLS13_AES_256_GCM_SHA384`).
pub fn provider(cipher_suites: Option<&[String]>) -> anyhow::Result<Arc<CryptoProvider>> {
	let base = rustls::crypto::ring::default_provider();
	let Some(allow) = cipher_suites else {
		return Ok(Arc::new(base));
	};
	let chosen: Vec<_> = base
		.cipher_suites
		.iter()
		.copied()
		.filter(|s| {
			let name = format!("{:?}", s.suite());
			allow.iter().any(|a| a.eq_ignore_ascii_case(&name))
		})
		.collect();
	if chosen.len() != allow.len() {
		anyhow::bail!(
			"unknown or unsupported cipher suites in allowlist: {:?}",
			allow
		);
	}
	Ok(Arc::new(CryptoProvider {
		cipher_suites: chosen,
		..base
	}))
}

/// One configured certificate chain plus its key, indexed under every name it carries.
pub struct Keypair {
	pub cert_chain: Vec<CertificateDer<'static>>,
	pub key: PrivateKeyDer<'static>,
}

impl Keypair {
	pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> anyhow::Result<Keypair> {
		let cert_chain = rustls_pemfile::certs(&mut std::io::Cursor::new(cert_pem))
			.collect::<Result<Vec<_>, _>>()?;
		if cert_chain.is_empty() {
			anyhow::bail!("no certificates found in PEM");
		}
		let key = rustls_pemfile::private_key(&mut std::io::Cursor::new(key_pem))?
			.ok_or_else(|| anyhow::anyhow!("no private key found in PEM"))?;
		Ok(Keypair { cert_chain, key })
	}

	/// names returns every DNS SAN plus the subject common name of the leaf, lowercased.
	fn names(&self) -> anyhow::Result<Vec<String>> {
		let (_, cert) = X509Certificate::from_der(&self.cert_chain[0])
			.map_err(|e| anyhow::anyhow!("invalid certificate: {e}"))?;
		let mut names = Vec::new();
		if let Ok(Some(san)) = cert.subject_alternative_name() {
			for name in &san.value.general_names {
				if let x509_parser::extensions::GeneralName::DNSName(dns) = name {
					names.push(dns.to_ascii_lowercase());
				}
			}
		}
		for cn in cert.subject().iter_common_name() {
			if let Ok(cn) = cn.as_str() {
				names.push(cn.to_ascii_lowercase());
			}
		}
		names.dedup();
		Ok(names)
	}
}

/// Certificate selection is a literal lookup of the SNI name, then the chain named `default`, then
/// the first configured chain. No wildcard expansion beyond what the names themselves carry.
#[derive(Debug)]
struct SniResolver {
	by_name: HashMap<String, Arc<CertifiedKey>>,
	fallback: Arc<CertifiedKey>,
}

impl ResolvesServerCert for SniResolver {
	fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
		let chosen = client_hello
			.server_name()
			.and_then(|name| self.by_name.get(&name.to_ascii_lowercase()))
			.or_else(|| self.by_name.get(DEFAULT_CERT_NAME))
			.unwrap_or(&self.fallback);
		Some(chosen.clone())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientCertMode {
	#[default]
	None,
	Request,
	Require,
}

/// server_config assembles the frontend TLS configuration: SNI-keyed certificates and the
/// configured client certificate posture.
pub fn server_config(
	provider: Arc<CryptoProvider>,
	keypairs: Vec<Keypair>,
	client_cert_mode: ClientCertMode,
	client_ca: Option<Vec<CertificateDer<'static>>>,
) -> anyhow::Result<Arc<ServerConfig>> {
	anyhow::ensure!(!keypairs.is_empty(), "at least one certificate is required");
	let mut by_name = HashMap::new();
	let mut fallback = None;
	for kp in keypairs {
		let names = kp.names()?;
		let signing_key = provider
			.key_provider
			.load_private_key(kp.key)
			.map_err(|e| anyhow::anyhow!("unusable private key: {e}"))?;
		let ck = Arc::new(CertifiedKey::new(kp.cert_chain, signing_key));
		if fallback.is_none() {
			fallback = Some(ck.clone());
		}
		for name in names {
			debug!(name, "certificate registered");
			by_name.entry(name).or_insert_with(|| ck.clone());
		}
	}
	let resolver = Arc::new(SniResolver {
		by_name,
		fallback: fallback.expect("at least one keypair"),
	});

	let builder = ServerConfig::builder_with_provider(provider.clone())
		.with_safe_default_protocol_versions()?;
	let mut config = match client_cert_mode {
		ClientCertMode::None => builder.with_no_client_auth(),
		mode => {
			let mut roots = RootCertStore::empty();
			for cert in client_ca
				.ok_or_else(|| anyhow::anyhow!("client certificate validation requires a CA"))?
			{
				roots.add(cert)?;
			}
			let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
			let verifier = if mode == ClientCertMode::Request {
				verifier.allow_unauthenticated().build()?
			} else {
				verifier.build()?
			};
			builder.with_client_cert_verifier(verifier)
		},
	}
	.with_cert_resolver(resolver);
	config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	Ok(Arc::new(config))
}

/// accept completes a TLS handshake on an accepted socket, preserving its connection extensions.
pub async fn accept(conn: Socket, cfg: Arc<ServerConfig>) -> Result<Socket, Error> {
	let (ext, counter, inner) = conn.into_parts();
	let stream = tokio_rustls::TlsAcceptor::from(cfg)
		.accept(Box::new(inner))
		.map_err(Error::Handshake)
		.await?;
	Ok(Socket::from_tls(ext, counter, stream))
}

/// The runtime-generated identity backing the loopback hairpin listener: a throwaway CA, a server
/// certificate for 127.0.0.1, and a client certificate the hairpin transport presents. Nothing is
/// persisted; the trust domain lives and dies with the process.
pub struct LoopbackIdentity {
	pub server: Arc<ServerConfig>,
	pub client: Arc<ClientConfig>,
}

pub fn generate_loopback_identity(provider: Arc<CryptoProvider>) -> anyhow::Result<LoopbackIdentity> {
	use rcgen::{
		BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
		KeyPair, SanType,
	};

	let ca_key = KeyPair::generate()?;
	let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
	ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	ca_params
		.distinguished_name
		.push(DnType::CommonName, "edgerouter loopback ca");
	let ca_cert = ca_params.self_signed(&ca_key)?;

	let server_key = KeyPair::generate()?;
	let mut server_params = CertificateParams::new(vec!["localhost".to_string()])?;
	server_params
		.subject_alt_names
		.push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
	server_params
		.extended_key_usages
		.push(ExtendedKeyUsagePurpose::ServerAuth);
	server_params.distinguished_name = DistinguishedName::new();
	let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key)?;

	let client_key = KeyPair::generate()?;
	let mut client_params = CertificateParams::new(Vec::<String>::new())?;
	client_params
		.extended_key_usages
		.push(ExtendedKeyUsagePurpose::ClientAuth);
	client_params
		.distinguished_name
		.push(DnType::CommonName, "edgerouter loopback client");
	let client_cert = client_params.signed_by(&client_key, &ca_cert, &ca_key)?;

	let ca_der: CertificateDer<'static> = ca_cert.der().clone();
	let mut roots = RootCertStore::empty();
	roots.add(ca_der.clone())?;
	let roots = Arc::new(roots);

	let verifier = WebPkiClientVerifier::builder_with_provider(roots.clone(), provider.clone())
		.build()?;
	let server = ServerConfig::builder_with_provider(provider.clone())
		.with_safe_default_protocol_versions()?
		.with_client_cert_verifier(verifier)
		.with_single_cert(
			vec![server_cert.der().clone()],
			PrivateKeyDer::try_from(server_key.serialize_der())
				.map_err(|e| anyhow::anyhow!("loopback server key: {e}"))?,
		)?;

	let client = ClientConfig::builder_with_provider(provider)
		.with_safe_default_protocol_versions()?
		.with_root_certificates(roots)
		.with_client_auth_cert(
			vec![client_cert.der().clone()],
			PrivateKeyDer::try_from(client_key.serialize_der())
				.map_err(|e| anyhow::anyhow!("loopback client key: {e}"))?,
		)?;

	Ok(LoopbackIdentity {
		server: Arc::new(server),
		client: Arc::new(client),
	})
}

/// backend_client_config builds the TLS configuration for dialing TLS-enabled backends and route
/// services: system roots plus any configured extra CAs, or no verification at all when the
/// operator asked to skip it.
pub fn backend_client_config(
	provider: Arc<CryptoProvider>,
	extra_roots: Vec<CertificateDer<'static>>,
	skip_verification: bool,
) -> anyhow::Result<Arc<ClientConfig>> {
	let builder = ClientConfig::builder_with_provider(provider.clone())
		.with_safe_default_protocol_versions()?;
	let config = if skip_verification {
		builder
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(insecure::NoVerifier))
			.with_no_client_auth()
	} else {
		let mut roots = RootCertStore::empty();
		let native = rustls_native_certs::load_native_certs();
		for err in &native.errors {
			warn!("failed loading a native root certificate: {err}");
		}
		for cert in native.certs {
			let _ = roots.add(cert);
		}
		for cert in extra_roots {
			roots.add(cert)?;
		}
		builder.with_root_certificates(roots).with_no_client_auth()
	};
	Ok(Arc::new(config))
}

pub mod insecure {
	use rustls::DigitallySignedStruct;
	use rustls::SignatureScheme;
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

	/// Accepts any server certificate. Only wired up when the operator explicitly disables backend
	/// certificate verification.
	#[derive(Debug)]
	pub struct NoVerifier;

	impl ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer,
			_intermediates: &[CertificateDer],
			_server_name: &ServerName,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
			vec![
				SignatureScheme::RSA_PKCS1_SHA256,
				SignatureScheme::ECDSA_NISTP256_SHA256,
				SignatureScheme::RSA_PKCS1_SHA384,
				SignatureScheme::ECDSA_NISTP384_SHA384,
				SignatureScheme::RSA_PKCS1_SHA512,
				SignatureScheme::ECDSA_NISTP521_SHA512,
				SignatureScheme::RSA_PSS_SHA256,
				SignatureScheme::RSA_PSS_SHA384,
				SignatureScheme::RSA_PSS_SHA512,
				SignatureScheme::ED25519,
			]
		}
	}
}
