use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::registry::endpoint::OverloadPolicy;
use crate::registry::pool::BalancingAlgorithm;
use crate::registry::subscriber::RegistryMessage;
use crate::proxy::pipeline::XfccMode;
use crate::transport::tls::ClientCertMode;

#[derive(Debug)]
pub struct Config {
	pub ip: IpAddr,
	/// Plain HTTP listener port; None disables it.
	pub port: Option<u16>,
	/// HTTPS listener port; None disables it.
	pub ssl_port: Option<u16>,
	pub health_addr: SocketAddr,
	/// Basic-auth diagnostics (`/routes`, `/varz`); only served when credentials are configured.
	pub admin_addr: SocketAddr,
	pub admin_user: Option<String>,
	pub admin_pass: Option<SecretString>,

	pub sticky_session_cookie_names: Vec<String>,
	pub forwarded_client_cert: XfccMode,
	pub client_cert_validation: ClientCertMode,
	pub client_ca_file: Option<PathBuf>,
	pub tls_keypair_files: Vec<KeypairFiles>,
	pub cipher_suites: Option<Vec<String>>,

	pub balancing_algorithm: BalancingAlgorithm,
	pub overload: OverloadPolicy,
	pub max_retries: usize,
	pub endpoint_timeout: Duration,
	pub connect_timeout: Duration,
	pub backend_idle_timeout: Duration,
	pub read_header_timeout: Duration,

	pub prune_interval: Duration,
	pub default_stale_threshold: Duration,

	pub drain_wait: Duration,
	pub drain_timeout: Duration,

	pub enable_proxy_protocol: bool,
	pub skip_ssl_validation: bool,
	pub ca_certs_file: Option<PathBuf>,

	pub route_services: RouteServicesConfig,
	pub static_routes: Vec<RegistryMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeypairFiles {
	pub cert_file: PathBuf,
	pub key_file: PathBuf,
}

#[derive(Debug)]
pub struct RouteServicesConfig {
	pub secret: Option<SecretString>,
	pub previous_secret: Option<SecretString>,
	pub timeout: Duration,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
	ip: Option<IpAddr>,
	port: Option<u16>,
	disable_http: Option<bool>,
	ssl_port: Option<u16>,
	health_port: Option<u16>,
	admin_port: Option<u16>,
	admin_user: Option<String>,
	admin_pass: Option<String>,

	sticky_session_cookie_names: Option<Vec<String>>,
	forwarded_client_cert: Option<XfccMode>,
	client_cert_validation: Option<ClientCertMode>,
	client_ca_file: Option<PathBuf>,
	tls_pems: Option<Vec<KeypairFiles>>,
	cipher_suites: Option<Vec<String>>,

	balancing_algorithm: Option<BalancingAlgorithm>,
	fail_threshold: Option<u32>,
	fail_cooldown: Option<String>,
	max_retries: Option<usize>,
	endpoint_timeout: Option<String>,
	connect_timeout: Option<String>,
	backend_idle_timeout: Option<String>,
	read_header_timeout: Option<String>,

	prune_interval: Option<String>,
	droplet_stale_threshold: Option<String>,

	drain_wait: Option<String>,
	drain_timeout: Option<String>,

	enable_proxy_protocol: Option<bool>,
	skip_ssl_validation: Option<bool>,
	ca_certs_file: Option<PathBuf>,

	route_services: Option<RawRouteServices>,
	static_routes: Option<Vec<RegistryMessage>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRouteServices {
	secret: Option<String>,
	previous_secret: Option<String>,
	timeout: Option<String>,
}

pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
	let raw: RawConfig = serde_yaml::from_str(contents)?;

	let ip = parse::<IpAddr>("ROUTER_IP")?
		.or(raw.ip)
		.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

	let disable_http = parse::<bool>("DISABLE_HTTP")?
		.or(raw.disable_http)
		.unwrap_or(false);
	let port = if disable_http {
		None
	} else {
		Some(parse::<u16>("PORT")?.or(raw.port).unwrap_or(8081))
	};
	let ssl_port = parse::<u16>("SSL_PORT")?.or(raw.ssl_port);

	let tls_keypair_files = raw.tls_pems.unwrap_or_default();
	if ssl_port.is_some() && tls_keypair_files.is_empty() {
		anyhow::bail!("ssl_port is set but no tls_pems are configured");
	}

	let client_cert_validation = raw.client_cert_validation.unwrap_or_default();
	if client_cert_validation != ClientCertMode::None && raw.client_ca_file.is_none() {
		anyhow::bail!("client_cert_validation requires client_ca_file");
	}

	let health_addr = SocketAddr::new(
		ip,
		parse::<u16>("HEALTH_PORT")?.or(raw.health_port).unwrap_or(8082),
	);
	let admin_addr = SocketAddr::new(
		ip,
		parse::<u16>("ADMIN_PORT")?.or(raw.admin_port).unwrap_or(8080),
	);

	let admin_user = empty_to_none(parse::<String>("ADMIN_USER")?.or(raw.admin_user));
	let admin_pass = empty_to_none(parse::<String>("ADMIN_PASS")?.or(raw.admin_pass));
	if admin_user.is_some() != admin_pass.is_some() {
		anyhow::bail!("admin_user and admin_pass must be configured together");
	}

	let route_services = {
		let raw = raw.route_services.unwrap_or_default();
		RouteServicesConfig {
			secret: empty_to_none(parse::<String>("ROUTE_SERVICES_SECRET")?.or(raw.secret))
				.map(SecretString::from),
			previous_secret: empty_to_none(
				parse::<String>("ROUTE_SERVICES_PREVIOUS_SECRET")?.or(raw.previous_secret),
			)
			.map(SecretString::from),
			timeout: parse_duration_field(raw.timeout, crate::routeservice::DEFAULT_TIMEOUT)?,
		}
	};
	if route_services.secret.is_none() && route_services.previous_secret.is_some() {
		anyhow::bail!("route_services.previous_secret requires route_services.secret");
	}

	Ok(Config {
		ip,
		port,
		ssl_port,
		health_addr,
		admin_addr,
		admin_user,
		admin_pass: admin_pass.map(SecretString::from),

		sticky_session_cookie_names: raw
			.sticky_session_cookie_names
			.unwrap_or_else(|| vec!["JSESSIONID".to_string()]),
		forwarded_client_cert: raw.forwarded_client_cert.unwrap_or_default(),
		client_cert_validation,
		client_ca_file: raw.client_ca_file,
		tls_keypair_files,
		cipher_suites: raw.cipher_suites,

		balancing_algorithm: raw.balancing_algorithm.unwrap_or_default(),
		overload: OverloadPolicy {
			max_fails: raw.fail_threshold.unwrap_or(3),
			cooldown: parse_duration_field(raw.fail_cooldown, Duration::from_secs(30))?,
		},
		max_retries: raw.max_retries.unwrap_or(3),
		endpoint_timeout: parse_duration_field(raw.endpoint_timeout, Duration::from_secs(60))?,
		connect_timeout: parse_duration_field(raw.connect_timeout, Duration::from_secs(5))?,
		backend_idle_timeout: parse_duration_field(raw.backend_idle_timeout, Duration::from_secs(90))?,
		read_header_timeout: parse_duration_field(raw.read_header_timeout, Duration::from_secs(15))?,

		prune_interval: parse_duration_field(raw.prune_interval, Duration::from_secs(30))?,
		default_stale_threshold: parse_duration_field(
			raw.droplet_stale_threshold,
			Duration::from_secs(120),
		)?,

		drain_wait: parse_duration_field(raw.drain_wait, Duration::from_secs(20))?,
		drain_timeout: parse_duration_field(raw.drain_timeout, Duration::from_secs(30))?,

		enable_proxy_protocol: raw.enable_proxy_protocol.unwrap_or(false),
		skip_ssl_validation: raw.skip_ssl_validation.unwrap_or(false),
		ca_certs_file: raw.ca_certs_file,

		route_services,
		static_routes: raw.static_routes.unwrap_or_default(),
	})
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match env::var(env) {
		Ok(val) => val
			.parse()
			.map(|v| Some(v))
			.map_err(|e: <T as FromStr>::Err| {
				anyhow::anyhow!("invalid env var {}={} ({})", env, val, e.to_string())
			}),
		Err(_) => Ok(None),
	}
}

fn parse_duration_field(raw: Option<String>, default: Duration) -> anyhow::Result<Duration> {
	raw
		.map(|ds| duration_str::parse(&ds).map_err(|e| anyhow::anyhow!("invalid duration {ds:?}: {e}")))
		.transpose()
		.map(|v| v.unwrap_or(default))
}

pub fn empty_to_none(inp: Option<String>) -> Option<String> {
	match inp {
		Some(s) if s.is_empty() => None,
		other => other,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults() {
		let cfg = parse_config("{}").unwrap();
		assert_eq!(cfg.port, Some(8081));
		assert_eq!(cfg.ssl_port, None);
		assert_eq!(cfg.max_retries, 3);
		assert_eq!(cfg.sticky_session_cookie_names, vec!["JSESSIONID"]);
		assert_eq!(cfg.forwarded_client_cert, XfccMode::SanitizeSet);
		assert_eq!(cfg.route_services.timeout, Duration::from_secs(60));
		assert!(cfg.admin_user.is_none());
	}

	#[test]
	fn full_config() {
		let cfg = parse_config(
			r#"
ip: 127.0.0.1
port: 80
ssl_port: 443
tls_pems:
  - cert_file: /etc/router/tls/cert.pem
    key_file: /etc/router/tls/key.pem
sticky_session_cookie_names: [JSESSIONID, SESSION]
forwarded_client_cert: forward
balancing_algorithm: least-connection
endpoint_timeout: 30s
drain_wait: 10s
route_services:
  secret: shhh
  timeout: 90s
static_routes:
  - host: 10.0.0.1
    port: 8080
    uris: [seed.example.com]
"#,
		)
		.unwrap();
		assert_eq!(cfg.ip, "127.0.0.1".parse::<IpAddr>().unwrap());
		assert_eq!(cfg.ssl_port, Some(443));
		assert_eq!(cfg.balancing_algorithm, BalancingAlgorithm::LeastConnection);
		assert_eq!(cfg.endpoint_timeout, Duration::from_secs(30));
		assert_eq!(cfg.forwarded_client_cert, XfccMode::Forward);
		assert!(cfg.route_services.secret.is_some());
		assert_eq!(cfg.static_routes.len(), 1);
	}

	#[test]
	fn ssl_requires_certificates() {
		assert!(parse_config("ssl_port: 443").is_err());
	}

	#[test]
	fn client_cert_validation_requires_ca() {
		assert!(parse_config("client_cert_validation: require").is_err());
	}

	#[test]
	fn disable_http_drops_the_plain_listener() {
		let cfg = parse_config("disable_http: true").unwrap();
		assert_eq!(cfg.port, None);
	}

	#[test]
	fn previous_secret_requires_current() {
		assert!(parse_config("route_services: {previous_secret: old}").is_err());
	}

	#[test]
	fn unknown_fields_are_rejected() {
		assert!(parse_config("bogus_knob: 1").is_err());
	}
}
