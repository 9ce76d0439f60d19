use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use chrono::{DateTime, SecondsFormat, Utc};
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// What the router proved to itself when it built the envelope: which URL it was forwarding, and
/// when. The route service carries both headers back verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
	pub forwarded_url: String,
	pub requested_time: DateTime<Utc>,
}

/// The decrypted envelope payload on the wire.
#[derive(Serialize, Deserialize)]
struct SignaturePayload {
	forwarded_url: String,
	requested_time: String,
}

/// The metadata header carries the nonce needed to decrypt the signature header.
#[derive(Serialize, Deserialize)]
struct Metadata {
	nonce: String,
}

/// An encrypted signature/metadata header pair.
#[derive(Debug, Clone)]
pub struct Envelope {
	pub signature: String,
	pub metadata: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ValidateError {
	#[error("signature expired (age {age:?}, limit {limit:?})")]
	Expired { age: Duration, limit: Duration },
	#[error("signature could not be decrypted")]
	Decrypt,
	#[error("malformed envelope: {0}")]
	Malformed(String),
}

impl ValidateError {
	fn malformed(err: impl std::fmt::Display) -> ValidateError {
		ValidateError::Malformed(err.to_string())
	}
}

/// Codec implements the signed-envelope protocol spoken with route services: AES-256-GCM over a
/// JSON payload, with a fresh random nonce per envelope carried in the metadata header. Two keys
/// are held for rotation: `current` encrypts and is tried first on decrypt; `previous` only
/// decrypts, letting operators roll the shared secret without a flag day.
pub struct Codec {
	current: LessSafeKey,
	previous: Option<LessSafeKey>,
	timeout: Duration,
	rng: SystemRandom,
}

impl std::fmt::Debug for Codec {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Codec")
			.field("timeout", &self.timeout)
			.field("previous", &self.previous.is_some())
			.finish()
	}
}

fn derive_key(secret: &SecretString) -> LessSafeKey {
	// The shared secret is operator-chosen text; hash it down to exactly the 256 bits AES wants.
	let digest = digest::digest(&digest::SHA256, secret.expose_secret().as_bytes());
	let unbound =
		UnboundKey::new(&AES_256_GCM, digest.as_ref()).expect("SHA-256 output is a valid AES-256 key");
	LessSafeKey::new(unbound)
}

impl Codec {
	pub fn new(secret: &SecretString, previous: Option<&SecretString>, timeout: Duration) -> Codec {
		Codec {
			current: derive_key(secret),
			previous: previous.map(derive_key),
			timeout,
			rng: SystemRandom::new(),
		}
	}

	/// create_request builds the envelope for handing `forwarded_url` to a route service.
	pub fn create_request(&self, forwarded_url: &str) -> anyhow::Result<Envelope> {
		self.create_at(forwarded_url, Utc::now())
	}

	fn create_at(&self, forwarded_url: &str, requested_time: DateTime<Utc>) -> anyhow::Result<Envelope> {
		let payload = SignaturePayload {
			forwarded_url: forwarded_url.to_string(),
			requested_time: requested_time.to_rfc3339_opts(SecondsFormat::Nanos, true),
		};
		let mut plaintext = serde_json::to_vec(&payload)?;

		let mut nonce = [0u8; NONCE_LEN];
		self
			.rng
			.fill(&mut nonce)
			.map_err(|_| anyhow::anyhow!("nonce generation failed"))?;
		self
			.current
			.seal_in_place_append_tag(
				Nonce::assume_unique_for_key(nonce),
				Aad::empty(),
				&mut plaintext,
			)
			.map_err(|_| anyhow::anyhow!("encryption failed"))?;

		let metadata = Metadata {
			nonce: URL_SAFE.encode(nonce),
		};
		Ok(Envelope {
			signature: URL_SAFE.encode(&plaintext),
			metadata: URL_SAFE.encode(serde_json::to_vec(&metadata)?),
		})
	}

	/// validate_request checks an envelope returned by a route service: it must decrypt under the
	/// current key (or the previous one during rotation), parse, and be younger than the configured
	/// timeout. Any byte flip in either header fails decryption.
	pub fn validate_request(&self, signature: &str, metadata: &str) -> Result<Signature, ValidateError> {
		let ciphertext = URL_SAFE
			.decode(signature)
			.map_err(ValidateError::malformed)?;
		let metadata_json = URL_SAFE.decode(metadata).map_err(ValidateError::malformed)?;
		let metadata: Metadata =
			serde_json::from_slice(&metadata_json).map_err(ValidateError::malformed)?;
		let nonce_bytes = URL_SAFE
			.decode(&metadata.nonce)
			.map_err(ValidateError::malformed)?;
		let nonce: [u8; NONCE_LEN] = nonce_bytes
			.try_into()
			.map_err(|_| ValidateError::Malformed("bad nonce length".to_string()))?;

		let plaintext = match self.open(&self.current, nonce, &ciphertext) {
			Ok(pt) => pt,
			Err(_) => {
				let Some(previous) = &self.previous else {
					return Err(ValidateError::Decrypt);
				};
				info!("route service signature did not validate with the current key, trying previous");
				self
					.open(previous, nonce, &ciphertext)
					.map_err(|_| ValidateError::Decrypt)?
			},
		};

		let payload: SignaturePayload =
			serde_json::from_slice(&plaintext).map_err(ValidateError::malformed)?;
		let requested_time = DateTime::parse_from_rfc3339(&payload.requested_time)
			.map_err(ValidateError::malformed)?
			.with_timezone(&Utc);

		let age = Utc::now()
			.signed_duration_since(requested_time)
			.to_std()
			.unwrap_or(Duration::ZERO);
		if age > self.timeout {
			return Err(ValidateError::Expired {
				age,
				limit: self.timeout,
			});
		}

		Ok(Signature {
			forwarded_url: payload.forwarded_url,
			requested_time,
		})
	}

	fn open(
		&self,
		key: &LessSafeKey,
		nonce: [u8; NONCE_LEN],
		ciphertext: &[u8],
	) -> Result<Vec<u8>, ring::error::Unspecified> {
		let mut buf = ciphertext.to_vec();
		let plaintext = key.open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut buf)?;
		Ok(plaintext.to_vec())
	}
}
