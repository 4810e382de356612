#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use storm_domain::UserId;
use storm_protocol::auth::{VALIDATE_SUBJECT, ValidateRequest, ValidateResponse};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::util::time::unix_secs_now;

/// Authenticated user attached to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
	pub user_id: UserId,
	pub username: String,
}

/// Validates bearer tokens against the auth authority over the bus.
///
/// Every failure (no responder, timeout, bad reply, invalid token) reads as
/// "not authenticated".
#[derive(Clone)]
pub struct AuthClient {
	bus: Arc<dyn Bus>,
	timeout: Duration,
}

impl AuthClient {
	pub fn new(bus: Arc<dyn Bus>, timeout: Duration) -> Self {
		Self { bus, timeout }
	}

	pub async fn validate(&self, token: &str) -> Option<Identity> {
		let token = token.trim();
		if token.is_empty() {
			return None;
		}

		let req = match serde_json::to_vec(&ValidateRequest {
			token: token.to_string(),
		}) {
			Ok(req) => req,
			Err(e) => {
				warn!(error = %e, "auth: failed to encode validate request");
				return None;
			}
		};

		let reply = match self.bus.request(VALIDATE_SUBJECT, Bytes::from(req), self.timeout).await {
			Ok(reply) => reply,
			Err(e) => {
				warn!(error = %e, "auth: validate request failed");
				return None;
			}
		};

		let resp: ValidateResponse = match serde_json::from_slice(&reply) {
			Ok(resp) => resp,
			Err(e) => {
				warn!(error = %e, "auth: malformed validate reply");
				return None;
			}
		};

		let user = resp.user.filter(|_| resp.valid)?;
		match UserId::parse(&user.id) {
			Ok(user_id) if !user_id.is_nil() => Some(Identity {
				user_id,
				username: user.username,
			}),
			_ => {
				debug!(user_id = %user.id, "auth: authority returned an unusable user id");
				None
			}
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	pub exp: u64,
}

/// Verify a `v1.<claims>.<signature>` development token.
pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	if claims.exp <= unix_secs_now() {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Mint a development token for `claims`.
pub fn issue_hmac_token(claims: &AuthClaims, secret: &str) -> anyhow::Result<String> {
	let payload = serde_json::to_vec(claims).context("encode token claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> anyhow::Result<Vec<u8>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|e| anyhow!("hmac key: {e}"))?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

fn validate_with_secret(payload: &[u8], secret: &str) -> ValidateResponse {
	let req: ValidateRequest = match serde_json::from_slice(payload) {
		Ok(req) => req,
		Err(_) => return ValidateResponse::invalid(),
	};

	match verify_hmac_token(&req.token, secret) {
		Ok(claims) => match UserId::parse(&claims.sub) {
			Ok(user) => {
				let username = claims.name.unwrap_or_else(|| user.to_string());
				ValidateResponse::valid(user.to_string(), username)
			}
			Err(_) => ValidateResponse::invalid(),
		},
		Err(e) => {
			debug!(error = %e, "auth: token rejected");
			ValidateResponse::invalid()
		}
	}
}

/// Answer `auth.validate` by checking HMAC development tokens.
pub async fn spawn_hmac_authority(bus: Arc<dyn Bus>, secret: String) -> anyhow::Result<JoinHandle<()>> {
	let mut sub = bus
		.queue_subscribe(VALIDATE_SUBJECT, "auth")
		.await
		.context("subscribe auth.validate")?;

	info!(subject = VALIDATE_SUBJECT, "hmac auth authority started");

	Ok(tokio::spawn(async move {
		while let Some(msg) = sub.next().await {
			let resp = validate_with_secret(&msg.payload, &secret);
			let encoded = match serde_json::to_vec(&resp) {
				Ok(encoded) => encoded,
				Err(e) => {
					warn!(error = %e, "auth: failed to encode validate reply");
					continue;
				}
			};

			if let Err(e) = msg.respond(Bytes::from(encoded)) {
				debug!(error = %e, "auth: validate reply dropped");
			}
		}
		debug!("hmac auth authority exiting (bus closed)");
	}))
}

#[cfg(test)]
pub(crate) fn dev_token(user: UserId, name: &str, secret: &str) -> String {
	let claims = AuthClaims {
		sub: user.to_string(),
		name: Some(name.to_string()),
		exp: unix_secs_now() + 3600,
	};
	issue_hmac_token(&claims, secret).expect("issue token")
}
