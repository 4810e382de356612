#![forbid(unsafe_code)]

//! Auth authority contract (`auth.validate`, JSON request/reply).

use serde::{Deserialize, Serialize};

/// Subject answered by the auth authority.
pub const VALIDATE_SUBJECT: &str = "auth.validate";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateRequest {
	pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateResponse {
	#[serde(default)]
	pub valid: bool,
	#[serde(default)]
	pub user: Option<AuthUser>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
	#[serde(default)]
	pub id: String,
	#[serde(default)]
	pub username: String,
}

impl ValidateResponse {
	pub fn invalid() -> Self {
		Self::default()
	}

	pub fn valid(id: impl Into<String>, username: impl Into<String>) -> Self {
		Self {
			valid: true,
			user: Some(AuthUser {
				id: id.into(),
				username: username.into(),
			}),
		}
	}
}
