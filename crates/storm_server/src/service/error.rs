#![forbid(unsafe_code)]

use storm_protocol::ErrorCode;
use thiserror::Error;

use crate::store::StoreError;

/// Typed failure of a conversation or message operation.
#[derive(Debug, Error)]
pub enum ServiceError {
	#[error("{0}")]
	InvalidInput(String),

	#[error("{0} not found")]
	NotFound(&'static str),

	#[error("forbidden")]
	Forbidden,

	#[error("{0}")]
	Conflict(&'static str),

	#[error("internal error")]
	Internal(#[source] StoreError),
}

impl ServiceError {
	pub fn invalid(msg: impl Into<String>) -> Self {
		ServiceError::InvalidInput(msg.into())
	}

	pub fn code(&self) -> ErrorCode {
		match self {
			ServiceError::InvalidInput(_) => ErrorCode::InvalidInput,
			ServiceError::NotFound(_) => ErrorCode::NotFound,
			ServiceError::Forbidden => ErrorCode::Forbidden,
			ServiceError::Conflict(_) => ErrorCode::Conflict,
			ServiceError::Internal(_) => ErrorCode::Internal,
		}
	}
}

impl From<StoreError> for ServiceError {
	fn from(e: StoreError) -> Self {
		match e {
			StoreError::ConversationNotFound => ServiceError::NotFound("conversation"),
			StoreError::MembershipNotFound => ServiceError::NotFound("membership"),
			StoreError::MessageNotFound => ServiceError::NotFound("message"),
			StoreError::MembershipExists => ServiceError::Conflict("membership already exists"),
			StoreError::LastOwner => ServiceError::Conflict("cannot remove the last owner"),
			other => ServiceError::Internal(other),
		}
	}
}
