#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use storm_domain::ConversationId;

use crate::pb;

/// Error codes carried in every failed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
	/// Missing or malformed identifiers, invalid role, content or name rules.
	InvalidInput,
	NotFound,
	Forbidden,
	/// Duplicate active membership or the last-owner guard.
	Conflict,
	Internal,
}

impl ErrorCode {
	/// Stable wire string.
	pub const fn as_str(self) -> &'static str {
		match self {
			ErrorCode::InvalidInput => "BAD_REQUEST",
			ErrorCode::NotFound => "NOT_FOUND",
			ErrorCode::Forbidden => "FORBIDDEN",
			ErrorCode::Conflict => "CONFLICT",
			ErrorCode::Internal => "INTERNAL",
		}
	}
}

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ErrorCode {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"BAD_REQUEST" => Ok(ErrorCode::InvalidInput),
			"NOT_FOUND" => Ok(ErrorCode::NotFound),
			"FORBIDDEN" => Ok(ErrorCode::Forbidden),
			"CONFLICT" => Ok(ErrorCode::Conflict),
			"INTERNAL" => Ok(ErrorCode::Internal),
			_ => Err(()),
		}
	}
}

/// Uniform `{ok, data | error}` reply shape.
pub trait Envelope: prost::Message + Default {
	type Data;

	fn success(data: Self::Data) -> Self;

	fn failure(error: pb::Error) -> Self;

	fn is_ok(&self) -> bool;

	fn error(&self) -> Option<&pb::Error>;

	fn fail(code: ErrorCode, message: impl Into<String>) -> Self {
		Self::failure(pb::Error {
			code: code.as_str().to_string(),
			message: message.into(),
		})
	}

	/// Parsed error code; unknown codes read as `Internal`.
	fn error_code(&self) -> Option<ErrorCode> {
		self.error()
			.map(|e| e.code.parse().unwrap_or(ErrorCode::Internal))
	}
}

macro_rules! envelope {
	($reply:ty, single $data:ty) => {
		impl Envelope for $reply {
			type Data = $data;

			fn success(data: $data) -> Self {
				Self {
					ok: true,
					data: Some(data),
					error: None,
				}
			}

			fn failure(error: pb::Error) -> Self {
				Self {
					ok: false,
					data: None,
					error: Some(error),
				}
			}

			fn is_ok(&self) -> bool {
				self.ok
			}

			fn error(&self) -> Option<&pb::Error> {
				self.error.as_ref()
			}
		}
	};
	($reply:ty, list $data:ty) => {
		impl Envelope for $reply {
			type Data = Vec<$data>;

			fn success(data: Vec<$data>) -> Self {
				Self {
					ok: true,
					data,
					error: None,
				}
			}

			fn failure(error: pb::Error) -> Self {
				Self {
					ok: false,
					data: Vec::new(),
					error: Some(error),
				}
			}

			fn is_ok(&self) -> bool {
				self.ok
			}

			fn error(&self) -> Option<&pb::Error> {
				self.error.as_ref()
			}
		}
	};
}

envelope!(pb::MessageReply, single pb::ChatMessage);
envelope!(pb::MessageListReply, list pb::ChatMessage);
envelope!(pb::ConversationReply, single pb::Conversation);
envelope!(pb::ConversationListReply, list pb::Conversation);
envelope!(pb::MemberReply, single pb::Member);
envelope!(pb::MemberListReply, list pb::Member);

impl Envelope for pb::StatusReply {
	type Data = ();

	fn success(_: ()) -> Self {
		Self { ok: true, error: None }
	}

	fn failure(error: pb::Error) -> Self {
		Self {
			ok: false,
			error: Some(error),
		}
	}

	fn is_ok(&self) -> bool {
		self.ok
	}

	fn error(&self) -> Option<&pb::Error> {
		self.error.as_ref()
	}
}

/// Pick the conversation id from a request.
///
/// The canonical field wins whenever it is positive; the legacy field is only
/// consulted otherwise.
pub fn resolve_conversation_id(canonical: i64, legacy: i64) -> Option<ConversationId> {
	ConversationId::new(canonical).or_else(|| ConversationId::new(legacy))
}

/// Requests that address a conversation through the canonical/legacy pair.
pub trait ConversationRef {
	fn canonical_conversation_id(&self) -> i64;

	fn legacy_group_id(&self) -> i64;

	fn conversation(&self) -> Option<ConversationId> {
		resolve_conversation_id(self.canonical_conversation_id(), self.legacy_group_id())
	}
}

macro_rules! conversation_ref {
	($($req:ty),+ $(,)?) => {
		$(
			impl ConversationRef for $req {
				fn canonical_conversation_id(&self) -> i64 {
					self.conversation_id
				}

				fn legacy_group_id(&self) -> i64 {
					self.group_id
				}
			}
		)+
	};
}

conversation_ref!(
	pb::SendMessageRequest,
	pb::ListMessagesRequest,
	pb::GetConversationRequest,
	pb::AddMemberRequest,
	pb::RemoveMemberRequest,
	pb::ListMembersRequest,
	pb::UpdateRoleRequest,
	pb::LeaveConversationRequest,
	pb::DeleteConversationRequest,
);
