#![forbid(unsafe_code)]

//! RPC schema (`storm.v1`).
//!
//! Timestamps are Unix milliseconds. Requests that address a conversation carry
//! both `conversation_id` and the deprecated `group_id`; see
//! [`crate::resolve_conversation_id`].

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
	#[prost(string, tag = "1")]
	pub code: String,
	#[prost(string, tag = "2")]
	pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatMessage {
	#[prost(int64, tag = "1")]
	pub id: i64,
	#[prost(string, tag = "2")]
	pub sender_id: String,
	/// Deprecated mirror of `conversation_id`.
	#[prost(int64, tag = "3")]
	pub group_id: i64,
	#[prost(string, tag = "4")]
	pub content: String,
	#[prost(string, tag = "5")]
	pub attachment: String,
	#[prost(int64, tag = "6")]
	pub created_at: i64,
	#[prost(int64, tag = "7")]
	pub updated_at: i64,
	#[prost(int64, tag = "8")]
	pub conversation_id: i64,
	/// Only set on acknowledgement replies.
	#[prost(int64, tag = "9")]
	pub received_at: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Conversation {
	#[prost(int64, tag = "1")]
	pub id: i64,
	#[prost(string, tag = "2")]
	pub name: String,
	#[prost(string, tag = "3")]
	pub avatar_url: String,
	#[prost(string, tag = "4")]
	pub created_by: String,
	#[prost(int64, tag = "5")]
	pub created_at: i64,
	#[prost(int64, tag = "6")]
	pub updated_at: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Member {
	#[prost(int64, tag = "1")]
	pub id: i64,
	#[prost(int64, tag = "2")]
	pub conversation_id: i64,
	#[prost(int64, tag = "3")]
	pub group_id: i64,
	#[prost(string, tag = "4")]
	pub user_id: String,
	#[prost(int32, tag = "5")]
	pub role: i32,
	#[prost(int64, tag = "6")]
	pub created_at: i64,
}

// --- message requests ---

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessageRequest {
	#[prost(int64, tag = "1")]
	pub group_id: i64,
	#[prost(string, tag = "2")]
	pub sender_id: String,
	#[prost(string, tag = "3")]
	pub content: String,
	#[prost(string, tag = "4")]
	pub attachment: String,
	#[prost(int64, tag = "5")]
	pub conversation_id: i64,
	/// Room the sender typed into; the persisted message is fanned out there.
	#[prost(string, tag = "6")]
	pub room: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetMessageRequest {
	#[prost(int64, tag = "1")]
	pub id: i64,
	#[prost(string, tag = "2")]
	pub actor_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListMessagesRequest {
	#[prost(int64, tag = "1")]
	pub group_id: i64,
	#[prost(string, tag = "2")]
	pub actor_id: String,
	#[prost(int64, tag = "3")]
	pub conversation_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateMessageRequest {
	#[prost(int64, tag = "1")]
	pub id: i64,
	#[prost(string, tag = "2")]
	pub actor_id: String,
	#[prost(string, tag = "3")]
	pub content: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteMessageRequest {
	#[prost(int64, tag = "1")]
	pub id: i64,
	#[prost(string, tag = "2")]
	pub actor_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AckMessageRequest {
	#[prost(int64, tag = "1")]
	pub id: i64,
	#[prost(string, tag = "2")]
	pub actor_id: String,
	/// Zero means "now".
	#[prost(int64, tag = "3")]
	pub received_at: i64,
}

// --- conversation requests ---

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateConversationRequest {
	#[prost(string, tag = "1")]
	pub actor_id: String,
	#[prost(string, tag = "2")]
	pub name: String,
	#[prost(string, tag = "3")]
	pub avatar_url: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetConversationRequest {
	#[prost(string, tag = "1")]
	pub actor_id: String,
	#[prost(int64, tag = "2")]
	pub group_id: i64,
	#[prost(int64, tag = "3")]
	pub conversation_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListConversationsForUserRequest {
	#[prost(string, tag = "1")]
	pub user_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddMemberRequest {
	#[prost(string, tag = "1")]
	pub actor_id: String,
	#[prost(int64, tag = "2")]
	pub group_id: i64,
	#[prost(string, tag = "3")]
	pub user_id: String,
	#[prost(int32, tag = "4")]
	pub role: i32,
	#[prost(int64, tag = "5")]
	pub conversation_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveMemberRequest {
	#[prost(string, tag = "1")]
	pub actor_id: String,
	#[prost(int64, tag = "2")]
	pub group_id: i64,
	#[prost(string, tag = "3")]
	pub user_id: String,
	#[prost(int64, tag = "4")]
	pub conversation_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListMembersRequest {
	#[prost(string, tag = "1")]
	pub actor_id: String,
	#[prost(int64, tag = "2")]
	pub group_id: i64,
	#[prost(int64, tag = "3")]
	pub conversation_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateRoleRequest {
	#[prost(string, tag = "1")]
	pub actor_id: String,
	#[prost(int64, tag = "2")]
	pub group_id: i64,
	#[prost(string, tag = "3")]
	pub user_id: String,
	#[prost(int32, tag = "4")]
	pub role: i32,
	#[prost(int64, tag = "5")]
	pub conversation_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LeaveConversationRequest {
	#[prost(string, tag = "1")]
	pub user_id: String,
	#[prost(int64, tag = "2")]
	pub group_id: i64,
	#[prost(int64, tag = "3")]
	pub conversation_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteConversationRequest {
	#[prost(string, tag = "1")]
	pub actor_id: String,
	#[prost(int64, tag = "2")]
	pub group_id: i64,
	#[prost(int64, tag = "3")]
	pub conversation_id: i64,
}

// --- replies ---

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageReply {
	#[prost(bool, tag = "1")]
	pub ok: bool,
	#[prost(message, optional, tag = "2")]
	pub data: Option<ChatMessage>,
	#[prost(message, optional, tag = "3")]
	pub error: Option<Error>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageListReply {
	#[prost(bool, tag = "1")]
	pub ok: bool,
	#[prost(message, repeated, tag = "2")]
	pub data: Vec<ChatMessage>,
	#[prost(message, optional, tag = "3")]
	pub error: Option<Error>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConversationReply {
	#[prost(bool, tag = "1")]
	pub ok: bool,
	#[prost(message, optional, tag = "2")]
	pub data: Option<Conversation>,
	#[prost(message, optional, tag = "3")]
	pub error: Option<Error>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConversationListReply {
	#[prost(bool, tag = "1")]
	pub ok: bool,
	#[prost(message, repeated, tag = "2")]
	pub data: Vec<Conversation>,
	#[prost(message, optional, tag = "3")]
	pub error: Option<Error>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MemberReply {
	#[prost(bool, tag = "1")]
	pub ok: bool,
	#[prost(message, optional, tag = "2")]
	pub data: Option<Member>,
	#[prost(message, optional, tag = "3")]
	pub error: Option<Error>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MemberListReply {
	#[prost(bool, tag = "1")]
	pub ok: bool,
	#[prost(message, repeated, tag = "2")]
	pub data: Vec<Member>,
	#[prost(message, optional, tag = "3")]
	pub error: Option<Error>,
}

/// Reply for operations without a payload (remove, leave, delete).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusReply {
	#[prost(bool, tag = "1")]
	pub ok: bool,
	#[prost(message, optional, tag = "3")]
	pub error: Option<Error>,
}
