#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("identifier must be positive: {0}")]
	NotPositive(i64),
	#[error("unknown role: {0}")]
	UnknownRole(i64),
}

/// User identifier issued by the auth authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
	pub const fn new(id: Uuid) -> Self {
		Self(id)
	}

	pub fn new_v4() -> Self {
		Self(Uuid::new_v4())
	}

	/// Parse a hyphenated or simple UUID string.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat(format!("not a uuid: {s}")))
	}

	pub fn is_nil(&self) -> bool {
		self.0.is_nil()
	}

	pub const fn as_uuid(&self) -> &Uuid {
		&self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::parse(s)
	}
}

macro_rules! positive_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(try_from = "i64", into = "i64")]
		pub struct $name(i64);

		impl $name {
			/// Returns `None` unless `id > 0`.
			pub const fn new(id: i64) -> Option<Self> {
				if id > 0 { Some(Self(id)) } else { None }
			}

			pub const fn get(self) -> i64 {
				self.0
			}
		}

		impl TryFrom<i64> for $name {
			type Error = ParseIdError;

			fn try_from(v: i64) -> Result<Self, Self::Error> {
				Self::new(v).ok_or(ParseIdError::NotPositive(v))
			}
		}

		impl From<$name> for i64 {
			fn from(v: $name) -> i64 {
				v.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				let v: i64 = s
					.parse()
					.map_err(|_| ParseIdError::InvalidFormat(format!("not an integer: {s}")))?;
				Self::try_from(v)
			}
		}
	};
}

positive_id!(
	/// Durable conversation identifier (server-assigned, positive).
	ConversationId
);

positive_id!(
	/// Durable message identifier (server-assigned, monotonic).
	MessageId
);

/// Membership role inside a conversation.
///
/// Ordering follows privilege: `Member < Admin < Owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	Member,
	Admin,
	Owner,
}

impl Role {
	/// Stable wire value.
	pub const fn as_i32(self) -> i32 {
		match self {
			Role::Member => 0,
			Role::Admin => 1,
			Role::Owner => 2,
		}
	}

	pub const fn from_i32(v: i32) -> Option<Self> {
		match v {
			0 => Some(Role::Member),
			1 => Some(Role::Admin),
			2 => Some(Role::Owner),
			_ => None,
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			Role::Member => "member",
			Role::Admin => "admin",
			Role::Owner => "owner",
		}
	}

	/// Admins and owners may moderate other members' messages.
	pub const fn can_moderate(self) -> bool {
		matches!(self, Role::Admin | Role::Owner)
	}
}

impl TryFrom<i32> for Role {
	type Error = ParseIdError;

	fn try_from(v: i32) -> Result<Self, Self::Error> {
		Role::from_i32(v).ok_or(ParseIdError::UnknownRole(v as i64))
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Conversation-scoped room names.
pub struct ConversationRoom;

impl ConversationRoom {
	/// Canonical prefix.
	pub const PREFIX: &'static str = "conversation:";
	/// Deprecated alias still sent by older clients.
	pub const LEGACY_PREFIX: &'static str = "group:";

	/// Format the canonical room name (e.g. `conversation:42`).
	pub fn format(id: ConversationId) -> String {
		format!("{}{}", Self::PREFIX, id)
	}

	/// Returns the id part when `room` carries a conversation prefix.
	fn id_part(room: &str) -> Option<&str> {
		room.strip_prefix(Self::PREFIX)
			.or_else(|| room.strip_prefix(Self::LEGACY_PREFIX))
	}

	/// Whether `room` uses a conversation prefix, regardless of the id part.
	pub fn is_conversation_room(room: &str) -> bool {
		Self::id_part(room).is_some()
	}

	/// Parse `conversation:<id>` or `group:<id>` into a positive id.
	pub fn parse(room: &str) -> Result<ConversationId, ParseIdError> {
		if room.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let id = Self::id_part(room)
			.ok_or_else(|| ParseIdError::InvalidFormat("expected conversation:<id>".into()))?;
		id.parse()
	}
}

/// Per-user private rooms (`user:<uuid>`), joined automatically on connect.
pub struct PrivateRoom;

impl PrivateRoom {
	pub const PREFIX: &'static str = "user:";

	pub fn format(user: UserId) -> String {
		format!("{}{}", Self::PREFIX, user)
	}

	/// The owner of `room` when it is exactly `user:<uuid>`.
	pub fn owner(room: &str) -> Option<UserId> {
		room.strip_prefix(Self::PREFIX).and_then(|id| UserId::parse(id).ok())
	}
}

/// How a room name is treated by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomScope {
	/// `conversation:<id>` / `group:<id>` with a valid id; joins need membership.
	Conversation(ConversationId),
	/// Conversation prefix with an unusable id part.
	MalformedConversation,
	/// `user:<uuid>`; only its owner is placed in it.
	Private,
	/// Anything else, `user:` names without a uuid included; joined without checks.
	AdHoc,
}

impl RoomScope {
	pub fn classify(room: &str) -> Self {
		if ConversationRoom::is_conversation_room(room) {
			return match ConversationRoom::parse(room) {
				Ok(id) => RoomScope::Conversation(id),
				Err(_) => RoomScope::MalformedConversation,
			};
		}

		if PrivateRoom::owner(room).is_some() {
			return RoomScope::Private;
		}

		RoomScope::AdHoc
	}
}

/// Broadcast topics used for cross-process room fan-out.
pub struct BroadcastTopic;

impl BroadcastTopic {
	/// Prefix for room broadcast subjects.
	pub const PREFIX: &'static str = "message.broadcast.";
	/// Wildcard pattern matching every room broadcast subject.
	pub const PATTERN: &'static str = "message.broadcast.>";

	/// Subject for a room (e.g. `message.broadcast.conversation:7`).
	pub fn subject(room: &str) -> String {
		format!("{}{}", Self::PREFIX, room)
	}

	/// Recover the room name from a broadcast subject.
	///
	/// Everything after the prefix is the room, dots included.
	pub fn room(subject: &str) -> Option<&str> {
		subject.strip_prefix(Self::PREFIX).filter(|room| !room.is_empty())
	}
}
