#![forbid(unsafe_code)]

//! JSON frames exchanged with WebSocket clients (one frame per message).

use serde::{Deserialize, Serialize};

/// Inbound and relayed client frame: `{action, room, user, content}`.
///
/// Missing fields read as empty strings. `id` is only present on frames that
/// relay a persisted message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
	#[serde(default)]
	pub action: String,
	#[serde(default)]
	pub room: String,
	#[serde(default)]
	pub user: String,
	#[serde(default)]
	pub content: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<i64>,
}

/// Action tag of a client frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAction {
	Join,
	Message,
	Typing,
	Unknown,
}

impl ClientAction {
	pub fn parse(tag: &str) -> Self {
		match tag {
			"join" => ClientAction::Join,
			"message" => ClientAction::Message,
			"typing" => ClientAction::Typing,
			_ => ClientAction::Unknown,
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			ClientAction::Join => "join",
			ClientAction::Message => "message",
			ClientAction::Typing => "typing",
			ClientAction::Unknown => "unknown",
		}
	}
}

impl ClientFrame {
	pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
		serde_json::from_slice(bytes)
	}

	pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
		serde_json::to_vec(self)
	}

	pub fn action(&self) -> ClientAction {
		ClientAction::parse(&self.action)
	}
}
