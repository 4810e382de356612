#![forbid(unsafe_code)]

pub mod auth;
pub mod client;
pub mod codec;
pub mod envelope;
pub mod pb;
pub mod subject;

pub use codec::{CodecError, DEFAULT_MAX_PAYLOAD_SIZE, decode_payload, encode_payload};
pub use envelope::{ConversationRef, Envelope, ErrorCode, resolve_conversation_id};
pub use subject::{QUEUE_GROUP, Subject};

/// Schema version constants.
pub mod version {
	/// Current RPC schema major version.
	pub const SCHEMA_MAJOR: u32 = 1;
	/// Current RPC schema minor version.
	pub const SCHEMA_MINOR: u32 = 0;

	/// Compact representation useful for logs/metrics.
	pub const SCHEMA_VERSION_U32: u32 = (SCHEMA_MAJOR << 16) | SCHEMA_MINOR;
}
