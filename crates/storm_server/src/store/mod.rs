#![forbid(unsafe_code)]

//! Durable records and the repository seam behind the conversation and message services.

pub mod memory;
pub mod sql;

use async_trait::async_trait;
use storm_domain::{ConversationId, MessageId, Role, UserId};
use thiserror::Error;
use tracing::warn;

pub use memory::MemoryStore;
pub use sql::SqlStore;

/// Soft-delete lifecycle shared by conversations, memberships and messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
	Active,
	Deleted { deleted_at: i64 },
}

impl RecordStatus {
	pub fn is_active(&self) -> bool {
		matches!(self, RecordStatus::Active)
	}

	pub fn from_deleted_at(deleted_at: Option<i64>) -> Self {
		match deleted_at {
			Some(deleted_at) => RecordStatus::Deleted { deleted_at },
			None => RecordStatus::Active,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
	pub id: ConversationId,
	pub name: String,
	pub avatar_url: String,
	pub created_by: UserId,
	pub created_at: i64,
	pub updated_at: i64,
	pub status: RecordStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
	pub name: String,
	pub avatar_url: String,
	pub created_by: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
	pub id: i64,
	pub conversation_id: ConversationId,
	pub user_id: UserId,
	pub role: Role,
	pub created_at: i64,
	pub status: RecordStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
	pub id: MessageId,
	pub conversation_id: ConversationId,
	pub sender_id: UserId,
	pub content: String,
	pub attachment: Option<String>,
	pub created_at: i64,
	pub updated_at: i64,
	pub status: RecordStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
	pub conversation_id: ConversationId,
	pub sender_id: UserId,
	pub content: String,
	pub attachment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageReceipt {
	pub message_id: MessageId,
	pub user_id: UserId,
	pub received_at: i64,
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("conversation not found")]
	ConversationNotFound,

	#[error("membership not found")]
	MembershipNotFound,

	#[error("message not found")]
	MessageNotFound,

	#[error("membership already exists")]
	MembershipExists,

	#[error("conversation must keep at least one owner")]
	LastOwner,

	#[error("corrupt row: {0}")]
	Corrupt(String),

	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),
}

/// Conversations and memberships.
///
/// Lookups only ever return active records; soft-deleted ones read as not found.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
	async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, StoreError>;

	/// Create a conversation and its owner membership.
	///
	/// This default is two steps with a compensating soft-delete. A crash
	/// between the steps leaves an ownerless conversation behind; backends with
	/// transactions override it.
	async fn create_conversation_with_owner(
		&self,
		new: NewConversation,
	) -> Result<(Conversation, Membership), StoreError> {
		let owner = new.created_by;
		let conversation = self.create_conversation(new).await?;

		match self.create_membership(conversation.id, owner, Role::Owner).await {
			Ok(membership) => Ok((conversation, membership)),
			Err(e) => {
				if let Err(rollback) = self.soft_delete_conversation(conversation.id).await {
					warn!(
						conversation_id = %conversation.id,
						error = %rollback,
						"failed to roll back conversation after owner membership error"
					);
				}
				Err(e)
			}
		}
	}

	async fn get_conversation(&self, id: ConversationId) -> Result<Conversation, StoreError>;

	/// Conversations where `user` holds an active membership, most recently updated first.
	async fn list_conversations_for_user(&self, user: UserId) -> Result<Vec<Conversation>, StoreError>;

	/// Soft-delete the conversation and every active membership in it.
	async fn soft_delete_conversation(&self, id: ConversationId) -> Result<(), StoreError>;

	/// Fails with `MembershipExists` while an active membership exists.
	async fn create_membership(
		&self,
		conversation: ConversationId,
		user: UserId,
		role: Role,
	) -> Result<Membership, StoreError>;

	async fn get_membership(&self, conversation: ConversationId, user: UserId) -> Result<Membership, StoreError>;

	/// Active memberships ordered by role (owners first), then by id.
	async fn list_memberships(&self, conversation: ConversationId) -> Result<Vec<Membership>, StoreError>;

	/// Fails with `LastOwner` when demoting the only active owner.
	async fn update_membership_role(
		&self,
		conversation: ConversationId,
		user: UserId,
		role: Role,
	) -> Result<Membership, StoreError>;

	/// Fails with `LastOwner` when removing the only active owner.
	async fn remove_membership(&self, conversation: ConversationId, user: UserId) -> Result<(), StoreError>;

	async fn count_owners(&self, conversation: ConversationId) -> Result<usize, StoreError>;
}

/// Messages and per-user receipts.
#[async_trait]
pub trait MessageRepository: Send + Sync {
	async fn insert_message(&self, new: NewMessage) -> Result<Message, StoreError>;

	async fn get_message(&self, id: MessageId) -> Result<Message, StoreError>;

	/// Newest first, at most `limit` rows.
	async fn list_messages(&self, conversation: ConversationId, limit: usize) -> Result<Vec<Message>, StoreError>;

	async fn update_message_content(&self, id: MessageId, content: &str) -> Result<Message, StoreError>;

	async fn soft_delete_message(&self, id: MessageId) -> Result<(), StoreError>;

	/// First write wins: an existing receipt for the pair is returned unchanged.
	async fn mark_received(&self, receipt: MessageReceipt) -> Result<MessageReceipt, StoreError>;

	async fn get_receipt(&self, id: MessageId, user: UserId) -> Result<Option<MessageReceipt>, StoreError>;
}
