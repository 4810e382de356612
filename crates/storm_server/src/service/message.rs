#![forbid(unsafe_code)]

use std::sync::Arc;

use storm_domain::{ConversationId, MessageId, UserId};
use tracing::{debug, error};

use super::{ConversationService, ServiceError};
use crate::store::{Message, MessageReceipt, MessageRepository, NewMessage};
use crate::util::time::unix_ms_now;

pub const MAX_MESSAGE_CONTENT_CHARS: usize = 10_000;

/// Page size for `list_messages`.
pub const MESSAGE_PAGE_SIZE: usize = 100;

/// Message lifecycle and receipts. Authorization goes through the conversation service.
#[derive(Clone)]
pub struct MessageService {
	repo: Arc<dyn MessageRepository>,
	conversations: ConversationService,
}

fn normalize_content(content: &str) -> Result<String, ServiceError> {
	let content = content.trim();
	if content.is_empty() {
		return Err(ServiceError::invalid("message content is empty"));
	}
	if content.chars().count() > MAX_MESSAGE_CONTENT_CHARS {
		return Err(ServiceError::invalid("message content too long"));
	}
	Ok(content.to_string())
}

impl MessageService {
	pub fn new(repo: Arc<dyn MessageRepository>, conversations: ConversationService) -> Self {
		Self { repo, conversations }
	}

	pub fn conversations(&self) -> &ConversationService {
		&self.conversations
	}

	pub async fn send_message(
		&self,
		sender: UserId,
		conversation: ConversationId,
		content: &str,
		attachment: Option<String>,
	) -> Result<Message, ServiceError> {
		if sender.is_nil() {
			return Err(ServiceError::invalid("sender_id required"));
		}
		let content = normalize_content(content)?;

		if !self.conversations.is_member(sender, conversation).await? {
			return Err(ServiceError::Forbidden);
		}

		let message = self
			.repo
			.insert_message(NewMessage {
				conversation_id: conversation,
				sender_id: sender,
				content,
				attachment: attachment.filter(|a| !a.trim().is_empty()),
			})
			.await
			.map_err(|e| {
				error!(%conversation, error = %e, "failed to save message");
				ServiceError::from(e)
			})?;

		debug!(message_id = %message.id, %conversation, %sender, "message saved");
		Ok(message)
	}

	/// Fetch a message visible to `actor`.
	pub async fn get_message(&self, actor: UserId, id: MessageId) -> Result<Message, ServiceError> {
		let message = self.repo.get_message(id).await?;
		self.require_member(actor, message.conversation_id).await?;
		Ok(message)
	}

	/// Newest first, at most `MESSAGE_PAGE_SIZE`.
	pub async fn list_messages(&self, actor: UserId, conversation: ConversationId) -> Result<Vec<Message>, ServiceError> {
		self.require_member(actor, conversation).await?;
		Ok(self.repo.list_messages(conversation, MESSAGE_PAGE_SIZE).await?)
	}

	pub async fn update_message(&self, actor: UserId, id: MessageId, content: &str) -> Result<Message, ServiceError> {
		let content = normalize_content(content)?;
		let message = self.repo.get_message(id).await?;
		self.authorize_mutation(actor, &message).await?;

		let updated = self.repo.update_message_content(id, &content).await?;
		debug!(message_id = %id, %actor, "message updated");
		Ok(updated)
	}

	pub async fn delete_message(&self, actor: UserId, id: MessageId) -> Result<(), ServiceError> {
		let message = self.repo.get_message(id).await?;
		self.authorize_mutation(actor, &message).await?;

		self.repo.soft_delete_message(id).await?;
		debug!(message_id = %id, %actor, "message deleted");
		Ok(())
	}

	/// Record that `actor` received message `id`. The first timestamp sticks.
	///
	/// `received_at` of `None` (or 0) means now.
	pub async fn mark_received(
		&self,
		actor: UserId,
		id: MessageId,
		received_at: Option<i64>,
	) -> Result<(Message, MessageReceipt), ServiceError> {
		let message = self.repo.get_message(id).await?;
		self.require_member(actor, message.conversation_id).await?;

		let received_at = received_at.filter(|ts| *ts > 0).unwrap_or_else(unix_ms_now);
		let receipt = self
			.repo
			.mark_received(MessageReceipt {
				message_id: id,
				user_id: actor,
				received_at,
			})
			.await?;

		Ok((message, receipt))
	}

	#[allow(dead_code)]
	pub async fn get_receipt(&self, id: MessageId, user: UserId) -> Result<Option<MessageReceipt>, ServiceError> {
		if user.is_nil() {
			return Err(ServiceError::invalid("user_id required"));
		}
		Ok(self.repo.get_receipt(id, user).await?)
	}

	async fn require_member(&self, actor: UserId, conversation: ConversationId) -> Result<(), ServiceError> {
		if actor.is_nil() {
			return Err(ServiceError::invalid("actor_id required"));
		}
		if !self.conversations.is_member(actor, conversation).await? {
			return Err(ServiceError::Forbidden);
		}
		Ok(())
	}

	/// Senders may change their own messages; admins and owners may change any.
	async fn authorize_mutation(&self, actor: UserId, message: &Message) -> Result<(), ServiceError> {
		if actor.is_nil() {
			return Err(ServiceError::invalid("actor_id required"));
		}

		let membership = self
			.conversations
			.membership(actor, message.conversation_id)
			.await?
			.ok_or(ServiceError::Forbidden)?;

		if message.sender_id == actor || membership.role.can_moderate() {
			Ok(())
		} else {
			Err(ServiceError::Forbidden)
		}
	}
}
