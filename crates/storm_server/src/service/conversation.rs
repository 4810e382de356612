#![forbid(unsafe_code)]

use std::sync::Arc;

use storm_domain::{ConversationId, Role, UserId};
use tracing::{debug, info};

use super::ServiceError;
use crate::store::{Conversation, ConversationRepository, Membership, NewConversation, StoreError};

pub const DEFAULT_CONVERSATION_NAME: &str = "Untitled conversation";
pub const MAX_CONVERSATION_NAME_CHARS: usize = 120;

/// Conversation and membership rules on top of a `ConversationRepository`.
#[derive(Clone)]
pub struct ConversationService {
	repo: Arc<dyn ConversationRepository>,
}

fn require_user(id: UserId, field: &str) -> Result<(), ServiceError> {
	if id.is_nil() {
		return Err(ServiceError::invalid(format!("{field} required")));
	}
	Ok(())
}

impl ConversationService {
	pub fn new(repo: Arc<dyn ConversationRepository>) -> Self {
		Self { repo }
	}

	/// Create a conversation owned by `owner`.
	///
	/// The name is trimmed and defaults to "Untitled conversation"; names over
	/// 120 characters are rejected.
	pub async fn create_conversation(
		&self,
		owner: UserId,
		name: &str,
		avatar_url: &str,
	) -> Result<Conversation, ServiceError> {
		require_user(owner, "actor_id")?;

		let name = match name.trim() {
			"" => DEFAULT_CONVERSATION_NAME,
			trimmed => trimmed,
		};
		if name.chars().count() > MAX_CONVERSATION_NAME_CHARS {
			return Err(ServiceError::invalid("conversation name too long"));
		}

		let (conversation, _owner) = self
			.repo
			.create_conversation_with_owner(NewConversation {
				name: name.to_string(),
				avatar_url: avatar_url.trim().to_string(),
				created_by: owner,
			})
			.await?;

		info!(conversation_id = %conversation.id, owner = %owner, "conversation created");
		Ok(conversation)
	}

	#[allow(dead_code)]
	pub async fn get_conversation(&self, id: ConversationId) -> Result<Conversation, ServiceError> {
		Ok(self.repo.get_conversation(id).await?)
	}

	/// Like `get_conversation`, but only for active members of it.
	pub async fn get_conversation_for_member(
		&self,
		actor: UserId,
		id: ConversationId,
	) -> Result<Conversation, ServiceError> {
		require_user(actor, "actor_id")?;
		let conversation = self.repo.get_conversation(id).await?;
		self.require_actor_membership(id, actor).await?;
		Ok(conversation)
	}

	pub async fn list_conversations_for_user(&self, user: UserId) -> Result<Vec<Conversation>, ServiceError> {
		require_user(user, "user_id")?;
		Ok(self.repo.list_conversations_for_user(user).await?)
	}

	pub async fn add_member(
		&self,
		actor: UserId,
		conversation: ConversationId,
		user: UserId,
		role: Role,
	) -> Result<Membership, ServiceError> {
		require_user(actor, "actor_id")?;
		require_user(user, "user_id")?;

		let actor_membership = self.require_actor_membership(conversation, actor).await?;
		match actor_membership.role {
			Role::Member => return Err(ServiceError::Forbidden),
			Role::Admin if role != Role::Member => return Err(ServiceError::Forbidden),
			_ => {}
		}

		let membership = self.repo.create_membership(conversation, user, role).await?;
		debug!(%conversation, %actor, %user, %role, "member added");
		Ok(membership)
	}

	/// Remove `user` from the conversation. Removing yourself is a leave.
	pub async fn remove_member(
		&self,
		actor: UserId,
		conversation: ConversationId,
		user: UserId,
	) -> Result<(), ServiceError> {
		require_user(actor, "actor_id")?;
		require_user(user, "user_id")?;

		if actor == user {
			return self.leave_conversation(user, conversation).await;
		}

		let actor_membership = self.require_actor_membership(conversation, actor).await?;
		let target = self.repo.get_membership(conversation, user).await?;

		match (actor_membership.role, target.role) {
			(Role::Member, _) => return Err(ServiceError::Forbidden),
			(Role::Admin, target_role) if target_role != Role::Member => return Err(ServiceError::Forbidden),
			_ => {}
		}

		if target.role == Role::Owner {
			self.ensure_not_last_owner(conversation).await?;
		}

		self.repo.remove_membership(conversation, user).await?;
		debug!(%conversation, %actor, %user, "member removed");
		Ok(())
	}

	pub async fn update_member_role(
		&self,
		actor: UserId,
		conversation: ConversationId,
		user: UserId,
		role: Role,
	) -> Result<Membership, ServiceError> {
		require_user(actor, "actor_id")?;
		require_user(user, "user_id")?;

		let actor_membership = self.require_actor_membership(conversation, actor).await?;
		if actor_membership.role != Role::Owner {
			return Err(ServiceError::Forbidden);
		}

		let target = self.repo.get_membership(conversation, user).await?;
		if target.role == role {
			return Ok(target);
		}

		if target.role == Role::Owner {
			self.ensure_not_last_owner(conversation).await?;
		}

		let updated = self.repo.update_membership_role(conversation, user, role).await?;
		debug!(%conversation, %actor, %user, from = %target.role, to = %role, "member role updated");
		Ok(updated)
	}

	pub async fn leave_conversation(&self, user: UserId, conversation: ConversationId) -> Result<(), ServiceError> {
		require_user(user, "user_id")?;

		let membership = self.repo.get_membership(conversation, user).await?;
		if membership.role == Role::Owner {
			self.ensure_not_last_owner(conversation).await?;
		}

		self.repo.remove_membership(conversation, user).await?;
		debug!(%conversation, %user, "member left");
		Ok(())
	}

	/// Soft-delete the conversation and all of its memberships. Owners only.
	pub async fn delete_conversation(&self, actor: UserId, conversation: ConversationId) -> Result<(), ServiceError> {
		require_user(actor, "actor_id")?;

		let actor_membership = self.require_actor_membership(conversation, actor).await?;
		if actor_membership.role != Role::Owner {
			return Err(ServiceError::Forbidden);
		}

		self.repo.soft_delete_conversation(conversation).await?;
		info!(%conversation, %actor, "conversation deleted");
		Ok(())
	}

	pub async fn list_members(&self, actor: UserId, conversation: ConversationId) -> Result<Vec<Membership>, ServiceError> {
		require_user(actor, "actor_id")?;
		self.require_actor_membership(conversation, actor).await?;
		Ok(self.repo.list_memberships(conversation).await?)
	}

	/// Absent conversations and memberships read as `false`.
	pub async fn is_member(&self, user: UserId, conversation: ConversationId) -> Result<bool, ServiceError> {
		Ok(self.membership(user, conversation).await?.is_some())
	}

	/// Active membership of `user`, if any.
	pub async fn membership(
		&self,
		user: UserId,
		conversation: ConversationId,
	) -> Result<Option<Membership>, ServiceError> {
		require_user(user, "user_id")?;

		match self.repo.get_membership(conversation, user).await {
			Ok(m) => Ok(Some(m)),
			Err(StoreError::MembershipNotFound | StoreError::ConversationNotFound) => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	/// The conversation must exist (else NotFound) and `actor` must be in it (else Forbidden).
	async fn require_actor_membership(
		&self,
		conversation: ConversationId,
		actor: UserId,
	) -> Result<Membership, ServiceError> {
		self.repo.get_conversation(conversation).await?;

		match self.repo.get_membership(conversation, actor).await {
			Ok(m) => Ok(m),
			Err(StoreError::MembershipNotFound) => Err(ServiceError::Forbidden),
			Err(e) => Err(e.into()),
		}
	}

	async fn ensure_not_last_owner(&self, conversation: ConversationId) -> Result<(), ServiceError> {
		if self.repo.count_owners(conversation).await? <= 1 {
			return Err(StoreError::LastOwner.into());
		}
		Ok(())
	}
}
