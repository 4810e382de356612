#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use storm_domain::{ConversationId, MessageId, Role, UserId};
use tokio::sync::Mutex;
use tracing::debug;

use super::{
	Conversation, ConversationRepository, Membership, Message, MessageReceipt, MessageRepository, NewConversation,
	NewMessage, RecordStatus, StoreError,
};
use crate::util::time::unix_ms_now;

/// Process-local store used for development and tests.
///
/// All state sits behind one lock, so multi-step operations are atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
	inner: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
	last_conversation_id: i64,
	last_membership_id: i64,
	last_message_id: i64,
	conversations: BTreeMap<ConversationId, Conversation>,
	memberships: Vec<Membership>,
	messages: BTreeMap<MessageId, Message>,
	receipts: HashMap<(MessageId, UserId), MessageReceipt>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

impl State {
	fn active_conversation(&self, id: ConversationId) -> Result<&Conversation, StoreError> {
		self.conversations
			.get(&id)
			.filter(|c| c.status.is_active())
			.ok_or(StoreError::ConversationNotFound)
	}

	fn active_membership_idx(&self, conversation: ConversationId, user: UserId) -> Option<usize> {
		self.memberships
			.iter()
			.position(|m| m.conversation_id == conversation && m.user_id == user && m.status.is_active())
	}

	fn owner_count(&self, conversation: ConversationId) -> usize {
		self.memberships
			.iter()
			.filter(|m| m.conversation_id == conversation && m.role == Role::Owner && m.status.is_active())
			.count()
	}

	fn insert_conversation(&mut self, new: NewConversation, now: i64) -> Result<Conversation, StoreError> {
		self.last_conversation_id += 1;
		let id = ConversationId::try_from(self.last_conversation_id).map_err(|e| StoreError::Corrupt(e.to_string()))?;

		let conversation = Conversation {
			id,
			name: new.name,
			avatar_url: new.avatar_url,
			created_by: new.created_by,
			created_at: now,
			updated_at: now,
			status: RecordStatus::Active,
		};
		self.conversations.insert(id, conversation.clone());
		Ok(conversation)
	}

	fn insert_membership(
		&mut self,
		conversation: ConversationId,
		user: UserId,
		role: Role,
		now: i64,
	) -> Result<Membership, StoreError> {
		self.active_conversation(conversation)?;
		if self.active_membership_idx(conversation, user).is_some() {
			return Err(StoreError::MembershipExists);
		}

		self.last_membership_id += 1;
		let membership = Membership {
			id: self.last_membership_id,
			conversation_id: conversation,
			user_id: user,
			role,
			created_at: now,
			status: RecordStatus::Active,
		};
		self.memberships.push(membership.clone());
		Ok(membership)
	}

	fn active_message(&self, id: MessageId) -> Result<&Message, StoreError> {
		self.messages
			.get(&id)
			.filter(|m| m.status.is_active())
			.ok_or(StoreError::MessageNotFound)
	}
}

#[async_trait]
impl ConversationRepository for MemoryStore {
	async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, StoreError> {
		let mut state = self.inner.lock().await;
		state.insert_conversation(new, unix_ms_now())
	}

	async fn create_conversation_with_owner(
		&self,
		new: NewConversation,
	) -> Result<(Conversation, Membership), StoreError> {
		let now = unix_ms_now();
		let owner = new.created_by;

		let mut state = self.inner.lock().await;
		let conversation = state.insert_conversation(new, now)?;
		let membership = state.insert_membership(conversation.id, owner, Role::Owner, now)?;
		Ok((conversation, membership))
	}

	async fn get_conversation(&self, id: ConversationId) -> Result<Conversation, StoreError> {
		let state = self.inner.lock().await;
		state.active_conversation(id).cloned()
	}

	async fn list_conversations_for_user(&self, user: UserId) -> Result<Vec<Conversation>, StoreError> {
		let state = self.inner.lock().await;

		let mut out: Vec<Conversation> = state
			.memberships
			.iter()
			.filter(|m| m.user_id == user && m.status.is_active())
			.filter_map(|m| state.active_conversation(m.conversation_id).ok().cloned())
			.collect();

		out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
		Ok(out)
	}

	async fn soft_delete_conversation(&self, id: ConversationId) -> Result<(), StoreError> {
		let now = unix_ms_now();
		let mut state = self.inner.lock().await;

		let conversation = state.conversations.get_mut(&id).ok_or(StoreError::ConversationNotFound)?;
		if let RecordStatus::Deleted { deleted_at } = conversation.status {
			debug!(conversation = %id, deleted_at, "store: conversation already deleted");
			return Err(StoreError::ConversationNotFound);
		}
		conversation.status = RecordStatus::Deleted { deleted_at: now };
		conversation.updated_at = now;

		for m in state
			.memberships
			.iter_mut()
			.filter(|m| m.conversation_id == id && m.status.is_active())
		{
			m.status = RecordStatus::Deleted { deleted_at: now };
		}

		Ok(())
	}

	async fn create_membership(
		&self,
		conversation: ConversationId,
		user: UserId,
		role: Role,
	) -> Result<Membership, StoreError> {
		let mut state = self.inner.lock().await;
		state.insert_membership(conversation, user, role, unix_ms_now())
	}

	async fn get_membership(&self, conversation: ConversationId, user: UserId) -> Result<Membership, StoreError> {
		let state = self.inner.lock().await;
		state
			.active_membership_idx(conversation, user)
			.map(|idx| state.memberships[idx].clone())
			.ok_or(StoreError::MembershipNotFound)
	}

	async fn list_memberships(&self, conversation: ConversationId) -> Result<Vec<Membership>, StoreError> {
		let state = self.inner.lock().await;

		let mut out: Vec<Membership> = state
			.memberships
			.iter()
			.filter(|m| m.conversation_id == conversation && m.status.is_active())
			.cloned()
			.collect();

		out.sort_by(|a, b| b.role.cmp(&a.role).then(a.id.cmp(&b.id)));
		Ok(out)
	}

	async fn update_membership_role(
		&self,
		conversation: ConversationId,
		user: UserId,
		role: Role,
	) -> Result<Membership, StoreError> {
		let mut state = self.inner.lock().await;

		let idx = state
			.active_membership_idx(conversation, user)
			.ok_or(StoreError::MembershipNotFound)?;

		let current = state.memberships[idx].role;
		if current == Role::Owner && role != Role::Owner && state.owner_count(conversation) <= 1 {
			return Err(StoreError::LastOwner);
		}

		state.memberships[idx].role = role;
		Ok(state.memberships[idx].clone())
	}

	async fn remove_membership(&self, conversation: ConversationId, user: UserId) -> Result<(), StoreError> {
		let now = unix_ms_now();
		let mut state = self.inner.lock().await;

		let idx = state
			.active_membership_idx(conversation, user)
			.ok_or(StoreError::MembershipNotFound)?;

		if state.memberships[idx].role == Role::Owner && state.owner_count(conversation) <= 1 {
			return Err(StoreError::LastOwner);
		}

		state.memberships[idx].status = RecordStatus::Deleted { deleted_at: now };
		Ok(())
	}

	async fn count_owners(&self, conversation: ConversationId) -> Result<usize, StoreError> {
		let state = self.inner.lock().await;
		Ok(state.owner_count(conversation))
	}
}

#[async_trait]
impl MessageRepository for MemoryStore {
	async fn insert_message(&self, new: NewMessage) -> Result<Message, StoreError> {
		let now = unix_ms_now();
		let mut state = self.inner.lock().await;

		state.last_message_id += 1;
		let id = MessageId::try_from(state.last_message_id).map_err(|e| StoreError::Corrupt(e.to_string()))?;

		let message = Message {
			id,
			conversation_id: new.conversation_id,
			sender_id: new.sender_id,
			content: new.content,
			attachment: new.attachment,
			created_at: now,
			updated_at: now,
			status: RecordStatus::Active,
		};
		state.messages.insert(id, message.clone());

		if let Some(c) = state.conversations.get_mut(&new.conversation_id) {
			c.updated_at = now;
		}

		Ok(message)
	}

	async fn get_message(&self, id: MessageId) -> Result<Message, StoreError> {
		let state = self.inner.lock().await;
		state.active_message(id).cloned()
	}

	async fn list_messages(&self, conversation: ConversationId, limit: usize) -> Result<Vec<Message>, StoreError> {
		let state = self.inner.lock().await;

		// Ids are allocated in insertion order, so reverse id order is newest first.
		Ok(state
			.messages
			.values()
			.rev()
			.filter(|m| m.conversation_id == conversation && m.status.is_active())
			.take(limit)
			.cloned()
			.collect())
	}

	async fn update_message_content(&self, id: MessageId, content: &str) -> Result<Message, StoreError> {
		let now = unix_ms_now();
		let mut state = self.inner.lock().await;

		let message = state
			.messages
			.get_mut(&id)
			.filter(|m| m.status.is_active())
			.ok_or(StoreError::MessageNotFound)?;
		message.content = content.to_string();
		message.updated_at = now;
		Ok(message.clone())
	}

	async fn soft_delete_message(&self, id: MessageId) -> Result<(), StoreError> {
		let now = unix_ms_now();
		let mut state = self.inner.lock().await;

		let message = state.messages.get_mut(&id).ok_or(StoreError::MessageNotFound)?;
		if let RecordStatus::Deleted { deleted_at } = message.status {
			debug!(message_id = %id, deleted_at, "store: message already deleted");
			return Err(StoreError::MessageNotFound);
		}
		message.status = RecordStatus::Deleted { deleted_at: now };
		message.updated_at = now;
		Ok(())
	}

	async fn mark_received(&self, receipt: MessageReceipt) -> Result<MessageReceipt, StoreError> {
		let mut state = self.inner.lock().await;
		state.active_message(receipt.message_id)?;

		Ok(*state
			.receipts
			.entry((receipt.message_id, receipt.user_id))
			.or_insert(receipt))
	}

	async fn get_receipt(&self, id: MessageId, user: UserId) -> Result<Option<MessageReceipt>, StoreError> {
		let state = self.inner.lock().await;
		Ok(state.receipts.get(&(id, user)).copied())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn new_conversation(owner: UserId) -> NewConversation {
		NewConversation {
			name: "team".to_string(),
			avatar_url: String::new(),
			created_by: owner,
		}
	}

	#[tokio::test]
	async fn soft_deleted_conversation_reads_as_missing() {
		let store = MemoryStore::new();
		let owner = UserId::new_v4();
		let (c, _) = store
			.create_conversation_with_owner(new_conversation(owner))
			.await
			.expect("create");

		store.soft_delete_conversation(c.id).await.expect("delete");
		let tombstone = store.inner.lock().await.conversations.get(&c.id).map(|c| c.status);

		assert!(matches!(
			store.soft_delete_conversation(c.id).await,
			Err(StoreError::ConversationNotFound)
		));
		assert_eq!(store.inner.lock().await.conversations.get(&c.id).map(|c| c.status), tombstone);
		assert!(matches!(tombstone, Some(RecordStatus::Deleted { .. })));

		assert!(matches!(store.get_conversation(c.id).await, Err(StoreError::ConversationNotFound)));
		assert!(matches!(
			store.get_membership(c.id, owner).await,
			Err(StoreError::MembershipNotFound)
		));
		assert!(store.list_conversations_for_user(owner).await.expect("list").is_empty());
	}

	#[tokio::test]
	async fn membership_can_be_recreated_after_removal() {
		let store = MemoryStore::new();
		let owner = UserId::new_v4();
		let user = UserId::new_v4();
		let (c, _) = store
			.create_conversation_with_owner(new_conversation(owner))
			.await
			.expect("create");

		let first = store.create_membership(c.id, user, Role::Member).await.expect("add");
		assert!(matches!(
			store.create_membership(c.id, user, Role::Member).await,
			Err(StoreError::MembershipExists)
		));

		store.remove_membership(c.id, user).await.expect("remove");
		let second = store.create_membership(c.id, user, Role::Admin).await.expect("re-add");
		assert_ne!(first.id, second.id);
		assert_eq!(second.role, Role::Admin);
	}

	#[tokio::test]
	async fn last_owner_is_guarded() {
		let store = MemoryStore::new();
		let owner = UserId::new_v4();
		let (c, _) = store
			.create_conversation_with_owner(new_conversation(owner))
			.await
			.expect("create");

		assert!(matches!(
			store.update_membership_role(c.id, owner, Role::Admin).await,
			Err(StoreError::LastOwner)
		));
		assert!(matches!(store.remove_membership(c.id, owner).await, Err(StoreError::LastOwner)));
		assert_eq!(store.count_owners(c.id).await.expect("count"), 1);
	}

	#[tokio::test]
	async fn receipts_keep_the_first_write() {
		let store = MemoryStore::new();
		let owner = UserId::new_v4();
		let (c, _) = store
			.create_conversation_with_owner(new_conversation(owner))
			.await
			.expect("create");
		let m = store
			.insert_message(NewMessage {
				conversation_id: c.id,
				sender_id: owner,
				content: "hi".to_string(),
				attachment: None,
			})
			.await
			.expect("insert");

		let first = store
			.mark_received(MessageReceipt {
				message_id: m.id,
				user_id: owner,
				received_at: 10,
			})
			.await
			.expect("ack");
		let second = store
			.mark_received(MessageReceipt {
				message_id: m.id,
				user_id: owner,
				received_at: 20,
			})
			.await
			.expect("ack again");

		assert_eq!(first.received_at, 10);
		assert_eq!(second.received_at, 10);
		assert_eq!(store.get_receipt(m.id, owner).await.expect("get").map(|r| r.received_at), Some(10));
	}

	#[tokio::test]
	async fn list_messages_is_newest_first_and_limited() {
		let store = MemoryStore::new();
		let owner = UserId::new_v4();
		let (c, _) = store
			.create_conversation_with_owner(new_conversation(owner))
			.await
			.expect("create");

		for i in 0..5 {
			store
				.insert_message(NewMessage {
					conversation_id: c.id,
					sender_id: owner,
					content: format!("m{i}"),
					attachment: None,
				})
				.await
				.expect("insert");
		}

		let listed = store.list_messages(c.id, 3).await.expect("list");
		let contents: Vec<&str> = listed.iter().map(|m| m.content.as_str()).collect();
		assert_eq!(contents, vec!["m4", "m3", "m2"]);
	}
}
