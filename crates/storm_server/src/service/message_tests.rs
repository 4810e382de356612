#![forbid(unsafe_code)]

use std::sync::Arc;

use storm_domain::{ConversationId, MessageId, Role, UserId};

use crate::service::message::{MAX_MESSAGE_CONTENT_CHARS, MESSAGE_PAGE_SIZE};
use crate::service::{ConversationService, MessageService, ServiceError};
use crate::store::MemoryStore;

struct Fixture {
	messages: MessageService,
	conversation: ConversationId,
	owner: UserId,
	admin: UserId,
	member: UserId,
	outsider: UserId,
}

async fn fixture() -> Fixture {
	let store = Arc::new(MemoryStore::new());
	let conversations = ConversationService::new(store.clone());
	let messages = MessageService::new(store, conversations.clone());

	let (owner, admin, member, outsider) = (UserId::new_v4(), UserId::new_v4(), UserId::new_v4(), UserId::new_v4());
	let conversation = conversations.create_conversation(owner, "team", "").await.expect("create").id;
	conversations
		.add_member(owner, conversation, admin, Role::Admin)
		.await
		.expect("add admin");
	conversations
		.add_member(owner, conversation, member, Role::Member)
		.await
		.expect("add member");

	Fixture {
		messages,
		conversation,
		owner,
		admin,
		member,
		outsider,
	}
}

#[tokio::test]
async fn send_trims_and_persists() {
	let f = fixture().await;

	let m = f
		.messages
		.send_message(f.member, f.conversation, "  hi  ", None)
		.await
		.expect("send");
	assert_eq!(m.content, "hi");
	assert_eq!(m.sender_id, f.member);
	assert_eq!(m.conversation_id, f.conversation);

	let fetched = f.messages.get_message(f.owner, m.id).await.expect("get");
	assert_eq!(fetched, m);
}

#[tokio::test]
async fn send_validates_content() {
	let f = fixture().await;

	assert!(matches!(
		f.messages.send_message(f.member, f.conversation, "   ", None).await,
		Err(ServiceError::InvalidInput(_))
	));

	let too_long = "a".repeat(MAX_MESSAGE_CONTENT_CHARS + 1);
	assert!(matches!(
		f.messages.send_message(f.member, f.conversation, &too_long, None).await,
		Err(ServiceError::InvalidInput(_))
	));

	let max = "a".repeat(MAX_MESSAGE_CONTENT_CHARS);
	assert!(f.messages.send_message(f.member, f.conversation, &max, None).await.is_ok());
}

#[tokio::test]
async fn non_member_send_is_forbidden_and_leaves_history_alone() {
	let f = fixture().await;
	f.messages
		.send_message(f.member, f.conversation, "first", None)
		.await
		.expect("send");

	assert!(matches!(
		f.messages.send_message(f.outsider, f.conversation, "spam", None).await,
		Err(ServiceError::Forbidden)
	));

	let listed = f.messages.list_messages(f.owner, f.conversation).await.expect("list");
	assert_eq!(listed.len(), 1);
	assert_eq!(listed[0].content, "first");
}

#[tokio::test]
async fn reading_requires_membership() {
	let f = fixture().await;
	let m = f
		.messages
		.send_message(f.member, f.conversation, "hi", None)
		.await
		.expect("send");

	assert!(matches!(
		f.messages.list_messages(f.outsider, f.conversation).await,
		Err(ServiceError::Forbidden)
	));
	assert!(matches!(f.messages.get_message(f.outsider, m.id).await, Err(ServiceError::Forbidden)));

	let missing = MessageId::new(404).expect("id");
	assert!(matches!(f.messages.get_message(f.owner, missing).await, Err(ServiceError::NotFound(_))));
}

#[tokio::test]
async fn list_is_newest_first_and_paged() {
	let f = fixture().await;
	for i in 0..(MESSAGE_PAGE_SIZE + 5) {
		f.messages
			.send_message(f.member, f.conversation, &format!("m{i}"), None)
			.await
			.expect("send");
	}

	let listed = f.messages.list_messages(f.member, f.conversation).await.expect("list");
	assert_eq!(listed.len(), MESSAGE_PAGE_SIZE);
	assert_eq!(listed[0].content, format!("m{}", MESSAGE_PAGE_SIZE + 4));
	assert!(listed.windows(2).all(|w| w[0].id > w[1].id));
}

#[tokio::test]
async fn only_sender_or_moderators_mutate() {
	let f = fixture().await;
	let m = f
		.messages
		.send_message(f.member, f.conversation, "hi", None)
		.await
		.expect("send");

	assert!(matches!(
		f.messages.update_message(f.outsider, m.id, "hacked").await,
		Err(ServiceError::Forbidden)
	));
	let unchanged = f.messages.get_message(f.member, m.id).await.expect("get");
	assert_eq!(unchanged.content, "hi");

	let edited = f.messages.update_message(f.admin, m.id, "moderated").await.expect("admin edit");
	assert_eq!(edited.content, "moderated");

	let own = f.messages.update_message(f.member, m.id, " mine ").await.expect("sender edit");
	assert_eq!(own.content, "mine");
}

#[tokio::test]
async fn plain_members_cannot_touch_others_messages() {
	let f = fixture().await;
	let other = UserId::new_v4();
	f.messages
		.conversations()
		.add_member(f.owner, f.conversation, other, Role::Member)
		.await
		.expect("add");
	let m = f
		.messages
		.send_message(other, f.conversation, "mine", None)
		.await
		.expect("send");

	assert!(matches!(
		f.messages.delete_message(f.member, m.id).await,
		Err(ServiceError::Forbidden)
	));
	assert!(matches!(
		f.messages.update_message(f.member, m.id, "edit").await,
		Err(ServiceError::Forbidden)
	));

	f.messages.delete_message(f.owner, m.id).await.expect("owner delete");
	assert!(matches!(f.messages.get_message(f.owner, m.id).await, Err(ServiceError::NotFound(_))));
	assert!(matches!(
		f.messages.delete_message(f.owner, m.id).await,
		Err(ServiceError::NotFound(_))
	));
}

#[tokio::test]
async fn update_revalidates_content() {
	let f = fixture().await;
	let m = f
		.messages
		.send_message(f.member, f.conversation, "hi", None)
		.await
		.expect("send");

	assert!(matches!(
		f.messages.update_message(f.member, m.id, "  ").await,
		Err(ServiceError::InvalidInput(_))
	));
}

#[tokio::test]
async fn receipts_are_first_write_wins_per_user() {
	let f = fixture().await;
	let m = f
		.messages
		.send_message(f.member, f.conversation, "hi", None)
		.await
		.expect("send");

	let (_, first) = f.messages.mark_received(f.owner, m.id, Some(1_000)).await.expect("ack");
	let (_, again) = f.messages.mark_received(f.owner, m.id, Some(2_000)).await.expect("ack again");
	assert_eq!(first.received_at, 1_000);
	assert_eq!(again.received_at, 1_000);

	let (_, other) = f.messages.mark_received(f.admin, m.id, Some(3_000)).await.expect("other ack");
	assert_eq!(other.received_at, 3_000);

	let stored = f.messages.get_receipt(m.id, f.owner).await.expect("receipt");
	assert_eq!(stored.map(|r| r.received_at), Some(1_000));
	assert!(f.messages.get_receipt(m.id, f.member).await.expect("receipt").is_none());
}

#[tokio::test]
async fn receipt_defaults_to_now_and_requires_membership() {
	let f = fixture().await;
	let m = f
		.messages
		.send_message(f.member, f.conversation, "hi", None)
		.await
		.expect("send");

	let (_, receipt) = f.messages.mark_received(f.member, m.id, None).await.expect("ack");
	assert!(receipt.received_at >= m.created_at);

	assert!(matches!(
		f.messages.mark_received(f.outsider, m.id, Some(1)).await,
		Err(ServiceError::Forbidden)
	));
}
