#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use storm_domain::{Role, UserId};
use storm_protocol::client::ClientFrame;
use storm_protocol::{DEFAULT_MAX_PAYLOAD_SIZE, Envelope, ErrorCode, Subject, decode_payload, encode_payload, pb};
use tokio::time::timeout;

use crate::bus::{Bus, LocalBus, LocalBusConfig};
use crate::rpc::{RpcConfig, RpcDispatcher, spawn_rpc_responders};
use crate::service::{ConversationService, MessageService};
use crate::store::MemoryStore;

struct Harness {
	bus: Arc<LocalBus>,
	dispatcher: RpcDispatcher,
}

fn harness() -> Harness {
	let bus = Arc::new(LocalBus::new(LocalBusConfig::default()));
	let store = Arc::new(MemoryStore::new());
	let conversations = ConversationService::new(store.clone());
	let messages = MessageService::new(store, conversations);
	let dispatcher = RpcDispatcher::new(messages, bus.clone(), RpcConfig::default());
	Harness { bus, dispatcher }
}

impl Harness {
	async fn call<Req: prost::Message, Rep: Envelope>(&self, subject: Subject, req: &Req) -> Rep {
		let payload = encode_payload(req, DEFAULT_MAX_PAYLOAD_SIZE).expect("encode request");
		let reply = self.dispatcher.dispatch(subject, &payload).await.expect("encode reply");
		decode_payload(&reply, DEFAULT_MAX_PAYLOAD_SIZE).expect("decode reply")
	}

	async fn create(&self, actor: UserId) -> i64 {
		let reply: pb::ConversationReply = self
			.call(
				Subject::ConversationCreate,
				&pb::CreateConversationRequest {
					actor_id: actor.to_string(),
					name: "team".into(),
					avatar_url: String::new(),
				},
			)
			.await;
		assert!(reply.ok, "create failed: {:?}", reply.error);
		reply.data.expect("conversation").id
	}

	async fn add(&self, actor: UserId, conversation: i64, user: UserId, role: Role) -> pb::MemberReply {
		self.call(
			Subject::ConversationAddMember,
			&pb::AddMemberRequest {
				actor_id: actor.to_string(),
				conversation_id: conversation,
				user_id: user.to_string(),
				role: role.as_i32(),
				..Default::default()
			},
		)
		.await
	}

	async fn send(&self, sender: UserId, conversation: i64, content: &str) -> pb::MessageReply {
		self.call(
			Subject::NewMessage,
			&pb::SendMessageRequest {
				sender_id: sender.to_string(),
				conversation_id: conversation,
				content: content.into(),
				..Default::default()
			},
		)
		.await
	}
}

#[tokio::test]
async fn undecodable_request_is_bad_request() {
	let h = harness();
	let reply = h
		.dispatcher
		.dispatch(Subject::ConversationCreate, &[0xff, 0xff, 0xff])
		.await
		.expect("reply");
	let reply: pb::ConversationReply = decode_payload(&reply, DEFAULT_MAX_PAYLOAD_SIZE).expect("decode");

	assert_eq!(reply.error_code(), Some(ErrorCode::InvalidInput));
	assert_eq!(reply.error.map(|e| e.message), Some("invalid request format".to_string()));
}

#[tokio::test]
async fn uuid_fields_are_validated() {
	let h = harness();

	let missing: pb::ConversationReply = h
		.call(Subject::ConversationCreate, &pb::CreateConversationRequest::default())
		.await;
	assert_eq!(
		missing.error.map(|e| (e.code, e.message)),
		Some(("BAD_REQUEST".to_string(), "actor_id required".to_string()))
	);

	let bad: pb::ConversationListReply = h
		.call(
			Subject::ConversationListForUser,
			&pb::ListConversationsForUserRequest {
				user_id: "not-a-uuid".into(),
			},
		)
		.await;
	assert_eq!(
		bad.error.map(|e| e.message),
		Some("user_id must be a valid UUID".to_string())
	);
}

#[tokio::test]
async fn missing_conversation_and_bad_role_are_bad_requests() {
	let h = harness();
	let owner = UserId::new_v4();
	let c = h.create(owner).await;

	let no_conversation: pb::MemberListReply = h
		.call(
			Subject::ConversationListMembers,
			&pb::ListMembersRequest {
				actor_id: owner.to_string(),
				..Default::default()
			},
		)
		.await;
	assert_eq!(no_conversation.error_code(), Some(ErrorCode::InvalidInput));

	let bad_role: pb::MemberReply = h
		.call(
			Subject::ConversationAddMember,
			&pb::AddMemberRequest {
				actor_id: owner.to_string(),
				conversation_id: c,
				user_id: UserId::new_v4().to_string(),
				role: 7,
				..Default::default()
			},
		)
		.await;
	assert_eq!(bad_role.error.map(|e| e.message), Some("invalid membership role".to_string()));
}

#[tokio::test]
async fn legacy_group_id_addresses_the_same_conversation() {
	let h = harness();
	let owner = UserId::new_v4();
	let c = h.create(owner).await;

	let via_legacy: pb::MemberListReply = h
		.call(
			Subject::ConversationListMembers,
			&pb::ListMembersRequest {
				actor_id: owner.to_string(),
				group_id: c,
				conversation_id: 0,
			},
		)
		.await;
	assert!(via_legacy.ok);
	assert_eq!(via_legacy.data.len(), 1);
	assert_eq!(via_legacy.data[0].role, Role::Owner.as_i32());
	assert_eq!(via_legacy.data[0].group_id, c);
}

#[tokio::test]
async fn domain_errors_map_to_codes() {
	let h = harness();
	let (owner, admin, member, outsider) = (UserId::new_v4(), UserId::new_v4(), UserId::new_v4(), UserId::new_v4());
	let c = h.create(owner).await;
	assert!(h.add(owner, c, admin, Role::Admin).await.ok);
	assert!(h.add(owner, c, member, Role::Member).await.ok);

	assert_eq!(h.add(member, c, outsider, Role::Member).await.error_code(), Some(ErrorCode::Forbidden));
	assert_eq!(h.add(admin, c, outsider, Role::Admin).await.error_code(), Some(ErrorCode::Forbidden));
	assert_eq!(h.add(owner, c, member, Role::Member).await.error_code(), Some(ErrorCode::Conflict));
	assert_eq!(h.add(owner, c + 100, outsider, Role::Member).await.error_code(), Some(ErrorCode::NotFound));

	let leave: pb::StatusReply = h
		.call(
			Subject::ConversationLeave,
			&pb::LeaveConversationRequest {
				user_id: owner.to_string(),
				conversation_id: c,
				..Default::default()
			},
		)
		.await;
	assert_eq!(leave.error_code(), Some(ErrorCode::Conflict));
}

#[tokio::test]
async fn group_get_is_the_join_check() {
	let h = harness();
	let owner = UserId::new_v4();
	let c = h.create(owner).await;

	let get = |actor: UserId| pb::GetConversationRequest {
		actor_id: actor.to_string(),
		conversation_id: c,
		..Default::default()
	};

	let ok: pb::ConversationReply = h.call(Subject::ConversationGet, &get(owner)).await;
	assert!(ok.ok);
	assert_eq!(ok.data.map(|d| d.name), Some("team".to_string()));

	let denied: pb::ConversationReply = h.call(Subject::ConversationGet, &get(UserId::new_v4())).await;
	assert_eq!(denied.error_code(), Some(ErrorCode::Forbidden));
}

#[tokio::test]
async fn message_flow_over_rpc() {
	let h = harness();
	let (owner, member, outsider) = (UserId::new_v4(), UserId::new_v4(), UserId::new_v4());
	let c = h.create(owner).await;
	assert!(h.add(owner, c, member, Role::Member).await.ok);

	let sent = h.send(member, c, "  hi ").await;
	assert!(sent.ok);
	let sent = sent.data.expect("message");
	assert_eq!(sent.content, "hi");
	assert_eq!((sent.conversation_id, sent.group_id), (c, c));

	assert_eq!(h.send(outsider, c, "spam").await.error_code(), Some(ErrorCode::Forbidden));

	let hacked: pb::MessageReply = h
		.call(
			Subject::UpdateMessage,
			&pb::UpdateMessageRequest {
				id: sent.id,
				actor_id: outsider.to_string(),
				content: "hacked".into(),
			},
		)
		.await;
	assert_eq!(hacked.error_code(), Some(ErrorCode::Forbidden));

	let listed: pb::MessageListReply = h
		.call(
			Subject::ListMessages,
			&pb::ListMessagesRequest {
				actor_id: owner.to_string(),
				conversation_id: c,
				..Default::default()
			},
		)
		.await;
	assert_eq!(listed.data.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), vec!["hi"]);

	let ack = |at: i64| pb::AckMessageRequest {
		id: sent.id,
		actor_id: owner.to_string(),
		received_at: at,
	};
	let first: pb::MessageReply = h.call(Subject::AckMessage, &ack(42)).await;
	let second: pb::MessageReply = h.call(Subject::AckMessage, &ack(99)).await;
	assert_eq!(first.data.map(|m| m.received_at), Some(42));
	assert_eq!(second.data.map(|m| m.received_at), Some(42));

	let deleted: pb::StatusReply = h
		.call(
			Subject::DeleteMessage,
			&pb::DeleteMessageRequest {
				id: sent.id,
				actor_id: owner.to_string(),
			},
		)
		.await;
	assert!(deleted.ok);

	let gone: pb::MessageReply = h
		.call(
			Subject::GetMessage,
			&pb::GetMessageRequest {
				id: sent.id,
				actor_id: owner.to_string(),
			},
		)
		.await;
	assert_eq!(gone.error_code(), Some(ErrorCode::NotFound));
}

#[tokio::test]
async fn legacy_room_sends_reach_both_room_names() {
	let h = harness();
	let owner = UserId::new_v4();
	let c = h.create(owner).await;
	let mut sub = h.bus.subscribe("message.broadcast.>").await.expect("subscribe");

	let reply: pb::MessageReply = h
		.call(
			Subject::NewMessage,
			&pb::SendMessageRequest {
				sender_id: owner.to_string(),
				group_id: c,
				content: "hello".into(),
				room: format!("group:{c}"),
				..Default::default()
			},
		)
		.await;
	let id = reply.data.expect("message").id;

	for room in [format!("conversation:{c}"), format!("group:{c}")] {
		let msg = timeout(Duration::from_millis(250), sub.next())
			.await
			.expect("fan-out within timeout")
			.expect("open");
		assert_eq!(msg.subject, format!("message.broadcast.{room}"));

		let frame = ClientFrame::decode(&msg.payload).expect("frame");
		assert_eq!(frame.action, "message");
		assert_eq!(frame.room, room);
		assert_eq!(frame.user, owner.to_string());
		assert_eq!(frame.content, "hello");
		assert_eq!(frame.id, Some(id));
	}
}

#[tokio::test]
async fn fan_out_ignores_rooms_of_other_conversations() {
	let h = harness();
	let owner = UserId::new_v4();
	let c = h.create(owner).await;
	let mut sub = h.bus.subscribe("message.broadcast.>").await.expect("subscribe");

	let reply: pb::MessageReply = h
		.call(
			Subject::NewMessage,
			&pb::SendMessageRequest {
				sender_id: owner.to_string(),
				conversation_id: c,
				content: "hello".into(),
				room: "conversation:999".into(),
				..Default::default()
			},
		)
		.await;
	assert!(reply.ok);

	let msg = timeout(Duration::from_millis(250), sub.next())
		.await
		.expect("fan-out within timeout")
		.expect("open");
	assert_eq!(msg.subject, format!("message.broadcast.conversation:{c}"));
	assert!(
		timeout(Duration::from_millis(50), sub.next()).await.is_err(),
		"no copy for the foreign room"
	);
}

#[tokio::test]
async fn responders_answer_over_the_bus() {
	let h = harness();
	let bus: Arc<dyn Bus> = h.bus.clone();
	let handles = spawn_rpc_responders(bus.clone(), h.dispatcher.clone()).await.expect("responders");
	assert_eq!(handles.len(), Subject::ALL.len());

	let req = pb::CreateConversationRequest {
		actor_id: UserId::new_v4().to_string(),
		name: "over the bus".into(),
		avatar_url: String::new(),
	};
	let payload = encode_payload(&req, DEFAULT_MAX_PAYLOAD_SIZE).expect("encode");

	let reply = bus
		.request(Subject::ConversationCreate.as_str(), payload, Duration::from_millis(250))
		.await
		.expect("reply");
	let reply: pb::ConversationReply = decode_payload(&reply, DEFAULT_MAX_PAYLOAD_SIZE).expect("decode");
	assert!(reply.ok);
	assert_eq!(reply.data.map(|c| c.name), Some("over the bus".to_string()));

	// Publish-only sends are served without a reply channel.
	bus.publish(Subject::NewMessage.as_str(), Bytes::new())
		.await
		.expect("publish");

	h.bus.close().await;
	for handle in handles {
		timeout(Duration::from_millis(250), handle)
			.await
			.expect("responder exits after close")
			.expect("join");
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn published_sends_are_stored_in_publish_order() {
	let h = harness();
	let bus: Arc<dyn Bus> = h.bus.clone();
	spawn_rpc_responders(bus.clone(), h.dispatcher.clone()).await.expect("responders");

	let owner = UserId::new_v4();
	let c = h.create(owner).await;

	const SENT: usize = 100;
	for i in 0..SENT {
		let req = pb::SendMessageRequest {
			sender_id: owner.to_string(),
			conversation_id: c,
			content: i.to_string(),
			..Default::default()
		};
		let payload = encode_payload(&req, DEFAULT_MAX_PAYLOAD_SIZE).expect("encode");
		bus.publish(Subject::NewMessage.as_str(), payload).await.expect("publish");
	}

	let list = pb::ListMessagesRequest {
		actor_id: owner.to_string(),
		conversation_id: c,
		..Default::default()
	};
	let stored = timeout(Duration::from_secs(2), async {
		loop {
			let reply: pb::MessageListReply = h.call(Subject::ListMessages, &list).await;
			if reply.data.len() == SENT {
				return reply.data;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("every send persisted");

	let newest_first: Vec<String> = stored.into_iter().map(|m| m.content).collect();
	let expected: Vec<String> = (0..SENT).rev().map(|i| i.to_string()).collect();
	assert_eq!(newest_first, expected);

	h.bus.close().await;
}
