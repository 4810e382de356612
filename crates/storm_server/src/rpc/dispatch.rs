#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use bytes::Bytes;
use storm_domain::{BroadcastTopic, ConversationId, ConversationRoom, MessageId, Role, UserId};
use storm_protocol::client::{ClientAction, ClientFrame};
use storm_protocol::{
	CodecError, ConversationRef, DEFAULT_MAX_PAYLOAD_SIZE, Envelope, ErrorCode, QUEUE_GROUP, Subject, decode_payload,
	encode_payload, pb,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{Bus, BusMessage};
use crate::service::{ConversationService, MessageService, ServiceError};
use crate::store::{Conversation, Membership, Message};

/// Settings for the RPC responders.
#[derive(Debug, Clone)]
pub struct RpcConfig {
	pub max_payload_size: usize,

	pub debug_logs: bool,
}

impl Default for RpcConfig {
	fn default() -> Self {
		Self {
			max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
			debug_logs: false,
		}
	}
}

/// Decodes requests, runs the conversation/message services and encodes replies.
#[derive(Clone)]
pub struct RpcDispatcher {
	conversations: ConversationService,
	messages: MessageService,
	bus: Arc<dyn Bus>,
	cfg: RpcConfig,
}

fn parse_user(raw: &str, field: &str) -> Result<UserId, ServiceError> {
	let raw = raw.trim();
	if raw.is_empty() {
		return Err(ServiceError::invalid(format!("{field} required")));
	}
	UserId::parse(raw).map_err(|_| ServiceError::invalid(format!("{field} must be a valid UUID")))
}

fn require_conversation(req: &impl ConversationRef) -> Result<ConversationId, ServiceError> {
	req.conversation()
		.ok_or_else(|| ServiceError::invalid("conversation_id required"))
}

fn require_message_id(id: i64) -> Result<MessageId, ServiceError> {
	MessageId::new(id).ok_or_else(|| ServiceError::invalid("id required"))
}

fn parse_role(raw: i32) -> Result<Role, ServiceError> {
	Role::from_i32(raw).ok_or_else(|| ServiceError::invalid("invalid membership role"))
}

fn message_to_pb(m: &Message) -> pb::ChatMessage {
	pb::ChatMessage {
		id: m.id.get(),
		sender_id: m.sender_id.to_string(),
		group_id: m.conversation_id.get(),
		content: m.content.clone(),
		attachment: m.attachment.clone().unwrap_or_default(),
		created_at: m.created_at,
		updated_at: m.updated_at,
		conversation_id: m.conversation_id.get(),
		received_at: 0,
	}
}

fn conversation_to_pb(c: &Conversation) -> pb::Conversation {
	pb::Conversation {
		id: c.id.get(),
		name: c.name.clone(),
		avatar_url: c.avatar_url.clone(),
		created_by: c.created_by.to_string(),
		created_at: c.created_at,
		updated_at: c.updated_at,
	}
}

fn member_to_pb(m: &Membership) -> pb::Member {
	pb::Member {
		id: m.id,
		conversation_id: m.conversation_id.get(),
		group_id: m.conversation_id.get(),
		user_id: m.user_id.to_string(),
		role: m.role.as_i32(),
		created_at: m.created_at,
	}
}

fn into_reply<R: Envelope>(result: Result<R::Data, ServiceError>) -> R {
	match result {
		Ok(data) => R::success(data),
		Err(e) => R::fail(e.code(), e.to_string()),
	}
}

impl RpcDispatcher {
	pub fn new(messages: MessageService, bus: Arc<dyn Bus>, cfg: RpcConfig) -> Self {
		Self {
			conversations: messages.conversations().clone(),
			messages,
			bus,
			cfg,
		}
	}

	/// Handle one request and return the encoded reply.
	pub async fn dispatch(&self, subject: Subject, payload: &[u8]) -> Result<Bytes, CodecError> {
		let started = Instant::now();

		let encoded = match subject {
			Subject::NewMessage => self.finish::<pb::MessageReply>(subject, self.new_message(payload).await),
			Subject::GetMessage => self.finish::<pb::MessageReply>(subject, self.get_message(payload).await),
			Subject::ListMessages => self.finish::<pb::MessageListReply>(subject, self.list_messages(payload).await),
			Subject::UpdateMessage => self.finish::<pb::MessageReply>(subject, self.update_message(payload).await),
			Subject::DeleteMessage => self.finish::<pb::StatusReply>(subject, self.delete_message(payload).await),
			Subject::AckMessage => self.finish::<pb::MessageReply>(subject, self.ack_message(payload).await),
			Subject::ConversationCreate => {
				self.finish::<pb::ConversationReply>(subject, self.create_conversation(payload).await)
			}
			Subject::ConversationGet => self.finish::<pb::ConversationReply>(subject, self.get_conversation(payload).await),
			Subject::ConversationListForUser => {
				self.finish::<pb::ConversationListReply>(subject, self.list_conversations_for_user(payload).await)
			}
			Subject::ConversationAddMember => self.finish::<pb::MemberReply>(subject, self.add_member(payload).await),
			Subject::ConversationRemoveMember => {
				self.finish::<pb::StatusReply>(subject, self.remove_member(payload).await)
			}
			Subject::ConversationListMembers => {
				self.finish::<pb::MemberListReply>(subject, self.list_members(payload).await)
			}
			Subject::ConversationUpdateRole => self.finish::<pb::MemberReply>(subject, self.update_role(payload).await),
			Subject::ConversationLeave => self.finish::<pb::StatusReply>(subject, self.leave(payload).await),
			Subject::ConversationDelete => {
				self.finish::<pb::StatusReply>(subject, self.delete_conversation(payload).await)
			}
		};

		metrics::histogram!("storm_rpc_request_duration_seconds", "subject" => subject.as_str())
			.record(started.elapsed().as_secs_f64());

		encoded
	}

	fn finish<R: Envelope>(&self, subject: Subject, result: Result<R::Data, ServiceError>) -> Result<Bytes, CodecError> {
		if let Err(ServiceError::Internal(e)) = &result {
			warn!(%subject, error = %e, "rpc: internal error");
		}

		let reply: R = into_reply(result);
		let outcome = reply.error_code().map(ErrorCode::as_str).unwrap_or("OK");
		metrics::counter!("storm_rpc_requests_total", "subject" => subject.as_str(), "outcome" => outcome).increment(1);

		if self.cfg.debug_logs {
			debug!(%subject, outcome, "rpc: handled");
		}

		encode_payload(&reply, self.cfg.max_payload_size)
	}

	fn decode<M: prost::Message + Default>(&self, payload: &[u8]) -> Result<M, ServiceError> {
		decode_payload(payload, self.cfg.max_payload_size).map_err(|e| {
			debug!(error = %e, "rpc: undecodable request");
			ServiceError::invalid("invalid request format")
		})
	}

	async fn new_message(&self, payload: &[u8]) -> Result<pb::ChatMessage, ServiceError> {
		let req: pb::SendMessageRequest = self.decode(payload)?;
		let sender = parse_user(&req.sender_id, "sender_id")?;
		let conversation = require_conversation(&req)?;
		let attachment = Some(req.attachment.trim().to_string()).filter(|a| !a.is_empty());

		let message = self
			.messages
			.send_message(sender, conversation, &req.content, attachment)
			.await?;

		self.fan_out(&req.room, &message).await;
		Ok(message_to_pb(&message))
	}

	/// Publish a persisted message to its rooms so every gateway replica delivers it.
	///
	/// The canonical `conversation:<id>` room always gets it. When the send
	/// command came from the legacy `group:<id>` name of the same conversation,
	/// that room gets a copy too. Rooms of other conversations are ignored.
	async fn fan_out(&self, requested_room: &str, message: &Message) {
		let canonical = ConversationRoom::format(message.conversation_id);
		let mut rooms = vec![canonical];

		let requested_room = requested_room.trim();
		if ConversationRoom::parse(requested_room) == Ok(message.conversation_id) && requested_room != rooms[0] {
			rooms.push(requested_room.to_string());
		}

		for room in rooms {
			let frame = ClientFrame {
				action: ClientAction::Message.as_str().to_string(),
				room: room.clone(),
				user: message.sender_id.to_string(),
				content: message.content.clone(),
				id: Some(message.id.get()),
			};

			let payload = match frame.encode() {
				Ok(bytes) => Bytes::from(bytes),
				Err(e) => {
					warn!(message_id = %message.id, error = %e, "rpc: failed to encode fan-out frame");
					return;
				}
			};

			if let Err(e) = self.bus.publish(&BroadcastTopic::subject(&room), payload).await {
				warn!(message_id = %message.id, %room, error = %e, "rpc: fan-out publish failed");
			}
		}
	}

	async fn get_message(&self, payload: &[u8]) -> Result<pb::ChatMessage, ServiceError> {
		let req: pb::GetMessageRequest = self.decode(payload)?;
		let id = require_message_id(req.id)?;
		let actor = parse_user(&req.actor_id, "actor_id")?;

		let message = self.messages.get_message(actor, id).await?;
		Ok(message_to_pb(&message))
	}

	async fn list_messages(&self, payload: &[u8]) -> Result<Vec<pb::ChatMessage>, ServiceError> {
		let req: pb::ListMessagesRequest = self.decode(payload)?;
		let conversation = require_conversation(&req)?;
		let actor = parse_user(&req.actor_id, "actor_id")?;

		let messages = self.messages.list_messages(actor, conversation).await?;
		Ok(messages.iter().map(message_to_pb).collect())
	}

	async fn update_message(&self, payload: &[u8]) -> Result<pb::ChatMessage, ServiceError> {
		let req: pb::UpdateMessageRequest = self.decode(payload)?;
		let id = require_message_id(req.id)?;
		let actor = parse_user(&req.actor_id, "actor_id")?;

		let message = self.messages.update_message(actor, id, &req.content).await?;
		Ok(message_to_pb(&message))
	}

	async fn delete_message(&self, payload: &[u8]) -> Result<(), ServiceError> {
		let req: pb::DeleteMessageRequest = self.decode(payload)?;
		let id = require_message_id(req.id)?;
		let actor = parse_user(&req.actor_id, "actor_id")?;

		self.messages.delete_message(actor, id).await
	}

	async fn ack_message(&self, payload: &[u8]) -> Result<pb::ChatMessage, ServiceError> {
		let req: pb::AckMessageRequest = self.decode(payload)?;
		let id = require_message_id(req.id)?;
		let actor = parse_user(&req.actor_id, "actor_id")?;
		let received_at = (req.received_at > 0).then_some(req.received_at);

		let (message, receipt) = self.messages.mark_received(actor, id, received_at).await?;
		let mut out = message_to_pb(&message);
		out.received_at = receipt.received_at;
		Ok(out)
	}

	async fn create_conversation(&self, payload: &[u8]) -> Result<pb::Conversation, ServiceError> {
		let req: pb::CreateConversationRequest = self.decode(payload)?;
		let actor = parse_user(&req.actor_id, "actor_id")?;

		let conversation = self
			.conversations
			.create_conversation(actor, &req.name, &req.avatar_url)
			.await?;
		Ok(conversation_to_pb(&conversation))
	}

	async fn get_conversation(&self, payload: &[u8]) -> Result<pb::Conversation, ServiceError> {
		let req: pb::GetConversationRequest = self.decode(payload)?;
		let conversation = require_conversation(&req)?;
		let actor = parse_user(&req.actor_id, "actor_id")?;

		let conversation = self.conversations.get_conversation_for_member(actor, conversation).await?;
		Ok(conversation_to_pb(&conversation))
	}

	async fn list_conversations_for_user(&self, payload: &[u8]) -> Result<Vec<pb::Conversation>, ServiceError> {
		let req: pb::ListConversationsForUserRequest = self.decode(payload)?;
		let user = parse_user(&req.user_id, "user_id")?;

		let conversations = self.conversations.list_conversations_for_user(user).await?;
		Ok(conversations.iter().map(conversation_to_pb).collect())
	}

	async fn add_member(&self, payload: &[u8]) -> Result<pb::Member, ServiceError> {
		let req: pb::AddMemberRequest = self.decode(payload)?;
		let conversation = require_conversation(&req)?;
		let actor = parse_user(&req.actor_id, "actor_id")?;
		let user = parse_user(&req.user_id, "user_id")?;
		let role = parse_role(req.role)?;

		let membership = self.conversations.add_member(actor, conversation, user, role).await?;
		Ok(member_to_pb(&membership))
	}

	async fn remove_member(&self, payload: &[u8]) -> Result<(), ServiceError> {
		let req: pb::RemoveMemberRequest = self.decode(payload)?;
		let conversation = require_conversation(&req)?;
		let actor = parse_user(&req.actor_id, "actor_id")?;
		let user = parse_user(&req.user_id, "user_id")?;

		self.conversations.remove_member(actor, conversation, user).await
	}

	async fn list_members(&self, payload: &[u8]) -> Result<Vec<pb::Member>, ServiceError> {
		let req: pb::ListMembersRequest = self.decode(payload)?;
		let conversation = require_conversation(&req)?;
		let actor = parse_user(&req.actor_id, "actor_id")?;

		let members = self.conversations.list_members(actor, conversation).await?;
		Ok(members.iter().map(member_to_pb).collect())
	}

	async fn update_role(&self, payload: &[u8]) -> Result<pb::Member, ServiceError> {
		let req: pb::UpdateRoleRequest = self.decode(payload)?;
		let conversation = require_conversation(&req)?;
		let actor = parse_user(&req.actor_id, "actor_id")?;
		let user = parse_user(&req.user_id, "user_id")?;
		let role = parse_role(req.role)?;

		let membership = self
			.conversations
			.update_member_role(actor, conversation, user, role)
			.await?;
		Ok(member_to_pb(&membership))
	}

	async fn leave(&self, payload: &[u8]) -> Result<(), ServiceError> {
		let req: pb::LeaveConversationRequest = self.decode(payload)?;
		let conversation = require_conversation(&req)?;
		let user = parse_user(&req.user_id, "user_id")?;

		self.conversations.leave_conversation(user, conversation).await
	}

	async fn delete_conversation(&self, payload: &[u8]) -> Result<(), ServiceError> {
		let req: pb::DeleteConversationRequest = self.decode(payload)?;
		let conversation = require_conversation(&req)?;
		let actor = parse_user(&req.actor_id, "actor_id")?;

		self.conversations.delete_conversation(actor, conversation).await
	}

	/// Answer one bus message, if it is a request.
	async fn serve_one(&self, subject: Subject, msg: BusMessage) {
		let reply = match self.dispatch(subject, &msg.payload).await {
			Ok(reply) => reply,
			Err(e) => {
				warn!(%subject, error = %e, "rpc: failed to encode reply");
				return;
			}
		};

		if !msg.expects_reply() {
			return;
		}
		if let Err(e) = msg.respond(reply) {
			debug!(%subject, error = %e, "rpc: reply dropped");
		}
	}
}

/// Subscribe every RPC subject in the shared queue group and serve requests
/// until the bus closes.
///
/// Each subject has one task that serves its requests in arrival order, so
/// sends from one client are stored in the order they were published.
pub async fn spawn_rpc_responders(bus: Arc<dyn Bus>, dispatcher: RpcDispatcher) -> anyhow::Result<Vec<JoinHandle<()>>> {
	let mut handles = Vec::with_capacity(Subject::ALL.len());

	for subject in Subject::ALL {
		let mut sub = bus
			.queue_subscribe(subject.as_str(), QUEUE_GROUP)
			.await
			.with_context(|| format!("subscribe {subject}"))?;
		let dispatcher = dispatcher.clone();

		handles.push(tokio::spawn(async move {
			while let Some(msg) = sub.next().await {
				dispatcher.serve_one(subject, msg).await;
			}
			debug!(%subject, "rpc responder exiting (bus closed)");
		}));
	}

	info!(subjects = Subject::ALL.len(), group = QUEUE_GROUP, "rpc responders started");
	Ok(handles)
}
