#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use storm_domain::{BroadcastTopic, ConversationId, ConversationRoom, PrivateRoom, RoomScope};
use storm_protocol::client::{ClientAction, ClientFrame};
use storm_protocol::{DEFAULT_MAX_PAYLOAD_SIZE, Envelope, Subject, decode_payload, encode_payload, pb};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::server::auth::Identity;
use crate::server::registry::{ConnId, ConnectionHandle, Outbound, Registry};

/// Per-connection handler settings.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
	pub heartbeat_interval: Duration,

	/// Upper bound on the join authorization request; expiry denies the join.
	pub join_authorize_timeout: Duration,

	pub max_payload_size: usize,

	pub debug_logs: bool,
}

impl Default for ProtocolConfig {
	fn default() -> Self {
		Self {
			heartbeat_interval: Duration::from_secs(30),
			join_authorize_timeout: Duration::from_secs(3),
			max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
			debug_logs: false,
		}
	}
}

/// State of one client connection.
#[derive(Debug, Clone)]
pub struct Session {
	pub conn_id: ConnId,
	pub identity: Option<Identity>,
	/// Room joined through a `join` action. At most one at a time.
	pub room: Option<String>,
}

impl Session {
	pub fn new(conn_id: ConnId, identity: Option<Identity>) -> Self {
		Self {
			conn_id,
			identity,
			room: None,
		}
	}

	pub fn private_room(&self) -> Option<String> {
		self.identity.as_ref().map(|id| PrivateRoom::format(id.user_id))
	}
}

/// What an inbound frame asks the handler to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
	/// Join `room`; conversation rooms carry the id to authorize first.
	Join {
		room: String,
		authorize: Option<ConversationId>,
	},
	/// Publish a send command and optionally echo the frame into the local room.
	Message {
		frame: ClientFrame,
		conversation: ConversationId,
		echo: bool,
	},
	/// Relay an ephemeral frame to the room's broadcast topic.
	Typing { frame: ClientFrame },
	Drop { reason: &'static str },
}

/// Decide what a decoded frame means for `session`. No I/O happens here.
pub fn plan(session: &Session, mut frame: ClientFrame) -> Effect {
	frame.room = frame.room.trim().to_string();

	match frame.action() {
		ClientAction::Join => {
			if frame.room.is_empty() {
				return Effect::Drop { reason: "empty room" };
			}

			match RoomScope::classify(&frame.room) {
				RoomScope::Conversation(id) => {
					if session.identity.is_none() {
						return Effect::Drop {
							reason: "unauthenticated conversation join",
						};
					}
					Effect::Join {
						room: frame.room,
						authorize: Some(id),
					}
				}
				RoomScope::MalformedConversation => Effect::Drop {
					reason: "malformed conversation room",
				},
				RoomScope::Private => Effect::Drop {
					reason: "private rooms are not joinable",
				},
				RoomScope::AdHoc => Effect::Join {
					room: frame.room,
					authorize: None,
				},
			}
		}
		ClientAction::Message => {
			let Some(identity) = &session.identity else {
				return Effect::Drop {
					reason: "anonymous message",
				};
			};
			let Ok(conversation) = ConversationRoom::parse(&frame.room) else {
				return Effect::Drop {
					reason: "message outside a conversation room",
				};
			};

			frame.user = identity.user_id.to_string();
			let echo = session.room.as_deref() == Some(frame.room.as_str());
			Effect::Message {
				frame,
				conversation,
				echo,
			}
		}
		ClientAction::Typing => {
			let Some(identity) = &session.identity else {
				return Effect::Drop { reason: "anonymous typing" };
			};
			if frame.room.is_empty() {
				return Effect::Drop { reason: "empty room" };
			}

			frame.user = identity.user_id.to_string();
			Effect::Typing { frame }
		}
		ClientAction::Unknown => Effect::Drop {
			reason: "unknown action",
		},
	}
}

/// Realtime protocol handler shared by every connection of one gateway.
#[derive(Clone)]
pub struct ProtocolHandler {
	registry: Registry,
	bus: Arc<dyn Bus>,
	cfg: ProtocolConfig,
}

impl ProtocolHandler {
	pub fn new(registry: Registry, bus: Arc<dyn Bus>, cfg: ProtocolConfig) -> Self {
		Self { registry, bus, cfg }
	}

	#[allow(dead_code)]
	pub fn registry(&self) -> &Registry {
		&self.registry
	}

	/// Join the private room (if authenticated) and start the heartbeat.
	pub async fn on_open(&self, session: &Session, conn: &ConnectionHandle) -> JoinHandle<()> {
		if let Some(room) = session.private_room() {
			self.registry.join(&room, conn).await;
		}

		info!(
			conn_id = session.conn_id,
			user = session.identity.as_ref().map(|i| i.username.as_str()).unwrap_or("anonymous"),
			"connection open"
		);

		spawn_heartbeat(conn.clone(), self.cfg.heartbeat_interval)
	}

	/// Handle one inbound frame. Failures are logged and the frame dropped.
	pub async fn on_payload(&self, session: &mut Session, conn: &ConnectionHandle, payload: &[u8]) {
		let frame = match ClientFrame::decode(payload) {
			Ok(frame) => frame,
			Err(e) => {
				metrics::counter!("storm_gateway_frames_dropped_total", "reason" => "undecodable").increment(1);
				warn!(conn_id = session.conn_id, error = %e, "dropping undecodable frame");
				return;
			}
		};

		let action = frame.action();
		metrics::counter!("storm_gateway_frames_total", "action" => action.as_str()).increment(1);

		match plan(session, frame) {
			Effect::Join { room, authorize } => self.join(session, conn, room, authorize).await,
			Effect::Message {
				frame,
				conversation,
				echo,
			} => self.message(session, frame, conversation, echo).await,
			Effect::Typing { frame } => self.typing(session, frame).await,
			Effect::Drop { reason } => {
				metrics::counter!("storm_gateway_frames_dropped_total", "reason" => reason).increment(1);
				debug!(conn_id = session.conn_id, action = action.as_str(), reason, "frame dropped");
			}
		}
	}

	/// Leave the joined room and the private room.
	pub async fn on_close(&self, session: &Session) {
		if let Some(room) = &session.room {
			self.registry.leave(room, session.conn_id).await;
		}
		if let Some(room) = session.private_room() {
			self.registry.leave(&room, session.conn_id).await;
		}

		info!(conn_id = session.conn_id, room = ?session.room, "connection closed");
	}

	async fn join(&self, session: &mut Session, conn: &ConnectionHandle, room: String, authorize: Option<ConversationId>) {
		if let Some(conversation) = authorize
			&& !self.authorize_join(session, conversation).await
		{
			metrics::counter!("storm_gateway_joins_denied_total").increment(1);
			info!(conn_id = session.conn_id, %room, "join denied");
			return;
		}

		if let Some(prev) = session.room.take()
			&& prev != room
		{
			self.registry.leave(&prev, session.conn_id).await;
		}

		self.registry.join(&room, conn).await;
		if self.cfg.debug_logs {
			debug!(conn_id = session.conn_id, %room, "joined room");
		}
		session.room = Some(room);
	}

	/// Ask the conversation authority whether the session may join. Any failure denies.
	async fn authorize_join(&self, session: &Session, conversation: ConversationId) -> bool {
		let Some(identity) = &session.identity else {
			return false;
		};

		let req = pb::GetConversationRequest {
			actor_id: identity.user_id.to_string(),
			conversation_id: conversation.get(),
			group_id: 0,
		};
		let payload = match encode_payload(&req, self.cfg.max_payload_size) {
			Ok(payload) => payload,
			Err(e) => {
				warn!(conn_id = session.conn_id, error = %e, "failed to encode join authorization");
				return false;
			}
		};

		let reply = match self
			.bus
			.request(Subject::ConversationGet.as_str(), payload, self.cfg.join_authorize_timeout)
			.await
		{
			Ok(reply) => reply,
			Err(e) => {
				warn!(conn_id = session.conn_id, %conversation, error = %e, "join authorization failed");
				return false;
			}
		};

		match decode_payload::<pb::ConversationReply>(&reply, self.cfg.max_payload_size) {
			Ok(reply) if reply.is_ok() => true,
			Ok(reply) => {
				debug!(
					conn_id = session.conn_id,
					%conversation,
					code = ?reply.error_code(),
					"join authorization rejected"
				);
				false
			}
			Err(e) => {
				warn!(conn_id = session.conn_id, error = %e, "undecodable join authorization reply");
				false
			}
		}
	}

	async fn message(&self, session: &Session, frame: ClientFrame, conversation: ConversationId, echo: bool) {
		let cmd = pb::SendMessageRequest {
			group_id: 0,
			sender_id: frame.user.clone(),
			content: frame.content.clone(),
			attachment: String::new(),
			conversation_id: conversation.get(),
			room: frame.room.clone(),
		};

		match encode_payload(&cmd, self.cfg.max_payload_size) {
			Ok(payload) => {
				if let Err(e) = self.bus.publish(Subject::NewMessage.as_str(), payload).await {
					warn!(conn_id = session.conn_id, room = %frame.room, error = %e, "send command publish failed");
				}
			}
			Err(e) => {
				warn!(conn_id = session.conn_id, room = %frame.room, error = %e, "send command too large");
				return;
			}
		}

		if !echo {
			return;
		}

		match frame.encode() {
			Ok(bytes) => {
				self.registry.broadcast_to_room(&frame.room, Bytes::from(bytes)).await;
			}
			Err(e) => warn!(conn_id = session.conn_id, error = %e, "failed to encode echo frame"),
		}
	}

	async fn typing(&self, session: &Session, frame: ClientFrame) {
		let payload = match frame.encode() {
			Ok(bytes) => Bytes::from(bytes),
			Err(e) => {
				warn!(conn_id = session.conn_id, error = %e, "failed to encode typing frame");
				return;
			}
		};

		if let Err(e) = self.bus.publish(&BroadcastTopic::subject(&frame.room), payload).await {
			warn!(conn_id = session.conn_id, room = %frame.room, error = %e, "typing publish failed");
		}
	}
}

/// Queue a ping every `interval` until the connection's queue is gone.
fn spawn_heartbeat(conn: ConnectionHandle, interval: Duration) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = interval_at(Instant::now() + interval, interval);
		loop {
			ticker.tick().await;
			if conn.send(Outbound::Ping).await.is_err() {
				debug!(conn_id = conn.id(), "heartbeat stopped");
				return;
			}
		}
	})
}
