#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

pub type ConnId = u64;

/// Items queued for a connection's socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
	Payload(Bytes),
	Ping,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
	#[error("outbound queue full")]
	QueueFull,
	#[error("connection closed")]
	Closed,
}

/// Sending half of one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	id: ConnId,
	tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
	pub fn new(id: ConnId, tx: mpsc::Sender<Outbound>) -> Self {
		Self { id, tx }
	}

	pub fn id(&self) -> ConnId {
		self.id
	}

	/// Non-blocking enqueue; never waits on a slow socket.
	pub fn try_send(&self, item: Outbound) -> Result<(), DeliveryError> {
		self.tx.try_send(item).map_err(|e| match e {
			mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
			mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
		})
	}

	/// Enqueue, waiting for queue space.
	pub async fn send(&self, item: Outbound) -> Result<(), DeliveryError> {
		self.tx.send(item).await.map_err(|_| DeliveryError::Closed)
	}
}

/// Configuration for `Registry`.
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
	pub debug_logs: bool,
}

/// Process-local room membership table.
///
/// Join/leave take the write lock; broadcasts share the read lock so they only
/// serialize against membership changes.
#[derive(Debug, Clone)]
pub struct Registry {
	rooms: Arc<RwLock<HashMap<String, HashMap<ConnId, ConnectionHandle>>>>,
	cfg: RegistryConfig,
}

impl Registry {
	pub fn new(cfg: RegistryConfig) -> Self {
		Self {
			rooms: Arc::new(RwLock::new(HashMap::new())),
			cfg,
		}
	}

	/// Add `conn` to `room`, creating the room. Joining twice is a no-op.
	pub async fn join(&self, room: &str, conn: &ConnectionHandle) -> bool {
		let mut rooms = self.rooms.write().await;
		let members = rooms.entry(room.to_string()).or_default();
		let added = members.insert(conn.id(), conn.clone()).is_none();

		if self.cfg.debug_logs {
			debug!(room, conn_id = conn.id(), members = members.len(), added, "registry: join");
		}

		added
	}

	/// Remove `conn_id` from `room`; the room disappears once empty.
	pub async fn leave(&self, room: &str, conn_id: ConnId) -> bool {
		let mut rooms = self.rooms.write().await;
		let Some(members) = rooms.get_mut(room) else {
			return false;
		};

		let removed = members.remove(&conn_id).is_some();
		if members.is_empty() {
			rooms.remove(room);
		}

		if self.cfg.debug_logs {
			debug!(room, conn_id, removed, "registry: leave");
		}

		removed
	}

	/// Deliver `payload` to every member of `room` and return how many accepted it.
	///
	/// Unknown rooms are a no-op. A failing member is logged and skipped.
	pub async fn broadcast_to_room(&self, room: &str, payload: Bytes) -> usize {
		let rooms = self.rooms.read().await;
		let Some(members) = rooms.get(room) else {
			return 0;
		};

		let mut delivered = 0usize;
		for conn in members.values() {
			match conn.try_send(Outbound::Payload(payload.clone())) {
				Ok(()) => delivered += 1,
				Err(e) => {
					metrics::counter!("storm_gateway_broadcast_failures_total").increment(1);
					warn!(room, conn_id = conn.id(), error = %e, "registry: delivery to member failed");
				}
			}
		}

		if self.cfg.debug_logs {
			debug!(room, members = members.len(), delivered, "registry: broadcast");
		}

		delivered
	}

	/// Number of connections in `room` (0 when absent).
	#[allow(dead_code)]
	pub async fn room_size(&self, room: &str) -> usize {
		self.rooms.read().await.get(room).map(HashMap::len).unwrap_or(0)
	}

	#[allow(dead_code)]
	pub async fn has_room(&self, room: &str) -> bool {
		self.rooms.read().await.contains_key(room)
	}

	/// Snapshot of member counts per room.
	#[allow(dead_code)]
	pub async fn room_counts(&self) -> HashMap<String, usize> {
		let rooms = self.rooms.read().await;
		rooms.iter().map(|(k, v)| (k.clone(), v.len())).collect()
	}
}
