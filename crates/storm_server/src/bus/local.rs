#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use super::{Bus, BusError, BusMessage, SubjectPattern, Subscription, validate_subject};

/// Configuration for `LocalBus`.
#[derive(Debug, Clone)]
pub struct LocalBusConfig {
	/// Maximum number of queued messages per subscription.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for LocalBusConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

/// In-process bus. Gateways and responders sharing one instance behave like
/// separate processes attached to the same broker.
#[derive(Debug)]
pub struct LocalBus {
	inner: Mutex<Inner>,
	cfg: LocalBusConfig,
}

#[derive(Debug, Default)]
struct Inner {
	closed: bool,
	entries: Vec<Entry>,
	/// Round-robin cursor per `(pattern, group)`.
	queue_cursor: HashMap<(String, String), usize>,
}

#[derive(Debug)]
struct Entry {
	pattern: SubjectPattern,
	group: Option<String>,
	tx: mpsc::Sender<BusMessage>,
}

impl LocalBus {
	pub fn new(cfg: LocalBusConfig) -> Self {
		Self {
			inner: Mutex::new(Inner::default()),
			cfg,
		}
	}

	/// Cancel every subscription and refuse further traffic.
	pub async fn close(&self) {
		let mut inner = self.inner.lock().await;
		inner.closed = true;
		inner.entries.clear();
		inner.queue_cursor.clear();
	}

	async fn add_entry(&self, pattern: &str, group: Option<&str>) -> Result<Subscription, BusError> {
		let parsed = SubjectPattern::parse(pattern)?;
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity);

		let mut inner = self.inner.lock().await;
		if inner.closed {
			return Err(BusError::Closed);
		}

		inner.entries.retain(|e| !e.tx.is_closed());
		inner.entries.push(Entry {
			pattern: parsed,
			group: group.map(str::to_string),
			tx,
		});

		if self.cfg.debug_logs {
			debug!(pattern, group, subs = inner.entries.len(), "bus: subscribed");
		}

		Ok(Subscription::new(rx))
	}

	/// Deliver to every plain match and to one member per queue group.
	async fn deliver(
		&self,
		subject: &str,
		payload: &Bytes,
		reply: Option<&mpsc::Sender<Bytes>>,
	) -> Result<usize, BusError> {
		validate_subject(subject)?;

		let mut inner = self.inner.lock().await;
		if inner.closed {
			return Err(BusError::Closed);
		}

		inner.entries.retain(|e| !e.tx.is_closed());

		let mut delivered = 0usize;
		let mut groups: HashMap<(String, String), Vec<usize>> = HashMap::new();

		for (idx, entry) in inner.entries.iter().enumerate() {
			if !entry.pattern.matches(subject) {
				continue;
			}

			match &entry.group {
				Some(group) => groups
					.entry((entry.pattern.as_str().to_string(), group.clone()))
					.or_default()
					.push(idx),
				None => {
					if try_deliver(&entry.tx, subject, payload, reply) {
						delivered += 1;
					}
				}
			}
		}

		for (key, members) in groups {
			let cursor = inner.queue_cursor.entry(key).or_insert(0);
			let start = *cursor;
			*cursor = cursor.wrapping_add(1);

			// Fall through to the next member when one is saturated.
			for offset in 0..members.len() {
				let idx = members[(start + offset) % members.len()];
				if try_deliver(&inner.entries[idx].tx, subject, payload, reply) {
					delivered += 1;
					break;
				}
			}
		}

		Ok(delivered)
	}
}

fn try_deliver(tx: &mpsc::Sender<BusMessage>, subject: &str, payload: &Bytes, reply: Option<&mpsc::Sender<Bytes>>) -> bool {
	let msg = BusMessage::new(subject, payload.clone(), reply.cloned());
	match tx.try_send(msg) {
		Ok(()) => true,
		Err(mpsc::error::TrySendError::Full(_)) => {
			metrics::counter!("storm_bus_dropped_total").increment(1);
			warn!(subject, "bus: subscriber queue full; message dropped");
			false
		}
		Err(mpsc::error::TrySendError::Closed(_)) => false,
	}
}

#[async_trait]
impl Bus for LocalBus {
	async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
		let delivered = self.deliver(subject, &payload, None).await?;
		metrics::counter!("storm_bus_published_total").increment(1);

		if self.cfg.debug_logs {
			debug!(subject, delivered, "bus: published");
		}

		Ok(())
	}

	async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Bytes, BusError> {
		let (reply_tx, mut reply_rx) = mpsc::channel(1);

		let delivered = self.deliver(subject, &payload, Some(&reply_tx)).await?;
		drop(reply_tx);

		if delivered == 0 {
			return Err(BusError::NoResponders(subject.to_string()));
		}

		match tokio::time::timeout(timeout, reply_rx.recv()).await {
			Ok(Some(reply)) => Ok(reply),
			// Every responder dropped the request without answering.
			Ok(None) => Err(BusError::NoResponders(subject.to_string())),
			Err(_) => Err(BusError::Timeout {
				subject: subject.to_string(),
				timeout,
			}),
		}
	}

	async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
		self.add_entry(pattern, None).await
	}

	async fn queue_subscribe(&self, pattern: &str, group: &str) -> Result<Subscription, BusError> {
		self.add_entry(pattern, Some(group)).await
	}
}
