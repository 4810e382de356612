#![forbid(unsafe_code)]

//! Subject-addressed message bus used for room broadcast fan-out and RPC.

mod local;

pub use local::{LocalBus, LocalBusConfig};

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum BusError {
	#[error("invalid subject: {0:?}")]
	InvalidSubject(String),

	#[error("no responders for {0}")]
	NoResponders(String),

	#[error("request to {subject} timed out after {timeout:?}")]
	Timeout {
		subject: String,
		timeout: Duration,
	},

	#[error("requester went away before the reply")]
	RequesterGone,

	#[error("bus closed")]
	Closed,
}

/// Publish/subscribe plus request/reply over dot-separated subjects.
///
/// Patterns may use `*` for one token and a trailing `>` for one or more.
#[async_trait]
pub trait Bus: Send + Sync {
	/// Fire-and-forget publish. Zero subscribers is not an error.
	async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;

	/// Send a request and wait for the first reply.
	async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Bytes, BusError>;

	/// Every subscription on a matching pattern receives each message.
	async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError>;

	/// Each message is delivered to one member of `group`.
	async fn queue_subscribe(&self, pattern: &str, group: &str) -> Result<Subscription, BusError>;
}

/// Message received on a subscription.
#[derive(Debug)]
pub struct BusMessage {
	pub subject: String,
	pub payload: Bytes,
	reply: Option<mpsc::Sender<Bytes>>,
}

impl BusMessage {
	pub(crate) fn new(subject: impl Into<String>, payload: Bytes, reply: Option<mpsc::Sender<Bytes>>) -> Self {
		Self {
			subject: subject.into(),
			payload,
			reply,
		}
	}

	pub fn expects_reply(&self) -> bool {
		self.reply.is_some()
	}

	/// Answer a request. No-op for plain publishes; later replies after the first are dropped.
	pub fn respond(&self, payload: Bytes) -> Result<(), BusError> {
		let Some(reply) = &self.reply else {
			return Ok(());
		};

		match reply.try_send(payload) {
			Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
			Err(mpsc::error::TrySendError::Closed(_)) => Err(BusError::RequesterGone),
		}
	}
}

/// Stream of messages for one subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
	rx: mpsc::Receiver<BusMessage>,
}

impl Subscription {
	pub(crate) fn new(rx: mpsc::Receiver<BusMessage>) -> Self {
		Self { rx }
	}

	/// Next message; `None` once the bus is closed.
	pub async fn next(&mut self) -> Option<BusMessage> {
		self.rx.recv().await
	}
}

/// Parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectPattern {
	raw: String,
	tokens: Vec<String>,
}

impl SubjectPattern {
	pub fn parse(pattern: &str) -> Result<Self, BusError> {
		let tokens: Vec<String> = pattern.split('.').map(str::to_string).collect();
		let last = tokens.len() - 1;

		for (idx, token) in tokens.iter().enumerate() {
			let bad = token.is_empty() || (token == ">" && idx != last) || (token.contains(['*', '>']) && token.len() > 1);
			if bad {
				return Err(BusError::InvalidSubject(pattern.to_string()));
			}
		}

		Ok(Self {
			raw: pattern.to_string(),
			tokens,
		})
	}

	pub fn as_str(&self) -> &str {
		&self.raw
	}

	pub fn matches(&self, subject: &str) -> bool {
		let mut parts = subject.split('.');

		for token in &self.tokens {
			match token.as_str() {
				">" => return parts.next().is_some(),
				"*" => {
					if parts.next().is_none() {
						return false;
					}
				}
				literal => {
					if parts.next() != Some(literal) {
						return false;
					}
				}
			}
		}

		parts.next().is_none()
	}
}

/// Concrete subjects: non-empty tokens, no wildcards.
pub fn validate_subject(subject: &str) -> Result<(), BusError> {
	let ok = !subject.is_empty()
		&& subject
			.split('.')
			.all(|token| !token.is_empty() && token != "*" && token != ">");

	if ok {
		Ok(())
	} else {
		Err(BusError::InvalidSubject(subject.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn full_wildcard_needs_at_least_one_token() {
		let p = SubjectPattern::parse("message.broadcast.>").expect("pattern");
		assert!(p.matches("message.broadcast.lobby"));
		assert!(p.matches("message.broadcast.team.eu"));
		assert!(!p.matches("message.broadcast"));
		assert!(!p.matches("message.other.lobby"));
	}

	#[test]
	fn single_wildcard_matches_exactly_one_token() {
		let p = SubjectPattern::parse("a.*.c").expect("pattern");
		assert!(p.matches("a.b.c"));
		assert!(!p.matches("a.b.x.c"));
		assert!(!p.matches("a.c"));
	}

	#[test]
	fn literal_patterns_match_exactly() {
		let p = SubjectPattern::parse("NEW_MESSAGE").expect("pattern");
		assert!(p.matches("NEW_MESSAGE"));
		assert!(!p.matches("NEW_MESSAGE.x"));
	}

	#[test]
	fn rejects_malformed_patterns_and_subjects() {
		assert!(SubjectPattern::parse("").is_err());
		assert!(SubjectPattern::parse("a..b").is_err());
		assert!(SubjectPattern::parse("a.>.b").is_err());
		assert!(SubjectPattern::parse("a.b*").is_err());

		assert!(validate_subject("message.broadcast.lobby").is_ok());
		assert!(validate_subject("message.broadcast.").is_err());
		assert!(validate_subject("message.*").is_err());
	}
}
