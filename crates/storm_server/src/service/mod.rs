#![forbid(unsafe_code)]

//! Conversation Authority and Message Store.

pub mod conversation;
pub mod error;
pub mod message;

pub use conversation::ConversationService;
pub use error::ServiceError;
pub use message::MessageService;

#[cfg(test)]
mod conversation_tests;

#[cfg(test)]
mod message_tests;
