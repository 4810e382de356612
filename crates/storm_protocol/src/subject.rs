#![forbid(unsafe_code)]

use core::fmt;

/// Queue group shared by every message-service responder.
pub const QUEUE_GROUP: &str = "message";

/// RPC subjects served by the message service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
	NewMessage,
	GetMessage,
	ListMessages,
	UpdateMessage,
	DeleteMessage,
	AckMessage,
	ConversationCreate,
	ConversationGet,
	ConversationListForUser,
	ConversationAddMember,
	ConversationRemoveMember,
	ConversationListMembers,
	ConversationUpdateRole,
	ConversationLeave,
	ConversationDelete,
}

impl Subject {
	pub const ALL: [Subject; 15] = [
		Subject::NewMessage,
		Subject::GetMessage,
		Subject::ListMessages,
		Subject::UpdateMessage,
		Subject::DeleteMessage,
		Subject::AckMessage,
		Subject::ConversationCreate,
		Subject::ConversationGet,
		Subject::ConversationListForUser,
		Subject::ConversationAddMember,
		Subject::ConversationRemoveMember,
		Subject::ConversationListMembers,
		Subject::ConversationUpdateRole,
		Subject::ConversationLeave,
		Subject::ConversationDelete,
	];

	/// Wire subject. Conversation subjects keep their historical `GROUP_` names.
	pub const fn as_str(self) -> &'static str {
		match self {
			Subject::NewMessage => "NEW_MESSAGE",
			Subject::GetMessage => "GET_MESSAGE",
			Subject::ListMessages => "LIST_MESSAGES",
			Subject::UpdateMessage => "UPDATE_MESSAGE",
			Subject::DeleteMessage => "DELETE_MESSAGE",
			Subject::AckMessage => "ACK_MESSAGE",
			Subject::ConversationCreate => "GROUP_CREATE",
			Subject::ConversationGet => "GROUP_GET",
			Subject::ConversationListForUser => "GROUP_LIST_FOR_USER",
			Subject::ConversationAddMember => "GROUP_ADD_MEMBER",
			Subject::ConversationRemoveMember => "GROUP_REMOVE_MEMBER",
			Subject::ConversationListMembers => "GROUP_LIST_MEMBERS",
			Subject::ConversationUpdateRole => "GROUP_UPDATE_ROLE",
			Subject::ConversationLeave => "GROUP_LEAVE",
			Subject::ConversationDelete => "GROUP_DELETE",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		Self::ALL.into_iter().find(|subject| subject.as_str() == s)
	}
}

impl fmt::Display for Subject {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
