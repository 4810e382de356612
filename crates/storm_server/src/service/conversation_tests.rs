#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use proptest::prelude::*;
use storm_domain::{ConversationId, Role, UserId};

use crate::service::{ConversationService, ServiceError};
use crate::store::{
	Conversation, ConversationRepository, Membership, MemoryStore, NewConversation, StoreError,
};

fn service() -> (ConversationService, Arc<MemoryStore>) {
	let store = Arc::new(MemoryStore::new());
	(ConversationService::new(store.clone()), store)
}

async fn conversation_with(
	svc: &ConversationService,
	owner: UserId,
	others: &[(UserId, Role)],
) -> ConversationId {
	let c = svc.create_conversation(owner, "team", "").await.expect("create");
	for (user, role) in others {
		svc.add_member(owner, c.id, *user, *role).await.expect("add member");
	}
	c.id
}

#[tokio::test]
async fn creator_is_the_only_owner() {
	let (svc, _) = service();
	let owner = UserId::new_v4();

	let c = svc.create_conversation(owner, "  ", " https://cdn/a.png ").await.expect("create");
	assert_eq!(c.name, "Untitled conversation");
	assert_eq!(c.avatar_url, "https://cdn/a.png");

	let members = svc.list_members(owner, c.id).await.expect("members");
	assert_eq!(members.len(), 1);
	assert_eq!((members[0].user_id, members[0].role), (owner, Role::Owner));
}

#[tokio::test]
async fn create_rejects_long_names_and_nil_owner() {
	let (svc, _) = service();

	let long = "x".repeat(121);
	assert!(matches!(
		svc.create_conversation(UserId::new_v4(), &long, "").await,
		Err(ServiceError::InvalidInput(_))
	));

	let exactly = "é".repeat(120);
	assert!(svc.create_conversation(UserId::new_v4(), &exactly, "").await.is_ok());

	assert!(matches!(
		svc.create_conversation(UserId::new(uuid::Uuid::nil()), "team", "").await,
		Err(ServiceError::InvalidInput(_))
	));
}

#[tokio::test]
async fn add_member_respects_roles() {
	let (svc, _) = service();
	let (owner, admin, member, outsider) = (UserId::new_v4(), UserId::new_v4(), UserId::new_v4(), UserId::new_v4());
	let c = conversation_with(&svc, owner, &[(admin, Role::Admin), (member, Role::Member)]).await;

	assert!(matches!(
		svc.add_member(member, c, outsider, Role::Member).await,
		Err(ServiceError::Forbidden)
	));
	assert!(matches!(
		svc.add_member(admin, c, outsider, Role::Admin).await,
		Err(ServiceError::Forbidden)
	));

	let added = svc.add_member(admin, c, outsider, Role::Member).await.expect("admin adds member");
	assert_eq!(added.role, Role::Member);

	assert!(matches!(
		svc.add_member(owner, c, outsider, Role::Member).await,
		Err(ServiceError::Conflict(_))
	));
}

#[tokio::test]
async fn non_members_cannot_act_and_missing_conversations_are_not_found() {
	let (svc, _) = service();
	let owner = UserId::new_v4();
	let stranger = UserId::new_v4();
	let c = conversation_with(&svc, owner, &[]).await;

	assert!(matches!(svc.list_members(stranger, c).await, Err(ServiceError::Forbidden)));
	assert!(matches!(
		svc.get_conversation_for_member(stranger, c).await,
		Err(ServiceError::Forbidden)
	));

	let missing = ConversationId::new(999).expect("id");
	assert!(matches!(svc.list_members(owner, missing).await, Err(ServiceError::NotFound(_))));
	assert!(!svc.is_member(owner, missing).await.expect("is_member"));
	assert!(!svc.is_member(stranger, c).await.expect("is_member"));
	assert!(svc.is_member(owner, c).await.expect("is_member"));
}

#[tokio::test]
async fn admin_can_only_remove_members() {
	let (svc, _) = service();
	let (owner, admin, admin2, member) = (UserId::new_v4(), UserId::new_v4(), UserId::new_v4(), UserId::new_v4());
	let c = conversation_with(&svc, owner, &[(admin, Role::Admin), (admin2, Role::Admin), (member, Role::Member)]).await;

	assert!(matches!(svc.remove_member(admin, c, admin2).await, Err(ServiceError::Forbidden)));
	assert!(matches!(svc.remove_member(admin, c, owner).await, Err(ServiceError::Forbidden)));
	assert!(matches!(svc.remove_member(member, c, admin).await, Err(ServiceError::Forbidden)));

	svc.remove_member(admin, c, member).await.expect("admin removes member");
	assert!(!svc.is_member(member, c).await.expect("is_member"));

	assert!(matches!(svc.remove_member(owner, c, member).await, Err(ServiceError::NotFound(_))));
}

#[tokio::test]
async fn removing_yourself_is_a_leave() {
	let (svc, _) = service();
	let (owner, member) = (UserId::new_v4(), UserId::new_v4());
	let c = conversation_with(&svc, owner, &[(member, Role::Member)]).await;

	svc.remove_member(member, c, member).await.expect("self removal");
	assert!(!svc.is_member(member, c).await.expect("is_member"));

	assert!(matches!(svc.remove_member(owner, c, owner).await, Err(ServiceError::Conflict(_))));
}

#[tokio::test]
async fn second_owner_can_leave_but_last_cannot() {
	let (svc, _) = service();
	let (o1, o2) = (UserId::new_v4(), UserId::new_v4());
	let c = conversation_with(&svc, o1, &[(o2, Role::Owner)]).await;

	svc.leave_conversation(o1, c).await.expect("o1 leaves");
	assert!(!svc.is_member(o1, c).await.expect("is_member"));

	assert!(matches!(svc.leave_conversation(o2, c).await, Err(ServiceError::Conflict(_))));
	assert!(svc.is_member(o2, c).await.expect("is_member"));
}

#[tokio::test]
async fn owners_remove_owners_only_while_another_remains() {
	let (svc, _) = service();
	let (o1, o2) = (UserId::new_v4(), UserId::new_v4());
	let c = conversation_with(&svc, o1, &[(o2, Role::Owner)]).await;

	svc.remove_member(o1, c, o2).await.expect("remove co-owner");
	let members = svc.list_members(o1, c).await.expect("members");
	assert_eq!(members.len(), 1);
}

#[tokio::test]
async fn update_role_is_owner_only_and_guards_last_owner() {
	let (svc, _) = service();
	let (owner, admin, member) = (UserId::new_v4(), UserId::new_v4(), UserId::new_v4());
	let c = conversation_with(&svc, owner, &[(admin, Role::Admin), (member, Role::Member)]).await;

	assert!(matches!(
		svc.update_member_role(admin, c, member, Role::Admin).await,
		Err(ServiceError::Forbidden)
	));

	let unchanged = svc.update_member_role(owner, c, member, Role::Member).await.expect("noop");
	assert_eq!(unchanged.role, Role::Member);

	assert!(matches!(
		svc.update_member_role(owner, c, owner, Role::Admin).await,
		Err(ServiceError::Conflict(_))
	));

	svc.update_member_role(owner, c, admin, Role::Owner).await.expect("promote");
	let demoted = svc.update_member_role(admin, c, owner, Role::Member).await.expect("demote former owner");
	assert_eq!(demoted.role, Role::Member);

	let members = svc.list_members(admin, c).await.expect("members");
	let roles: Vec<Role> = members.iter().map(|m| m.role).collect();
	assert_eq!(roles, vec![Role::Owner, Role::Member, Role::Member]);
}

#[tokio::test]
async fn delete_is_owner_only_and_cascades() {
	let (svc, _) = service();
	let (owner, admin) = (UserId::new_v4(), UserId::new_v4());
	let c = conversation_with(&svc, owner, &[(admin, Role::Admin)]).await;

	assert!(matches!(svc.delete_conversation(admin, c).await, Err(ServiceError::Forbidden)));

	svc.delete_conversation(owner, c).await.expect("delete");
	assert!(matches!(svc.get_conversation(c).await, Err(ServiceError::NotFound(_))));
	assert!(!svc.is_member(admin, c).await.expect("is_member"));
	assert!(svc.list_conversations_for_user(owner).await.expect("list").is_empty());
}

#[tokio::test]
async fn conversations_for_user_are_most_recent_first() {
	let (svc, _) = service();
	let user = UserId::new_v4();

	let first = svc.create_conversation(user, "first", "").await.expect("create");
	let second = svc.create_conversation(user, "second", "").await.expect("create");
	let _unrelated = svc.create_conversation(UserId::new_v4(), "other", "").await.expect("create");

	let listed: Vec<ConversationId> = svc
		.list_conversations_for_user(user)
		.await
		.expect("list")
		.into_iter()
		.map(|c| c.id)
		.collect();
	assert_eq!(listed, vec![second.id, first.id]);
}

/// Repository whose membership inserts always fail, exercising the
/// compensating path of `create_conversation_with_owner`.
struct RejectingMemberships {
	inner: MemoryStore,
}

#[async_trait]
impl ConversationRepository for RejectingMemberships {
	async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, StoreError> {
		self.inner.create_conversation(new).await
	}

	async fn get_conversation(&self, id: ConversationId) -> Result<Conversation, StoreError> {
		self.inner.get_conversation(id).await
	}

	async fn list_conversations_for_user(&self, user: UserId) -> Result<Vec<Conversation>, StoreError> {
		self.inner.list_conversations_for_user(user).await
	}

	async fn soft_delete_conversation(&self, id: ConversationId) -> Result<(), StoreError> {
		self.inner.soft_delete_conversation(id).await
	}

	async fn create_membership(&self, _: ConversationId, _: UserId, _: Role) -> Result<Membership, StoreError> {
		Err(StoreError::Corrupt("membership table unavailable".into()))
	}

	async fn get_membership(&self, conversation: ConversationId, user: UserId) -> Result<Membership, StoreError> {
		self.inner.get_membership(conversation, user).await
	}

	async fn list_memberships(&self, conversation: ConversationId) -> Result<Vec<Membership>, StoreError> {
		self.inner.list_memberships(conversation).await
	}

	async fn update_membership_role(
		&self,
		conversation: ConversationId,
		user: UserId,
		role: Role,
	) -> Result<Membership, StoreError> {
		self.inner.update_membership_role(conversation, user, role).await
	}

	async fn remove_membership(&self, conversation: ConversationId, user: UserId) -> Result<(), StoreError> {
		self.inner.remove_membership(conversation, user).await
	}

	async fn count_owners(&self, conversation: ConversationId) -> Result<usize, StoreError> {
		self.inner.count_owners(conversation).await
	}
}

#[tokio::test]
async fn failed_owner_membership_rolls_back_the_conversation() {
	let store = Arc::new(RejectingMemberships { inner: MemoryStore::new() });
	let svc = ConversationService::new(store.clone());

	let err = svc.create_conversation(UserId::new_v4(), "team", "").await.unwrap_err();
	assert!(matches!(err, ServiceError::Internal(_)));

	let first = ConversationId::new(1).expect("id");
	assert!(matches!(
		store.inner.get_conversation(first).await,
		Err(StoreError::ConversationNotFound)
	));
}

#[derive(Debug, Clone)]
enum Op {
	Add { actor: usize, user: usize, role: Role },
	Remove { actor: usize, user: usize },
	UpdateRole { actor: usize, user: usize, role: Role },
	Leave { user: usize },
}

fn role_strategy() -> impl Strategy<Value = Role> {
	prop_oneof![Just(Role::Member), Just(Role::Admin), Just(Role::Owner)]
}

fn op_strategy() -> impl Strategy<Value = Op> {
	let user = 0usize..4;
	prop_oneof![
		(user.clone(), user.clone(), role_strategy()).prop_map(|(actor, user, role)| Op::Add { actor, user, role }),
		(user.clone(), user.clone()).prop_map(|(actor, user)| Op::Remove { actor, user }),
		(user.clone(), user.clone(), role_strategy()).prop_map(|(actor, user, role)| Op::UpdateRole {
			actor,
			user,
			role
		}),
		user.prop_map(|user| Op::Leave { user }),
	]
}

proptest! {
	#[test]
	fn active_conversations_always_keep_an_owner(ops in proptest::collection::vec(op_strategy(), 1..40)) {
		let rt = tokio::runtime::Builder::new_current_thread()
			.enable_all()
			.build()
			.expect("runtime");

		rt.block_on(async {
			let (svc, store) = service();
			let users: Vec<UserId> = (0..4).map(|_| UserId::new_v4()).collect();
			let c = svc.create_conversation(users[0], "prop", "").await.expect("create").id;

			for op in ops {
				let _ = match op {
					Op::Add { actor, user, role } => svc.add_member(users[actor], c, users[user], role).await.map(|_| ()),
					Op::Remove { actor, user } => svc.remove_member(users[actor], c, users[user]).await,
					Op::UpdateRole { actor, user, role } => {
						svc.update_member_role(users[actor], c, users[user], role).await.map(|_| ())
					}
					Op::Leave { user } => svc.leave_conversation(users[user], c).await,
				};

				let owners = store.count_owners(c).await.expect("count");
				assert!(owners >= 1, "conversation lost its last owner");
			}
		});
	}
}
