#![forbid(unsafe_code)]

use std::fmt::Display;
use std::str::FromStr;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use storm_domain::{ConversationId, MessageId, Role, UserId};
use tracing::info;

use super::{
	Conversation, ConversationRepository, Membership, Message, MessageReceipt, MessageRepository, NewConversation,
	NewMessage, RecordStatus, StoreError,
};
use crate::util::time::unix_ms_now;

/// SQL-backed store (SQLite or Postgres, chosen by the URL scheme).
#[derive(Clone)]
pub struct SqlStore {
	backend: Backend,
}

#[derive(Clone)]
enum Backend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

/// Run `$body` against whichever pool backs `$store`. Both dialects accept `$N` placeholders.
macro_rules! with_pool {
	($store:expr, |$pool:ident| $body:expr) => {
		match &$store.backend {
			Backend::Sqlite($pool) => $body,
			Backend::Postgres($pool) => $body,
		}
	};
}

const CONVERSATION_COLUMNS_RETURNING: &str =
	"RETURNING id, name, avatar_url, created_by, created_at, updated_at, deleted_at";

const MEMBERSHIP_COLUMNS_RETURNING: &str = "RETURNING id, conversation_id, user_id, role, created_at, deleted_at";

const MESSAGE_COLUMNS_RETURNING: &str =
	"RETURNING id, conversation_id, sender_id, content, attachment, created_at, updated_at, deleted_at";

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let opts = SqliteConnectOptions::from_str(database_url)
				.context("parse sqlite url")?
				.create_if_missing(true);

			// Every connection to `:memory:` is a separate database.
			let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
			let pool = if in_memory {
				SqlitePoolOptions::new()
					.max_connections(1)
					.idle_timeout(None)
					.max_lifetime(None)
					.connect_with(opts)
					.await
			} else {
				SqlitePoolOptions::new().connect_with(opts).await
			}
			.context("connect sqlite")?;

			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			info!("store: sqlite ready");
			Ok(Self {
				backend: Backend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.connect(database_url)
				.await
				.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			info!("store: postgres ready");
			Ok(Self {
				backend: Backend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite:, postgres:)"))
		}
	}

	/// Statement that pins a conversation for the rest of a transaction.
	///
	/// SQLite serializes writers on its own; Postgres needs a row lock so two
	/// owners cannot demote each other concurrently.
	fn lock_conversation_sql(&self) -> &'static str {
		match self.backend {
			Backend::Sqlite(_) => "SELECT id FROM conversations WHERE id = $1 AND deleted_at IS NULL",
			Backend::Postgres(_) => "SELECT id FROM conversations WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
		}
	}
}

fn corrupt(e: impl Display) -> StoreError {
	StoreError::Corrupt(e.to_string())
}

fn membership_insert_error(e: sqlx::Error) -> StoreError {
	match &e {
		sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::MembershipExists,
		_ => StoreError::Database(e),
	}
}

#[derive(sqlx::FromRow)]
struct ConversationRow {
	id: i64,
	name: String,
	avatar_url: String,
	created_by: String,
	created_at: i64,
	updated_at: i64,
	deleted_at: Option<i64>,
}

impl TryFrom<ConversationRow> for Conversation {
	type Error = StoreError;

	fn try_from(row: ConversationRow) -> Result<Self, Self::Error> {
		Ok(Conversation {
			id: ConversationId::try_from(row.id).map_err(corrupt)?,
			name: row.name,
			avatar_url: row.avatar_url,
			created_by: UserId::parse(&row.created_by).map_err(corrupt)?,
			created_at: row.created_at,
			updated_at: row.updated_at,
			status: RecordStatus::from_deleted_at(row.deleted_at),
		})
	}
}

#[derive(sqlx::FromRow)]
struct MembershipRow {
	id: i64,
	conversation_id: i64,
	user_id: String,
	role: i32,
	created_at: i64,
	deleted_at: Option<i64>,
}

impl TryFrom<MembershipRow> for Membership {
	type Error = StoreError;

	fn try_from(row: MembershipRow) -> Result<Self, Self::Error> {
		Ok(Membership {
			id: row.id,
			conversation_id: ConversationId::try_from(row.conversation_id).map_err(corrupt)?,
			user_id: UserId::parse(&row.user_id).map_err(corrupt)?,
			role: Role::try_from(row.role).map_err(corrupt)?,
			created_at: row.created_at,
			status: RecordStatus::from_deleted_at(row.deleted_at),
		})
	}
}

#[derive(sqlx::FromRow)]
struct MessageRow {
	id: i64,
	conversation_id: i64,
	sender_id: String,
	content: String,
	attachment: Option<String>,
	created_at: i64,
	updated_at: i64,
	deleted_at: Option<i64>,
}

impl TryFrom<MessageRow> for Message {
	type Error = StoreError;

	fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
		Ok(Message {
			id: MessageId::try_from(row.id).map_err(corrupt)?,
			conversation_id: ConversationId::try_from(row.conversation_id).map_err(corrupt)?,
			sender_id: UserId::parse(&row.sender_id).map_err(corrupt)?,
			content: row.content,
			attachment: row.attachment,
			created_at: row.created_at,
			updated_at: row.updated_at,
			status: RecordStatus::from_deleted_at(row.deleted_at),
		})
	}
}

#[derive(sqlx::FromRow)]
struct ReceiptRow {
	message_id: i64,
	user_id: String,
	received_at: i64,
}

impl TryFrom<ReceiptRow> for MessageReceipt {
	type Error = StoreError;

	fn try_from(row: ReceiptRow) -> Result<Self, Self::Error> {
		Ok(MessageReceipt {
			message_id: MessageId::try_from(row.message_id).map_err(corrupt)?,
			user_id: UserId::parse(&row.user_id).map_err(corrupt)?,
			received_at: row.received_at,
		})
	}
}

fn insert_conversation_sql() -> String {
	format!(
		"INSERT INTO conversations (name, avatar_url, created_by, created_at, updated_at) \
		VALUES ($1, $2, $3, $4, $5) {CONVERSATION_COLUMNS_RETURNING}"
	)
}

fn insert_membership_sql() -> String {
	format!(
		"INSERT INTO conversation_members (conversation_id, user_id, role, created_at) \
		VALUES ($1, $2, $3, $4) {MEMBERSHIP_COLUMNS_RETURNING}"
	)
}

const SELECT_ACTIVE_MEMBERSHIP: &str = "SELECT id, conversation_id, user_id, role, created_at, deleted_at \
	FROM conversation_members WHERE conversation_id = $1 AND user_id = $2 AND deleted_at IS NULL";

const COUNT_OWNERS: &str = "SELECT COUNT(*) FROM conversation_members \
	WHERE conversation_id = $1 AND role = $2 AND deleted_at IS NULL";

#[async_trait]
impl ConversationRepository for SqlStore {
	async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, StoreError> {
		let now = unix_ms_now();
		let sql = insert_conversation_sql();

		let row: ConversationRow = with_pool!(self, |pool| {
			sqlx::query_as(&sql)
				.bind(&new.name)
				.bind(&new.avatar_url)
				.bind(new.created_by.to_string())
				.bind(now)
				.bind(now)
				.fetch_one(pool)
				.await?
		});

		row.try_into()
	}

	async fn create_conversation_with_owner(
		&self,
		new: NewConversation,
	) -> Result<(Conversation, Membership), StoreError> {
		let now = unix_ms_now();
		let conversation_sql = insert_conversation_sql();
		let membership_sql = insert_membership_sql();

		let (conversation, membership): (ConversationRow, MembershipRow) = with_pool!(self, |pool| {
			let mut tx = pool.begin().await?;

			let conversation: ConversationRow = sqlx::query_as(&conversation_sql)
				.bind(&new.name)
				.bind(&new.avatar_url)
				.bind(new.created_by.to_string())
				.bind(now)
				.bind(now)
				.fetch_one(&mut *tx)
				.await?;

			let membership: MembershipRow = sqlx::query_as(&membership_sql)
				.bind(conversation.id)
				.bind(new.created_by.to_string())
				.bind(Role::Owner.as_i32())
				.bind(now)
				.fetch_one(&mut *tx)
				.await
				.map_err(membership_insert_error)?;

			tx.commit().await?;
			(conversation, membership)
		});

		Ok((conversation.try_into()?, membership.try_into()?))
	}

	async fn get_conversation(&self, id: ConversationId) -> Result<Conversation, StoreError> {
		let row: Option<ConversationRow> = with_pool!(self, |pool| {
			sqlx::query_as(
				"SELECT id, name, avatar_url, created_by, created_at, updated_at, deleted_at \
				FROM conversations WHERE id = $1 AND deleted_at IS NULL",
			)
			.bind(id.get())
			.fetch_optional(pool)
			.await?
		});

		row.ok_or(StoreError::ConversationNotFound)?.try_into()
	}

	async fn list_conversations_for_user(&self, user: UserId) -> Result<Vec<Conversation>, StoreError> {
		let rows: Vec<ConversationRow> = with_pool!(self, |pool| {
			sqlx::query_as(
				"SELECT c.id, c.name, c.avatar_url, c.created_by, c.created_at, c.updated_at, c.deleted_at \
				FROM conversations c \
				JOIN conversation_members m ON m.conversation_id = c.id \
				WHERE m.user_id = $1 AND m.deleted_at IS NULL AND c.deleted_at IS NULL \
				ORDER BY c.updated_at DESC, c.id DESC",
			)
			.bind(user.to_string())
			.fetch_all(pool)
			.await?
		});

		rows.into_iter().map(Conversation::try_from).collect()
	}

	async fn soft_delete_conversation(&self, id: ConversationId) -> Result<(), StoreError> {
		let now = unix_ms_now();

		let affected = with_pool!(self, |pool| {
			let mut tx = pool.begin().await?;

			let affected = sqlx::query(
				"UPDATE conversations SET deleted_at = $1, updated_at = $2 WHERE id = $3 AND deleted_at IS NULL",
			)
			.bind(now)
			.bind(now)
			.bind(id.get())
			.execute(&mut *tx)
			.await?
			.rows_affected();

			if affected > 0 {
				sqlx::query(
					"UPDATE conversation_members SET deleted_at = $1 WHERE conversation_id = $2 AND deleted_at IS NULL",
				)
				.bind(now)
				.bind(id.get())
				.execute(&mut *tx)
				.await?;
			}

			tx.commit().await?;
			affected
		});

		if affected == 0 {
			return Err(StoreError::ConversationNotFound);
		}
		Ok(())
	}

	async fn create_membership(
		&self,
		conversation: ConversationId,
		user: UserId,
		role: Role,
	) -> Result<Membership, StoreError> {
		let now = unix_ms_now();
		let sql = insert_membership_sql();

		let row: Option<MembershipRow> = with_pool!(self, |pool| {
			let mut tx = pool.begin().await?;

			let exists: Option<(i64,)> = sqlx::query_as(self.lock_conversation_sql())
				.bind(conversation.get())
				.fetch_optional(&mut *tx)
				.await?;

			match exists {
				None => None,
				Some(_) => {
					let row: MembershipRow = sqlx::query_as(&sql)
						.bind(conversation.get())
						.bind(user.to_string())
						.bind(role.as_i32())
						.bind(now)
						.fetch_one(&mut *tx)
						.await
						.map_err(membership_insert_error)?;
					tx.commit().await?;
					Some(row)
				}
			}
		});

		row.ok_or(StoreError::ConversationNotFound)?.try_into()
	}

	async fn get_membership(&self, conversation: ConversationId, user: UserId) -> Result<Membership, StoreError> {
		let row: Option<MembershipRow> = with_pool!(self, |pool| {
			sqlx::query_as(SELECT_ACTIVE_MEMBERSHIP)
				.bind(conversation.get())
				.bind(user.to_string())
				.fetch_optional(pool)
				.await?
		});

		row.ok_or(StoreError::MembershipNotFound)?.try_into()
	}

	async fn list_memberships(&self, conversation: ConversationId) -> Result<Vec<Membership>, StoreError> {
		let rows: Vec<MembershipRow> = with_pool!(self, |pool| {
			sqlx::query_as(
				"SELECT id, conversation_id, user_id, role, created_at, deleted_at \
				FROM conversation_members WHERE conversation_id = $1 AND deleted_at IS NULL \
				ORDER BY role DESC, id ASC",
			)
			.bind(conversation.get())
			.fetch_all(pool)
			.await?
		});

		rows.into_iter().map(Membership::try_from).collect()
	}

	async fn update_membership_role(
		&self,
		conversation: ConversationId,
		user: UserId,
		role: Role,
	) -> Result<Membership, StoreError> {
		let update_sql = format!(
			"UPDATE conversation_members SET role = $1 WHERE id = $2 {MEMBERSHIP_COLUMNS_RETURNING}"
		);

		let row: MembershipRow = with_pool!(self, |pool| {
			let mut tx = pool.begin().await?;

			sqlx::query(self.lock_conversation_sql())
				.bind(conversation.get())
				.execute(&mut *tx)
				.await?;

			let current: MembershipRow = sqlx::query_as(SELECT_ACTIVE_MEMBERSHIP)
				.bind(conversation.get())
				.bind(user.to_string())
				.fetch_optional(&mut *tx)
				.await?
				.ok_or(StoreError::MembershipNotFound)?;

			if current.role == Role::Owner.as_i32() && role != Role::Owner {
				let (owners,): (i64,) = sqlx::query_as(COUNT_OWNERS)
					.bind(conversation.get())
					.bind(Role::Owner.as_i32())
					.fetch_one(&mut *tx)
					.await?;
				if owners <= 1 {
					return Err(StoreError::LastOwner);
				}
			}

			let updated: MembershipRow = sqlx::query_as(&update_sql)
				.bind(role.as_i32())
				.bind(current.id)
				.fetch_one(&mut *tx)
				.await?;

			tx.commit().await?;
			updated
		});

		row.try_into()
	}

	async fn remove_membership(&self, conversation: ConversationId, user: UserId) -> Result<(), StoreError> {
		let now = unix_ms_now();

		with_pool!(self, |pool| {
			let mut tx = pool.begin().await?;

			sqlx::query(self.lock_conversation_sql())
				.bind(conversation.get())
				.execute(&mut *tx)
				.await?;

			let current: MembershipRow = sqlx::query_as(SELECT_ACTIVE_MEMBERSHIP)
				.bind(conversation.get())
				.bind(user.to_string())
				.fetch_optional(&mut *tx)
				.await?
				.ok_or(StoreError::MembershipNotFound)?;

			if current.role == Role::Owner.as_i32() {
				let (owners,): (i64,) = sqlx::query_as(COUNT_OWNERS)
					.bind(conversation.get())
					.bind(Role::Owner.as_i32())
					.fetch_one(&mut *tx)
					.await?;
				if owners <= 1 {
					return Err(StoreError::LastOwner);
				}
			}

			sqlx::query("UPDATE conversation_members SET deleted_at = $1 WHERE id = $2")
				.bind(now)
				.bind(current.id)
				.execute(&mut *tx)
				.await?;

			tx.commit().await?;
		});

		Ok(())
	}

	async fn count_owners(&self, conversation: ConversationId) -> Result<usize, StoreError> {
		let (owners,): (i64,) = with_pool!(self, |pool| {
			sqlx::query_as(COUNT_OWNERS)
				.bind(conversation.get())
				.bind(Role::Owner.as_i32())
				.fetch_one(pool)
				.await?
		});

		Ok(owners.max(0) as usize)
	}
}

#[async_trait]
impl MessageRepository for SqlStore {
	async fn insert_message(&self, new: NewMessage) -> Result<Message, StoreError> {
		let now = unix_ms_now();
		let sql = format!(
			"INSERT INTO messages (conversation_id, sender_id, content, attachment, created_at, updated_at) \
			VALUES ($1, $2, $3, $4, $5, $6) {MESSAGE_COLUMNS_RETURNING}"
		);

		let row: MessageRow = with_pool!(self, |pool| {
			let mut tx = pool.begin().await?;

			let row: MessageRow = sqlx::query_as(&sql)
				.bind(new.conversation_id.get())
				.bind(new.sender_id.to_string())
				.bind(&new.content)
				.bind(new.attachment.as_deref())
				.bind(now)
				.bind(now)
				.fetch_one(&mut *tx)
				.await?;

			sqlx::query("UPDATE conversations SET updated_at = $1 WHERE id = $2")
				.bind(now)
				.bind(new.conversation_id.get())
				.execute(&mut *tx)
				.await?;

			tx.commit().await?;
			row
		});

		row.try_into()
	}

	async fn get_message(&self, id: MessageId) -> Result<Message, StoreError> {
		let row: Option<MessageRow> = with_pool!(self, |pool| {
			sqlx::query_as(
				"SELECT id, conversation_id, sender_id, content, attachment, created_at, updated_at, deleted_at \
				FROM messages WHERE id = $1 AND deleted_at IS NULL",
			)
			.bind(id.get())
			.fetch_optional(pool)
			.await?
		});

		row.ok_or(StoreError::MessageNotFound)?.try_into()
	}

	async fn list_messages(&self, conversation: ConversationId, limit: usize) -> Result<Vec<Message>, StoreError> {
		let limit = i64::try_from(limit).unwrap_or(i64::MAX);

		let rows: Vec<MessageRow> = with_pool!(self, |pool| {
			sqlx::query_as(
				"SELECT id, conversation_id, sender_id, content, attachment, created_at, updated_at, deleted_at \
				FROM messages WHERE conversation_id = $1 AND deleted_at IS NULL \
				ORDER BY created_at DESC, id DESC LIMIT $2",
			)
			.bind(conversation.get())
			.bind(limit)
			.fetch_all(pool)
			.await?
		});

		rows.into_iter().map(Message::try_from).collect()
	}

	async fn update_message_content(&self, id: MessageId, content: &str) -> Result<Message, StoreError> {
		let now = unix_ms_now();
		let sql = format!(
			"UPDATE messages SET content = $1, updated_at = $2 WHERE id = $3 AND deleted_at IS NULL \
			{MESSAGE_COLUMNS_RETURNING}"
		);

		let row: Option<MessageRow> = with_pool!(self, |pool| {
			sqlx::query_as(&sql)
				.bind(content)
				.bind(now)
				.bind(id.get())
				.fetch_optional(pool)
				.await?
		});

		row.ok_or(StoreError::MessageNotFound)?.try_into()
	}

	async fn soft_delete_message(&self, id: MessageId) -> Result<(), StoreError> {
		let now = unix_ms_now();

		let affected = with_pool!(self, |pool| {
			sqlx::query("UPDATE messages SET deleted_at = $1, updated_at = $2 WHERE id = $3 AND deleted_at IS NULL")
				.bind(now)
				.bind(now)
				.bind(id.get())
				.execute(pool)
				.await?
				.rows_affected()
		});

		if affected == 0 {
			return Err(StoreError::MessageNotFound);
		}
		Ok(())
	}

	async fn mark_received(&self, receipt: MessageReceipt) -> Result<MessageReceipt, StoreError> {
		let row: Option<ReceiptRow> = with_pool!(self, |pool| {
			let mut tx = pool.begin().await?;

			let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM messages WHERE id = $1 AND deleted_at IS NULL")
				.bind(receipt.message_id.get())
				.fetch_optional(&mut *tx)
				.await?;

			match exists {
				None => None,
				Some(_) => {
					sqlx::query(
						"INSERT INTO message_receipts (message_id, user_id, received_at) VALUES ($1, $2, $3) \
						ON CONFLICT (message_id, user_id) DO NOTHING",
					)
					.bind(receipt.message_id.get())
					.bind(receipt.user_id.to_string())
					.bind(receipt.received_at)
					.execute(&mut *tx)
					.await?;

					let stored: ReceiptRow = sqlx::query_as(
						"SELECT message_id, user_id, received_at FROM message_receipts \
						WHERE message_id = $1 AND user_id = $2",
					)
					.bind(receipt.message_id.get())
					.bind(receipt.user_id.to_string())
					.fetch_one(&mut *tx)
					.await?;

					tx.commit().await?;
					Some(stored)
				}
			}
		});

		row.ok_or(StoreError::MessageNotFound)?.try_into()
	}

	async fn get_receipt(&self, id: MessageId, user: UserId) -> Result<Option<MessageReceipt>, StoreError> {
		let row: Option<ReceiptRow> = with_pool!(self, |pool| {
			sqlx::query_as(
				"SELECT message_id, user_id, received_at FROM message_receipts \
				WHERE message_id = $1 AND user_id = $2",
			)
			.bind(id.get())
			.bind(user.to_string())
			.fetch_optional(pool)
			.await?
		});

		row.map(MessageReceipt::try_from).transpose()
	}
}
