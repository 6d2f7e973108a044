use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    ConflictSnafu, CreateSqliteDirectorySnafu, DeserializePartsSnafu, InvariantViolationSnafu,
    NotFoundSnafu, SerializePartsSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu,
    SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::{ConversationId, MessageId, VersionGroupId};
use super::types::{
    ConversationRecord, GenerationOutcome, GenerationStatus, MessagePart, MessageRecord,
    MessageRole, NewConversation, NewMessage,
};
use super::{BoxFuture, BranchPointerStore, ConversationStore, MessageStore};

const MESSAGE_SELECT: &str = "SELECT id, conversation_id, role, content, parts_json, parent_message_id, version_group, version_number, status, error, model_id, created_at, updated_at FROM messages";

const CONVERSATION_SELECT: &str = "SELECT c.id, c.title, b.active_leaf_message_id, c.created_at, c.updated_at FROM conversations c LEFT JOIN branch_pointers b ON b.conversation_id = c.id";

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single long-lived connection keeps `sqlite::memory:` databases alive across calls
        // and serializes writers from concurrent generation tasks.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "sqlite storage ready");
        Ok(Self { pool })
    }

    async fn load_message(&self, message_id: MessageId) -> StorageResult<Option<MessageRecord>> {
        let query = format!("{MESSAGE_SELECT} WHERE id = ?");
        let row = sqlx::query_as::<_, MessageRow>(&query)
            .bind(message_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-load-query",
            })?;

        row.map(message_row_to_record).transpose()
    }

    async fn load_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Option<ConversationRecord>> {
        let query = format!("{CONVERSATION_SELECT} WHERE c.id = ?");
        let row = sqlx::query_as::<_, ConversationRow>(&query)
            .bind(conversation_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-load-query",
            })?;

        row.map(conversation_row_to_record).transpose()
    }

    async fn ensure_conversation_exists(
        &self,
        conversation_id: ConversationId,
        stage: &'static str,
    ) -> StorageResult<()> {
        let existing = sqlx::query_scalar::<_, i64>("SELECT 1 FROM conversations WHERE id = ?")
            .bind(conversation_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu { stage })?;

        if existing.is_none() {
            return NotFoundSnafu {
                stage,
                entity: "conversation",
                id: conversation_id.to_string(),
            }
            .fail();
        }

        Ok(())
    }

    async fn ensure_message_in_conversation(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        stage: &'static str,
    ) -> StorageResult<()> {
        let existing = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM messages WHERE conversation_id = ? AND id = ?",
        )
        .bind(conversation_id.to_string())
        .bind(message_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu { stage })?;

        if existing.is_none() {
            return NotFoundSnafu {
                stage,
                entity: "message",
                id: message_id.to_string(),
            }
            .fail();
        }

        Ok(())
    }
}

impl ConversationStore for SqliteStorage {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let conversation_id = ConversationId::new_v7();
            let title = input.normalized_title();
            let now = u64_to_i64(input.created_at_unix_ms, "conversation-create-created-at")?;

            sqlx::query(
                "INSERT INTO conversations (id, title, created_at, updated_at) VALUES (?, ?, ?, ?)",
            )
            .bind(conversation_id.to_string())
            .bind(title.clone())
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-create-insert",
            })?;

            Ok(ConversationRecord {
                id: conversation_id,
                title,
                active_leaf_message_id: None,
                created_at_unix_ms: input.created_at_unix_ms,
                updated_at_unix_ms: input.created_at_unix_ms,
            })
        })
    }

    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let query = format!("{CONVERSATION_SELECT} ORDER BY c.updated_at DESC, c.id DESC");
            let rows = sqlx::query_as::<_, ConversationRow>(&query)
                .fetch_all(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-list-query",
                })?;

            rows.into_iter().map(conversation_row_to_record).collect()
        })
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        Box::pin(self.load_conversation(conversation_id))
    }

    fn touch_conversation(
        &self,
        conversation_id: ConversationId,
        updated_at_unix_ms: u64,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let updated_at = u64_to_i64(updated_at_unix_ms, "conversation-touch-updated-at")?;
            // MAX keeps `updated_at` monotonic when a slow generation lands after a newer write.
            let result = sqlx::query(
                "UPDATE conversations SET updated_at = MAX(updated_at, ?) WHERE id = ?",
            )
            .bind(updated_at)
            .bind(conversation_id.to_string())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-touch-apply",
            })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "conversation-touch-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            Ok(())
        })
    }

    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(conversation_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-delete-apply",
                })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "conversation-delete-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            Ok(())
        })
    }
}

impl BranchPointerStore for SqliteStorage {
    fn load_active_leaf(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageId>>> {
        Box::pin(async move {
            let leaf = sqlx::query_scalar::<_, String>(
                "SELECT active_leaf_message_id FROM branch_pointers WHERE conversation_id = ?",
            )
            .bind(conversation_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "branch-pointer-load-query",
            })?;

            leaf.as_deref().map(MessageId::parse).transpose()
        })
    }

    fn upsert_active_leaf(
        &self,
        conversation_id: ConversationId,
        leaf_message_id: MessageId,
        updated_at_unix_ms: u64,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.ensure_message_in_conversation(
                conversation_id,
                leaf_message_id,
                "branch-pointer-upsert-check-leaf",
            )
            .await?;
            let updated_at = u64_to_i64(updated_at_unix_ms, "branch-pointer-upsert-updated-at")?;

            sqlx::query(
                "INSERT INTO branch_pointers (conversation_id, active_leaf_message_id, updated_at) VALUES (?, ?, ?) \
                 ON CONFLICT (conversation_id) DO UPDATE SET active_leaf_message_id = excluded.active_leaf_message_id, updated_at = excluded.updated_at",
            )
            .bind(conversation_id.to_string())
            .bind(leaf_message_id.to_string())
            .bind(updated_at)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "branch-pointer-upsert-apply",
            })?;

            Ok(())
        })
    }
}

impl MessageStore for SqliteStorage {
    fn insert_message(&self, input: NewMessage) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            self.ensure_conversation_exists(
                input.conversation_id,
                "message-insert-check-conversation",
            )
            .await?;
            if let Some(parent_message_id) = input.parent_message_id {
                self.ensure_message_in_conversation(
                    input.conversation_id,
                    parent_message_id,
                    "message-insert-check-parent",
                )
                .await?;
            }

            let message_id = MessageId::new_v7();
            let created_at = u64_to_i64(input.created_at_unix_ms, "message-insert-created-at")?;
            let parts_json = encode_parts(input.parts.as_deref(), "message-insert-encode-parts")?;

            let inserted = sqlx::query(
                "INSERT INTO messages (id, conversation_id, role, content, parts_json, parent_message_id, version_group, version_number, status, error, model_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(message_id.to_string())
            .bind(input.conversation_id.to_string())
            .bind(input.role.as_str())
            .bind(input.content.clone())
            .bind(parts_json)
            .bind(input.parent_message_id.map(|id| id.to_string()))
            .bind(input.version_group.map(|id| id.to_string()))
            .bind(i64::from(input.version_number))
            .bind(input.status.as_str())
            .bind(input.error.clone())
            .bind(input.model_id.clone())
            .bind(created_at)
            .bind(created_at)
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => {}
                Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                    return ConflictSnafu {
                        stage: "message-insert-version-slot",
                        entity: "message",
                        details: format!(
                            "version {} is already taken in group {:?}",
                            input.version_number, input.version_group
                        ),
                    }
                    .fail();
                }
                Err(source) => {
                    return Err(StorageError::SqliteQuery {
                        stage: "message-insert-apply",
                        source,
                    });
                }
            }

            Ok(MessageRecord {
                id: message_id,
                conversation_id: input.conversation_id,
                role: input.role,
                content: input.content,
                parts: input.parts,
                parent_message_id: input.parent_message_id,
                version_group: input.version_group,
                version_number: input.version_number,
                status: input.status,
                error: input.error,
                model_id: input.model_id,
                created_at_unix_ms: input.created_at_unix_ms,
                updated_at_unix_ms: input.created_at_unix_ms,
            })
        })
    }

    fn get_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>> {
        Box::pin(self.load_message(message_id))
    }

    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let query =
                format!("{MESSAGE_SELECT} WHERE conversation_id = ? ORDER BY created_at ASC, id ASC");
            let rows = sqlx::query_as::<_, MessageRow>(&query)
                .bind(conversation_id.to_string())
                .fetch_all(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-list-query",
                })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }

    fn settle_generation(
        &self,
        message_id: MessageId,
        outcome: GenerationOutcome,
    ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>> {
        Box::pin(async move {
            if !outcome.status.is_terminal() {
                return InvariantViolationSnafu {
                    stage: "message-settle-status",
                    details: format!("cannot settle message '{message_id}' back to generating"),
                }
                .fail();
            }

            let parts_json = encode_parts(outcome.parts.as_deref(), "message-settle-encode-parts")?;
            let updated_at = u64_to_i64(outcome.updated_at_unix_ms, "message-settle-updated-at")?;
            let result = sqlx::query(
                "UPDATE messages SET status = ?, content = ?, parts_json = ?, error = ?, updated_at = ? WHERE id = ? AND status = 'generating'",
            )
            .bind(outcome.status.as_str())
            .bind(outcome.content)
            .bind(parts_json)
            .bind(outcome.error)
            .bind(updated_at)
            .bind(message_id.to_string())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-settle-apply",
            })?;

            let row = self.load_message(message_id).await?.context(NotFoundSnafu {
                stage: "message-settle-load",
                entity: "message",
                id: message_id.to_string(),
            })?;

            if result.rows_affected() == 0 {
                return Ok(None);
            }

            Ok(Some(row))
        })
    }

    fn list_stuck_generations(
        &self,
        cutoff_unix_ms: u64,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let cutoff = u64_to_i64(cutoff_unix_ms, "message-stuck-cutoff")?;
            let query = format!(
                "{MESSAGE_SELECT} WHERE status = 'generating' AND created_at < ? ORDER BY created_at ASC, id ASC"
            );
            let rows = sqlx::query_as::<_, MessageRow>(&query)
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-stuck-query",
                })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    title: String,
    active_leaf_message_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    role: String,
    content: String,
    parts_json: Option<String>,
    parent_message_id: Option<String>,
    version_group: Option<String>,
    version_number: i64,
    status: String,
    error: Option<String>,
    model_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ConversationId::parse(&row.id)?,
        title: row.title,
        active_leaf_message_id: row
            .active_leaf_message_id
            .as_deref()
            .map(MessageId::parse)
            .transpose()?,
        created_at_unix_ms: i64_to_u64(row.created_at, "conversation-row-created-at")?,
        updated_at_unix_ms: i64_to_u64(row.updated_at, "conversation-row-updated-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        conversation_id: ConversationId::parse(&row.conversation_id)?,
        role: role_from_sql(&row.role)?,
        content: row.content,
        parts: decode_parts(row.parts_json.as_deref())?,
        parent_message_id: row
            .parent_message_id
            .as_deref()
            .map(MessageId::parse)
            .transpose()?,
        version_group: row
            .version_group
            .as_deref()
            .map(VersionGroupId::parse)
            .transpose()?,
        version_number: i64_to_u32(row.version_number, "message-row-version-number")?,
        status: status_from_sql(&row.status)?,
        error: row.error,
        model_id: row.model_id,
        created_at_unix_ms: i64_to_u64(row.created_at, "message-row-created-at")?,
        updated_at_unix_ms: i64_to_u64(row.updated_at, "message-row-updated-at")?,
    })
}

fn encode_parts(
    parts: Option<&[MessagePart]>,
    stage: &'static str,
) -> StorageResult<Option<String>> {
    parts
        .map(|parts| serde_json::to_string(parts).context(SerializePartsSnafu { stage }))
        .transpose()
}

fn decode_parts(raw: Option<&str>) -> StorageResult<Option<Vec<MessagePart>>> {
    raw.map(|raw| {
        serde_json::from_str(raw).context(DeserializePartsSnafu {
            stage: "message-row-parts",
        })
    })
    .transpose()
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "system" => Ok(MessageRole::System),
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn status_from_sql(raw: &str) -> StorageResult<GenerationStatus> {
    match raw {
        "generating" => Ok(GenerationStatus::Generating),
        "completed" => Ok(GenerationStatus::Completed),
        "failed" => Ok(GenerationStatus::Failed),
        _ => InvariantViolationSnafu {
            stage: "message-status-from-sql",
            details: format!("unknown generation status '{raw}'"),
        }
        .fail(),
    }
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value.try_into().map_err(|_| StorageError::InvariantViolation {
        stage,
        details: format!("negative sqlite integer '{value}' cannot map to u64"),
    })
}

fn i64_to_u32(value: i64, stage: &'static str) -> StorageResult<u32> {
    value.try_into().map_err(|_| StorageError::InvariantViolation {
        stage,
        details: format!("sqlite integer '{value}' cannot map to u32"),
    })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value.try_into().map_err(|_| StorageError::InvariantViolation {
        stage,
        details: format!("u64 '{value}' cannot map to sqlite i64"),
    })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_memory() -> SqliteStorage {
        SqliteStorage::open(":memory:").await.unwrap()
    }

    async fn new_conversation(storage: &SqliteStorage) -> ConversationRecord {
        storage
            .create_conversation(NewConversation {
                title: "branching".to_string(),
                created_at_unix_ms: 1_000,
            })
            .await
            .unwrap()
    }

    fn generating(conversation_id: ConversationId, parent: MessageId, at: u64) -> NewMessage {
        NewMessage {
            status: GenerationStatus::Generating,
            model_id: Some("gpt-4o-mini".to_string()),
            ..NewMessage::completed(conversation_id, MessageRole::Assistant, "", at)
                .with_parent(Some(parent))
                .with_version(VersionGroupId::new_v7(), 1)
        }
    }

    #[test]
    fn memory_locations_normalize_to_sqlite_urls() {
        assert_eq!(normalize_database_url(":memory:"), "sqlite::memory:");
        assert_eq!(normalize_database_url("sqlite://a.db"), "sqlite://a.db");
        assert_eq!(normalize_database_url("data/a.db"), "sqlite://data/a.db");
    }

    #[tokio::test]
    async fn lists_messages_in_creation_order_with_parts() {
        let storage = open_memory().await;
        let conversation = new_conversation(&storage).await;

        let user = storage
            .insert_message(NewMessage::completed(
                conversation.id,
                MessageRole::User,
                "hello",
                2_000,
            ))
            .await
            .unwrap();
        let reply = NewMessage {
            parts: Some(vec![MessagePart::Text {
                text: "hi".to_string(),
            }]),
            ..NewMessage::completed(conversation.id, MessageRole::Assistant, "hi", 1_500)
                .with_parent(Some(user.id))
        };
        let reply = storage.insert_message(reply).await.unwrap();

        let listed = storage.list_messages(conversation.id).await.unwrap();
        assert_eq!(listed, vec![reply.clone(), user.clone()]);
        assert_eq!(
            storage.get_message(reply.id).await.unwrap(),
            Some(reply.clone())
        );
    }

    #[tokio::test]
    async fn rejects_parents_from_other_conversations() {
        let storage = open_memory().await;
        let first = new_conversation(&storage).await;
        let second = new_conversation(&storage).await;
        let foreign = storage
            .insert_message(NewMessage::completed(first.id, MessageRole::User, "a", 1))
            .await
            .unwrap();

        let error = storage
            .insert_message(
                NewMessage::completed(second.id, MessageRole::User, "b", 2)
                    .with_parent(Some(foreign.id)),
            )
            .await
            .unwrap_err();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn duplicate_version_slots_conflict() {
        let storage = open_memory().await;
        let conversation = new_conversation(&storage).await;
        let group = VersionGroupId::new_v7();

        storage
            .insert_message(
                NewMessage::completed(conversation.id, MessageRole::User, "v1", 1)
                    .with_version(group, 1),
            )
            .await
            .unwrap();
        let error = storage
            .insert_message(
                NewMessage::completed(conversation.id, MessageRole::User, "v1 again", 2)
                    .with_version(group, 1),
            )
            .await
            .unwrap_err();

        assert!(matches!(error, StorageError::Conflict { .. }));
    }

    #[tokio::test]
    async fn settles_generating_rows_exactly_once() {
        let storage = open_memory().await;
        let conversation = new_conversation(&storage).await;
        let user = storage
            .insert_message(NewMessage::completed(conversation.id, MessageRole::User, "q", 1))
            .await
            .unwrap();
        let pending = storage
            .insert_message(generating(conversation.id, user.id, 2))
            .await
            .unwrap();

        let completed = GenerationOutcome {
            status: GenerationStatus::Completed,
            content: "answer".to_string(),
            parts: Some(vec![MessagePart::Text {
                text: "answer".to_string(),
            }]),
            error: None,
            updated_at_unix_ms: 10,
        };
        let settled = storage
            .settle_generation(pending.id, completed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled.status, GenerationStatus::Completed);
        assert_eq!(settled.content, "answer");
        assert_eq!(settled.updated_at_unix_ms, 10);

        let late_failure = GenerationOutcome::failed("too late", "", None, 11);
        assert_eq!(
            storage.settle_generation(pending.id, late_failure).await.unwrap(),
            None
        );
        let reloaded = storage.get_message(pending.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, GenerationStatus::Completed);

        let missing = GenerationOutcome::failed("gone", "", None, 12);
        let error = storage
            .settle_generation(MessageId::new_v7(), missing)
            .await
            .unwrap_err();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn stuck_generations_respect_the_cutoff() {
        let storage = open_memory().await;
        let conversation = new_conversation(&storage).await;
        let user = storage
            .insert_message(NewMessage::completed(conversation.id, MessageRole::User, "q", 1))
            .await
            .unwrap();
        let old = storage
            .insert_message(generating(conversation.id, user.id, 100))
            .await
            .unwrap();
        storage
            .insert_message(generating(conversation.id, user.id, 500))
            .await
            .unwrap();

        let stuck = storage.list_stuck_generations(500).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, old.id);
    }

    #[tokio::test]
    async fn branch_pointer_upserts_and_surfaces_on_conversation() {
        let storage = open_memory().await;
        let conversation = new_conversation(&storage).await;
        assert_eq!(storage.load_active_leaf(conversation.id).await.unwrap(), None);

        let first = storage
            .insert_message(NewMessage::completed(conversation.id, MessageRole::User, "a", 1))
            .await
            .unwrap();
        let second = storage
            .insert_message(NewMessage::completed(conversation.id, MessageRole::User, "b", 2))
            .await
            .unwrap();

        storage
            .upsert_active_leaf(conversation.id, first.id, 3)
            .await
            .unwrap();
        storage
            .upsert_active_leaf(conversation.id, second.id, 4)
            .await
            .unwrap();

        assert_eq!(
            storage.load_active_leaf(conversation.id).await.unwrap(),
            Some(second.id)
        );
        let reloaded = storage
            .get_conversation(conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.active_leaf_message_id, Some(second.id));
    }

    #[tokio::test]
    async fn deleting_a_conversation_cascades() {
        let storage = open_memory().await;
        let conversation = new_conversation(&storage).await;
        let root = storage
            .insert_message(NewMessage::completed(conversation.id, MessageRole::User, "a", 1))
            .await
            .unwrap();
        let child = storage
            .insert_message(
                NewMessage::completed(conversation.id, MessageRole::Assistant, "b", 2)
                    .with_parent(Some(root.id)),
            )
            .await
            .unwrap();
        storage
            .upsert_active_leaf(conversation.id, child.id, 3)
            .await
            .unwrap();

        storage.delete_conversation(conversation.id).await.unwrap();

        assert_eq!(storage.get_conversation(conversation.id).await.unwrap(), None);
        assert_eq!(storage.get_message(child.id).await.unwrap(), None);
        assert!(
            storage
                .delete_conversation(conversation.id)
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn touch_never_moves_updated_at_backwards() {
        let storage = open_memory().await;
        let conversation = new_conversation(&storage).await;

        storage.touch_conversation(conversation.id, 5_000).await.unwrap();
        storage.touch_conversation(conversation.id, 4_000).await.unwrap();

        let listed = storage.list_conversations().await.unwrap();
        assert_eq!(listed[0].updated_at_unix_ms, 5_000);
    }
}
