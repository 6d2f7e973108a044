use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, MessageId, VersionGroupId};
pub use memory::InMemoryStorage;
pub use sqlite::SqliteStorage;
pub use types::{
    ConversationRecord, DEFAULT_CONVERSATION_TITLE, GenerationOutcome, GenerationStatus,
    MessagePart, MessageRecord, MessageRole, NewConversation, NewMessage,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait ConversationStore: Send + Sync {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>>;
    /// Most recently updated first.
    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>>;
    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>>;
    fn touch_conversation(
        &self,
        conversation_id: ConversationId,
        updated_at_unix_ms: u64,
    ) -> BoxFuture<'_, StorageResult<()>>;
    /// Removes the conversation together with every message and its branch pointer.
    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<()>>;
}

pub trait BranchPointerStore: Send + Sync {
    fn load_active_leaf(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageId>>>;
    /// Insert-or-replace; the last writer wins.
    fn upsert_active_leaf(
        &self,
        conversation_id: ConversationId,
        leaf_message_id: MessageId,
        updated_at_unix_ms: u64,
    ) -> BoxFuture<'_, StorageResult<()>>;
}

pub trait MessageStore: Send + Sync {
    fn insert_message(&self, input: NewMessage) -> BoxFuture<'_, StorageResult<MessageRecord>>;
    fn get_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>>;
    /// Every message of the conversation ordered by `created_at`, then id.
    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;
    /// Applies `outcome` only if the row is still `generating`.
    ///
    /// Returns `None` when the row exists but already reached a terminal state.
    fn settle_generation(
        &self,
        message_id: MessageId,
        outcome: GenerationOutcome,
    ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>>;
    /// `generating` rows created strictly before `cutoff_unix_ms`.
    fn list_stuck_generations(
        &self,
        cutoff_unix_ms: u64,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;
}

pub trait Storage: ConversationStore + BranchPointerStore + MessageStore {}

impl<T> Storage for T where T: ConversationStore + BranchPointerStore + MessageStore {}
