use std::sync::Arc;

use forkchat_storage::{ConversationId, MessageId, MessageRecord, Storage};
use snafu::ResultExt;

use super::error::{EngineResult, StorageSnafu};
use super::tree::find_default_leaf;

/// Where the displayed leaf of a conversation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafSource {
    /// The stored branch pointer.
    Pointer,
    /// Derived by [`find_default_leaf`] because no usable pointer exists.
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveLeaf {
    pub message_id: MessageId,
    pub source: LeafSource,
}

/// The per-conversation active-leaf cell. Writes are last-writer-wins.
#[derive(Clone)]
pub struct BranchPointer {
    storage: Arc<dyn Storage>,
}

impl BranchPointer {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Stored pointer when it names a message of `all`, otherwise the default leaf.
    pub async fn resolve(
        &self,
        conversation_id: ConversationId,
        all: &[MessageRecord],
    ) -> EngineResult<Option<ActiveLeaf>> {
        let stored = self
            .storage
            .load_active_leaf(conversation_id)
            .await
            .context(StorageSnafu {
                stage: "branch-pointer-load",
            })?;

        if let Some(message_id) = stored
            && all.iter().any(|message| message.id == message_id)
        {
            return Ok(Some(ActiveLeaf {
                message_id,
                source: LeafSource::Pointer,
            }));
        }

        Ok(find_default_leaf(all).map(|leaf| ActiveLeaf {
            message_id: leaf.id,
            source: LeafSource::Default,
        }))
    }

    pub async fn move_to(
        &self,
        conversation_id: ConversationId,
        leaf_message_id: MessageId,
        updated_at_unix_ms: u64,
    ) -> EngineResult<()> {
        self.storage
            .upsert_active_leaf(conversation_id, leaf_message_id, updated_at_unix_ms)
            .await
            .context(StorageSnafu {
                stage: "branch-pointer-upsert",
            })?;
        tracing::debug!(
            conversation_id = %conversation_id,
            leaf_message_id = %leaf_message_id,
            "moved branch pointer"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use forkchat_storage::{
        ConversationStore, InMemoryStorage, MessageRole, MessageStore, NewConversation, NewMessage,
    };

    use super::*;

    #[tokio::test]
    async fn prefers_the_pointer_over_the_default_leaf() {
        let storage = Arc::new(InMemoryStorage::new());
        let conversation = storage
            .create_conversation(NewConversation {
                title: "t".to_string(),
                created_at_unix_ms: 0,
            })
            .await
            .unwrap();
        let root = storage
            .insert_message(NewMessage::completed(
                conversation.id,
                MessageRole::User,
                "hi",
                1,
            ))
            .await
            .unwrap();
        let older = storage
            .insert_message(
                NewMessage::completed(conversation.id, MessageRole::Assistant, "a", 2)
                    .with_parent(Some(root.id)),
            )
            .await
            .unwrap();
        let newer = storage
            .insert_message(
                NewMessage::completed(conversation.id, MessageRole::Assistant, "b", 3)
                    .with_parent(Some(root.id)),
            )
            .await
            .unwrap();
        let all = storage.list_messages(conversation.id).await.unwrap();

        let pointer = BranchPointer::new(storage.clone());
        assert_eq!(
            pointer.resolve(conversation.id, &all).await.unwrap(),
            Some(ActiveLeaf {
                message_id: newer.id,
                source: LeafSource::Default,
            })
        );

        pointer.move_to(conversation.id, older.id, 4).await.unwrap();
        assert_eq!(
            pointer.resolve(conversation.id, &all).await.unwrap(),
            Some(ActiveLeaf {
                message_id: older.id,
                source: LeafSource::Pointer,
            })
        );
    }
}
