use std::collections::HashMap;

use tokio::sync::RwLock;

use super::error::{ConflictSnafu, InvariantViolationSnafu, NotFoundSnafu, StorageResult};
use super::ids::{ConversationId, MessageId};
use super::types::{
    ConversationRecord, GenerationOutcome, MessageRecord, NewConversation, NewMessage,
};
use super::{BoxFuture, BranchPointerStore, ConversationStore, MessageStore};

/// Process-local store with the same contract as [`super::SqliteStorage`].
///
/// Messages are kept in insertion order; listing sorts by `created_at` then id like the
/// SQL query does.
#[derive(Default)]
pub struct InMemoryStorage {
    state: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    conversations: Vec<ConversationRecord>,
    messages: Vec<MessageRecord>,
    branch_pointers: HashMap<ConversationId, MessageId>,
}

impl MemoryState {
    fn conversation_mut(
        &mut self,
        conversation_id: ConversationId,
    ) -> Option<&mut ConversationRecord> {
        self.conversations
            .iter_mut()
            .find(|conversation| conversation.id == conversation_id)
    }

    fn message(&self, message_id: MessageId) -> Option<&MessageRecord> {
        self.messages.iter().find(|message| message.id == message_id)
    }

    fn with_pointer(&self, conversation: &ConversationRecord) -> ConversationRecord {
        ConversationRecord {
            active_leaf_message_id: self.branch_pointers.get(&conversation.id).copied(),
            ..conversation.clone()
        }
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationStore for InMemoryStorage {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let record = ConversationRecord {
                id: ConversationId::new_v7(),
                title: input.normalized_title(),
                active_leaf_message_id: None,
                created_at_unix_ms: input.created_at_unix_ms,
                updated_at_unix_ms: input.created_at_unix_ms,
            };
            self.state.write().await.conversations.push(record.clone());
            Ok(record)
        })
    }

    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut conversations = state
                .conversations
                .iter()
                .map(|conversation| state.with_pointer(conversation))
                .collect::<Vec<_>>();
            conversations.sort_by(|left, right| {
                right
                    .updated_at_unix_ms
                    .cmp(&left.updated_at_unix_ms)
                    .then_with(|| right.id.cmp(&left.id))
            });
            Ok(conversations)
        })
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .conversations
                .iter()
                .find(|conversation| conversation.id == conversation_id)
                .map(|conversation| state.with_pointer(conversation)))
        })
    }

    fn touch_conversation(
        &self,
        conversation_id: ConversationId,
        updated_at_unix_ms: u64,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let Some(conversation) = state.conversation_mut(conversation_id) else {
                return NotFoundSnafu {
                    stage: "memory-conversation-touch-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            };
            conversation.updated_at_unix_ms =
                conversation.updated_at_unix_ms.max(updated_at_unix_ms);
            Ok(())
        })
    }

    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let before = state.conversations.len();
            state
                .conversations
                .retain(|conversation| conversation.id != conversation_id);
            if state.conversations.len() == before {
                return NotFoundSnafu {
                    stage: "memory-conversation-delete-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            state
                .messages
                .retain(|message| message.conversation_id != conversation_id);
            state.branch_pointers.remove(&conversation_id);
            Ok(())
        })
    }
}

impl BranchPointerStore for InMemoryStorage {
    fn load_active_leaf(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageId>>> {
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .await
                .branch_pointers
                .get(&conversation_id)
                .copied())
        })
    }

    fn upsert_active_leaf(
        &self,
        conversation_id: ConversationId,
        leaf_message_id: MessageId,
        _updated_at_unix_ms: u64,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let in_conversation = state
                .message(leaf_message_id)
                .is_some_and(|message| message.conversation_id == conversation_id);
            if !in_conversation {
                return NotFoundSnafu {
                    stage: "memory-branch-pointer-upsert-check-leaf",
                    entity: "message",
                    id: leaf_message_id.to_string(),
                }
                .fail();
            }

            state.branch_pointers.insert(conversation_id, leaf_message_id);
            Ok(())
        })
    }
}

impl MessageStore for InMemoryStorage {
    fn insert_message(&self, input: NewMessage) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if state.conversation_mut(input.conversation_id).is_none() {
                return NotFoundSnafu {
                    stage: "memory-message-insert-check-conversation",
                    entity: "conversation",
                    id: input.conversation_id.to_string(),
                }
                .fail();
            }

            if let Some(parent_message_id) = input.parent_message_id {
                let parent_in_conversation = state
                    .message(parent_message_id)
                    .is_some_and(|parent| parent.conversation_id == input.conversation_id);
                if !parent_in_conversation {
                    return NotFoundSnafu {
                        stage: "memory-message-insert-check-parent",
                        entity: "message",
                        id: parent_message_id.to_string(),
                    }
                    .fail();
                }
            }

            if let Some(version_group) = input.version_group {
                let slot_taken = state.messages.iter().any(|message| {
                    message.version_group == Some(version_group)
                        && message.version_number == input.version_number
                });
                if slot_taken {
                    return ConflictSnafu {
                        stage: "memory-message-insert-version-slot",
                        entity: "message",
                        details: format!(
                            "version {} is already taken in group {version_group}",
                            input.version_number
                        ),
                    }
                    .fail();
                }
            }

            let record = MessageRecord {
                id: MessageId::new_v7(),
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
            };
            state.messages.push(record.clone());
            Ok(record)
        })
    }

    fn get_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>> {
        Box::pin(async move { Ok(self.state.read().await.message(message_id).cloned()) })
    }

    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut messages = state
                .messages
                .iter()
                .filter(|message| message.conversation_id == conversation_id)
                .cloned()
                .collect::<Vec<_>>();
            messages.sort_by(|left, right| {
                left.created_at_unix_ms
                    .cmp(&right.created_at_unix_ms)
                    .then_with(|| left.id.cmp(&right.id))
            });
            Ok(messages)
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
                    stage: "memory-message-settle-status",
                    details: format!("cannot settle message '{message_id}' back to generating"),
                }
                .fail();
            }

            let mut state = self.state.write().await;
            let Some(message) = state
                .messages
                .iter_mut()
                .find(|message| message.id == message_id)
            else {
                return NotFoundSnafu {
                    stage: "memory-message-settle-load",
                    entity: "message",
                    id: message_id.to_string(),
                }
                .fail();
            };

            if message.status.is_terminal() {
                return Ok(None);
            }

            message.status = outcome.status;
            message.content = outcome.content;
            message.parts = outcome.parts;
            message.error = outcome.error;
            message.updated_at_unix_ms = outcome.updated_at_unix_ms;
            Ok(Some(message.clone()))
        })
    }

    fn list_stuck_generations(
        &self,
        cutoff_unix_ms: u64,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .messages
                .iter()
                .filter(|message| {
                    !message.status.is_terminal() && message.created_at_unix_ms < cutoff_unix_ms
                })
                .cloned()
                .collect())
        })
    }
}
