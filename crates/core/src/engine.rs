use std::sync::Arc;

use forkchat_llm::{LlmProvider, ProviderMessage, Role, StreamRequest};
use forkchat_storage::{
    ConversationId, ConversationRecord, GenerationStatus, MessageId, MessageRecord, MessageRole,
    NewConversation, NewMessage, Storage, VersionGroupId,
};
use snafu::{OptionExt, ResultExt, ensure};

use super::branch::{BranchPointer, LeafSource};
use super::error::{
    EmptyContentSnafu, EngineResult, NotAUserMessageSnafu, NotAnAssistantMessageSnafu,
    NotFoundSnafu, ProviderNotConfiguredSnafu, StorageSnafu, VersionGroupMismatchSnafu,
};
use super::generation::{
    GenerationHandle, GenerationLifecycle, GenerationPlan, GenerationStatusReport, load_status,
};
use super::now_unix_ms;
use super::reaper::StuckGenerationReaper;
use super::tree::{ChainEntry, attach_version_info, build_chain, resolve_leaf_of};
use super::version::{VersionLocks, new_turn};

/// Request shaping applied to every generation the engine starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineSettings {
    /// Falls back to the provider's default model when unset.
    pub model_id: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

/// What a reader sees: the active branch of one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationView {
    pub conversation: ConversationRecord,
    pub entries: Vec<ChainEntry>,
    pub active_leaf_message_id: Option<MessageId>,
    pub leaf_source: Option<LeafSource>,
}

/// A new or edited user turn together with the generation answering it.
pub struct TurnHandle {
    pub user_message: MessageRecord,
    pub generation: GenerationHandle,
}

/// Entry point for callers. Read paths work without a provider; anything that generates
/// fails with [`EngineError::ProviderNotConfigured`] until one is attached.
pub struct ConversationEngine {
    storage: Arc<dyn Storage>,
    generation: Option<GenerationLifecycle>,
    pointer: BranchPointer,
    locks: VersionLocks,
    settings: EngineSettings,
}

impl ConversationEngine {
    pub fn new(storage: Arc<dyn Storage>, settings: EngineSettings) -> Self {
        Self {
            generation: None,
            pointer: BranchPointer::new(storage.clone()),
            locks: VersionLocks::default(),
            storage,
            settings,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.generation = Some(GenerationLifecycle::new(self.storage.clone(), provider));
        self
    }

    pub async fn create_conversation(&self, title: &str) -> EngineResult<ConversationRecord> {
        let conversation = self
            .storage
            .create_conversation(NewConversation {
                title: title.to_string(),
                created_at_unix_ms: now_unix_ms(),
            })
            .await
            .context(StorageSnafu {
                stage: "engine-create-conversation",
            })?;
        tracing::info!(conversation_id = %conversation.id, "created conversation");
        Ok(conversation)
    }

    pub async fn list_conversations(&self) -> EngineResult<Vec<ConversationRecord>> {
        self.storage
            .list_conversations()
            .await
            .context(StorageSnafu {
                stage: "engine-list-conversations",
            })
    }

    pub async fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> EngineResult<ConversationRecord> {
        let conversation = self
            .storage
            .get_conversation(conversation_id)
            .await
            .context(StorageSnafu {
                stage: "engine-get-conversation",
            })?;
        conversation.ok_or_else(|| {
            NotFoundSnafu {
                stage: "engine-get-conversation",
                entity: "conversation",
                id: conversation_id.to_string(),
            }
            .build()
        })
    }

    pub async fn delete_conversation(&self, conversation_id: ConversationId) -> EngineResult<()> {
        self.storage
            .delete_conversation(conversation_id)
            .await
            .context(StorageSnafu {
                stage: "engine-delete-conversation",
            })?;
        tracing::info!(conversation_id = %conversation_id, "deleted conversation");
        Ok(())
    }

    /// Appends a user turn under the active leaf and starts answering it.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
    ) -> EngineResult<TurnHandle> {
        ensure!(
            !content.trim().is_empty(),
            EmptyContentSnafu {
                stage: "engine-send-message",
            }
        );
        let generation = self.generation("engine-send-message")?;
        self.get_conversation(conversation_id).await?;

        let all = self.list_messages(conversation_id).await?;
        let parent_message_id = self
            .pointer
            .resolve(conversation_id, &all)
            .await?
            .map(|leaf| leaf.message_id);

        let slot = new_turn(&all, None);
        let user_message = self
            .insert_user_turn(
                NewMessage::completed(conversation_id, MessageRole::User, content, now_unix_ms())
                    .with_parent(parent_message_id)
                    .with_version(slot.version_group, slot.version_number),
            )
            .await?;

        let generation = self.answer(generation, &user_message, all).await?;
        Ok(TurnHandle {
            user_message,
            generation,
        })
    }

    /// Adds `content` as a new version of a user turn and answers it on a fresh branch.
    pub async fn edit_message(
        &self,
        message_id: MessageId,
        content: &str,
    ) -> EngineResult<TurnHandle> {
        let original = self.load_message(message_id, "engine-edit-message").await?;
        ensure!(
            original.role == MessageRole::User,
            NotAUserMessageSnafu {
                stage: "engine-edit-message",
                message_id,
                role: original.role.as_str(),
            }
        );
        ensure!(
            !content.trim().is_empty(),
            EmptyContentSnafu {
                stage: "engine-edit-message",
            }
        );
        let generation = self.generation("engine-edit-message")?;

        // An ungrouped original starts a new group at version 1 and stays outside it.
        let version_group = original.version_group.unwrap_or_else(VersionGroupId::new_v7);
        let (user_message, all) = {
            let _guard = self.locks.acquire(version_group).await;
            let all = self.list_messages(original.conversation_id).await?;
            let slot = new_turn(&all, Some(version_group));
            let user_message = self
                .insert_user_turn(
                    NewMessage::completed(
                        original.conversation_id,
                        MessageRole::User,
                        content,
                        now_unix_ms(),
                    )
                    .with_parent(original.parent_message_id)
                    .with_version(slot.version_group, slot.version_number),
                )
                .await?;
            (user_message, all)
        };
        tracing::info!(
            original_message_id = %message_id,
            message_id = %user_message.id,
            version_number = user_message.version_number,
            "edited user message"
        );

        let generation = self.answer(generation, &user_message, all).await?;
        Ok(TurnHandle {
            user_message,
            generation,
        })
    }

    /// Starts a new version of an assistant turn against the same parent.
    pub async fn regenerate(&self, message_id: MessageId) -> EngineResult<GenerationHandle> {
        let generation = self.generation("engine-regenerate")?;
        let (plan, _guard) = self.plan_regeneration(generation, message_id).await?;
        generation.start(plan).await
    }

    /// Like [`Self::regenerate`] but streams within the call and inserts only the final row.
    pub async fn regenerate_inline(&self, message_id: MessageId) -> EngineResult<MessageRecord> {
        let generation = self.generation("engine-regenerate-inline")?;
        let (plan, _guard) = self.plan_regeneration(generation, message_id).await?;
        generation.run_inline(plan).await
    }

    /// Points the conversation at the newest leaf below `target_message_id`, which must be a
    /// version of `current_message_id`.
    pub async fn switch_version(
        &self,
        current_message_id: MessageId,
        target_message_id: MessageId,
    ) -> EngineResult<ConversationView> {
        let current = self
            .load_message(current_message_id, "engine-switch-version-current")
            .await?;
        let target = self
            .load_message(target_message_id, "engine-switch-version-target")
            .await?;

        let same_group = current.version_group.is_some()
            && current.version_group == target.version_group
            && current.conversation_id == target.conversation_id;
        ensure!(
            same_group,
            VersionGroupMismatchSnafu {
                stage: "engine-switch-version",
                current: current_message_id,
                target: target_message_id,
            }
        );

        let all = self.list_messages(target.conversation_id).await?;
        let leaf_message_id = resolve_leaf_of(&all, target.id);
        self.pointer
            .move_to(target.conversation_id, leaf_message_id, now_unix_ms())
            .await?;
        tracing::info!(
            from_message_id = %current_message_id,
            to_message_id = %target_message_id,
            leaf_message_id = %leaf_message_id,
            "switched version"
        );

        self.load_view(target.conversation_id).await
    }

    pub async fn load_view(
        &self,
        conversation_id: ConversationId,
    ) -> EngineResult<ConversationView> {
        let conversation = self.get_conversation(conversation_id).await?;
        let all = self.list_messages(conversation_id).await?;
        let active_leaf = self.pointer.resolve(conversation_id, &all).await?;

        let entries = match active_leaf {
            Some(leaf) => attach_version_info(&build_chain(&all, leaf.message_id), &all),
            None => Vec::new(),
        };

        Ok(ConversationView {
            conversation,
            entries,
            active_leaf_message_id: active_leaf.map(|leaf| leaf.message_id),
            leaf_source: active_leaf.map(|leaf| leaf.source),
        })
    }

    pub async fn get_status(&self, message_id: MessageId) -> EngineResult<GenerationStatusReport> {
        load_status(self.storage.as_ref(), message_id).await
    }

    pub fn reaper(&self) -> StuckGenerationReaper {
        StuckGenerationReaper::new(self.storage.clone())
    }

    async fn plan_regeneration(
        &self,
        generation: &GenerationLifecycle,
        message_id: MessageId,
    ) -> EngineResult<(GenerationPlan, tokio::sync::OwnedMutexGuard<()>)> {
        let original = self.load_message(message_id, "engine-regenerate").await?;
        ensure!(
            original.role == MessageRole::Assistant,
            NotAnAssistantMessageSnafu {
                stage: "engine-regenerate",
                message_id,
                role: original.role.as_str(),
            }
        );
        let Some(parent_message_id) = original.parent_message_id else {
            return NotFoundSnafu {
                stage: "engine-regenerate-parent",
                entity: "parent of message",
                id: message_id.to_string(),
            }
            .fail();
        };

        // An ungrouped original starts a new group at version 1 and stays outside it.
        let version_group = original.version_group.unwrap_or_else(VersionGroupId::new_v7);
        // Held until the caller has inserted the new version.
        let guard = self.locks.acquire(version_group).await;
        let all = self.list_messages(original.conversation_id).await?;
        let slot = new_turn(&all, Some(version_group));
        let chain = build_chain(&all, parent_message_id);

        let plan = GenerationPlan {
            conversation_id: original.conversation_id,
            parent_message_id,
            slot,
            request: self.stream_request(generation, &chain),
        };
        Ok((plan, guard))
    }

    async fn answer(
        &self,
        generation: &GenerationLifecycle,
        user_message: &MessageRecord,
        mut all: Vec<MessageRecord>,
    ) -> EngineResult<GenerationHandle> {
        all.push(user_message.clone());
        let chain = build_chain(&all, user_message.id);
        let plan = GenerationPlan {
            conversation_id: user_message.conversation_id,
            parent_message_id: user_message.id,
            slot: new_turn(&all, None),
            request: self.stream_request(generation, &chain),
        };
        generation.start(plan).await
    }

    async fn insert_user_turn(&self, input: NewMessage) -> EngineResult<MessageRecord> {
        let conversation_id = input.conversation_id;
        let created_at_unix_ms = input.created_at_unix_ms;
        let message = self
            .storage
            .insert_message(input)
            .await
            .context(StorageSnafu {
                stage: "engine-insert-user-message",
            })?;
        self.storage
            .touch_conversation(conversation_id, created_at_unix_ms)
            .await
            .context(StorageSnafu {
                stage: "engine-touch-conversation",
            })?;
        Ok(message)
    }

    fn generation(&self, stage: &'static str) -> EngineResult<&GenerationLifecycle> {
        self.generation
            .as_ref()
            .context(ProviderNotConfiguredSnafu { stage })
    }

    fn stream_request(
        &self,
        generation: &GenerationLifecycle,
        chain: &[MessageRecord],
    ) -> StreamRequest {
        let model_id = self
            .settings
            .model_id
            .clone()
            .unwrap_or_else(|| generation.default_model().to_string());
        let mut request = StreamRequest::new(model_id, assemble_prompt(chain));
        if let Some(system_prompt) = &self.settings.system_prompt
            && !system_prompt.trim().is_empty()
        {
            request = request.with_preamble(system_prompt.clone());
        }
        if let Some(temperature) = self.settings.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.settings.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> EngineResult<Vec<MessageRecord>> {
        self.storage
            .list_messages(conversation_id)
            .await
            .context(StorageSnafu {
                stage: "engine-list-messages",
            })
    }

    async fn load_message(
        &self,
        message_id: MessageId,
        stage: &'static str,
    ) -> EngineResult<MessageRecord> {
        let message = self
            .storage
            .get_message(message_id)
            .await
            .context(StorageSnafu { stage })?;
        message.ok_or_else(|| {
            NotFoundSnafu {
                stage,
                entity: "message",
                id: message_id.to_string(),
            }
            .build()
        })
    }
}

/// Backend prompt for a transcript. Assistant turns that did not complete are left out, and so
/// is blank content.
pub fn assemble_prompt(chain: &[MessageRecord]) -> Vec<ProviderMessage> {
    chain
        .iter()
        .filter(|message| !message.content.trim().is_empty())
        .filter(|message| {
            message.role != MessageRole::Assistant || message.status == GenerationStatus::Completed
        })
        .map(|message| ProviderMessage::new(provider_role(message.role), message.content.clone()))
        .collect()
}

fn provider_role(role: MessageRole) -> Role {
    match role {
        MessageRole::System => Role::System,
        MessageRole::User => Role::User,
        MessageRole::Assistant => Role::Assistant,
    }
}

#[cfg(test)]
mod tests {
    use forkchat_llm::ScriptedProvider;
    use forkchat_storage::{DEFAULT_CONVERSATION_TITLE, InMemoryStorage, MessageStore};

    use super::*;
    use crate::error::EngineError;
    use crate::test_support::message;
    use crate::version::siblings_of;

    fn engine() -> (Arc<InMemoryStorage>, Arc<ScriptedProvider>, ConversationEngine) {
        let storage = Arc::new(InMemoryStorage::new());
        let provider = Arc::new(ScriptedProvider::default());
        let engine = ConversationEngine::new(
            storage.clone(),
            EngineSettings {
                system_prompt: Some("be kind".to_string()),
                ..EngineSettings::default()
            },
        )
        .with_provider(provider.clone());
        (storage, provider, engine)
    }

    async fn settle(generation: GenerationHandle) -> MessageRecord {
        generation.task.await.unwrap().unwrap()
    }

    fn contents(view: &ConversationView) -> Vec<&str> {
        view.entries
            .iter()
            .map(|entry| entry.message.content.as_str())
            .collect()
    }

    fn expect_err<T>(result: EngineResult<T>) -> EngineError {
        match result {
            Ok(_) => panic!("expected the engine to reject the request"),
            Err(error) => error,
        }
    }

    #[tokio::test]
    async fn send_message_answers_under_the_active_leaf() {
        let (_, provider, engine) = engine();
        provider.push_reply("hello back").push_reply("second answer");

        let conversation = engine.create_conversation("  ").await.unwrap();
        assert_eq!(conversation.title, DEFAULT_CONVERSATION_TITLE);
        let empty = engine.load_view(conversation.id).await.unwrap();
        assert!(empty.entries.is_empty());
        assert_eq!(empty.active_leaf_message_id, None);

        let first = engine.send_message(conversation.id, "hello").await.unwrap();
        assert_eq!(first.user_message.parent_message_id, None);
        assert_eq!(
            first.generation.message.parent_message_id,
            Some(first.user_message.id)
        );
        assert_eq!(first.generation.message.status, GenerationStatus::Generating);
        let first_reply = settle(first.generation).await;

        let second = engine.send_message(conversation.id, "again").await.unwrap();
        assert_eq!(second.user_message.parent_message_id, Some(first_reply.id));
        let second_reply = settle(second.generation).await;

        let view = engine.load_view(conversation.id).await.unwrap();
        assert_eq!(
            contents(&view),
            vec!["hello", "hello back", "again", "second answer"]
        );
        assert_eq!(view.active_leaf_message_id, Some(second_reply.id));
        assert_eq!(view.leaf_source, Some(LeafSource::Pointer));

        let requests = provider.requests();
        assert_eq!(requests[0].preamble.as_deref(), Some("be kind"));
        assert_eq!(requests[0].model_id, "scripted-model");
        assert_eq!(
            requests[1].messages,
            vec![
                ProviderMessage::new(Role::User, "hello"),
                ProviderMessage::new(Role::Assistant, "hello back"),
                ProviderMessage::new(Role::User, "again"),
            ]
        );
    }

    #[tokio::test]
    async fn edit_creates_a_sibling_user_turn_with_a_fresh_answer() {
        let (_, provider, engine) = engine();
        provider.push_reply("draft answer").push_reply("final answer");
        let conversation = engine.create_conversation("edits").await.unwrap();

        let first = engine.send_message(conversation.id, "draft").await.unwrap();
        let first_user = first.user_message.clone();
        let first_reply = settle(first.generation).await;

        let edited = engine.edit_message(first_user.id, "final").await.unwrap();
        assert_eq!(
            edited.user_message.parent_message_id,
            first_user.parent_message_id
        );
        assert_eq!(edited.user_message.version_group, first_user.version_group);
        assert_eq!(edited.user_message.version_number, 2);

        let edited_user_id = edited.user_message.id;
        let new_reply = settle(edited.generation).await;
        assert_eq!(new_reply.parent_message_id, Some(edited_user_id));
        assert_eq!(new_reply.version_number, 1);
        assert_ne!(new_reply.version_group, first_reply.version_group);

        let view = engine.load_view(conversation.id).await.unwrap();
        assert_eq!(contents(&view), vec!["final", "final answer"]);
        let user_versions = view.entries[0].version.as_ref().unwrap();
        assert_eq!(user_versions.total_versions, 2);
        assert_eq!(user_versions.sibling_ids, vec![first_user.id, edited_user_id]);

        assert_eq!(
            provider.requests()[1].messages,
            vec![ProviderMessage::new(Role::User, "final")]
        );
    }

    #[tokio::test]
    async fn regenerate_adds_a_version_without_touching_the_user_turn() {
        let (storage, provider, engine) = engine();
        provider.push_reply("one").push_reply("two");
        let conversation = engine.create_conversation("regen").await.unwrap();

        let first = engine.send_message(conversation.id, "q").await.unwrap();
        let first_reply = settle(first.generation).await;

        let regenerated = engine.regenerate(first_reply.id).await.unwrap();
        assert_eq!(
            regenerated.message.parent_message_id,
            first_reply.parent_message_id
        );
        assert_eq!(regenerated.message.version_group, first_reply.version_group);
        assert_eq!(regenerated.message.version_number, 2);
        settle(regenerated).await;

        let view = engine.load_view(conversation.id).await.unwrap();
        assert_eq!(contents(&view), vec!["q", "two"]);
        assert_eq!(
            view.entries[1]
                .version
                .as_ref()
                .map(|info| info.total_versions),
            Some(2)
        );

        let users = storage
            .list_messages(conversation.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|message| message.role == MessageRole::User)
            .count();
        assert_eq!(users, 1);
        assert_eq!(
            provider.requests()[1].messages,
            vec![ProviderMessage::new(Role::User, "q")]
        );
    }

    #[tokio::test]
    async fn switching_versions_follows_the_newest_descendant() {
        let (_, provider, engine) = engine();
        provider
            .push_reply("one")
            .push_reply("two")
            .push_reply("three");
        let conversation = engine.create_conversation("switch").await.unwrap();

        let first = engine.send_message(conversation.id, "q").await.unwrap();
        let one = settle(first.generation).await;
        let two = settle(engine.regenerate(one.id).await.unwrap()).await;
        let follow_up = engine.send_message(conversation.id, "more").await.unwrap();
        assert_eq!(follow_up.user_message.parent_message_id, Some(two.id));
        let three = settle(follow_up.generation).await;

        let view = engine.switch_version(two.id, one.id).await.unwrap();
        assert_eq!(view.active_leaf_message_id, Some(one.id));
        assert_eq!(contents(&view), vec!["q", "one"]);

        let view = engine.switch_version(one.id, two.id).await.unwrap();
        assert_eq!(view.active_leaf_message_id, Some(three.id));
        assert_eq!(contents(&view), vec!["q", "two", "more", "three"]);
    }

    #[tokio::test]
    async fn failed_generations_leave_the_pointer_on_the_last_good_leaf() {
        let (_, provider, engine) = engine();
        provider.push_reply("fine").push_failure("boom");
        let conversation = engine.create_conversation("fail").await.unwrap();

        let first = engine.send_message(conversation.id, "q").await.unwrap();
        let good = settle(first.generation).await;
        let second = engine.send_message(conversation.id, "again").await.unwrap();
        let failed = settle(second.generation).await;

        let status = engine.get_status(failed.id).await.unwrap();
        assert_eq!(status.status, GenerationStatus::Failed);
        assert_eq!(status.error.as_deref(), Some("boom"));

        let view = engine.load_view(conversation.id).await.unwrap();
        assert_eq!(view.active_leaf_message_id, Some(good.id));
        assert_eq!(contents(&view), vec!["q", "fine"]);
    }

    #[tokio::test]
    async fn rejects_invalid_requests_before_mutating() {
        let (storage, provider, engine) = engine();
        provider.push_reply("a");
        let conversation = engine.create_conversation("guards").await.unwrap();
        let first = engine.send_message(conversation.id, "q").await.unwrap();
        let user = first.user_message.clone();
        let reply = settle(first.generation).await;
        let before = storage.list_messages(conversation.id).await.unwrap().len();

        let rejected = vec![
            expect_err(engine.edit_message(reply.id, "x").await),
            expect_err(engine.regenerate(user.id).await),
            expect_err(engine.edit_message(user.id, "   ").await),
            expect_err(engine.send_message(conversation.id, "").await),
            expect_err(engine.switch_version(user.id, reply.id).await),
        ];
        assert!(matches!(rejected[0], EngineError::NotAUserMessage { .. }));
        assert!(matches!(rejected[1], EngineError::NotAnAssistantMessage { .. }));
        assert!(matches!(rejected[2], EngineError::EmptyContent { .. }));
        assert!(matches!(rejected[4], EngineError::VersionGroupMismatch { .. }));
        assert!(rejected.iter().all(EngineError::is_invalid_request));
        assert_eq!(
            storage.list_messages(conversation.id).await.unwrap().len(),
            before
        );

        assert!(
            expect_err(engine.send_message(ConversationId::new_v7(), "hi").await).is_not_found()
        );
        assert!(expect_err(engine.edit_message(MessageId::new_v7(), "x").await).is_not_found());
        assert!(expect_err(engine.get_status(MessageId::new_v7()).await).is_not_found());
    }

    #[tokio::test]
    async fn ungrouped_turns_branch_into_a_new_group() {
        let (storage, provider, engine) = engine();
        provider.push_reply("edited answer").push_reply("regenerated");
        let conversation = engine.create_conversation("imported").await.unwrap();
        let user = storage
            .insert_message(NewMessage::completed(
                conversation.id,
                MessageRole::User,
                "old question",
                1,
            ))
            .await
            .unwrap();
        let reply = storage
            .insert_message(
                NewMessage::completed(conversation.id, MessageRole::Assistant, "old answer", 2)
                    .with_parent(Some(user.id)),
            )
            .await
            .unwrap();
        assert_eq!(user.version_group, None);
        assert_eq!(reply.version_group, None);

        let edited = engine.edit_message(user.id, "new question").await.unwrap();
        let edited_user = edited.user_message.clone();
        settle(edited.generation).await;
        assert_eq!(edited_user.parent_message_id, None);
        assert_eq!(edited_user.version_number, 1);
        let minted = edited_user.version_group.unwrap();

        let regenerated = engine.regenerate_inline(reply.id).await.unwrap();
        assert_eq!(regenerated.parent_message_id, Some(user.id));
        assert_eq!(regenerated.version_number, 1);
        assert!(regenerated.version_group.is_some());
        assert_ne!(regenerated.version_group, Some(minted));

        let all = storage.list_messages(conversation.id).await.unwrap();
        assert_eq!(siblings_of(&all, minted).len(), 1);
        let stored_user = storage.get_message(user.id).await.unwrap().unwrap();
        assert_eq!(stored_user.version_group, None);

        // The untouched original is not a sibling of the new version.
        assert!(matches!(
            expect_err(engine.switch_version(edited_user.id, user.id).await),
            EngineError::VersionGroupMismatch { .. }
        ));
        assert!(matches!(
            expect_err(engine.switch_version(regenerated.id, reply.id).await),
            EngineError::VersionGroupMismatch { .. }
        ));
    }

    #[tokio::test]
    async fn concurrent_regenerations_get_distinct_versions() {
        let (_, provider, engine) = engine();
        provider.push_reply("base").push_reply("a").push_reply("b");
        let conversation = engine.create_conversation("race").await.unwrap();
        let first = engine.send_message(conversation.id, "q").await.unwrap();
        let base = settle(first.generation).await;

        let (left, right) = tokio::join!(engine.regenerate(base.id), engine.regenerate(base.id));
        let mut versions = vec![
            left.unwrap().message.version_number,
            right.unwrap().message.version_number,
        ];
        versions.sort_unstable();
        assert_eq!(versions, vec![2, 3]);
    }

    #[tokio::test]
    async fn inline_regeneration_inserts_a_finished_version() {
        let (_, provider, engine) = engine();
        provider.push_reply("streamed").push_reply("inline");
        let conversation = engine.create_conversation("inline").await.unwrap();
        let first = engine.send_message(conversation.id, "q").await.unwrap();
        let streamed = settle(first.generation).await;

        let inline = engine.regenerate_inline(streamed.id).await.unwrap();
        assert_eq!(inline.status, GenerationStatus::Completed);
        assert_eq!(inline.version_number, 2);
        assert_eq!(inline.version_group, streamed.version_group);

        let view = engine.load_view(conversation.id).await.unwrap();
        assert_eq!(view.active_leaf_message_id, Some(inline.id));
    }

    #[tokio::test]
    async fn deleting_a_conversation_removes_it_from_listings() {
        let (_, _, engine) = engine();
        let kept = engine.create_conversation("kept").await.unwrap();
        let dropped = engine.create_conversation("dropped").await.unwrap();

        engine.delete_conversation(dropped.id).await.unwrap();
        let listed = engine.list_conversations().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, kept.id);
        assert!(expect_err(engine.get_conversation(dropped.id).await).is_not_found());
    }

    #[tokio::test]
    async fn read_paths_work_without_a_provider() {
        let storage = Arc::new(InMemoryStorage::new());
        let engine = ConversationEngine::new(storage.clone(), EngineSettings::default());
        let conversation = engine.create_conversation("offline").await.unwrap();

        let error = expect_err(engine.send_message(conversation.id, "hi").await);
        assert!(matches!(error, EngineError::ProviderNotConfigured { .. }));
        assert!(storage.list_messages(conversation.id).await.unwrap().is_empty());

        let view = engine.load_view(conversation.id).await.unwrap();
        assert_eq!(view.conversation.title, "offline");
    }

    #[test]
    fn assembled_prompts_skip_unfinished_assistant_turns() {
        let mut question = message(MessageRole::User, None, 1);
        question.content = "q".to_string();
        let mut failed = message(MessageRole::Assistant, Some(question.id), 2);
        failed.content = "half".to_string();
        failed.status = GenerationStatus::Failed;
        let mut pending = message(MessageRole::Assistant, Some(question.id), 3);
        pending.status = GenerationStatus::Generating;
        let mut done = message(MessageRole::Assistant, Some(question.id), 4);
        done.content = "answer".to_string();

        assert_eq!(
            assemble_prompt(&[question, failed, pending, done]),
            vec![
                ProviderMessage::new(Role::User, "q"),
                ProviderMessage::new(Role::Assistant, "answer"),
            ]
        );
    }
}
