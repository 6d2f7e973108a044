use std::sync::Arc;
use std::time::{Duration, Instant};

use forkchat_llm::{
    LlmProvider, ProviderEventStream, ProviderStreamHandle, StreamEvent, StreamRequest, TokenUsage,
};
use forkchat_storage::{
    ConversationId, GenerationOutcome, GenerationStatus, MessageId, MessagePart, MessageRecord,
    MessageRole, NewMessage, Storage,
};
use snafu::ResultExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::branch::BranchPointer;
use super::error::{EngineResult, NotFoundSnafu, StorageSnafu};
use super::now_unix_ms;
use super::version::VersionSlot;

pub const STREAM_CLOSED_EARLY: &str = "provider stream ended before a terminal event";

/// A new assistant turn: what it replies to, where it sits among its versions, and the
/// backend request that produces it.
#[derive(Debug, Clone)]
pub struct GenerationPlan {
    pub conversation_id: ConversationId,
    pub parent_message_id: MessageId,
    pub slot: VersionSlot,
    pub request: StreamRequest,
}

/// Live feed of a detached generation.
///
/// `Settled` carries the terminal row and is the last event, also when another writer (the
/// reaper) settled the row first. It is missing only when the terminal row could not be written
/// or read back.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    Delta(String),
    ReasoningDelta(String),
    Settled(MessageRecord),
}

/// Returned once the `generating` row is durable.
///
/// Dropping any field leaves the task running; it always finishes by writing a terminal
/// status. The task resolves to the settled row, or `None` when something else (the reaper)
/// settled it first or the final write failed.
pub struct GenerationHandle {
    pub message: MessageRecord,
    pub events: mpsc::UnboundedReceiver<GenerationEvent>,
    pub task: JoinHandle<Option<MessageRecord>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationStatusReport {
    pub message_id: MessageId,
    pub status: GenerationStatus,
    pub content: String,
    pub error: Option<String>,
    pub updated_at_unix_ms: u64,
}

#[derive(Clone)]
pub struct GenerationLifecycle {
    storage: Arc<dyn Storage>,
    provider: Arc<dyn LlmProvider>,
    pointer: BranchPointer,
}

impl GenerationLifecycle {
    pub fn new(storage: Arc<dyn Storage>, provider: Arc<dyn LlmProvider>) -> Self {
        let pointer = BranchPointer::new(storage.clone());
        Self {
            storage,
            provider,
            pointer,
        }
    }

    /// Writes the `generating` row, then streams into it from a spawned task.
    pub async fn start(&self, plan: GenerationPlan) -> EngineResult<GenerationHandle> {
        let GenerationPlan {
            conversation_id,
            parent_message_id,
            slot,
            request,
        } = plan;

        let placeholder = NewMessage {
            status: GenerationStatus::Generating,
            model_id: Some(request.model_id.clone()),
            ..NewMessage::completed(conversation_id, MessageRole::Assistant, "", now_unix_ms())
                .with_parent(Some(parent_message_id))
                .with_version(slot.version_group, slot.version_number)
        };
        let message = self
            .storage
            .insert_message(placeholder)
            .await
            .context(StorageSnafu {
                stage: "generation-write-ahead",
            })?;
        tracing::info!(
            message_id = %message.id,
            conversation_id = %conversation_id,
            model_id = %request.model_id,
            version_number = slot.version_number,
            "wrote generating placeholder"
        );

        let (event_tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.clone().drive(message.id, request, event_tx));

        Ok(GenerationHandle {
            message,
            events,
            task,
        })
    }

    /// Streams inside the caller and inserts the finished row once, completed or failed.
    pub async fn run_inline(&self, plan: GenerationPlan) -> EngineResult<MessageRecord> {
        let GenerationPlan {
            conversation_id,
            parent_message_id,
            slot,
            request,
        } = plan;

        let started_at_unix_ms = now_unix_ms();
        let model_id = request.model_id.clone();
        let outcome = collect_stream(self.provider.as_ref(), request, None)
            .await
            .into_outcome(now_unix_ms());

        let input = NewMessage {
            content: outcome.content,
            parts: outcome.parts,
            status: outcome.status,
            error: outcome.error,
            model_id: Some(model_id),
            ..NewMessage::completed(
                conversation_id,
                MessageRole::Assistant,
                "",
                started_at_unix_ms,
            )
            .with_parent(Some(parent_message_id))
            .with_version(slot.version_group, slot.version_number)
        };
        let record = self
            .storage
            .insert_message(input)
            .await
            .context(StorageSnafu {
                stage: "generation-inline-insert",
            })?;

        self.after_settle(&record).await;
        Ok(record)
    }

    pub async fn status(&self, message_id: MessageId) -> EngineResult<GenerationStatusReport> {
        load_status(self.storage.as_ref(), message_id).await
    }

    pub fn default_model(&self) -> &str {
        self.provider.default_model()
    }

    async fn drive(
        self,
        message_id: MessageId,
        request: StreamRequest,
        events: mpsc::UnboundedSender<GenerationEvent>,
    ) -> Option<MessageRecord> {
        let outcome = collect_stream(self.provider.as_ref(), request, Some(&events))
            .await
            .into_outcome(now_unix_ms());

        let settled = match self.storage.settle_generation(message_id, outcome).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(
                    message_id = %message_id,
                    "generation already reached a terminal state elsewhere"
                );
                match self.storage.get_message(message_id).await {
                    Ok(Some(stored)) => {
                        let _ = events.send(GenerationEvent::Settled(stored));
                    }
                    Ok(None) => {}
                    Err(error) => tracing::error!(
                        message_id = %message_id,
                        error = %error,
                        "failed to read the row settled elsewhere"
                    ),
                }
                return None;
            }
            Err(error) => {
                tracing::error!(
                    message_id = %message_id,
                    error = %error,
                    "failed to persist generation outcome"
                );
                return None;
            }
        };

        self.after_settle(&settled).await;
        let _ = events.send(GenerationEvent::Settled(settled.clone()));
        Some(settled)
    }

    async fn after_settle(&self, record: &MessageRecord) {
        match record.status {
            GenerationStatus::Completed => {
                tracing::info!(
                    message_id = %record.id,
                    content_len = record.content.len(),
                    "generation completed"
                );
                if let Err(error) = self
                    .pointer
                    .move_to(record.conversation_id, record.id, record.updated_at_unix_ms)
                    .await
                {
                    tracing::error!(
                        message_id = %record.id,
                        error = %error,
                        "failed to move branch pointer to the completed generation"
                    );
                }
                if let Err(error) = self
                    .storage
                    .touch_conversation(record.conversation_id, record.updated_at_unix_ms)
                    .await
                {
                    tracing::error!(
                        conversation_id = %record.conversation_id,
                        error = %error,
                        "failed to bump conversation timestamp"
                    );
                }
            }
            GenerationStatus::Failed => {
                tracing::warn!(
                    message_id = %record.id,
                    error = record.error.as_deref().unwrap_or_default(),
                    "generation failed"
                );
            }
            GenerationStatus::Generating => {}
        }
    }
}

pub(crate) async fn load_status(
    storage: &dyn Storage,
    message_id: MessageId,
) -> EngineResult<GenerationStatusReport> {
    let Some(message) = storage
        .get_message(message_id)
        .await
        .context(StorageSnafu {
            stage: "generation-status-load",
        })?
    else {
        return NotFoundSnafu {
            stage: "generation-status-load",
            entity: "message",
            id: message_id.to_string(),
        }
        .fail();
    };

    Ok(GenerationStatusReport {
        message_id,
        status: message.status,
        content: message.content,
        error: message.error,
        updated_at_unix_ms: message.updated_at_unix_ms,
    })
}

#[derive(Debug, Default)]
struct StreamTranscript {
    text: String,
    reasoning: String,
    usage: Option<TokenUsage>,
}

#[derive(Debug)]
enum StreamEnd {
    Done,
    Failed(String),
}

#[derive(Debug)]
struct CollectedStream {
    transcript: StreamTranscript,
    end: StreamEnd,
    elapsed: Duration,
}

impl CollectedStream {
    fn into_outcome(self, updated_at_unix_ms: u64) -> GenerationOutcome {
        let Self {
            transcript,
            end,
            elapsed,
        } = self;

        let mut parts = Vec::new();
        if !transcript.reasoning.is_empty() {
            parts.push(MessagePart::Reasoning {
                text: transcript.reasoning,
            });
        }

        match end {
            StreamEnd::Done => {
                parts.push(MessagePart::Text {
                    text: transcript.text.clone(),
                });
                parts.push(metrics_part(elapsed, transcript.usage));
                GenerationOutcome {
                    status: GenerationStatus::Completed,
                    content: transcript.text,
                    parts: Some(parts),
                    error: None,
                    updated_at_unix_ms,
                }
            }
            StreamEnd::Failed(error) => {
                if !transcript.text.is_empty() {
                    parts.push(MessagePart::Text {
                        text: transcript.text.clone(),
                    });
                }
                let parts = (!parts.is_empty()).then_some(parts);
                GenerationOutcome::failed(error, transcript.text, parts, updated_at_unix_ms)
            }
        }
    }
}

fn metrics_part(elapsed: Duration, usage: Option<TokenUsage>) -> MessagePart {
    let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    let tokens_per_second = usage
        .filter(|usage| usage.output_tokens > 0 && duration_ms > 0)
        .map(|usage| usage.output_tokens as f64 * 1000.0 / duration_ms as f64);

    MessagePart::Metrics {
        duration_ms,
        input_tokens: usage.map(|usage| usage.input_tokens),
        output_tokens: usage.map(|usage| usage.output_tokens),
        tokens_per_second,
    }
}

async fn collect_stream(
    provider: &dyn LlmProvider,
    request: StreamRequest,
    events: Option<&mpsc::UnboundedSender<GenerationEvent>>,
) -> CollectedStream {
    let started = Instant::now();
    let mut transcript = StreamTranscript::default();

    let end = match provider.stream_chat(request) {
        Ok(ProviderStreamHandle { mut stream, worker }) => {
            tokio::spawn(worker);
            drain_stream(&mut stream, &mut transcript, events).await
        }
        Err(error) => StreamEnd::Failed(error.to_string()),
    };

    CollectedStream {
        transcript,
        end,
        elapsed: started.elapsed(),
    }
}

async fn drain_stream(
    stream: &mut ProviderEventStream,
    transcript: &mut StreamTranscript,
    events: Option<&mpsc::UnboundedSender<GenerationEvent>>,
) -> StreamEnd {
    // Nobody listening is fine; the row is the source of truth.
    let forward = |event: GenerationEvent| {
        if let Some(events) = events {
            let _ = events.send(event);
        }
    };

    while let Some(event) = stream.recv().await {
        match event {
            StreamEvent::Delta(chunk) => {
                transcript.text.push_str(&chunk);
                forward(GenerationEvent::Delta(chunk));
            }
            StreamEvent::ReasoningDelta(chunk) => {
                transcript.reasoning.push_str(&chunk);
                forward(GenerationEvent::ReasoningDelta(chunk));
            }
            StreamEvent::Usage(usage) => transcript.usage = Some(usage),
            StreamEvent::Done => return StreamEnd::Done,
            StreamEvent::Error(message) => return StreamEnd::Failed(message),
        }
    }

    StreamEnd::Failed(STREAM_CLOSED_EARLY.to_string())
}
