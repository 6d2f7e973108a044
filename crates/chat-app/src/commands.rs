use std::io::Write;
use std::time::Duration;

use forkchat_core::{
    ChainEntry, ConversationEngine, ConversationView, GenerationEvent, GenerationHandle,
    GenerationStatusReport, LeafSource,
};
use forkchat_storage::{MessageRecord, MessageRole};
use snafu::ResultExt;

use super::cli::ChatCommand;
use super::error::{AppResult, EngineSnafu, GenerationTaskSnafu, WriteOutputSnafu};

/// Runs [`ChatCommand`]s against one engine and prints `key=value` lines plus streamed text.
pub struct CommandRunner {
    engine: ConversationEngine,
    generation_timeout: Duration,
}

impl CommandRunner {
    pub fn new(engine: ConversationEngine, generation_timeout: Duration) -> Self {
        Self {
            engine,
            generation_timeout,
        }
    }

    pub async fn execute(&self, command: ChatCommand, out: &mut impl Write) -> AppResult<()> {
        match command {
            ChatCommand::New { title } => {
                let conversation = self
                    .engine
                    .create_conversation(&title.join(" "))
                    .await
                    .context(EngineSnafu {
                        stage: "command-new",
                    })?;
                emit(out, format!("conversation_id={}", conversation.id))?;
                emit(out, format!("title={}", conversation.title))
            }
            ChatCommand::List => {
                let conversations =
                    self.engine
                        .list_conversations()
                        .await
                        .context(EngineSnafu {
                            stage: "command-list",
                        })?;
                for conversation in conversations {
                    emit(
                        out,
                        format!(
                            "{}\t{}\t{}",
                            conversation.id, conversation.updated_at_unix_ms, conversation.title
                        ),
                    )?;
                }
                Ok(())
            }
            ChatCommand::Show { conversation_id } => {
                let view = self
                    .engine
                    .load_view(conversation_id)
                    .await
                    .context(EngineSnafu {
                        stage: "command-show",
                    })?;
                write_view(out, &view)
            }
            ChatCommand::Send {
                conversation_id,
                text,
            } => {
                let turn = self
                    .engine
                    .send_message(conversation_id, &text.join(" "))
                    .await
                    .context(EngineSnafu {
                        stage: "command-send",
                    })?;
                emit(out, format!("user_message_id={}", turn.user_message.id))?;
                self.follow(turn.generation, out).await
            }
            ChatCommand::Edit { message_id, text } => {
                let turn = self
                    .engine
                    .edit_message(message_id, &text.join(" "))
                    .await
                    .context(EngineSnafu {
                        stage: "command-edit",
                    })?;
                emit(out, format!("user_message_id={}", turn.user_message.id))?;
                emit(
                    out,
                    format!("version_number={}", turn.user_message.version_number),
                )?;
                self.follow(turn.generation, out).await
            }
            ChatCommand::Regenerate {
                message_id,
                inline: true,
            } => {
                let record = self
                    .engine
                    .regenerate_inline(message_id)
                    .await
                    .context(EngineSnafu {
                        stage: "command-regenerate-inline",
                    })?;
                emit(out, format!("assistant_message_id={}", record.id))?;
                emit(out, format!("version_number={}", record.version_number))?;
                emit(out, record.content.clone())?;
                write_outcome(out, &record)
            }
            ChatCommand::Regenerate {
                message_id,
                inline: false,
            } => {
                let handle = self
                    .engine
                    .regenerate(message_id)
                    .await
                    .context(EngineSnafu {
                        stage: "command-regenerate",
                    })?;
                emit(
                    out,
                    format!("version_number={}", handle.message.version_number),
                )?;
                self.follow(handle, out).await
            }
            ChatCommand::Switch {
                current_message_id,
                target_message_id,
            } => {
                let view = self
                    .engine
                    .switch_version(current_message_id, target_message_id)
                    .await
                    .context(EngineSnafu {
                        stage: "command-switch",
                    })?;
                write_view(out, &view)
            }
            ChatCommand::Status { message_id } => {
                let report = self
                    .engine
                    .get_status(message_id)
                    .await
                    .context(EngineSnafu {
                        stage: "command-status",
                    })?;
                write_status(out, &report)
            }
            ChatCommand::Sweep { timeout_ms } => {
                let timeout = timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(self.generation_timeout);
                let reaped = self
                    .engine
                    .reaper()
                    .sweep(timeout)
                    .await
                    .context(EngineSnafu {
                        stage: "command-sweep",
                    })?;
                emit(out, format!("reaped={reaped}"))
            }
            ChatCommand::Delete { conversation_id } => {
                self.engine
                    .delete_conversation(conversation_id)
                    .await
                    .context(EngineSnafu {
                        stage: "command-delete",
                    })?;
                emit(out, format!("deleted={conversation_id}"))
            }
        }
    }

    /// Prints deltas as they arrive and waits for the terminal status.
    async fn follow(&self, handle: GenerationHandle, out: &mut impl Write) -> AppResult<()> {
        let GenerationHandle {
            message,
            mut events,
            task,
        } = handle;
        emit(out, format!("assistant_message_id={}", message.id))?;

        let mut settled = None;
        while let Some(event) = events.recv().await {
            match event {
                GenerationEvent::Delta(text) => {
                    write!(out, "{text}").context(WriteOutputSnafu {
                        stage: "follow-delta",
                    })?;
                    out.flush().context(WriteOutputSnafu {
                        stage: "follow-flush",
                    })?;
                }
                GenerationEvent::ReasoningDelta(_) => {}
                GenerationEvent::Settled(record) => settled = Some(record),
            }
        }
        emit(out, String::new())?;

        let settled = match settled {
            Some(record) => Some(record),
            None => task.await.context(GenerationTaskSnafu {
                stage: "follow-join",
                message_id: message.id.to_string(),
            })?,
        };
        match settled {
            Some(record) => write_outcome(out, &record),
            // The terminal row was not written or read back; report what storage holds.
            None => {
                let report = self
                    .engine
                    .get_status(message.id)
                    .await
                    .context(EngineSnafu {
                        stage: "follow-status",
                    })?;
                write_status(out, &report)
            }
        }
    }
}

fn emit(out: &mut impl Write, line: String) -> AppResult<()> {
    writeln!(out, "{line}").context(WriteOutputSnafu { stage: "emit-line" })
}

fn write_outcome(out: &mut impl Write, record: &MessageRecord) -> AppResult<()> {
    emit(out, format!("status={}", record.status.as_str()))?;
    if let Some(error) = &record.error {
        emit(out, format!("error={error}"))?;
    }
    Ok(())
}

fn write_status(out: &mut impl Write, report: &GenerationStatusReport) -> AppResult<()> {
    emit(out, format!("message_id={}", report.message_id))?;
    emit(out, format!("status={}", report.status.as_str()))?;
    emit(out, format!("updated_at_unix_ms={}", report.updated_at_unix_ms))?;
    if let Some(error) = &report.error {
        emit(out, format!("error={error}"))?;
    }
    emit(out, format!("content={}", report.content))
}

fn write_view(out: &mut impl Write, view: &ConversationView) -> AppResult<()> {
    emit(out, format!("conversation_id={}", view.conversation.id))?;
    emit(out, format!("title={}", view.conversation.title))?;
    if let Some(leaf) = view.active_leaf_message_id {
        let source = match view.leaf_source {
            Some(LeafSource::Pointer) => "pointer",
            Some(LeafSource::Default) | None => "default",
        };
        emit(out, format!("active_leaf={leaf} ({source})"))?;
    }
    for entry in &view.entries {
        emit(out, render_entry(entry))?;
    }
    Ok(())
}

fn render_entry(entry: &ChainEntry) -> String {
    let message = &entry.message;
    let mut header = format!("[{}] {}", message.role.as_str(), message.id);
    if let Some(version) = &entry.version
        && version.total_versions > 1
    {
        header.push_str(&format!(
            " v{}/{}",
            version.version_number, version.total_versions
        ));
    }
    if message.role == MessageRole::Assistant && !message.status.is_terminal() {
        header.push_str(" (generating)");
    }
    if let Some(error) = &message.error {
        header.push_str(&format!(" (failed: {error})"));
    }
    format!("{header}\n{}", message.content)
}
