use forkchat_storage::{MessageId, StorageError};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("{entity} '{id}' was not found"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("only user messages can be edited, '{message_id}' is a {role} message"))]
    NotAUserMessage {
        stage: &'static str,
        message_id: MessageId,
        role: &'static str,
    },
    #[snafu(display(
        "only assistant messages can be regenerated, '{message_id}' is a {role} message"
    ))]
    NotAnAssistantMessage {
        stage: &'static str,
        message_id: MessageId,
        role: &'static str,
    },
    #[snafu(display("message '{target}' is not a version of message '{current}'"))]
    VersionGroupMismatch {
        stage: &'static str,
        current: MessageId,
        target: MessageId,
    },
    #[snafu(display("no model provider is configured"))]
    ProviderNotConfigured { stage: &'static str },
    #[snafu(display("message content must not be empty"))]
    EmptyContent { stage: &'static str },
    #[snafu(display("storage failed on `{stage}`, {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// True for missing records, whether detected here or reported by the store.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Storage { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// True for requests rejected before any mutation.
    pub fn is_invalid_request(&self) -> bool {
        matches!(
            self,
            Self::NotAUserMessage { .. }
                | Self::NotAnAssistantMessage { .. }
                | Self::VersionGroupMismatch { .. }
                | Self::EmptyContent { .. }
        )
    }
}
