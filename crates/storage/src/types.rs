use serde::{Deserialize, Serialize};

use super::ids::{ConversationId, MessageId, VersionGroupId};

/// Title used when a conversation is created with a blank title.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Storage-local message role, intentionally decoupled from provider role enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Lifecycle of a message row. Only `Generating` rows may still change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationStatus {
    Generating,
    Completed,
    Failed,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Generating => false,
            Self::Completed | Self::Failed => true,
        }
    }
}

/// One typed segment of an assistant reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Reasoning {
        text: String,
    },
    Text {
        text: String,
    },
    Metrics {
        duration_ms: u64,
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
        tokens_per_second: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub content: String,
    pub parts: Option<Vec<MessagePart>>,
    pub parent_message_id: Option<MessageId>,
    pub version_group: Option<VersionGroupId>,
    pub version_number: u32,
    pub status: GenerationStatus,
    pub error: Option<String>,
    pub model_id: Option<String>,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
}

/// Insert payload. The caller stamps `created_at_unix_ms`, which also seeds `updated_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub content: String,
    pub parts: Option<Vec<MessagePart>>,
    pub parent_message_id: Option<MessageId>,
    pub version_group: Option<VersionGroupId>,
    pub version_number: u32,
    pub status: GenerationStatus,
    pub error: Option<String>,
    pub model_id: Option<String>,
    pub created_at_unix_ms: u64,
}

impl NewMessage {
    /// A completed turn with no parts, the shape every user and system message takes.
    pub fn completed(
        conversation_id: ConversationId,
        role: MessageRole,
        content: impl Into<String>,
        created_at_unix_ms: u64,
    ) -> Self {
        Self {
            conversation_id,
            role,
            content: content.into(),
            parts: None,
            parent_message_id: None,
            version_group: None,
            version_number: 1,
            status: GenerationStatus::Completed,
            error: None,
            model_id: None,
            created_at_unix_ms,
        }
    }

    pub fn with_parent(mut self, parent_message_id: Option<MessageId>) -> Self {
        self.parent_message_id = parent_message_id;
        self
    }

    pub fn with_version(mut self, version_group: VersionGroupId, version_number: u32) -> Self {
        self.version_group = Some(version_group);
        self.version_number = version_number;
        self
    }
}

/// Terminal transition applied to a `generating` row.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub status: GenerationStatus,
    pub content: String,
    pub parts: Option<Vec<MessagePart>>,
    pub error: Option<String>,
    pub updated_at_unix_ms: u64,
}

impl GenerationOutcome {
    pub fn failed(
        error: impl Into<String>,
        content: impl Into<String>,
        parts: Option<Vec<MessagePart>>,
        updated_at_unix_ms: u64,
    ) -> Self {
        Self {
            status: GenerationStatus::Failed,
            content: content.into(),
            parts,
            error: Some(error.into()),
            updated_at_unix_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub title: String,
    pub active_leaf_message_id: Option<MessageId>,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub title: String,
    pub created_at_unix_ms: u64,
}

impl NewConversation {
    pub(crate) fn normalized_title(&self) -> String {
        let title = self.title.trim();
        if title.is_empty() {
            DEFAULT_CONVERSATION_TITLE.to_string()
        } else {
            title.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_serialize_with_a_type_tag() {
        let parts = vec![
            MessagePart::Reasoning {
                text: "think".to_string(),
            },
            MessagePart::Text {
                text: "answer".to_string(),
            },
        ];

        let json = serde_json::to_string(&parts).unwrap();
        assert_eq!(
            json,
            r#"[{"type":"reasoning","text":"think"},{"type":"text","text":"answer"}]"#
        );
    }

    #[test]
    fn blank_titles_fall_back_to_default() {
        let input = NewConversation {
            title: "   ".to_string(),
            created_at_unix_ms: 0,
        };
        assert_eq!(input.normalized_title(), DEFAULT_CONVERSATION_TITLE);
    }
}
