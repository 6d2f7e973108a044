use forkchat_storage::{
    ConversationId, GenerationStatus, MessageId, MessageRecord, MessageRole, VersionGroupId,
};

pub(crate) fn message(
    role: MessageRole,
    parent_message_id: Option<MessageId>,
    created_at_unix_ms: u64,
) -> MessageRecord {
    MessageRecord {
        id: MessageId::new_v7(),
        conversation_id: ConversationId::new_v7(),
        role,
        content: String::new(),
        parts: None,
        parent_message_id,
        version_group: None,
        version_number: 1,
        status: GenerationStatus::Completed,
        error: None,
        model_id: None,
        created_at_unix_ms,
        updated_at_unix_ms: created_at_unix_ms,
    }
}

pub(crate) fn versioned(
    mut message: MessageRecord,
    version_group: VersionGroupId,
    version_number: u32,
) -> MessageRecord {
    message.version_group = Some(version_group);
    message.version_number = version_number;
    message
}
