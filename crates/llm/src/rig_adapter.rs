use futures::StreamExt;
use rig::completion::{CompletionModel, GetTokenUsage, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::provider::{
    CompletionsFailedSnafu, DEFAULT_OPENAI_MODEL, EmptyMessageSetSnafu, HttpClientSnafu,
    LlmProvider, MissingApiKeySnafu, ProviderConfig, ProviderError, ProviderMessage,
    ProviderResult, ProviderStreamHandle, ProviderWorker, Role, StreamEvent, StreamRequest,
    TokenUsage, make_event_stream,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

pub struct RigProviderAdapter {
    config: ProviderConfig,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &ProviderMessage) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    /// Rig takes a single preamble, so system turns are folded into it.
    fn merged_preamble(request: &StreamRequest) -> Option<String> {
        let mut preamble_parts = Vec::new();

        if let Some(preamble) = &request.preamble
            && !preamble.trim().is_empty()
        {
            preamble_parts.push(preamble.clone());
        }

        for message in &request.messages {
            if matches!(message.role, Role::System) && !message.content.trim().is_empty() {
                preamble_parts.push(message.content.clone());
            }
        }

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    async fn open_stream(
        config: &ProviderConfig,
        request: &StreamRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(request.model_id.clone());

        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                model_id = %request.model_id,
                total_message_count = request.messages.len(),
                "cannot open stream because no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-filter-messages",
                model_id: request.model_id.clone(),
            }
            .fail();
        };
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::merged_preamble(request) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn emit_error_event(event_tx: &mpsc::UnboundedSender<StreamEvent>, error: ProviderError) {
        let _ = event_tx.send(StreamEvent::Error(error.to_string()));
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<StreamEvent>
    where
        R: Clone + Unpin + GetTokenUsage,
    {
        let event = match item {
            StreamedAssistantContent::Text(text) => StreamEvent::Delta(text.text),
            StreamedAssistantContent::Reasoning(reasoning) => {
                let text = reasoning.reasoning.join("");
                if text.is_empty() {
                    return None;
                }
                StreamEvent::ReasoningDelta(text)
            }
            StreamedAssistantContent::ReasoningDelta { reasoning, .. } => {
                if reasoning.is_empty() {
                    return None;
                }
                StreamEvent::ReasoningDelta(reasoning)
            }
            StreamedAssistantContent::Final(response) => {
                let usage = response.token_usage()?;
                StreamEvent::Usage(TokenUsage {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                })
            }
            StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. } => return None,
        };

        Some(event)
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let mut stream = match Self::open_stream(&config, &request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    provider_id = %config.provider_id,
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, error);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(model_id = %request.model_id, "provider stream cancelled");
                    stream.cancel();
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(event) = Self::map_stream_item(item)
                                && event_tx.send(event).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                model_id = %request.model_id,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_error_event(&event_tx, error);
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = event_tx.send(StreamEvent::Done);
    }
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Rig OpenAI"
    }

    fn default_model(&self) -> &str {
        self.config
            .default_model
            .as_deref()
            .filter(|model| !model.trim().is_empty())
            .unwrap_or(DEFAULT_OPENAI_MODEL)
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                model_id: request.model_id.clone(),
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(messages: Vec<ProviderMessage>) -> StreamRequest {
        StreamRequest::new("gpt-test", messages)
    }

    #[test]
    fn rejects_blank_api_keys() {
        let error = RigProviderAdapter::new(ProviderConfig::new("openai", "  ", "", None))
            .err()
            .unwrap();
        assert!(matches!(error, ProviderError::MissingApiKey { .. }));
    }

    #[test]
    fn folds_system_turns_into_the_preamble() {
        let request = request(vec![
            ProviderMessage::new(Role::System, "be brief"),
            ProviderMessage::new(Role::User, "hi"),
        ])
        .with_preamble("you are helpful");

        assert_eq!(
            RigProviderAdapter::merged_preamble(&request).as_deref(),
            Some("you are helpful\n\nbe brief")
        );
        assert!(RigProviderAdapter::to_rig_message(&request.messages[0]).is_none());
    }

    #[test]
    fn falls_back_to_the_builtin_default_model() {
        let adapter =
            RigProviderAdapter::new(ProviderConfig::new("openai", "key", "", Some(" ".into())))
                .unwrap();
        assert_eq!(adapter.default_model(), DEFAULT_OPENAI_MODEL);

        let adapter = RigProviderAdapter::new(ProviderConfig::new(
            "openai",
            "key",
            "",
            Some("gpt-x".into()),
        ))
        .unwrap();
        assert_eq!(adapter.default_model(), "gpt-x");
    }

    #[test]
    fn refuses_empty_requests_before_spawning() {
        let adapter = RigProviderAdapter::new(ProviderConfig::new("openai", "key", "", None))
            .unwrap();
        let error = adapter.stream_chat(request(Vec::new())).err().unwrap();
        assert!(matches!(error, ProviderError::EmptyMessageSet { .. }));
    }
}
