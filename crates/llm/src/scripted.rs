use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, mpsc, oneshot};

use super::provider::{
    LlmProvider, ProviderResult, ProviderStreamHandle, ProviderWorker, StreamEvent, StreamRequest,
    make_event_stream,
};

pub const SCRIPTED_PROVIDER_ID: &str = "scripted";

/// One instruction replayed by the scripted worker.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Emit(StreamEvent),
    Pause(Duration),
    /// Blocks the worker until the gate is notified.
    WaitFor(Arc<Notify>),
}

/// Deterministic provider that replays queued scripts, one per `stream_chat` call.
///
/// Every request is recorded so callers can assert on the prompt that was sent. When the
/// queue runs dry the stream fails with an error event.
pub struct ScriptedProvider {
    default_model: String,
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new("scripted-model")
    }
}

impl ScriptedProvider {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_script(&self, steps: Vec<ScriptStep>) -> &Self {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(steps);
        self
    }

    /// Queues a reply that streams `text` in one delta and finishes.
    pub fn push_reply(&self, text: impl Into<String>) -> &Self {
        self.push_script(vec![
            ScriptStep::Emit(StreamEvent::Delta(text.into())),
            ScriptStep::Emit(StreamEvent::Done),
        ])
    }

    pub fn push_failure(&self, message: impl Into<String>) -> &Self {
        self.push_script(vec![ScriptStep::Emit(StreamEvent::Error(message.into()))])
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn run_script(
        steps: Vec<ScriptStep>,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        for step in steps {
            match step {
                ScriptStep::Emit(event) => {
                    if event_tx.send(event).is_err() {
                        return;
                    }
                }
                ScriptStep::Pause(duration) => {
                    tokio::select! {
                        _ = &mut cancel_rx => return,
                        _ = tokio::time::sleep(duration) => {}
                    }
                }
                ScriptStep::WaitFor(gate) => {
                    tokio::select! {
                        _ = &mut cancel_rx => return,
                        _ = gate.notified() => {}
                    }
                }
            }
        }
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        SCRIPTED_PROVIDER_ID
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let steps = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| {
                tracing::warn!("scripted provider has no reply queued");
                vec![ScriptStep::Emit(StreamEvent::Error(
                    "no scripted reply left".to_string(),
                ))]
            });

        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: ProviderWorker = Box::pin(Self::run_script(steps, event_tx, cancel_rx));
        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderMessage, Role};

    fn request() -> StreamRequest {
        StreamRequest::new("m", vec![ProviderMessage::new(Role::User, "hi")])
    }

    #[tokio::test]
    async fn replays_scripts_in_order_and_records_requests() {
        let provider = ScriptedProvider::default();
        provider.push_reply("first").push_failure("nope");

        let ProviderStreamHandle { mut stream, worker } = provider.stream_chat(request()).unwrap();
        tokio::spawn(worker);
        assert_eq!(stream.recv().await, Some(StreamEvent::Delta("first".into())));
        assert_eq!(stream.recv().await, Some(StreamEvent::Done));
        assert_eq!(stream.recv().await, None);

        let ProviderStreamHandle { mut stream, worker } = provider.stream_chat(request()).unwrap();
        tokio::spawn(worker);
        assert_eq!(stream.recv().await, Some(StreamEvent::Error("nope".into())));

        assert_eq!(provider.requests().len(), 2);
    }

    #[tokio::test]
    async fn waits_on_gates_until_notified() {
        let provider = ScriptedProvider::default();
        let gate = Arc::new(Notify::new());
        provider.push_script(vec![
            ScriptStep::Emit(StreamEvent::Delta("a".into())),
            ScriptStep::WaitFor(gate.clone()),
            ScriptStep::Emit(StreamEvent::Done),
        ]);

        let ProviderStreamHandle { mut stream, worker } = provider.stream_chat(request()).unwrap();
        tokio::spawn(worker);
        assert_eq!(stream.recv().await, Some(StreamEvent::Delta("a".into())));
        let blocked = tokio::time::timeout(Duration::from_millis(20), stream.recv()).await;
        assert!(blocked.is_err());

        gate.notify_one();
        assert_eq!(stream.recv().await, Some(StreamEvent::Done));
    }

    #[tokio::test]
    async fn fails_when_the_queue_is_empty() {
        let provider = ScriptedProvider::default();
        let ProviderStreamHandle { mut stream, worker } = provider.stream_chat(request()).unwrap();
        tokio::spawn(worker);
        assert!(matches!(stream.recv().await, Some(StreamEvent::Error(_))));
    }
}
