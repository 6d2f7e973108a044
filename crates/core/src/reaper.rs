use std::sync::Arc;
use std::time::Duration;

use forkchat_storage::{GenerationOutcome, Storage};
use snafu::ResultExt;
use tokio::task::JoinHandle;

use super::error::{EngineResult, StorageSnafu};
use super::now_unix_ms;

pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Fails `generating` rows whose task died before reaching a terminal state.
#[derive(Clone)]
pub struct StuckGenerationReaper {
    storage: Arc<dyn Storage>,
}

impl StuckGenerationReaper {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn sweep(&self, timeout: Duration) -> EngineResult<usize> {
        self.sweep_at(now_unix_ms(), timeout).await
    }

    /// Returns how many rows this call moved to `failed`.
    pub async fn sweep_at(&self, now_unix_ms: u64, timeout: Duration) -> EngineResult<usize> {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let cutoff_unix_ms = now_unix_ms.saturating_sub(timeout_ms);
        let stuck = self
            .storage
            .list_stuck_generations(cutoff_unix_ms)
            .await
            .context(StorageSnafu {
                stage: "reaper-list-stuck",
            })?;

        let error = timeout_message(timeout);
        let mut reaped = 0;
        for message in stuck {
            let outcome =
                GenerationOutcome::failed(&error, message.content, message.parts, now_unix_ms);
            let settled = self
                .storage
                .settle_generation(message.id, outcome)
                .await
                .context(StorageSnafu {
                    stage: "reaper-settle",
                })?;
            if settled.is_some() {
                reaped += 1;
                tracing::warn!(
                    message_id = %message.id,
                    conversation_id = %message.conversation_id,
                    created_at_unix_ms = message.created_at_unix_ms,
                    "reaped stuck generation"
                );
            }
        }

        if reaped > 0 {
            tracing::info!(reaped, cutoff_unix_ms, "stuck generation sweep finished");
        }
        Ok(reaped)
    }

    /// Sweeps every `interval` until the returned task is aborted.
    pub fn spawn_periodic(self, interval: Duration, timeout: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(error) = self.sweep(timeout).await {
                    tracing::error!(error = %error, "stuck generation sweep failed");
                }
            }
        })
    }
}

fn timeout_message(timeout: Duration) -> String {
    let minutes = timeout.as_secs() / 60;
    match minutes {
        0 => format!("Generation timed out after {} seconds", timeout.as_secs()),
        1 => "Generation timed out after 1 minute".to_string(),
        _ => format!("Generation timed out after {minutes} minutes"),
    }
}
