use std::path::PathBuf;

use forkchat_core::EngineError;
use forkchat_llm::ProviderError;
use forkchat_storage::StorageError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to load settings from {}: {source}", path.display()))]
    LoadConfig {
        stage: &'static str,
        path: PathBuf,
        source: figment::Error,
    },
    #[snafu(display("failed to create directory {}: {source}", path.display()))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write {}: {source}", path.display()))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to rename {} to {}: {source}",
        from.display(),
        to.display()
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to open storage: {source}"))]
    OpenStorage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to create provider: {source}"))]
    CreateProvider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("{source}"))]
    Engine {
        stage: &'static str,
        source: EngineError,
    },
    #[snafu(display("failed to write command output: {source}"))]
    WriteOutput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("generation task for message {message_id} stopped unexpectedly"))]
    GenerationTask {
        stage: &'static str,
        message_id: String,
        source: tokio::task::JoinError,
    },
}

pub type AppResult<T> = Result<T, AppError>;
