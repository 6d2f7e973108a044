use std::sync::Arc;

use clap::Parser;
use forkchat_core::{ConversationEngine, StuckGenerationReaper};
use forkchat_storage::{SqliteStorage, Storage};
use snafu::ResultExt;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod config;
mod error;

use cli::{Cli, Command, ConfigAction};
use commands::CommandRunner;
use config::{AppSettings, default_config_path, load_settings, write_settings};
use error::{AppResult, CreateProviderSnafu, OpenStorageSnafu, WriteOutputSnafu};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> AppResult<()> {
    let Cli {
        config_path,
        database_path,
        command,
    } = Cli::parse();
    let config_path = config_path.unwrap_or_else(default_config_path);

    let chat = match command {
        Command::Config(ConfigAction::Path) => {
            println!("{}", config_path.display());
            return Ok(());
        }
        Command::Config(ConfigAction::Init) => {
            // Environment overrides and key fallbacks must never land in the file.
            let created = !config_path.exists();
            if created {
                write_settings(&config_path, &AppSettings::default())?;
            }
            println!("config_path={}", config_path.display());
            println!("created={created}");
            return Ok(());
        }
        Command::Chat(chat) => chat,
    };

    let mut settings = load_settings(&config_path)?;
    if let Some(database_path) = database_path {
        settings.database_path = database_path;
    }

    let storage: Arc<dyn Storage> = Arc::new(
        SqliteStorage::open(&settings.database_path)
            .await
            .context(OpenStorageSnafu {
                stage: "open-sqlite-storage",
            })?,
    );

    // Rows left `generating` by a previous process can never settle on their own.
    let reaper = StuckGenerationReaper::new(storage.clone());
    if let Err(error) = reaper.sweep(settings.generation_timeout()).await {
        tracing::error!(error = %error, "startup generation sweep failed");
    }
    let periodic = reaper.spawn_periodic(settings.reaper_interval(), settings.generation_timeout());

    let mut engine = ConversationEngine::new(storage, settings.engine_settings());
    match settings.provider_config() {
        Some(provider_config) => {
            let provider =
                forkchat_llm::create_provider(provider_config).context(CreateProviderSnafu {
                    stage: "create-provider",
                })?;
            tracing::debug!(provider_id = provider.id(), "provider ready");
            engine = engine.with_provider(provider);
        }
        None => {
            tracing::info!("no API key configured, generation commands are unavailable");
        }
    }

    let runner = CommandRunner::new(engine, settings.generation_timeout());
    let mut stdout = std::io::stdout().lock();
    let result = runner.execute(chat, &mut stdout).await;
    periodic.abort();
    result?;

    std::io::Write::flush(&mut stdout).context(WriteOutputSnafu {
        stage: "flush-stdout",
    })
}
