use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use forkchat_core::{DEFAULT_GENERATION_TIMEOUT, EngineSettings};
use forkchat_llm::{DEFAULT_OPENAI_MODEL, ProviderConfig, RIG_OPENAI_PROVIDER_ID};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::error::{
    AppResult, CreateDirSnafu, LoadConfigSnafu, RenameTempFileSnafu, SerializeConfigSnafu,
    WriteFileSnafu,
};

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const SETTINGS_DIRECTORY_NAME: &str = "forkchat";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "forkchat.sqlite3";
pub const ENV_PREFIX: &str = "FORKCHAT_";
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub default_model: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider_id: RIG_OPENAI_PROVIDER_ID.to_string(),
            api_key: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            default_model: DEFAULT_OPENAI_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperSettings {
    pub timeout_ms: u64,
    pub interval_ms: u64,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            timeout_ms: duration_ms(DEFAULT_GENERATION_TIMEOUT),
            interval_ms: duration_ms(DEFAULT_REAPER_INTERVAL),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub database_path: String,
    pub provider: ProviderSettings,
    pub generation: GenerationSettings,
    pub reaper: ReaperSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            database_path: default_database_path().to_string_lossy().into_owned(),
            provider: ProviderSettings::default(),
            generation: GenerationSettings::default(),
            reaper: ReaperSettings::default(),
        }
    }
}

impl AppSettings {
    /// Trims every string and puts defaults back where a value is blank or zero.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();

        self.database_path = non_blank_or(self.database_path, defaults.database_path);
        self.provider.provider_id =
            non_blank_or(self.provider.provider_id, defaults.provider.provider_id);
        self.provider.api_key = self.provider.api_key.trim().to_string();
        self.provider.endpoint = non_blank_or(self.provider.endpoint, defaults.provider.endpoint);
        self.provider.default_model =
            non_blank_or(self.provider.default_model, defaults.provider.default_model);

        self.generation.system_prompt = self
            .generation
            .system_prompt
            .map(|prompt| prompt.trim().to_string())
            .filter(|prompt| !prompt.is_empty());
        self.generation.max_tokens = self.generation.max_tokens.filter(|tokens| *tokens > 0);

        if self.reaper.timeout_ms == 0 {
            self.reaper.timeout_ms = defaults.reaper.timeout_ms;
        }
        if self.reaper.interval_ms == 0 {
            self.reaper.interval_ms = defaults.reaper.interval_ms;
        }

        self
    }

    /// Fills a blank API key from `OPENAI_API_KEY`.
    pub fn with_api_key_fallback(mut self, fallback: Option<String>) -> Self {
        if self.provider.api_key.is_empty()
            && let Some(api_key) = fallback
        {
            self.provider.api_key = api_key.trim().to_string();
        }
        self
    }

    pub fn provider_config(&self) -> Option<ProviderConfig> {
        if self.provider.api_key.is_empty() {
            return None;
        }

        Some(ProviderConfig::new(
            &self.provider.provider_id,
            &self.provider.api_key,
            &self.provider.endpoint,
            Some(self.provider.default_model.clone()),
        ))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            model_id: Some(self.provider.default_model.clone()),
            system_prompt: self.generation.system_prompt.clone(),
            temperature: self.generation.temperature,
            max_tokens: self.generation.max_tokens,
        }
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.reaper.timeout_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper.interval_ms)
    }
}

pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".forkchat"))
}

pub fn default_config_path() -> PathBuf {
    default_config_dir().join(SETTINGS_FILE_NAME)
}

pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".forkchat"))
        .join(DATABASE_FILE_NAME)
}

/// Defaults, then the JSON file when it exists, then `FORKCHAT_*` variables
/// (`FORKCHAT_PROVIDER__API_KEY` sets `provider.api_key`).
pub fn load_settings(path: &Path) -> AppResult<AppSettings> {
    let mut figment = Figment::from(Serialized::defaults(AppSettings::default()));
    if path.exists() {
        figment = figment.merge(Json::file(path));
    } else {
        tracing::debug!(path = %path.display(), "settings file not found, using defaults");
    }
    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    let settings = figment
        .extract::<AppSettings>()
        .context(LoadConfigSnafu {
            stage: "extract-settings",
            path: path.to_path_buf(),
        })?;

    Ok(settings
        .normalized()
        .with_api_key_fallback(std::env::var("OPENAI_API_KEY").ok()))
}

/// Writes `settings` to a sibling temporary file, then renames it over `path`.
pub fn write_settings(path: &Path, settings: &AppSettings) -> AppResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateDirSnafu {
            stage: "create-settings-directory",
            path: parent.to_path_buf(),
        })?;
    }

    let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
        stage: "serialize-settings-json",
    })?;

    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, content).context(WriteFileSnafu {
        stage: "write-temporary-settings-file",
        path: temp_path.clone(),
    })?;

    std::fs::rename(&temp_path, path).context(RenameTempFileSnafu {
        stage: "rename-temporary-settings-file",
        from: temp_path,
        to: path.to_path_buf(),
    })?;

    tracing::info!(path = %path.display(), "saved settings");
    Ok(())
}

fn non_blank_or(value: String, fallback: String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback
    } else {
        trimmed.to_string()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_restores_blank_and_zero_values() {
        let settings = AppSettings {
            database_path: "  ".to_string(),
            provider: ProviderSettings {
                provider_id: String::new(),
                api_key: "  sk-test ".to_string(),
                endpoint: " ".to_string(),
                default_model: " gpt-x ".to_string(),
            },
            generation: GenerationSettings {
                system_prompt: Some("   ".to_string()),
                temperature: Some(0.2),
                max_tokens: Some(0),
            },
            reaper: ReaperSettings {
                timeout_ms: 0,
                interval_ms: 5,
            },
        }
        .normalized();

        assert_eq!(settings.database_path, AppSettings::default().database_path);
        assert_eq!(settings.provider.provider_id, RIG_OPENAI_PROVIDER_ID);
        assert_eq!(settings.provider.api_key, "sk-test");
        assert_eq!(settings.provider.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(settings.provider.default_model, "gpt-x");
        assert_eq!(settings.generation.system_prompt, None);
        assert_eq!(settings.generation.max_tokens, None);
        assert_eq!(settings.generation_timeout(), DEFAULT_GENERATION_TIMEOUT);
        assert_eq!(settings.reaper_interval(), Duration::from_millis(5));
    }

    #[test]
    fn provider_config_requires_an_api_key() {
        let settings = AppSettings::default();
        assert_eq!(settings.provider_config(), None);

        let settings = settings.with_api_key_fallback(Some(" sk-env ".to_string()));
        let config = settings.provider_config().unwrap();
        assert_eq!(config.api_key, "sk-env");
        assert_eq!(config.default_model.as_deref(), Some(DEFAULT_OPENAI_MODEL));
    }

    #[test]
    fn file_values_override_defaults_and_keep_the_rest() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                SETTINGS_FILE_NAME,
                r#"{ "provider": { "api_key": "sk-file" }, "reaper": { "timeout_ms": 1000 } }"#,
            )?;
            jail.set_env("FORKCHAT_PROVIDER__DEFAULT_MODEL", "gpt-env");

            let settings = load_settings(Path::new(SETTINGS_FILE_NAME)).unwrap();
            assert_eq!(settings.provider.api_key, "sk-file");
            assert_eq!(settings.provider.default_model, "gpt-env");
            assert_eq!(settings.provider.endpoint, DEFAULT_ENDPOINT);
            assert_eq!(settings.generation_timeout(), Duration::from_secs(1));
            Ok(())
        });
    }

    #[test]
    fn written_settings_load_back() {
        figment::Jail::expect_with(|jail| {
            let path = jail.directory().join("nested").join(SETTINGS_FILE_NAME);
            let mut settings = AppSettings::default();
            settings.generation.system_prompt = Some("be terse".to_string());

            write_settings(&path, &settings).unwrap();
            let loaded = load_settings(&path).unwrap();
            assert_eq!(loaded.generation.system_prompt.as_deref(), Some("be terse"));
            Ok(())
        });
    }
}
