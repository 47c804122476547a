use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::relay::context::ContextPolicy;
use crate::relay::supervisor::FailurePolicy;

/// Environment variables holding the secrets. All are required.
pub const ENV_TELEGRAM_TOKEN: &str = "TELEGRAM_TOKEN";
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_SECRET_PHRASE: &str = "SECRET_PHRASE";
pub const ENV_AES_KEY: &str = "AES_KEY";

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// A required environment variable is unset or empty.
    MissingEnv(&'static str),
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::MissingEnv(name) => write!(f, "environment variable {} is required", name),
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::MissingEnv(_) | Self::Validation(_) => None,
        }
    }
}

/// Non-secret tunables, read from the optional JSON file.
#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    /// Directory for the database and logs. Defaults to current directory.
    data_dir: Option<String>,
    /// Overrides `<data_dir>/history.db`.
    database_path: Option<String>,
    chat_model: Option<String>,
    completion_model: Option<String>,
    system_prompt: Option<String>,
    max_tokens: Option<u32>,
    #[serde(default)]
    context_policy: ContextPolicy,
    context_window: Option<usize>,
    #[serde(default)]
    failure_policy: FailurePolicy,
    request_timeout_secs: Option<u64>,
    /// Base URL of the OpenAI-compatible API, without trailing slash.
    api_base: Option<String>,
}

const DEFAULT_CHAT_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_COMPLETION_MODEL: &str = "gpt-3.5-turbo-instruct";
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const DEFAULT_MAX_TOKENS: u32 = 256;
const DEFAULT_CONTEXT_WINDOW: usize = 5;
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

pub struct Config {
    pub telegram_token: String,
    pub openai_api_key: String,
    pub secret_phrase: String,
    /// Raw AES key bytes (16 or 32), decoded from hex.
    pub aes_key: Vec<u8>,
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub chat_model: String,
    pub completion_model: String,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub context_policy: ContextPolicy,
    /// How many stored messages the windowed policy sends.
    pub context_window: usize,
    pub failure_policy: FailurePolicy,
    pub request_timeout: Duration,
    pub api_base: String,
}

impl Config {
    /// Load tunables from `path` (if given) and secrets from the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => read_file(path)?,
            None => ConfigFile::default(),
        };
        Self::build(file, |name| std::env::var(name).ok())
    }

    fn build<F>(file: ConfigFile, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |name: &'static str| {
            env(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingEnv(name))
        };

        let telegram_token = require(ENV_TELEGRAM_TOKEN)?;
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = telegram_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(format!(
                "{} appears invalid (expected format: 123456789:ABCdefGHI...)",
                ENV_TELEGRAM_TOKEN
            )));
        }

        let openai_api_key = require(ENV_OPENAI_API_KEY)?;
        // Not trimmed: the phrase is compared byte for byte.
        let secret_phrase = env(ENV_SECRET_PHRASE)
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingEnv(ENV_SECRET_PHRASE))?;

        let aes_key = hex::decode(require(ENV_AES_KEY)?)
            .map_err(|e| ConfigError::Validation(format!("{} is not valid hex: {}", ENV_AES_KEY, e)))?;
        if aes_key.len() != 16 && aes_key.len() != 32 {
            return Err(ConfigError::Validation(format!(
                "{} must decode to 16 or 32 bytes, got {}",
                ENV_AES_KEY,
                aes_key.len()
            )));
        }

        let context_window = file.context_window.unwrap_or(DEFAULT_CONTEXT_WINDOW);
        if context_window == 0 {
            return Err(ConfigError::Validation("context_window must be at least 1".into()));
        }
        let timeout_secs = file.request_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(ConfigError::Validation("request_timeout_secs must be at least 1".into()));
        }

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let database_path = file
            .database_path
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("history.db"));

        Ok(Self {
            telegram_token,
            openai_api_key,
            secret_phrase,
            aes_key,
            data_dir,
            database_path,
            chat_model: file.chat_model.unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            completion_model: file
                .completion_model
                .unwrap_or_else(|| DEFAULT_COMPLETION_MODEL.to_string()),
            system_prompt: file
                .system_prompt
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_tokens: file.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            context_policy: file.context_policy,
            context_window,
            failure_policy: file.failure_policy,
            request_timeout: Duration::from_secs(timeout_secs),
            api_base: file
                .api_base
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        })
    }
}

fn read_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ReadFile { path: path.to_path_buf(), source: e })?;
    serde_json::from_str(&content)
        .map_err(|e| ConfigError::ParseJson { path: path.to_path_buf(), source: e })
}
