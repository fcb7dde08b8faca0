//! Runtime configuration.
//!
//! Everything comes from the process environment. The binary loads a `.env`
//! file first (via `dotenvy`), so `Settings::from_env` only ever sees plain
//! variables. Tests go through `Settings::from_lookup` with a map instead of
//! mutating the real environment.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "Medreport";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_PATIENT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_LLM_MAX_ATTEMPTS: u32 = 2;
pub const DEFAULT_FETCH_CONCURRENCY: usize = 4;
/// 100 MiB, same ceiling as the import path uses for local files.
pub const DEFAULT_MAX_DOCUMENT_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_MAX_DOCUMENT_CHARS: usize = 50_000;
pub const DEFAULT_MAX_ATTACHMENT_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_MAX_DISCOVERY_DEPTH: usize = 64;
pub const DEFAULT_DOCUMENT_HOST: &str = "cloudinary.com";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Default tracing filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "medreport=info,medreport_lib=info,warn"
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

/// Which LLM backend speaks for both analysis stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAi => DEFAULT_OPENAI_BASE_URL,
            Self::Ollama => DEFAULT_OLLAMA_BASE_URL,
        }
    }
}

impl FromStr for LlmProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(format!("expected openai or ollama, got {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: LlmProvider,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub hosts: Vec<String>,
    /// When set, replaces host matching entirely.
    pub url_pattern: Option<String>,
    pub max_depth: usize,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub base_url: Option<String>,
    pub patient_timeout: Duration,
    pub fetch_timeout: Duration,
    pub fetch_concurrency: usize,
    pub max_document_bytes: u64,
    pub max_document_chars: usize,
    pub attach_images: bool,
    pub discovery: DiscoverySettings,
    pub llm: LlmSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Blank values count as unset so `FOO=` in a .env file falls back.
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let provider = match get("LLM_PROVIDER") {
            Some(raw) => raw.parse::<LlmProvider>().map_err(|reason| ConfigError::Invalid {
                var: "LLM_PROVIDER",
                value: raw,
                reason,
            })?,
            None => LlmProvider::OpenAi,
        };

        let hosts = match get("DOCUMENT_HOSTS") {
            Some(raw) => raw
                .split(',')
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect(),
            None => vec![DEFAULT_DOCUMENT_HOST.to_string()],
        };

        let url_pattern = get("DOCUMENT_URL_PATTERN");
        if let Some(pattern) = &url_pattern {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(ConfigError::Invalid {
                    var: "DOCUMENT_URL_PATTERN",
                    value: pattern.clone(),
                    reason: e.to_string(),
                });
            }
        }

        let fetch_concurrency: usize =
            parse_positive(&get, "FETCH_CONCURRENCY", DEFAULT_FETCH_CONCURRENCY)?;
        let max_attempts: u32 =
            parse_positive(&get, "LLM_MAX_ATTEMPTS", DEFAULT_LLM_MAX_ATTEMPTS)?;

        Ok(Self {
            base_url: get("BASE_URL").map(|u| u.trim().trim_end_matches('/').to_string()),
            patient_timeout: Duration::from_secs(parse_positive(
                &get,
                "PATIENT_TIMEOUT_SECS",
                DEFAULT_PATIENT_TIMEOUT_SECS,
            )?),
            fetch_timeout: Duration::from_secs(parse_positive(
                &get,
                "FETCH_TIMEOUT_SECS",
                DEFAULT_FETCH_TIMEOUT_SECS,
            )?),
            fetch_concurrency,
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
            max_document_chars: parse_positive(
                &get,
                "MAX_DOCUMENT_CHARS",
                DEFAULT_MAX_DOCUMENT_CHARS,
            )?,
            attach_images: parse_bool(&get, "ATTACH_IMAGES", true)?,
            discovery: DiscoverySettings {
                hosts,
                url_pattern,
                max_depth: DEFAULT_MAX_DISCOVERY_DEPTH,
            },
            llm: LlmSettings {
                provider,
                base_url: get("LLM_BASE_URL")
                    .unwrap_or_else(|| provider.default_base_url().to_string())
                    .trim_end_matches('/')
                    .to_string(),
                api_key: get("OPENAI_API_KEY"),
                model: get("LLM_MODEL").unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
                timeout: Duration::from_secs(parse_positive(
                    &get,
                    "LLM_TIMEOUT_SECS",
                    DEFAULT_LLM_TIMEOUT_SECS,
                )?),
                max_attempts,
            },
        })
    }

    /// Patient service root, required only for report generation.
    pub fn patient_base_url(&self) -> Result<&str, ConfigError> {
        self.base_url.as_deref().ok_or(ConfigError::Missing("BASE_URL"))
    }
}

fn parse_var<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            var,
            value: raw,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Like `parse_var`, but rejects zero.
fn parse_positive<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq + std::fmt::Display,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let value = parse_var(get, var, default)?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be at least 1".into(),
        });
    }
    Ok(value)
}

fn parse_bool<G>(get: &G, var: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                var,
                value: raw,
                reason: "expected true or false".into(),
            }),
        },
        None => Ok(default),
    }
}
