use std::{str::FromStr, time::Duration};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_POSITIVE_TOKENS: &[&str] =
    &["babesia", "leishmania", "trypanosome", "malaria parasitized"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "pg" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => anyhow::bail!("unknown store backend {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    pub backend: StoreBackend,
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub statement_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierMode {
    Subprocess,
    Mock,
}

impl FromStr for ClassifierMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "subprocess" => Ok(Self::Subprocess),
            "mock" => Ok(Self::Mock),
            other => anyhow::bail!("unknown classifier mode {other:?}"),
        }
    }
}

/// How the image payload reaches the prediction script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadInput {
    Arg,
    Stdin,
}

impl FromStr for PayloadInput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "arg" => Ok(Self::Arg),
            "stdin" => Ok(Self::Stdin),
            other => anyhow::bail!("unknown classifier input {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    pub mode: ClassifierMode,
    pub fallback: bool,
    pub program: String,
    pub args: Vec<String>,
    pub input: PayloadInput,
    pub timeout: Duration,
    pub max_concurrency: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            mode: ClassifierMode::Subprocess,
            fallback: true,
            program: "python3".into(),
            args: vec!["predict.py".into()],
            input: PayloadInput::Arg,
            timeout: Duration::from_secs(30),
            max_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub db: DbConfig,
    pub classifier: ClassifierConfig,
    pub max_image_bytes: usize,
    /// Label fragments that mark a result as a parasitic infection.
    pub positive_tokens: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let backend = env_parse("STORE_BACKEND", StoreBackend::Postgres)?;
        let url = match backend {
            StoreBackend::Postgres => std::env::var("DATABASE_URL").context("DATABASE_URL")?,
            StoreBackend::Memory => std::env::var("DATABASE_URL").unwrap_or_default(),
        };
        let db = DbConfig {
            backend,
            url,
            max_connections: env_parse("DB_MAX_CONNECTIONS", 10)?,
            acquire_timeout: Duration::from_secs(env_parse("DB_ACQUIRE_TIMEOUT_SECS", 5)?),
            statement_timeout_ms: env_parse("DB_STATEMENT_TIMEOUT_MS", 10_000)?,
        };

        let defaults = ClassifierConfig::default();
        let classifier = ClassifierConfig {
            mode: env_parse("CLASSIFIER_MODE", defaults.mode)?,
            fallback: env_parse("CLASSIFIER_FALLBACK", defaults.fallback)?,
            program: std::env::var("CLASSIFIER_PROGRAM").unwrap_or(defaults.program),
            args: std::env::var("CLASSIFIER_ARGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or(defaults.args),
            input: env_parse("CLASSIFIER_INPUT", defaults.input)?,
            timeout: Duration::from_secs(env_parse(
                "CLASSIFIER_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )?),
            max_concurrency: env_parse("CLASSIFIER_MAX_CONCURRENCY", defaults.max_concurrency)?,
        };
        anyhow::ensure!(
            classifier.max_concurrency > 0,
            "CLASSIFIER_MAX_CONCURRENCY must be at least 1"
        );

        let positive_tokens = std::env::var("POSITIVE_LABEL_TOKENS")
            .map(|v| parse_tokens(&v))
            .unwrap_or_else(|_| default_positive_tokens());

        Ok(Self {
            db,
            classifier,
            max_image_bytes: env_parse("MAX_IMAGE_BYTES", 10 * 1024 * 1024)?,
            positive_tokens,
        })
    }
}

pub fn default_positive_tokens() -> Vec<String> {
    DEFAULT_POSITIVE_TOKENS.iter().map(|t| t.to_string()).collect()
}

/// Comma separated, trimmed, lower-cased, blanks dropped.
pub fn parse_tokens(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn env_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}={v:?}: {e}")),
        _ => Ok(default),
    }
}
