//! Runtime configuration.
//!
//! One `Settings` value is built at process start (from environment
//! variables) and handed to each component's constructor. Engine code never
//! reads the environment on its own.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Lowest allowed inbox poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// IMAP (inbound mail) settings.
#[derive(Debug, Clone)]
pub struct ImapSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub folder: String,
    pub processed_folder: String,
}

impl ImapSettings {
    /// Credentials present, so fetching is possible.
    pub fn is_configured(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

/// SMTP (outbound mail) settings.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub use_starttls: bool,
    pub from_address: String,
}

impl SmtpSettings {
    pub fn is_configured(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

/// LLM backend settings (Ollama chat API).
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    /// Completion prefix that signals the model wants a human to take over.
    pub confidence_marker: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

/// Task-queue settings for the dispatch gateway.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub enabled: bool,
    /// How long a caller blocks on a queued job before falling back inline.
    pub wait_timeout: Duration,
    pub capacity: usize,
}

/// Application settings, assembled once in `main`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: String,
    pub imap: ImapSettings,
    pub smtp: SmtpSettings,
    pub llm: LlmSettings,
    pub queue: QueueSettings,
    /// Send confident LLM replies without operator approval.
    pub auto_send_replies: bool,
    pub poll_interval: Duration,
    /// Minimum text length before language detection is attempted.
    pub language_min_chars: usize,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env_opt(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cannot parse {raw:?}"),
        }),
        None => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match env_opt(key) {
        Some(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected boolean, got {other:?}"),
            }),
        },
        None => Ok(default),
    }
}

impl Settings {
    /// Build settings from environment variables, applying the same defaults
    /// for every unset knob.
    pub fn from_env() -> Result<Self, ConfigError> {
        let imap = ImapSettings {
            host: env_or("AVTOMAIL_IMAP_HOST", "imap.example.com"),
            port: env_parse("AVTOMAIL_IMAP_PORT", 993)?,
            username: env_opt("AVTOMAIL_IMAP_USERNAME"),
            password: env_opt("AVTOMAIL_IMAP_PASSWORD").map(SecretString::from),
            folder: env_or("AVTOMAIL_IMAP_FOLDER", "INBOX"),
            processed_folder: env_or("AVTOMAIL_IMAP_PROCESSED_FOLDER", "Processed"),
        };

        let smtp = SmtpSettings {
            host: env_or("AVTOMAIL_SMTP_HOST", "smtp.example.com"),
            port: env_parse("AVTOMAIL_SMTP_PORT", 587)?,
            username: env_opt("AVTOMAIL_SMTP_USERNAME"),
            password: env_opt("AVTOMAIL_SMTP_PASSWORD").map(SecretString::from),
            use_starttls: env_bool("AVTOMAIL_SMTP_STARTTLS", true)?,
            from_address: env_or("AVTOMAIL_SMTP_FROM", "support@example.com"),
        };

        let llm = LlmSettings {
            base_url: env_or("AVTOMAIL_OLLAMA_URL", "http://localhost:11434"),
            model: env_or("AVTOMAIL_OLLAMA_MODEL", "llama3"),
            confidence_marker: env_or("AVTOMAIL_LLM_MARKER", "MANAGER"),
            temperature: env_parse("AVTOMAIL_LLM_TEMPERATURE", 0.2)?,
            max_tokens: env_opt("AVTOMAIL_LLM_MAX_TOKENS")
                .map(|raw| {
                    raw.parse().map_err(|_| ConfigError::InvalidValue {
                        key: "AVTOMAIL_LLM_MAX_TOKENS".to_string(),
                        message: format!("cannot parse {raw:?}"),
                    })
                })
                .transpose()?,
        };

        let queue = QueueSettings {
            enabled: env_bool("AVTOMAIL_QUEUE_ENABLED", false)?,
            wait_timeout: Duration::from_secs(env_parse("AVTOMAIL_QUEUE_TIMEOUT_SECS", 180u64)?),
            capacity: env_parse("AVTOMAIL_QUEUE_CAPACITY", 64usize)?,
        };

        let poll_secs: u64 = env_parse("AVTOMAIL_POLL_INTERVAL_SECS", 120u64)?;

        Ok(Self {
            database_path: env_or("AVTOMAIL_DB_PATH", "./data/avtomail.db"),
            imap,
            smtp,
            llm,
            queue,
            auto_send_replies: env_bool("AVTOMAIL_AUTO_SEND", false)?,
            poll_interval: Duration::from_secs(poll_secs).max(MIN_POLL_INTERVAL),
            language_min_chars: env_parse("AVTOMAIL_LANGUAGE_MIN_CHARS", 20usize)?,
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: ":memory:".to_string(),
            imap: ImapSettings {
                host: "imap.example.com".to_string(),
                port: 993,
                username: None,
                password: None,
                folder: "INBOX".to_string(),
                processed_folder: "Processed".to_string(),
            },
            smtp: SmtpSettings {
                host: "smtp.example.com".to_string(),
                port: 587,
                username: None,
                password: None,
                use_starttls: true,
                from_address: "support@example.com".to_string(),
            },
            llm: LlmSettings {
                base_url: "http://localhost:11434".to_string(),
                model: "llama3".to_string(),
                confidence_marker: "MANAGER".to_string(),
                temperature: 0.2,
                max_tokens: None,
            },
            queue: QueueSettings {
                enabled: false,
                wait_timeout: Duration::from_secs(180),
                capacity: 64,
            },
            auto_send_replies: false,
            poll_interval: Duration::from_secs(120),
            language_min_chars: 20,
        }
    }
}
