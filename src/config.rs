//! Configuration types, built from environment variables.
//!
//! Every `from_env()` delegates to a `from_lookup()` taking a key → value
//! closure so tests can supply a map instead of mutating the process env.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::summarize::SummaryStyle;

/// Key → value lookup used by all config loaders.
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Default label a newsletter must carry to be picked up.
pub const DEFAULT_LABEL: &str = "To-Summarize";

/// Default batch cap per run.
pub const DEFAULT_FETCH_LIMIT: usize = 10;

/// Default digest subject line.
pub const DEFAULT_DIGEST_SUBJECT: &str = "Your Daily Newsletter Digest";

/// Name of the implicit account when `DISTILLER_ACCOUNTS` is unset.
pub const DEFAULT_ACCOUNT: &str = "default";

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: std::str::FromStr>(
    lookup: Lookup<'_>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}

/// Top-level configuration for a distiller process.
#[derive(Debug, Clone)]
pub struct DistillerConfig {
    /// One entry per credential set.
    pub accounts: Vec<AccountConfig>,
    pub normalizer: NormalizerConfig,
    pub summarizer: SummarizerConfig,
    pub backend: BackendConfig,
    pub smtp: SmtpConfig,
    /// libSQL status database; `None` keeps status in memory.
    pub db_path: Option<PathBuf>,
    /// Cron expression for periodic runs; `None` runs once.
    pub schedule: Option<String>,
    /// Directory for rotated log files.
    pub log_dir: Option<PathBuf>,
}

impl DistillerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let names: Vec<String> = lookup("DISTILLER_ACCOUNTS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let accounts = if names.is_empty() {
            vec![AccountConfig::from_lookup(DEFAULT_ACCOUNT, lookup)?]
        } else {
            names
                .iter()
                .map(|name| AccountConfig::from_lookup(name, lookup))
                .collect::<Result<Vec<_>, _>>()?
        };

        if let Some(schedule) = lookup("DIGEST_SCHEDULE") {
            crate::scheduler::parse_schedule(&schedule)?;
        }

        Ok(Self {
            accounts,
            normalizer: NormalizerConfig::from_lookup(lookup)?,
            summarizer: SummarizerConfig::from_lookup(lookup)?,
            backend: BackendConfig::from_lookup(lookup)?,
            smtp: SmtpConfig::from_lookup(lookup)?,
            db_path: lookup("DISTILLER_DB_PATH").map(PathBuf::from),
            schedule: lookup("DIGEST_SCHEDULE"),
            log_dir: lookup("DISTILLER_LOG_DIR").map(PathBuf::from),
        })
    }

    pub fn account(&self, name: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.name == name)
    }
}

// ── Accounts ────────────────────────────────────────────────────────

/// One credential set: where to read mail from and where to send the digest.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub name: String,
    pub source: SourceConfig,
    pub label: String,
    pub fetch_limit: usize,
    /// Overrides `SmtpConfig::recipient` for this account.
    pub recipient: Option<String>,
}

impl AccountConfig {
    /// Load an account. Non-default accounts read `<NAME>_<KEY>` first and
    /// fall back to the unprefixed key.
    pub fn from_lookup(name: &str, lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let prefix = format!("{}_", name.to_uppercase().replace('-', "_"));
        let scoped = |key: &str| -> Option<String> {
            if name != DEFAULT_ACCOUNT
                && let Some(v) = lookup(&format!("{prefix}{key}"))
            {
                return Some(v);
            }
            lookup(key)
        };

        let fetch_limit = parse_or(&scoped, "FETCH_LIMIT", DEFAULT_FETCH_LIMIT)?;
        if fetch_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "FETCH_LIMIT".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(Self {
            name: name.to_string(),
            source: SourceConfig::from_lookup(&scoped)?,
            label: scoped("NEWSLETTER_LABEL").unwrap_or_else(|| DEFAULT_LABEL.to_string()),
            fetch_limit,
            recipient: scoped("RECIPIENT_EMAIL"),
        })
    }
}

/// Which mailbox backend an account reads from.
#[derive(Debug, Clone)]
pub enum SourceConfig {
    Gmail(GmailConfig),
    Imap(ImapConfig),
}

impl SourceConfig {
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let kind = lookup("MAIL_SOURCE").unwrap_or_else(|| "gmail".to_string());
        match kind.trim().to_lowercase().as_str() {
            "gmail" => Ok(Self::Gmail(GmailConfig::from_lookup(lookup)?)),
            "imap" => Ok(Self::Imap(ImapConfig::from_lookup(lookup)?)),
            other => Err(ConfigError::UnknownSource(other.to_string())),
        }
    }
}

/// Gmail REST API access via a stored OAuth token.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    /// OAuth client secrets JSON (the "installed" or "web" layout).
    pub credentials_file: PathBuf,
    /// Stored access/refresh token JSON.
    pub token_file: PathBuf,
    pub api_base: String,
    pub timeout: Duration,
}

impl GmailConfig {
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            credentials_file: lookup("GMAIL_CREDENTIALS_FILE")
                .unwrap_or_else(|| "credentials.json".to_string())
                .into(),
            token_file: lookup("GMAIL_TOKEN_FILE")
                .unwrap_or_else(|| "token.json".to_string())
                .into(),
            api_base: lookup("GMAIL_API_BASE")
                .unwrap_or_else(|| "https://gmail.googleapis.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            timeout: Duration::from_secs(parse_or(lookup, "GMAIL_TIMEOUT_SECS", 30)?),
        })
    }
}

/// Plain IMAP access; the label is treated as a mailbox name.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub timeout: Duration,
}

impl ImapConfig {
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let host = lookup("IMAP_HOST").ok_or_else(|| ConfigError::MissingRequired {
            key: "IMAP_HOST".into(),
            hint: "Required when MAIL_SOURCE=imap".into(),
        })?;
        let username = lookup("IMAP_USERNAME")
            .ok_or_else(|| ConfigError::MissingEnvVar("IMAP_USERNAME".into()))?;
        let password = lookup("IMAP_PASSWORD")
            .ok_or_else(|| ConfigError::MissingEnvVar("IMAP_PASSWORD".into()))?;

        Ok(Self {
            host,
            port: parse_or(lookup, "IMAP_PORT", 993)?,
            username,
            password: SecretString::from(password),
            timeout: Duration::from_secs(parse_or(lookup, "IMAP_TIMEOUT_SECS", 30)?),
        })
    }
}

// ── Pipeline stages ─────────────────────────────────────────────────

/// Content normalizer limits.
#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// Approximate token budget (1 token ≈ 4 chars).
    pub max_tokens: usize,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self { max_tokens: 2000 }
    }
}

impl NormalizerConfig {
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let max_tokens = parse_or(lookup, "MAX_TOKENS", Self::default().max_tokens)?;
        if max_tokens == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_TOKENS".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(Self { max_tokens })
    }
}

/// Summarizer behaviour independent of the backend.
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    /// Bodies shorter than this (in chars, trimmed) skip the backend.
    pub min_chars: usize,
    pub style: SummaryStyle,
    /// Per-call backend timeout.
    pub timeout: Duration,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            min_chars: 50,
            style: SummaryStyle::Neutral,
            timeout: Duration::from_secs(60),
        }
    }
}

impl SummarizerConfig {
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let style = match lookup("SUMMARY_STYLE") {
            Some(raw) => raw.parse::<SummaryStyle>().map_err(|e| ConfigError::InvalidValue {
                key: "SUMMARY_STYLE".into(),
                message: e,
            })?,
            None => defaults.style,
        };
        Ok(Self {
            min_chars: parse_or(lookup, "MIN_SUMMARY_CHARS", defaults.min_chars)?,
            style,
            timeout: Duration::from_secs(parse_or(
                lookup,
                "BACKEND_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )?),
        })
    }
}

/// Text-generation backend selection. Chosen once, at construction.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    OpenAi {
        api_key: SecretString,
        model: String,
    },
    Ollama {
        base_url: String,
        model: String,
    },
}

impl BackendConfig {
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let provider = lookup("AI_PROVIDER").unwrap_or_else(|| "openai".to_string());
        match provider.trim().to_lowercase().as_str() {
            "openai" => {
                let api_key =
                    lookup("OPENAI_API_KEY").ok_or_else(|| ConfigError::MissingRequired {
                        key: "OPENAI_API_KEY".into(),
                        hint: "Set it, or use AI_PROVIDER=ollama for a local model".into(),
                    })?;
                Ok(Self::OpenAi {
                    api_key: SecretString::from(api_key),
                    model: lookup("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                })
            }
            "ollama" => Ok(Self::Ollama {
                base_url: lookup("OLLAMA_BASE_URL")
                    .unwrap_or_else(|| "http://localhost:11434".to_string())
                    .trim_end_matches('/')
                    .to_string(),
                model: lookup("OLLAMA_MODEL").unwrap_or_else(|| "llama3".to_string()),
            }),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }

    pub fn provider(&self) -> &'static str {
        match self {
            Self::OpenAi { .. } => "openai",
            Self::Ollama { .. } => "ollama",
        }
    }
}

/// Outbound SMTP settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub sender: String,
    /// Absent ⇒ the dispatcher skips sending.
    pub app_password: Option<SecretString>,
    pub recipient: String,
    pub subject: String,
    pub timeout: Duration,
}

impl SmtpConfig {
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let app_password = lookup("GMAIL_APP_PASSWORD").map(SecretString::from);
        let sender = lookup("SENDER_EMAIL").unwrap_or_default();
        if app_password.is_some() && sender.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "SENDER_EMAIL".into(),
                hint: "Required when GMAIL_APP_PASSWORD is set".into(),
            });
        }
        let recipient = lookup("RECIPIENT_EMAIL").unwrap_or_else(|| sender.clone());

        Ok(Self {
            host: lookup("SMTP_SERVER").unwrap_or_else(|| "smtp.gmail.com".to_string()),
            port: parse_or(lookup, "SMTP_PORT", 587)?,
            sender,
            app_password,
            recipient,
            subject: lookup("DIGEST_SUBJECT")
                .unwrap_or_else(|| DEFAULT_DIGEST_SUBJECT.to_string()),
            timeout: Duration::from_secs(parse_or(lookup, "SMTP_TIMEOUT_SECS", 30)?),
        })
    }
}
