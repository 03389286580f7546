//! Error types for the newsletter distiller.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level error type for a distiller run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Status store error: {0}")]
    Status(#[from] StatusError),
}

/// Configuration-related errors. Always fatal before any network call.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown AI provider '{0}' (expected 'openai' or 'ollama')")]
    UnknownBackend(String),

    #[error("Unknown mail source '{0}' (expected 'gmail' or 'imap')")]
    UnknownSource(String),

    #[error("Credential file not found: {0}")]
    CredentialFileMissing(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mailbox access errors.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Source configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Token refresh failed for {account}: {reason}")]
    TokenRefresh { account: String, reason: String },

    #[error("Authentication failed for {account}: {reason}")]
    AuthFailed { account: String, reason: String },

    #[error("Mailbox request failed: {0}")]
    Request(String),

    #[error("Unexpected mailbox response: {0}")]
    InvalidResponse(String),

    #[error("Mailbox request timed out after {0:?}")]
    Timeout(Duration),

    #[error("IMAP error: {0}")]
    Imap(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Text-generation backend errors. Recovered per item, never batch-fatal.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Cannot connect to {provider} at {url}: {reason}")]
    Unavailable {
        provider: String,
        url: String,
        reason: String,
    },

    #[error("Provider {provider} returned {status}: {body}")]
    Api {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },
}

impl BackendError {
    /// Typed code recorded in status tracking for this failure.
    pub fn code(&self) -> FailureCode {
        match self {
            Self::Unavailable { .. } => FailureCode::BackendUnavailable,
            Self::Api { .. } | Self::RequestFailed { .. } => FailureCode::BackendError,
            Self::InvalidResponse { .. } => FailureCode::InvalidResponse,
            Self::Timeout { .. } => FailureCode::BackendTimeout,
        }
    }
}

/// Digest delivery errors. Fatal to the remaining steps of a run.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("SMTP authentication failed for {user}: {reason}")]
    AuthFailed { user: String, reason: String },

    #[error("SMTP transport error: {0}")]
    Transport(String),

    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),
}

/// Status persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Item {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: String,
        state: String,
        target: String,
    },
}

/// Typed reason an item ended in `failed` status.
///
/// Sentinel bullets are display text only; reporting keys off this code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    BackendUnavailable,
    BackendError,
    BackendTimeout,
    InvalidResponse,
    StatusStore,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BackendUnavailable => "backend_unavailable",
            Self::BackendError => "backend_error",
            Self::BackendTimeout => "backend_timeout",
            Self::InvalidResponse => "invalid_response",
            Self::StatusStore => "status_store",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backend_unavailable" => Some(Self::BackendUnavailable),
            "backend_error" => Some(Self::BackendError),
            "backend_timeout" => Some(Self::BackendTimeout),
            "invalid_response" => Some(Self::InvalidResponse),
            "status_store" => Some(Self::StatusStore),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type alias for the distiller.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_map_to_codes() {
        let timeout = BackendError::Timeout {
            provider: "ollama".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(timeout.code(), FailureCode::BackendTimeout);

        let down = BackendError::Unavailable {
            provider: "ollama".into(),
            url: "http://localhost:11434".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(down.code(), FailureCode::BackendUnavailable);

        let api = BackendError::Api {
            provider: "openai".into(),
            status: 500,
            body: "oops".into(),
        };
        assert_eq!(api.code(), FailureCode::BackendError);
    }

    #[test]
    fn failure_code_string_roundtrip() {
        for code in [
            FailureCode::BackendUnavailable,
            FailureCode::BackendError,
            FailureCode::BackendTimeout,
            FailureCode::InvalidResponse,
            FailureCode::StatusStore,
        ] {
            assert_eq!(FailureCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(FailureCode::parse("nope"), None);
    }

    #[test]
    fn config_error_message_includes_hint() {
        let err = ConfigError::MissingRequired {
            key: "OPENAI_API_KEY".into(),
            hint: "Set it or use AI_PROVIDER=ollama".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("OPENAI_API_KEY"));
        assert!(msg.contains("AI_PROVIDER=ollama"));
    }
}
