//! OAuth token handling for the Gmail source.
//!
//! The interactive consent flow is out of scope: a token file produced by a
//! prior authorization must exist. Expired access tokens are refreshed with
//! the stored refresh token and the rotated token is written back at once.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{ConfigError, SourceError};

/// Google's token endpoint, used when neither file names one.
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Refresh this many seconds before the recorded expiry.
const EXPIRY_SKEW_SECS: i64 = 60;

/// OAuth client identity used for refresh requests.
#[derive(Debug, Clone)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: SecretString,
    pub token_uri: String,
}

#[derive(Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecretsEntry>,
    web: Option<ClientSecretsEntry>,
}

#[derive(Deserialize)]
struct ClientSecretsEntry {
    client_id: String,
    client_secret: String,
    token_uri: Option<String>,
}

impl ClientSecrets {
    /// Read a client secrets JSON in either the "installed" or "web" layout.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = read_existing(path)?;
        let file: ClientSecretsFile = serde_json::from_str(&raw).map_err(|e| {
            ConfigError::ParseError(format!("{}: {e}", path.display()))
        })?;
        let entry = file.installed.or(file.web).ok_or_else(|| {
            ConfigError::ParseError(format!(
                "{}: expected an 'installed' or 'web' section",
                path.display()
            ))
        })?;
        Ok(Self {
            client_id: entry.client_id,
            client_secret: SecretString::from(entry.client_secret),
            token_uri: entry.token_uri.unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
        })
    }
}

/// Persisted token. Accepts both our own layout and the authorized-user
/// layout written by Google's client libraries (`token`, `expiry`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    #[serde(alias = "token")]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing)]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
}

impl StoredToken {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = read_existing(path)?;
        let mut token: StoredToken = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
        if token.expires_at.is_none() {
            token.expires_at = token.expiry.map(|t| t.timestamp());
        }
        Ok(token)
    }

    /// Expired (or about to). Tokens with no recorded expiry are trusted.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|at| at <= now.timestamp() + EXPIRY_SKEW_SECS)
    }

    /// Client identity embedded in an authorized-user token file, if complete.
    fn embedded_secrets(&self) -> Option<ClientSecrets> {
        Some(ClientSecrets {
            client_id: self.client_id.clone()?,
            client_secret: SecretString::from(self.client_secret.clone()?),
            token_uri: self
                .token_uri
                .clone()
                .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
        })
    }

    /// Write atomically with owner-only permissions.
    pub fn store(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, path)
    }
}

fn read_existing(path: &Path) -> Result<String, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::CredentialFileMissing(path.display().to_string()));
    }
    Ok(fs::read_to_string(path)?)
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
}

/// Hands out valid access tokens, refreshing and persisting as needed.
pub struct TokenManager {
    account: String,
    token_path: PathBuf,
    secrets: ClientSecrets,
    http: reqwest::Client,
    token: Mutex<StoredToken>,
}

impl TokenManager {
    /// Load the token file and client secrets. Both must exist; no network.
    pub fn load(
        account: &str,
        credentials_file: &Path,
        token_file: &Path,
        http: reqwest::Client,
    ) -> Result<Self, ConfigError> {
        let token = StoredToken::load(token_file)?;
        let secrets = match token.embedded_secrets() {
            Some(secrets) => secrets,
            None => ClientSecrets::load(credentials_file)?,
        };
        Ok(Self {
            account: account.to_string(),
            token_path: token_file.to_path_buf(),
            secrets,
            http,
            token: Mutex::new(token),
        })
    }

    /// A usable access token, refreshing first if the stored one expired.
    pub async fn access_token(&self) -> Result<SecretString, SourceError> {
        let mut token = self.token.lock().await;
        if token.is_expired(Utc::now()) {
            self.refresh(&mut token).await?;
        }
        Ok(SecretString::from(token.access_token.clone()))
    }

    /// Refresh regardless of recorded expiry (after a 401).
    pub async fn force_refresh(&self) -> Result<SecretString, SourceError> {
        let mut token = self.token.lock().await;
        self.refresh(&mut token).await?;
        Ok(SecretString::from(token.access_token.clone()))
    }

    async fn refresh(&self, token: &mut StoredToken) -> Result<(), SourceError> {
        let refresh_token =
            token
                .refresh_token
                .clone()
                .ok_or_else(|| SourceError::AuthFailed {
                    account: self.account.clone(),
                    reason: "access token expired and no refresh token is stored".into(),
                })?;

        tracing::debug!(account = %self.account, "Refreshing Gmail access token");

        let response = self
            .http
            .post(&self.secrets.token_uri)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", self.secrets.client_id.as_str()),
                ("client_secret", self.secrets.client_secret.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| self.refresh_error(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.refresh_error(format!("{status}: {body}")));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| self.refresh_error(format!("invalid response: {e}")))?;

        token.access_token = body.access_token;
        token.expires_at = body.expires_in.map(|secs| Utc::now().timestamp() + secs);
        if let Some(rotated) = body.refresh_token {
            token.refresh_token = Some(rotated);
        }

        token
            .store(&self.token_path)
            .map_err(|e| self.refresh_error(format!("failed to persist token: {e}")))?;

        tracing::info!(account = %self.account, "Gmail access token refreshed");
        Ok(())
    }

    fn refresh_error(&self, reason: String) -> SourceError {
        SourceError::TokenRefresh {
            account: self.account.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let p = dir.join(name);
        fs::write(&p, body).unwrap();
        p
    }

    fn secrets_json(token_uri: &str) -> String {
        serde_json::json!({
            "installed": {
                "client_id": "cid",
                "client_secret": "csecret",
                "token_uri": token_uri,
            }
        })
        .to_string()
    }

    #[test]
    fn missing_token_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let creds = write(dir.path(), "credentials.json", &secrets_json(DEFAULT_TOKEN_URI));
        let result = TokenManager::load(
            "default",
            &creds,
            &dir.path().join("token.json"),
            reqwest::Client::new(),
        );
        assert!(matches!(result, Err(ConfigError::CredentialFileMissing(_))));
    }

    #[test]
    fn missing_credentials_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let token = write(dir.path(), "token.json", r#"{"access_token":"a"}"#);
        let result = TokenManager::load(
            "default",
            &dir.path().join("credentials.json"),
            &token,
            reqwest::Client::new(),
        );
        assert!(matches!(result, Err(ConfigError::CredentialFileMissing(_))));
    }

    #[test]
    fn unreadable_credentials_path_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let token = write(dir.path(), "token.json", r#"{"access_token":"a"}"#);
        // Exists, but is a directory.
        let result = TokenManager::load("default", dir.path(), &token, reqwest::Client::new());
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn web_layout_and_authorized_user_token_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let creds = write(
            dir.path(),
            "credentials.json",
            r#"{"web":{"client_id":"w","client_secret":"s"}}"#,
        );
        let secrets = ClientSecrets::load(&creds).unwrap();
        assert_eq!(secrets.client_id, "w");
        assert_eq!(secrets.token_uri, DEFAULT_TOKEN_URI);

        let token = write(
            dir.path(),
            "token.json",
            r#"{"token":"abc","refresh_token":"r","expiry":"2020-01-01T00:00:00Z"}"#,
        );
        let token = StoredToken::load(&token).unwrap();
        assert_eq!(token.access_token, "abc");
        assert!(token.is_expired(Utc::now()));
    }

    #[test]
    fn token_without_expiry_is_trusted() {
        let token: StoredToken = serde_json::from_str(r#"{"access_token":"a"}"#).unwrap();
        assert!(!token.is_expired(Utc::now()));
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_persisted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh",
                "expires_in": 3600,
                "token_type": "Bearer",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let creds = write(
            dir.path(),
            "credentials.json",
            &secrets_json(&format!("{}/token", server.uri())),
        );
        let token_path = write(
            dir.path(),
            "token.json",
            r#"{"access_token":"stale","refresh_token":"r1","expires_at":1}"#,
        );

        let manager =
            TokenManager::load("default", &creds, &token_path, reqwest::Client::new()).unwrap();
        let access = manager.access_token().await.unwrap();
        assert_eq!(access.expose_secret(), "fresh");

        let saved = StoredToken::load(&token_path).unwrap();
        assert_eq!(saved.access_token, "fresh");
        assert_eq!(saved.refresh_token.as_deref(), Some("r1"));
        assert!(!saved.is_expired(Utc::now()));
    }

    #[tokio::test]
    async fn refresh_rejection_is_token_refresh_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let creds = write(
            dir.path(),
            "credentials.json",
            &secrets_json(&format!("{}/token", server.uri())),
        );
        let token_path = write(
            dir.path(),
            "token.json",
            r#"{"access_token":"stale","refresh_token":"r1","expires_at":1}"#,
        );

        let manager =
            TokenManager::load("default", &creds, &token_path, reqwest::Client::new()).unwrap();
        let err = manager.access_token().await.unwrap_err();
        assert!(matches!(err, SourceError::TokenRefresh { .. }));
    }

    #[tokio::test]
    async fn expired_without_refresh_token_fails_auth() {
        let dir = tempfile::tempdir().unwrap();
        let creds = write(dir.path(), "credentials.json", &secrets_json(DEFAULT_TOKEN_URI));
        let token_path = write(
            dir.path(),
            "token.json",
            r#"{"access_token":"stale","expires_at":1}"#,
        );
        let manager =
            TokenManager::load("default", &creds, &token_path, reqwest::Client::new()).unwrap();
        let err = manager.access_token().await.unwrap_err();
        assert!(matches!(err, SourceError::AuthFailed { .. }));
    }
}
