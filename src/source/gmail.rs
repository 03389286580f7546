//! Gmail REST API message source.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::mime::MimePart;
use super::oauth::TokenManager;
use super::{FetchResult, MarkReport, MessageFilter, MessageSource};
use crate::config::GmailConfig;
use crate::error::SourceError;
use crate::pipeline::types::RawMessage;

/// Gmail emits URL-safe base64 with or without padding.
const BASE64_URL: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Debug, Deserialize)]
struct Label {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    internal_date: Option<String>,
    payload: Option<Payload>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Payload {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: PartBody,
    #[serde(default)]
    parts: Vec<Payload>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct PartBody {
    data: Option<String>,
}

impl Payload {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Convert to a [`MimePart`]. Undecodable bodies become `None`.
    fn into_mime(self) -> MimePart {
        let data = self.body.data.and_then(|d| match BASE64_URL.decode(d.as_bytes()) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::debug!(
                    mime_type = %self.mime_type,
                    error = %e,
                    "Skipping undecodable part body"
                );
                None
            }
        });
        MimePart {
            mime_type: self.mime_type,
            data,
            parts: self.parts.into_iter().map(Payload::into_mime).collect(),
        }
    }
}

// ── Source ──────────────────────────────────────────────────────────

/// Reads labeled mail through the Gmail REST API.
pub struct GmailSource {
    account: String,
    api_base: String,
    http: reqwest::Client,
    tokens: TokenManager,
    timeout: std::time::Duration,
}

impl GmailSource {
    /// Load credentials. Fails with a config error if either file is missing.
    pub fn new(account: &str, config: GmailConfig) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SourceError::Request(format!("failed to build HTTP client: {e}")))?;
        let tokens = TokenManager::load(
            account,
            &config.credentials_file,
            &config.token_file,
            http.clone(),
        )?;
        Ok(Self {
            account: account.to_string(),
            api_base: config.api_base,
            http,
            tokens,
            timeout: config.timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/gmail/v1/users/me/{path}", self.api_base)
    }

    fn map_reqwest(&self, e: reqwest::Error) -> SourceError {
        if e.is_timeout() {
            SourceError::Timeout(self.timeout)
        } else {
            SourceError::Request(e.to_string())
        }
    }

    /// Send with a bearer token, retrying once with a refreshed token on 401.
    async fn send(
        &self,
        build: impl Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, SourceError> {
        let token = self.tokens.access_token().await?;
        let response = build(&self.http)
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;

        let response = if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            tracing::debug!(account = %self.account, "Gmail returned 401, refreshing token");
            let token = self.tokens.force_refresh().await?;
            build(&self.http)
                .bearer_auth(token.expose_secret())
                .send()
                .await
                .map_err(|e| self.map_reqwest(e))?
        } else {
            response
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::AuthFailed {
                account: self.account.clone(),
                reason: format!("{status}: {body}"),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Request(format!("{status}: {body}")));
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let url = self.url(path);
        let response = self.send(|http| http.get(&url).query(query)).await?;
        response
            .json()
            .await
            .map_err(|e| SourceError::InvalidResponse(format!("{path}: {e}")))
    }

    async fn find_label_id(&self, name: &str) -> Result<Option<String>, SourceError> {
        let list: LabelList = self.get_json("labels", &[]).await?;
        Ok(list.labels.into_iter().find(|l| l.name == name).map(|l| l.id))
    }

    async fn fetch_message(&self, id: &str) -> Result<RawMessage, SourceError> {
        let message: GmailMessage = self
            .get_json(&format!("messages/{id}"), &[("format", "full".to_string())])
            .await?;
        Ok(to_raw_message(message))
    }

    async fn mark_one(&self, id: &str) -> Result<(), SourceError> {
        let url = self.url(&format!("messages/{id}/modify"));
        let body = serde_json::json!({ "removeLabelIds": ["UNREAD"] });
        self.send(|http| http.post(&url).json(&body)).await?;
        Ok(())
    }
}

/// Gmail search syntax wants hyphens in place of spaces in label names.
pub fn label_query(label: &str, unread_only: bool) -> String {
    let label = label.split_whitespace().collect::<Vec<_>>().join("-");
    if unread_only {
        format!("label:{label} is:unread")
    } else {
        format!("label:{label}")
    }
}

fn to_raw_message(message: GmailMessage) -> RawMessage {
    let payload = message.payload.unwrap_or_default();
    let sender = payload
        .header("From")
        .unwrap_or("Unknown Sender")
        .to_string();
    let subject = payload.header("Subject").unwrap_or("No Subject").to_string();
    let received_at = message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    RawMessage {
        id: message.id,
        sender,
        subject,
        body: payload.into_mime(),
        received_at,
    }
}

#[async_trait]
impl MessageSource for GmailSource {
    fn name(&self) -> &str {
        "gmail"
    }

    async fn fetch(
        &self,
        filter: &MessageFilter,
        limit: usize,
    ) -> Result<FetchResult, SourceError> {
        let mut result = FetchResult::default();

        if self.find_label_id(&filter.label).await?.is_none() {
            let warning = format!(
                "Label '{}' not found. Create it in Gmail and apply it to newsletters.",
                filter.label
            );
            tracing::warn!(account = %self.account, "{warning}");
            result.warnings.push(warning);
            return Ok(result);
        }

        let query = label_query(&filter.label, filter.unread_only);
        let list: MessageList = self
            .get_json(
                "messages",
                &[("q", query), ("maxResults", limit.to_string())],
            )
            .await?;

        tracing::info!(
            account = %self.account,
            count = list.messages.len(),
            label = %filter.label,
            "Found matching messages"
        );

        for msg in list.messages.into_iter().take(limit) {
            result.messages.push(self.fetch_message(&msg.id).await?);
        }
        Ok(result)
    }

    async fn mark_consumed(&self, ids: &[String]) -> MarkReport {
        let mut report = MarkReport::default();
        for id in ids {
            report.record(id, self.mark_one(id).await);
        }
        tracing::info!(
            account = %self.account,
            marked = report.marked.len(),
            failed = report.failures.len(),
            "Marked messages as read"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use base64::engine::general_purpose;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::error::ConfigError;
    use crate::source::mime::extract_body;

    fn b64(s: &str) -> String {
        general_purpose::URL_SAFE_NO_PAD.encode(s)
    }

    fn write_credentials(dir: &Path) -> GmailConfig {
        std::fs::write(
            dir.join("credentials.json"),
            r#"{"installed":{"client_id":"cid","client_secret":"cs"}}"#,
        )
        .unwrap();
        std::fs::write(dir.join("token.json"), r#"{"access_token":"tok"}"#).unwrap();
        GmailConfig {
            credentials_file: dir.join("credentials.json"),
            token_file: dir.join("token.json"),
            api_base: String::new(),
            timeout: std::time::Duration::from_secs(5),
        }
    }

    async fn source(server: &MockServer, dir: &Path) -> GmailSource {
        let mut config = write_credentials(dir);
        config.api_base = server.uri();
        GmailSource::new("default", config).unwrap()
    }

    async fn mount_labels(server: &MockServer, names: &[&str]) {
        let labels: Vec<_> = names
            .iter()
            .enumerate()
            .map(|(i, n)| serde_json::json!({"id": format!("Label_{i}"), "name": n}))
            .collect();
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/labels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "labels": labels
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn label_query_format() {
        assert_eq!(label_query("To-Summarize", true), "label:To-Summarize is:unread");
        assert_eq!(label_query("My News", true), "label:My-News is:unread");
        assert_eq!(label_query("News", false), "label:News");
    }

    #[test]
    fn payload_decodes_padded_and_unpadded() {
        let padded = general_purpose::URL_SAFE.encode("ab");
        let payload = Payload {
            mime_type: "multipart/alternative".into(),
            parts: vec![
                Payload {
                    mime_type: "text/plain".into(),
                    body: PartBody {
                        data: Some(padded),
                    },
                    ..Default::default()
                },
                Payload {
                    mime_type: "text/html".into(),
                    body: PartBody {
                        data: Some(b64("<p>cd</p>")),
                    },
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(extract_body(&payload.into_mime()), "ab\n<p>cd</p>");
    }

    #[test]
    fn missing_headers_get_placeholders() {
        let raw = to_raw_message(GmailMessage {
            id: "x".into(),
            internal_date: Some("1700000000000".into()),
            payload: None,
        });
        assert_eq!(raw.sender, "Unknown Sender");
        assert_eq!(raw.subject, "No Subject");
        assert_eq!(raw.received_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn missing_credentials_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = GmailConfig {
            credentials_file: dir.path().join("nope.json"),
            token_file: dir.path().join("nope-token.json"),
            api_base: "http://localhost".into(),
            timeout: std::time::Duration::from_secs(1),
        };
        let err = GmailSource::new("default", config).err().unwrap();
        assert!(matches!(
            err,
            SourceError::Config(ConfigError::CredentialFileMissing(_))
        ));
    }

    #[tokio::test]
    async fn missing_label_yields_empty_with_warning() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        mount_labels(&server, &["INBOX", "Other"]).await;

        let src = source(&server, dir.path()).await;
        let result = src
            .fetch(&MessageFilter::unread("To-Summarize"), 10)
            .await
            .unwrap();
        assert!(result.messages.is_empty());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("To-Summarize"));
    }

    #[tokio::test]
    async fn fetch_lists_and_decodes_messages() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        mount_labels(&server, &["To-Summarize"]).await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .and(query_param("q", "label:To-Summarize is:unread"))
            .and(query_param("maxResults", "10"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [{"id": "m1", "threadId": "t1"}]
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/m1"))
            .and(query_param("format", "full"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "m1",
                "internalDate": "1700000000000",
                "payload": {
                    "mimeType": "text/html",
                    "headers": [
                        {"name": "From", "value": "Morning Brew <crew@morningbrew.com>"},
                        {"name": "Subject", "value": "Markets today"}
                    ],
                    "body": {"size": 12, "data": b64("<p>Stocks rose.</p>")}
                }
            })))
            .mount(&server)
            .await;

        let src = source(&server, dir.path()).await;
        let result = src
            .fetch(&MessageFilter::unread("To-Summarize"), 10)
            .await
            .unwrap();
        assert!(result.warnings.is_empty());
        assert_eq!(result.messages.len(), 1);
        let msg = &result.messages[0];
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.subject, "Markets today");
        assert_eq!(msg.sender, "Morning Brew <crew@morningbrew.com>");
        assert_eq!(extract_body(&msg.body), "<p>Stocks rose.</p>");
    }

    #[tokio::test]
    async fn mark_consumed_is_best_effort() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        for id in ["a", "c"] {
            Mock::given(method("POST"))
                .and(path(format!("/gmail/v1/users/me/messages/{id}/modify")))
                .and(body_json(serde_json::json!({"removeLabelIds": ["UNREAD"]})))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
                .mount(&server)
                .await;
        }
        Mock::given(method("POST"))
            .and(path("/gmail/v1/users/me/messages/b/modify"))
            .respond_with(ResponseTemplate::new(500).set_body_string("backend error"))
            .mount(&server)
            .await;

        let src = source(&server, dir.path()).await;
        let report = src
            .mark_consumed(&["a".into(), "b".into(), "c".into()])
            .await;
        assert_eq!(report.marked, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "b");
    }

    #[tokio::test]
    async fn forbidden_is_auth_failure() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/labels"))
            .respond_with(ResponseTemplate::new(403).set_body_string("insufficient scope"))
            .mount(&server)
            .await;

        let src = source(&server, dir.path()).await;
        let err = src
            .fetch(&MessageFilter::unread("To-Summarize"), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::AuthFailed { .. }));
    }
}
