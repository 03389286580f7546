//! Dispatcher: sends a compiled digest over SMTP via lettre.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;

use crate::config::SmtpConfig;
use crate::error::DeliveryError;
use crate::pipeline::types::Digest;

/// What a dispatch attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent { recipient: String },
    /// Not sent, by configuration. No network I/O happened.
    Skipped { reason: String },
}

/// Delivers digests to a destination address.
#[async_trait]
pub trait DigestDispatcher: Send + Sync {
    async fn send(&self, digest: &Digest, destination: &str)
    -> Result<DispatchOutcome, DeliveryError>;
}

/// Authenticated SMTP delivery (STARTTLS, or implicit TLS on port 465).
pub struct SmtpDispatcher {
    config: SmtpConfig,
}

impl SmtpDispatcher {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn build_message(&self, digest: &Digest, destination: &str) -> Result<Message, DeliveryError> {
        let from: Mailbox = parse_mailbox(&self.config.sender)?;
        let to: Mailbox = parse_mailbox(destination)?;
        Message::builder()
            .from(from)
            .to(to)
            .subject(&self.config.subject)
            .header(ContentType::TEXT_HTML)
            .body(digest.html.clone())
            .map_err(|e| DeliveryError::Build(e.to_string()))
    }

    fn transport(&self, password: &str) -> Result<SmtpTransport, DeliveryError> {
        let builder = if self.config.port == 465 {
            SmtpTransport::relay(&self.config.host)
        } else {
            SmtpTransport::starttls_relay(&self.config.host)
        }
        .map_err(|e| DeliveryError::Transport(format!("SMTP relay error: {e}")))?;

        Ok(builder
            .port(self.config.port)
            .credentials(Credentials::new(
                self.config.sender.clone(),
                password.to_string(),
            ))
            .timeout(Some(self.config.timeout))
            .build())
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, DeliveryError> {
    address
        .parse()
        .map_err(|e: lettre::address::AddressError| DeliveryError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

/// 530/534/535 are authentication rejections.
fn is_auth_failure(e: &lettre::transport::smtp::Error) -> bool {
    e.status()
        .is_some_and(|code| code.to_string().starts_with("53"))
}

#[async_trait]
impl DigestDispatcher for SmtpDispatcher {
    async fn send(
        &self,
        digest: &Digest,
        destination: &str,
    ) -> Result<DispatchOutcome, DeliveryError> {
        let Some(password) = self.config.app_password.as_ref() else {
            tracing::warn!("GMAIL_APP_PASSWORD not set. Skipping email send.");
            return Ok(DispatchOutcome::Skipped {
                reason: "GMAIL_APP_PASSWORD not set".to_string(),
            });
        };

        let message = self.build_message(digest, destination)?;
        let transport = self.transport(password.expose_secret())?;
        let user = self.config.sender.clone();

        let result = tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| DeliveryError::Transport(format!("SMTP task panicked: {e}")))?;

        match result {
            Ok(_) => {
                tracing::info!(recipient = %destination, "Digest sent");
                Ok(DispatchOutcome::Sent {
                    recipient: destination.to_string(),
                })
            }
            Err(e) if is_auth_failure(&e) => {
                tracing::error!(
                    "SMTP authentication failed. Check SENDER_EMAIL and GMAIL_APP_PASSWORD."
                );
                Err(DeliveryError::AuthFailed {
                    user,
                    reason: e.to_string(),
                })
            }
            Err(e) => {
                tracing::error!(error = %e, "SMTP send failed");
                Err(DeliveryError::Transport(e.to_string()))
            }
        }
    }
}
