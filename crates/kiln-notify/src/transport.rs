//! Mail transport.
//!
//! [`Mailer`] uses enum dispatch over the two transports, the same way
//! the sentiment classifier is selected: an HTTP mail API when credentials
//! are configured, otherwise a simulated transport that logs the message
//! and reports success.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::NotifyError;

/// One message handed to a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutgoingMail<'a> {
    /// Delivery address.
    pub recipient: &'a str,
    /// Subject line.
    pub subject: &'a str,
    /// Message body.
    pub body: &'a str,
    /// Whether `body` is HTML.
    pub is_html: bool,
}

/// Something that can deliver a message.
pub trait Transport: Send + Sync {
    /// Deliver one message.
    fn send(&self, mail: &OutgoingMail<'_>) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

/// Mail settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailerConfig {
    /// Send endpoint of the mail API.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// API user (public key).
    #[serde(default)]
    pub api_user: Option<String>,
    /// API key (secret).
    #[serde(default)]
    pub api_key: Option<String>,
    /// Sender address.
    #[serde(default = "default_from_address")]
    pub from_address: String,
    /// Sender display name.
    #[serde(default = "default_from_name")]
    pub from_name: String,
}

fn default_api_url() -> String {
    "https://api.mailjet.com/v3.1/send".to_owned()
}

fn default_from_address() -> String {
    "notifications@kiln.local".to_owned()
}

fn default_from_name() -> String {
    "Kiln".to_owned()
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_user: None,
            api_key: None,
            from_address: default_from_address(),
            from_name: default_from_name(),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// The configured transport.
#[derive(Debug, Clone)]
pub enum Mailer {
    /// Mail API over HTTPS.
    Http(HttpMailer),
    /// Log only.
    Simulated(SimulatedMailer),
}

impl Mailer {
    /// HTTP transport when both credentials are set, otherwise simulated.
    pub fn from_config(config: &MailerConfig) -> Self {
        let user = config.api_user.as_deref().filter(|s| !s.is_empty());
        let key = config.api_key.as_deref().filter(|s| !s.is_empty());
        match (user, key) {
            (Some(user), Some(key)) => Self::Http(HttpMailer::new(config, user, key)),
            _ => {
                info!("Mail credentials not configured, deliveries are simulated");
                Self::Simulated(SimulatedMailer)
            }
        }
    }

    /// Transport name for logs.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Simulated(_) => "simulated",
        }
    }
}

impl Transport for Mailer {
    async fn send(&self, mail: &OutgoingMail<'_>) -> Result<(), NotifyError> {
        match self {
            Self::Http(m) => m.send(mail).await,
            Self::Simulated(m) => m.send(mail).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Simulated
// ---------------------------------------------------------------------------

/// Logs each message and reports success.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedMailer;

impl Transport for SimulatedMailer {
    async fn send(&self, mail: &OutgoingMail<'_>) -> Result<(), NotifyError> {
        info!(
            recipient = mail.recipient,
            subject = mail.subject,
            html = mail.is_html,
            bytes = mail.body.len(),
            "Simulated email send"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Mail API client.
///
/// Posts one message per call with basic auth (`api_user:api_key`).
#[derive(Debug, Clone)]
pub struct HttpMailer {
    client: reqwest::Client,
    api_url: String,
    api_user: String,
    api_key: String,
    from_address: String,
    from_name: String,
}

impl HttpMailer {
    /// Create a client with explicit credentials.
    pub fn new(config: &MailerConfig, api_user: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: config.api_url.clone(),
            api_user: api_user.to_owned(),
            api_key: api_key.to_owned(),
            from_address: config.from_address.clone(),
            from_name: config.from_name.clone(),
        }
    }

    fn request_body(&self, mail: &OutgoingMail<'_>) -> serde_json::Value {
        let part = if mail.is_html { "HTMLPart" } else { "TextPart" };
        serde_json::json!({
            "Messages": [{
                "From": {"Email": self.from_address, "Name": self.from_name},
                "To": [{"Email": mail.recipient}],
                "Subject": mail.subject,
                (part): mail.body,
            }]
        })
    }
}

impl Transport for HttpMailer {
    async fn send(&self, mail: &OutgoingMail<'_>) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.api_url)
            .basic_auth(&self.api_user, Some(&self.api_key))
            .json(&self.request_body(mail))
            .send()
            .await
            .map_err(|e| NotifyError::Transport(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            debug!(recipient = mail.recipient, %status, "Email accepted by mail API");
            return Ok(());
        }
        let error_body = response
            .text()
            .await
            .unwrap_or_else(|_| "unable to read error body".to_owned());
        let message = format!("returned {status}: {error_body}");
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            Err(NotifyError::Unauthorized(message))
        } else if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(NotifyError::Rejected(message))
        } else {
            Err(NotifyError::Transport(message))
        }
    }
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn missing_credentials_simulate() {
        assert_eq!(Mailer::from_config(&MailerConfig::default()).name(), "simulated");
        let half = MailerConfig {
            api_user: Some("user".to_owned()),
            ..MailerConfig::default()
        };
        assert_eq!(Mailer::from_config(&half).name(), "simulated");
        let full = MailerConfig {
            api_user: Some("user".to_owned()),
            api_key: Some("key".to_owned()),
            ..MailerConfig::default()
        };
        assert_eq!(Mailer::from_config(&full).name(), "http");
    }

    #[test]
    fn html_goes_in_html_part() {
        let mailer = HttpMailer::new(&MailerConfig::default(), "u", "k");
        let body = mailer.request_body(&OutgoingMail {
            recipient: "kol@example.com",
            subject: "Hi",
            body: "<p>x</p>",
            is_html: true,
        });
        let message = &body["Messages"][0];
        assert_eq!(message["HTMLPart"], "<p>x</p>");
        assert_eq!(message["To"][0]["Email"], "kol@example.com");
        assert!(message.get("TextPart").is_none());
    }
}
