use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A fully rendered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send one message, returning the provider's message id.
    async fn send(&self, email: &OutgoingEmail) -> Result<String, MailerError>;
}

/// Client for the Resend transactional email API.
pub struct ResendMailer {
    http: Client,
    base_url: String,
    api_key: String,
    from: String,
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

#[derive(Deserialize)]
struct SendEmailResponse {
    id: String,
}

impl ResendMailer {
    pub fn new(base_url: &str, api_key: &str, from: &str) -> Result<Self, MailerError> {
        if api_key.trim().is_empty() {
            return Err(MailerError::Config("Resend API key is empty".to_string()));
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(MailerError::Http)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            from: from.to_string(),
        })
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, MailerError> {
        let url = format!("{}/emails", self.base_url);
        let body = SendEmailRequest {
            from: &self.from,
            to: [email.to.as_str()],
            subject: &email.subject,
            html: &email.html,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(MailerError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(MailerError::Rejected {
                status: status.as_u16(),
                detail,
            });
        }

        let sent: SendEmailResponse = response.json().await.map_err(MailerError::Http)?;
        Ok(sent.id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MailerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Mailer configuration error: {0}")]
    Config(String),

    #[error("Mail provider rejected the message ({status}): {detail}")]
    Rejected { status: u16, detail: String },
}
