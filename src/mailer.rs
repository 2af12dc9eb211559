//! Outbound mail.
//!
//! The site only sends transactional mail (one-time codes). Delivery goes to
//! an HTTP mail API when one is configured; otherwise messages are logged.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;

use crate::config::SiteConfig;
use crate::error::{Result, SiteError};

/// A message ready to be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub text: String,
}

/// Boxed future returned by [`Mailer::send`].
pub type MailFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Mail transport.
pub trait Mailer: Send + Sync {
    fn send(&self, mail: OutgoingMail) -> MailFuture<'_>;
}

/// Posts mail as JSON to an HTTP mail API.
pub struct HttpMailer {
    http_client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    from: String,
}

#[derive(Serialize)]
struct MailPayload<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
}

impl HttpMailer {
    pub fn new(api_url: impl Into<String>, api_key: Option<String>, from: impl Into<String>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key,
            from: from.into(),
        }
    }

    async fn deliver(&self, mail: OutgoingMail) -> Result<()> {
        let payload = MailPayload {
            from: &self.from,
            to: &mail.to,
            subject: &mail.subject,
            text: &mail.text,
        };

        let mut request = self.http_client.post(&self.api_url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SiteError::Mail(format!(
                "Mail API returned {}: {}",
                status, body
            )));
        }

        tracing::info!(subject = %mail.subject, "Mail delivered");
        Ok(())
    }
}

impl Mailer for HttpMailer {
    fn send(&self, mail: OutgoingMail) -> MailFuture<'_> {
        Box::pin(self.deliver(mail))
    }
}

/// Logs mail instead of sending it.
#[derive(Debug, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, mail: OutgoingMail) -> MailFuture<'_> {
        Box::pin(async move {
            tracing::info!(
                to = %mail.to,
                subject = %mail.subject,
                "Mail delivery not configured, message logged only"
            );
            tracing::debug!(body = %mail.text, "Logged mail body");
            Ok(())
        })
    }
}

/// Pick the transport for `config`.
pub fn from_config(config: &SiteConfig) -> Arc<dyn Mailer> {
    match &config.mail_api_url {
        Some(url) => Arc::new(HttpMailer::new(
            url.clone(),
            config.mail_api_key.clone(),
            config.mail_from.clone(),
        )),
        None => {
            tracing::warn!("MAIL_API_URL not set, outgoing mail will only be logged");
            Arc::new(LogMailer)
        }
    }
}

/// Records mail in memory. Used by tests to read one-time codes.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingMailer {
    pub sent: std::sync::Mutex<Vec<OutgoingMail>>,
}

#[cfg(test)]
impl RecordingMailer {
    pub fn last(&self) -> Option<OutgoingMail> {
        self.sent.lock().ok()?.last().cloned()
    }
}

#[cfg(test)]
impl Mailer for RecordingMailer {
    fn send(&self, mail: OutgoingMail) -> MailFuture<'_> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(mail);
        }
        Box::pin(async { Ok(()) })
    }
}
