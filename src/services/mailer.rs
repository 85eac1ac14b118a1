use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use lettre::message::header::ContentType;
use lettre::message::{Attachment as LettreAttachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;

use crate::models::campaign::Attachment;

/// Delivery failures, split by whether a retry can help. 5xx rejections and
/// unparseable addresses are permanent; everything else (4xx, timeouts,
/// connection trouble) is transient.
#[derive(Debug, Error, Clone)]
pub enum MailerError {
    #[error("transient transport failure: {0}")]
    Transient(String),
    #[error("permanent transport failure: {0}")]
    Permanent(String),
}

/// One fully-composed recipient message, transport-agnostic.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body_html: String,
    pub attachments: Vec<Attachment>,
}

/// Opaque SMTP-delivery capability. Returns the relay message id.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<String, MailerError>;
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_ms: u64,
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    timeout: Duration,
}

impl SmtpMailer {
    pub fn new(settings: &SmtpSettings) -> Result<Self, MailerError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
            .map_err(|e| MailerError::Permanent(format!("failed to create transport: {}", e)))?
            .port(settings.port);

        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            timeout: Duration::from_millis(settings.timeout_ms),
        })
    }

    fn build_message(&self, email: &OutboundEmail) -> Result<Message, MailerError> {
        let from = email
            .from
            .parse()
            .map_err(|e| MailerError::Permanent(format!("invalid from address: {}", e)))?;
        let to = email
            .to
            .parse()
            .map_err(|e| MailerError::Permanent(format!("invalid to address: {}", e)))?;

        let alternative = MultiPart::alternative()
            .singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_PLAIN)
                    .body(strip_html(&email.body_html)),
            )
            .singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_HTML)
                    .body(email.body_html.clone()),
            );

        let builder = Message::builder().from(from).to(to).subject(&email.subject);

        if email.attachments.is_empty() {
            return builder
                .multipart(alternative)
                .map_err(|e| MailerError::Permanent(format!("failed to build email: {}", e)));
        }

        let mut mixed = MultiPart::mixed().multipart(alternative);
        for attachment in &email.attachments {
            let bytes = BASE64
                .decode(&attachment.data)
                .map_err(|e| MailerError::Permanent(format!("invalid attachment encoding: {}", e)))?;
            let content_type = ContentType::parse(&attachment.content_type).map_err(|_| {
                MailerError::Permanent(format!(
                    "invalid attachment content type: {}",
                    attachment.content_type
                ))
            })?;
            mixed = mixed.singlepart(
                LettreAttachment::new(attachment.filename.clone()).body(bytes, content_type),
            );
        }

        builder
            .multipart(mixed)
            .map_err(|e| MailerError::Permanent(format!("failed to build email: {}", e)))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<String, MailerError> {
        let message = self.build_message(email)?;

        let response = match tokio::time::timeout(self.timeout, self.transport.send(message)).await
        {
            Ok(result) => result.map_err(classify_smtp_error)?,
            Err(_) => {
                return Err(MailerError::Transient(format!(
                    "smtp send timed out after {}ms",
                    self.timeout.as_millis()
                )))
            }
        };

        Ok(response.message().collect::<Vec<_>>().join(""))
    }
}

fn classify_smtp_error(e: lettre::transport::smtp::Error) -> MailerError {
    if e.is_permanent() {
        MailerError::Permanent(format!("SMTP error: {}", e))
    } else {
        MailerError::Transient(format!("SMTP error: {}", e))
    }
}

fn strip_html(html: &str) -> String {
    static TAG: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"<[^>]*>").unwrap());
    TAG.replace_all(html, "").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_html_removes_tags() {
        assert_eq!(strip_html("<p>Hi <b>there</b></p>"), "Hi there");
        assert_eq!(strip_html("no markup"), "no markup");
    }

    #[tokio::test]
    async fn build_message_rejects_bad_addresses() {
        let mailer = SmtpMailer::new(&SmtpSettings {
            host: "smtp.example.com".to_string(),
            port: 587,
            username: None,
            password: None,
            timeout_ms: 1000,
        })
        .unwrap();

        let email = OutboundEmail {
            from: "noreply@reachinbox.app".to_string(),
            to: "not an address".to_string(),
            subject: "Hi".to_string(),
            body_html: "<p>Hi</p>".to_string(),
            attachments: vec![],
        };

        match mailer.build_message(&email) {
            Err(MailerError::Permanent(_)) => {}
            other => panic!("expected permanent failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn build_message_rejects_undecodable_attachment() {
        let mailer = SmtpMailer::new(&SmtpSettings {
            host: "smtp.example.com".to_string(),
            port: 587,
            username: None,
            password: None,
            timeout_ms: 1000,
        })
        .unwrap();

        let email = OutboundEmail {
            from: "noreply@reachinbox.app".to_string(),
            to: "a@x.io".to_string(),
            subject: "Hi".to_string(),
            body_html: "<p>Hi</p>".to_string(),
            attachments: vec![Attachment {
                filename: "a.txt".to_string(),
                content_type: "text/plain".to_string(),
                data: "%%% not base64 %%%".to_string(),
            }],
        };

        match mailer.build_message(&email) {
            Err(MailerError::Permanent(_)) => {}
            other => panic!("expected permanent failure, got {:?}", other.map(|_| ())),
        }
    }
}
