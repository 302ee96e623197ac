use anyhow::Context;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::info;

use crate::config::{MailConfig, SmtpConfig};

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(smtp: &SmtpConfig, from: &str) -> anyhow::Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
            .with_context(|| format!("smtp relay {}", smtp.host))?
            .port(smtp.port);
        if let (Some(user), Some(pass)) = (&smtp.username, &smtp.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        Ok(Self {
            transport: builder.build(),
            from: from.parse().context("parse MAIL_FROM")?,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> anyhow::Result<()> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(to.parse().context("parse recipient")?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html.to_string())
            .context("build message")?;
        self.transport.send(message).await.context("smtp send")?;
        Ok(())
    }
}

/// Writes outgoing mail to the log. Used when no SMTP relay is configured.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> anyhow::Result<()> {
        info!(%to, %subject, body = %html, "mail not sent (no SMTP relay configured)");
        Ok(())
    }
}

pub fn from_config(cfg: &MailConfig) -> anyhow::Result<Box<dyn Mailer>> {
    match &cfg.smtp {
        Some(smtp) => Ok(Box::new(SmtpMailer::new(smtp, &cfg.from)?)),
        None => Ok(Box::new(LogMailer)),
    }
}
