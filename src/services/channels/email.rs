use std::time::Duration;

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{authentication::Credentials, Error as SmtpError},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use uuid::Uuid;

use super::{ChannelError, DeliveryChannel};
use crate::db::models::Channel;

const DEFAULT_SUBJECT: &str = "CI/CD notification";

/// SMTP connection settings.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: String,
    pub from_name: String,
}

/// SMTP email sender.
pub struct EmailChannel {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    domain: String,
}

impl EmailChannel {
    pub fn new(settings: &SmtpSettings) -> Result<Self, ChannelError> {
        let address = settings
            .from_address
            .parse()
            .map_err(|e| ChannelError::InvalidMessage(format!("invalid from address: {}", e)))?;
        let from = Mailbox::new(Some(settings.from_name.clone()), address);

        // Port 465 speaks implicit TLS, everything else negotiates STARTTLS.
        let builder = if settings.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
        }
        .map_err(|e| ChannelError::Unavailable(format!("invalid SMTP host: {}", e)))?
        .port(settings.port)
        .timeout(Some(Duration::from_secs(30)));

        let builder = match (&settings.username, &settings.password) {
            (Some(user), Some(pass)) => builder.credentials(Credentials::new(user.clone(), pass.clone())),
            _ => builder,
        };

        let domain = settings
            .from_address
            .rsplit_once('@')
            .map(|(_, d)| d.to_string())
            .unwrap_or_else(|| "localhost".to_string());

        Ok(Self {
            mailer: builder.build(),
            from,
            domain,
        })
    }
}

fn build_message(
    from: &Mailbox,
    domain: &str,
    recipient: &str,
    subject: Option<&str>,
    body: &str,
) -> Result<(Message, String), ChannelError> {
    let to: Mailbox = recipient
        .trim()
        .parse()
        .map_err(|e| ChannelError::InvalidRecipient(format!("{}: {}", recipient, e)))?;

    let message_id = format!("<{}@{}>", Uuid::new_v4(), domain);
    let message = Message::builder()
        .from(from.clone())
        .to(to)
        .subject(subject.filter(|s| !s.is_empty()).unwrap_or(DEFAULT_SUBJECT))
        .message_id(Some(message_id.clone()))
        .header(ContentType::TEXT_PLAIN)
        .body(body.to_string())
        .map_err(|e| ChannelError::InvalidMessage(format!("failed to build email: {}", e)))?;

    Ok((message, message_id))
}

fn map_smtp_error(err: SmtpError) -> ChannelError {
    let msg = err.to_string();
    if err.is_timeout() || err.is_transient() {
        return ChannelError::Transport(msg);
    }
    if err.is_permanent() {
        return match err.status().map(|code| code.to_string()) {
            Some(code) if code == "530" || code == "535" => ChannelError::Unauthorized(msg),
            _ => ChannelError::InvalidRecipient(msg),
        };
    }
    ChannelError::Other(msg)
}

#[async_trait]
impl DeliveryChannel for EmailChannel {
    async fn send(
        &self,
        recipient: &str,
        subject: Option<&str>,
        message: &str,
    ) -> Result<String, ChannelError> {
        let (email, message_id) = build_message(&self.from, &self.domain, recipient, subject, message)?;

        self.mailer.send(email).await.map_err(map_smtp_error)?;

        tracing::debug!("Email sent to {}: message_id={}", recipient, message_id);
        Ok(message_id)
    }

    fn channel_type(&self) -> Channel {
        Channel::Email
    }

    async fn is_available(&self) -> bool {
        match self.mailer.test_connection().await {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!("SMTP connection test failed: {}", e);
                false
            }
        }
    }

    fn max_retries(&self) -> u32 {
        5
    }

    fn rate_limit_info(&self) -> (u32, Duration) {
        (10, Duration::from_secs(60))
    }
}
