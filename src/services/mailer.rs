//! Outbound Email
//!
//! Best-effort SMTP delivery. Auth flows never fail because a mail could
//! not be sent; failures are logged and retried at most once.

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::EmailSettings;

pub struct Mailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl Mailer {
    pub fn new(settings: &EmailSettings) -> anyhow::Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.smtp_host)?
            .port(settings.smtp_port)
            .credentials(Credentials::new(
                settings.smtp_username.clone(),
                settings.smtp_password.clone(),
            ))
            .build();
        let from: Mailbox = format!("{} <{}>", settings.from_name, settings.from_email)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid from address: {e}"))?;
        Ok(Self { transport, from })
    }

    /// Send with at most one retry; never propagates failure.
    async fn send(&self, to: &str, subject: &str, body: String) {
        let Ok(to_mailbox) = to.parse::<Mailbox>() else {
            tracing::warn!(to, "skipping mail to unparseable address");
            return;
        };
        let message = match Message::builder()
            .from(self.from.clone())
            .to(to_mailbox)
            .subject(subject)
            .body(body)
        {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "failed to build email");
                return;
            }
        };

        for attempt in 0..2 {
            match self.transport.send(message.clone()).await {
                Ok(_) => {
                    tracing::info!(to, subject, "email sent");
                    return;
                }
                Err(e) if attempt == 0 => {
                    tracing::warn!(to, error = %e, "email send failed, retrying once");
                }
                Err(e) => {
                    tracing::error!(to, error = %e, "email send failed");
                }
            }
        }
    }

    pub async fn send_verification_email(&self, to: &str, token: &str, name: &str) {
        self.send(
            to,
            "Verify your email address",
            format!(
                "Hi {name},\n\nPlease verify your email address by opening:\n\n\
                 /verify-email/{token}\n\nThe link expires in 24 hours.\n"
            ),
        )
        .await;
    }

    pub async fn send_password_reset_email(&self, to: &str, token: &str, name: &str) {
        self.send(
            to,
            "Reset your password",
            format!(
                "Hi {name},\n\nA password reset was requested for your account.\n\
                 If this was you, open:\n\n/reset-password?token={token}\n\n\
                 The link expires in 1 hour. If you did not request this, you can \
                 ignore this message.\n"
            ),
        )
        .await;
    }

    pub async fn send_welcome_email(&self, to: &str, name: &str) {
        self.send(
            to,
            "Welcome to Kehilla Directory",
            format!("Hi {name},\n\nYour email address is confirmed. Welcome aboard!\n"),
        )
        .await;
    }
}
