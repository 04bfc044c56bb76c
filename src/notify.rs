//! Outbound account emails.
//!
//! The auth service only decides *that* a verification or reset email should go out and
//! builds the link. Rendering and delivery belong to whatever sits behind [`Notifier`].

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Mail relay request failed: {0}")]
    Transport(String),
    #[error("Mail relay rejected message with status {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_verification_email(
        &self,
        email: &str,
        username: &str,
        link: &str,
    ) -> Result<(), NotifyError>;

    async fn send_password_reset_email(&self, email: &str, link: &str) -> Result<(), NotifyError>;
}

/// Writes the links to the log instead of sending mail. Development default.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_verification_email(
        &self,
        email: &str,
        username: &str,
        link: &str,
    ) -> Result<(), NotifyError> {
        log::info!("Verification email for {} <{}>: {}", username, email, link);
        Ok(())
    }

    async fn send_password_reset_email(&self, email: &str, link: &str) -> Result<(), NotifyError> {
        log::info!("Password reset email for <{}>: {}", email, link);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "template", rename_all = "snake_case")]
enum MailMessage<'a> {
    VerifyEmail {
        to: &'a str,
        username: &'a str,
        link: &'a str,
    },
    ResetPassword {
        to: &'a str,
        link: &'a str,
    },
}

/// Hands messages to an HTTP mail relay as JSON; the relay owns templates and retries.
#[derive(Debug, Clone)]
pub struct HttpMailNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpMailNotifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    async fn post(&self, message: &MailMessage<'_>) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(message)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for HttpMailNotifier {
    async fn send_verification_email(
        &self,
        email: &str,
        username: &str,
        link: &str,
    ) -> Result<(), NotifyError> {
        self.post(&MailMessage::VerifyEmail {
            to: email,
            username,
            link,
        })
        .await
    }

    async fn send_password_reset_email(&self, email: &str, link: &str) -> Result<(), NotifyError> {
        self.post(&MailMessage::ResetPassword { to: email, link })
            .await
    }
}

/// An email the [`ChannelNotifier`] was asked to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentEmail {
    Verification {
        email: String,
        username: String,
        link: String,
    },
    PasswordReset {
        email: String,
        link: String,
    },
}

impl SentEmail {
    pub fn email(&self) -> &str {
        match self {
            SentEmail::Verification { email, .. } | SentEmail::PasswordReset { email, .. } => email,
        }
    }

    pub fn link(&self) -> &str {
        match self {
            SentEmail::Verification { link, .. } | SentEmail::PasswordReset { link, .. } => link,
        }
    }

    /// The token embedded in the link, either as the last path segment or as `?token=`.
    pub fn token(&self) -> &str {
        let link = self.link();
        match link.split_once("token=") {
            Some((_, token)) => token,
            None => link.rsplit('/').next().unwrap_or(link),
        }
    }
}

/// Forwards every message to an unbounded channel. Lets embedding code (and tests)
/// observe outgoing mail without a relay.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<SentEmail>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SentEmail>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn forward(&self, email: SentEmail) -> Result<(), NotifyError> {
        self.sender
            .send(email)
            .map_err(|_| NotifyError::Transport("receiver dropped".to_string()))
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn send_verification_email(
        &self,
        email: &str,
        username: &str,
        link: &str,
    ) -> Result<(), NotifyError> {
        self.forward(SentEmail::Verification {
            email: email.to_string(),
            username: username.to_string(),
            link: link.to_string(),
        })
    }

    async fn send_password_reset_email(&self, email: &str, link: &str) -> Result<(), NotifyError> {
        self.forward(SentEmail::PasswordReset {
            email: email.to_string(),
            link: link.to_string(),
        })
    }
}
