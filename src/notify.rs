//! Customer notifications.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::domain::aggregates::EarlyAppeal;

const RESEND_URL: &str = "https://api.resend.com/emails";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Transport(String),
    #[error("notification rejected with HTTP {0}")]
    Rejected(u16),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn appeal_approved(appeal: &EarlyAppeal, app_url: &str) -> Self {
        Self {
            to: appeal.customer_email.clone(),
            subject: format!("Early Delivery Appeal Approved - Order {}", appeal.order_id),
            body: format!(
                "Your early delivery appeal for order {} has been approved.\n\n\
                 You can now activate your product immediately: {}/activate\n\n\
                 Thank you for your patience.",
                appeal.order_id,
                app_url.trim_end_matches('/'),
            ),
        }
    }

    pub fn appeal_rejected(appeal: &EarlyAppeal) -> Self {
        let reason = appeal
            .rejection_reason
            .as_deref()
            .map(|r| format!("\nReason: {r}\n"))
            .unwrap_or_default();
        Self {
            to: appeal.customer_email.clone(),
            subject: format!("Early Delivery Appeal Update - Order {}", appeal.order_id),
            body: format!(
                "We reviewed your early delivery appeal for order {}.\n\n\
                 Unfortunately, we were unable to verify your proof of delivery at this time.\n{reason}\n\
                 You can still activate your product once the estimated delivery date has passed. \
                 If you believe this was an error, please contact support with additional proof.",
                appeal.order_id,
            ),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Sends email through the Resend API.
pub struct ResendNotifier {
    http: reqwest::Client,
    api_key: String,
    from: String,
}

#[derive(Serialize)]
struct ResendEmail<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
}

impl ResendNotifier {
    pub fn new(api_key: impl Into<String>, from: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self { http, api_key: api_key.into(), from: from.into() })
    }
}

#[async_trait]
impl Notifier for ResendNotifier {
    async fn send(&self, n: &Notification) -> Result<(), NotifyError> {
        let body = ResendEmail { from: &self.from, to: [&n.to], subject: &n.subject, text: &n.body };
        let resp = self
            .http
            .post(RESEND_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(NotifyError::Rejected(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// Writes notifications to the log; used when no email provider is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, n: &Notification) -> Result<(), NotifyError> {
        tracing::info!(to = %n.to, subject = %n.subject, "notification (email disabled)");
        Ok(())
    }
}
