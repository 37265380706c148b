// src/notify.rs
//
// Best-effort purchase emails. Nothing in here returns an error to the
// webhook pipeline: every failure ends up in a NotificationReceipt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use handlebars::Handlebars;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;

use crate::config::MailSettings;

const GRANT_TEMPLATE: &str = "access_granted";
const REVOKE_TEMPLATE: &str = "access_revoked";

const GRANT_BODY: &str = r#"<p>Hi {{name}},</p>
<p>Thanks for your purchase of <strong>{{product}}</strong> (order {{order_id}}).</p>
<p>Your access is active until {{expires_at}}. Use this access token to enter:</p>
<pre>{{token}}</pre>
<p>If the token expires you can refresh it as long as your access has not been revoked.</p>"#;

const REVOKE_BODY: &str = r#"<p>Hi {{name}},</p>
<p>Your access to <strong>{{product}}</strong> has been revoked.</p>
<p>Reason: {{reason}}</p>
<p>Reply to this email if you think this is a mistake.</p>"#;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notifications disabled")]
    Disabled,

    #[error("template error: {0}")]
    Template(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("mail api error status={status} body={body}")]
    Api { status: u16, body: String },

    #[error("mail send timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OutboundEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), NotifyError>;
}

/// Posts messages as JSON to a transactional mail HTTP API with a bearer key.
pub struct HttpMailer {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl HttpMailer {
    pub fn new(settings: &MailSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: settings.api_url.clone(),
            api_key: settings.api_key.clone(),
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(email)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(NotifyError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

/// Used when no mail API is configured.
pub struct DisabledMailer;

#[async_trait]
impl Mailer for DisabledMailer {
    async fn send(&self, _email: &OutboundEmail) -> Result<(), NotifyError> {
        Err(NotifyError::Disabled)
    }
}

/// Keeps every message in memory. Can be switched into a failing mode.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutboundEmail>>,
    failing: AtomicBool,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Api {
                status: 503,
                body: "mail relay unavailable".into(),
            });
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(email.clone());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GrantNotice {
    pub display_name: Option<String>,
    pub product_id: String,
    pub product_title: Option<String>,
    pub order_id: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RevokeNotice {
    pub display_name: Option<String>,
    pub product_id: String,
    pub product_title: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema, PartialEq, Eq)]
pub struct NotificationReceipt {
    pub sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl NotificationReceipt {
    fn sent() -> Self {
        Self {
            sent: true,
            reason: None,
        }
    }

    fn failed(err: &NotifyError) -> Self {
        Self {
            sent: false,
            reason: Some(err.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    mailer: Arc<dyn Mailer>,
    templates: Handlebars<'static>,
    from: String,
    timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        mailer: Arc<dyn Mailer>,
        from: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let mut templates = Handlebars::new();
        // missing variables fail the render instead of producing blanks
        templates.set_strict_mode(true);
        templates
            .register_template_string(GRANT_TEMPLATE, GRANT_BODY)
            .map_err(|e| NotifyError::Template(e.to_string()))?;
        templates
            .register_template_string(REVOKE_TEMPLATE, REVOKE_BODY)
            .map_err(|e| NotifyError::Template(e.to_string()))?;

        Ok(Self {
            mailer,
            templates,
            from: from.into(),
            timeout,
        })
    }

    pub async fn send_grant_notice(&self, recipient: &str, notice: &GrantNotice) -> NotificationReceipt {
        let product = notice.product_title.as_deref().unwrap_or(&notice.product_id);
        let data = json!({
            "name": notice.display_name.as_deref().unwrap_or("there"),
            "product": product,
            "order_id": notice.order_id,
            "token": notice.token,
            "expires_at": notice.expires_at.format("%Y-%m-%d %H:%M UTC").to_string(),
        });
        let subject = format!("Your access to {product} is ready");

        match self.deliver(GRANT_TEMPLATE, recipient, subject, &data).await {
            Ok(()) => {
                log::info!(
                    "grant notice sent product_id={} order_id={}",
                    notice.product_id,
                    notice.order_id
                );
                NotificationReceipt::sent()
            }
            Err(e) => {
                log::warn!(
                    "grant notice not sent product_id={} order_id={} error={e}",
                    notice.product_id,
                    notice.order_id
                );
                NotificationReceipt::failed(&e)
            }
        }
    }

    pub async fn send_revoke_notice(
        &self,
        recipient: &str,
        notice: &RevokeNotice,
        reason: &str,
    ) -> NotificationReceipt {
        let product = notice.product_title.as_deref().unwrap_or(&notice.product_id);
        let data = json!({
            "name": notice.display_name.as_deref().unwrap_or("there"),
            "product": product,
            "reason": reason,
        });
        let subject = format!("Your access to {product} has ended");

        match self.deliver(REVOKE_TEMPLATE, recipient, subject, &data).await {
            Ok(()) => {
                log::info!(
                    "revoke notice sent product_id={} reason={reason}",
                    notice.product_id
                );
                NotificationReceipt::sent()
            }
            Err(e) => {
                log::warn!(
                    "revoke notice not sent product_id={} error={e}",
                    notice.product_id
                );
                NotificationReceipt::failed(&e)
            }
        }
    }

    async fn deliver(
        &self,
        template: &str,
        recipient: &str,
        subject: String,
        data: &serde_json::Value,
    ) -> Result<(), NotifyError> {
        let html = self
            .templates
            .render(template, data)
            .map_err(|e| NotifyError::Template(e.to_string()))?;
        let email = OutboundEmail {
            from: self.from.clone(),
            to: recipient.to_string(),
            subject,
            html,
        };

        match tokio::time::timeout(self.timeout, self.mailer.send(&email)).await {
            Ok(result) => result,
            Err(_) => Err(NotifyError::Timeout(self.timeout)),
        }
    }
}
