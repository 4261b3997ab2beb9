//! Operator notification for cursors that need a human.
//!
//! Notices go to the loadout's webhook targets. The loadout's
//! `notification_email` travels in the payload as `operator_email`; mail
//! delivery is left to the webhook receiver.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sha2::Sha256;
use tracing::{info, warn};

use loadout_core::config::NotificationsConfig;
use loadout_core::domain::agent::AgentType;
use loadout_core::domain::contact::ContactId;
use loadout_core::domain::loadout::{LoadoutId, TenantId};

pub const SIGNATURE_HEADER: &str = "X-Loadout-Signature";

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NeedsAttentionNotice {
    pub event: &'static str,
    pub tenant_id: TenantId,
    pub loadout_id: LoadoutId,
    pub contact_id: ContactId,
    pub step_index: u32,
    pub agent_type: Option<AgentType>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub operator_email: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn needs_attention(
        &self,
        notice: &NeedsAttentionNotice,
        webhook_urls: &[String],
    ) -> DeliveryReport;
}

/// Logs every notice at `warn` and, when enabled, posts it to the loadout's
/// webhook targets. Delivery failures are logged and never propagated.
pub struct WebhookNotifier {
    enabled: bool,
    signing_secret: Option<SecretString>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn from_config(config: &NotificationsConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self { enabled: config.enabled, signing_secret: config.signing_secret.clone(), client })
    }

    async fn deliver(&self, url: &str, body: &[u8]) -> Result<(), String> {
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec());
        if let Some(secret) = &self.signing_secret {
            request = request.header(SIGNATURE_HEADER, sign(secret.expose_secret(), body));
        }

        let response = request.send().await.map_err(|error| error.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("webhook responded {}", response.status()))
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn needs_attention(
        &self,
        notice: &NeedsAttentionNotice,
        webhook_urls: &[String],
    ) -> DeliveryReport {
        warn!(
            event_name = "engine.cursor.needs_attention",
            tenant_id = %notice.tenant_id.0,
            loadout_id = %notice.loadout_id.0,
            contact_id = %notice.contact_id.0,
            step_index = notice.step_index,
            attempts = notice.attempts,
            last_error = notice.last_error.as_deref().unwrap_or(""),
            operator_email = notice.operator_email.as_deref().unwrap_or(""),
            "contact needs operator attention"
        );

        let mut report = DeliveryReport::default();
        if !self.enabled || webhook_urls.is_empty() {
            return report;
        }

        let body = match serde_json::to_vec(notice) {
            Ok(body) => body,
            Err(error) => {
                warn!(
                    event_name = "notify.webhook.encode_failed",
                    error = %error,
                    "could not encode operator notice"
                );
                report.failed = webhook_urls.len();
                return report;
            }
        };

        for url in webhook_urls {
            match self.deliver(url, &body).await {
                Ok(()) => {
                    report.delivered += 1;
                    info!(
                        event_name = "notify.webhook.delivered",
                        tenant_id = %notice.tenant_id.0,
                        url = %url,
                        "operator notice delivered"
                    );
                }
                Err(error) => {
                    report.failed += 1;
                    warn!(
                        event_name = "notify.webhook.failed",
                        tenant_id = %notice.tenant_id.0,
                        url = %url,
                        error = %error,
                        "operator notice delivery failed"
                    );
                }
            }
        }
        report
    }
}

/// `sha256=<hex>` HMAC of the request body.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length.
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
