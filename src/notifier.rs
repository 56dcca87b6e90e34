// ===============================
// src/notifier.rs
// ===============================
use std::time::Duration;

use serde_json::json;
use tracing::{error, warn};

/// Operator alert sink. Delivery is fire-and-forget: a failed delivery is
/// logged, never reported back to the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, subject: &str, body: &str);
}

/// Alerts go to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, subject: &str, body: &str) {
        warn!(%subject, %body, "alert raised");
    }
}

/// POSTs `{subject, body}` to a webhook (mail gateway, chat bot, ...).
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, url })
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, subject: &str, body: &str) {
        warn!(%subject, %body, "alert raised");
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            error!("alert webhook skipped: no runtime");
            return;
        };
        let client = self.client.clone();
        let url = self.url.clone();
        let payload = json!({ "subject": subject, "body": body });
        rt.spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(rsp) if rsp.status().is_success() => {}
                Ok(rsp) => error!(status = %rsp.status(), "alert webhook rejected"),
                Err(e) => error!(?e, "alert webhook failed"),
            }
        });
    }
}

#[cfg(test)]
pub use self::testing::RecordingNotifier;
