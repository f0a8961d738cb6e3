use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Settings;

/// Outbound push notifications for scan completion. Delivery is best-effort:
/// failures are logged and never surface to the scan lifecycle.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, message: &str);
}

/// No-op sink used when no push credentials are configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _title: &str, _message: &str) {}
}

const PUSHOVER_API_URL: &str = "https://api.pushover.net/1/messages.json";

pub struct PushoverNotifier {
    client: reqwest::Client,
    token: String,
    user: String,
}

impl PushoverNotifier {
    pub fn new(token: String, user: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            user,
        }
    }
}

#[async_trait]
impl Notifier for PushoverNotifier {
    async fn notify(&self, title: &str, message: &str) {
        let params = [
            ("token", self.token.as_str()),
            ("user", self.user.as_str()),
            ("title", title),
            ("message", message),
        ];

        match self.client.post(PUSHOVER_API_URL).form(&params).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(title = title, "push notification delivered");
            }
            Ok(response) => {
                tracing::warn!(
                    title = title,
                    status = %response.status(),
                    "push notification rejected"
                );
            }
            Err(e) => {
                tracing::warn!(title = title, error = %e, "push notification failed");
            }
        }
    }
}

/// Build the notifier the settings call for.
pub fn notifier_from_settings(settings: &Settings) -> Arc<dyn Notifier> {
    match (&settings.pushover_token, &settings.pushover_user) {
        (Some(token), Some(user)) if !token.is_empty() && !user.is_empty() => {
            tracing::info!("push notifications enabled via Pushover");
            Arc::new(PushoverNotifier::new(token.clone(), user.clone()))
        }
        _ => Arc::new(NoopNotifier),
    }
}
