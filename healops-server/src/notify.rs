//! Outbound chat notifications.
//!
//! Fire-and-forget POSTs to a configured webhook URL. Notification failures
//! are logged and never affect the primary state transition.

use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::model::Run;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatMessage<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repository: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'a str>,
}

pub struct ChatNotifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl ChatNotifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            webhook_url,
        }
    }

    pub async fn notify(&self, text: &str, run: Option<&Run>) {
        let Some(url) = &self.webhook_url else {
            return;
        };

        let message = ChatMessage {
            text,
            run_id: run.map(|r| r.id.0.as_str()),
            repository: run.map(|r| r.repository.as_str()),
            status: run.map(|r| r.status.as_str()),
        };

        match self.client.post(url).json(&message).send().await {
            Ok(response) if !response.status().is_success() => {
                warn!(
                    "Chat notification rejected with status {}",
                    response.status()
                );
            }
            Ok(_) => {}
            Err(e) => warn!("Chat notification failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_without_url_is_noop() {
        let notifier = ChatNotifier::new(None);
        notifier.notify("run escalated", None).await;
    }
}
