//! ntfy notifier — posts one notification per new message.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderValue;
use tracing::{info, warn};

use crate::error::NotifyError;

/// Truncation length for subjects echoed into log lines.
pub const MAX_LOG_SUBJECT_LENGTH: usize = 50;

/// Push delivery capability consumed by the bridge.
///
/// A failed delivery leaves the message unrecorded, so it is retried on the
/// next poll cycle.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, subject: &str, sender: &str) -> Result<(), NotifyError>;
}

/// Notifier posting to an ntfy topic URL.
pub struct NtfyNotifier {
    client: reqwest::Client,
    topic_url: String,
    title: String,
    tags: String,
    priority: u8,
}

impl NtfyNotifier {
    pub fn new(topic_url: String, title: String, tags: String, priority: u8) -> Self {
        info!(topic = %topic_url, "ntfy notifier initialized");
        Self {
            client: reqwest::Client::new(),
            topic_url,
            title,
            tags,
            priority,
        }
    }

    /// The `Title` header: the configured title when set, else the sender.
    fn title_for(&self, sender: &str) -> String {
        if self.title.is_empty() {
            sender.to_string()
        } else {
            self.title.clone()
        }
    }
}

#[async_trait]
impl Notifier for NtfyNotifier {
    async fn deliver(&self, subject: &str, sender: &str) -> Result<(), NotifyError> {
        let mut request = self
            .client
            .post(&self.topic_url)
            .timeout(Duration::from_secs(10))
            .header("Priority", self.priority.to_string())
            .body(subject.to_string());

        // reqwest rejects header values outside visible ASCII; a value that
        // cannot be represented is dropped, not a delivery failure.
        let title = self.title_for(sender);
        match HeaderValue::from_str(&title) {
            Ok(value) => request = request.header("Title", value),
            Err(_) => warn!(title = %title, "Skipping non-ASCII notification title"),
        }
        if !self.tags.is_empty() {
            match HeaderValue::from_str(&self.tags) {
                Ok(value) => request = request.header("Tags", value),
                Err(_) => warn!(tags = %self.tags, "Skipping invalid notification tags"),
            }
        }

        let response = request.send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(NotifyError::Status(response.status()));
        }

        info!(
            subject = %subject.chars().take(MAX_LOG_SUBJECT_LENGTH).collect::<String>(),
            "Notification sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier(title: &str) -> NtfyNotifier {
        NtfyNotifier::new(
            "https://ntfy.example/mail".to_string(),
            title.to_string(),
            String::new(),
            3,
        )
    }

    #[test]
    fn configured_title_wins_over_sender() {
        let n = notifier("Mail");
        assert_eq!(n.title_for("Jane Doe"), "Mail");
    }

    #[test]
    fn sender_used_when_title_unset() {
        let n = notifier("");
        assert_eq!(n.title_for("Jane Doe"), "Jane Doe");
    }
}
