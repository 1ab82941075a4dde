//! Slack incoming-webhook notifier.

use async_trait::async_trait;
use base64::Engine;

use crate::services::notify::{ChatMessage, ChatNotifier, NotifyError};

const BOT_NAME: &str = "IaCCINotifyBot";

/// Decodes the base64 webhook reference stored on a trigger.
pub fn decode_webhook_url(encoded: &str) -> Result<String, NotifyError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| NotifyError::InvalidWebhook(e.to_string()))?;
    let url = String::from_utf8(bytes).map_err(|e| NotifyError::InvalidWebhook(e.to_string()))?;
    if !url.starts_with("https://") && !url.starts_with("http://") {
        return Err(NotifyError::InvalidWebhook("not an http(s) url".to_string()));
    }
    Ok(url.trim().to_string())
}

/// Slack message body: title line, message, then one `<url|label>` per link.
pub fn render_payload(message: &ChatMessage) -> serde_json::Value {
    let mut text = format!("*{}*\n{}", message.title, message.message);
    for link in &message.links {
        text.push_str(&format!("\n<{}|{}>", link.url, link.label));
    }

    let mut payload = serde_json::json!({
        "username": BOT_NAME,
        "icon_emoji": message.emoji,
        "text": text,
    });
    if let Some(channel) = &message.channel {
        payload["channel"] = serde_json::Value::String(channel.clone());
    }
    payload
}

#[derive(Clone, Default)]
pub struct SlackNotifier {
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatNotifier for SlackNotifier {
    async fn send(&self, webhook_url: &str, message: &ChatMessage) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(webhook_url)
            .json(&render_payload(message))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                service: "slack",
                status,
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Link;

    #[test]
    fn webhook_reference_is_base64() {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode("https://hooks.slack.com/services/T/B/x");
        assert_eq!(
            decode_webhook_url(&encoded).unwrap(),
            "https://hooks.slack.com/services/T/B/x"
        );
        assert!(decode_webhook_url("%%%").is_err());
    }

    #[test]
    fn payload_lists_links_and_channel() {
        let message = ChatMessage {
            message: "codebuild with build_id: plan:1".to_string(),
            emoji: ":x:".to_string(),
            title: ":x: - iac-ci report".to_string(),
            links: vec![Link::new("ci pipeline", "https://ci.example/runs/1")],
            channel: Some("#infra".to_string()),
        };

        let payload = render_payload(&message);
        assert_eq!(payload["username"], "IaCCINotifyBot");
        assert_eq!(payload["channel"], "#infra");
        let text = payload["text"].as_str().unwrap();
        assert!(text.starts_with("*:x: - iac-ci report*"));
        assert!(text.contains("<https://ci.example/runs/1|ci pipeline>"));
    }
}
