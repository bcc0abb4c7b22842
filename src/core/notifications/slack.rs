use super::{Notification, NotificationChannel};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    fn format_message(&self, notification: &Notification) -> serde_json::Value {
        let mut fields = vec![json!({
            "type": "mrkdwn",
            "text": format!("*Server:*\n{}", notification.host)
        })];
        if let Some(job_id) = &notification.job_id {
            fields.push(json!({
                "type": "mrkdwn",
                "text": format!("*Job ID:*\n`{}`", job_id)
            }));
        }

        json!({
            "blocks": [
                {
                    "type": "header",
                    "text": {
                        "type": "plain_text",
                        "text": notification.title,
                        "emoji": true
                    }
                },
                {
                    "type": "section",
                    "fields": fields
                },
                {
                    "type": "section",
                    "text": {
                        "type": "mrkdwn",
                        "text": format!("```{}```", notification.message)
                    }
                }
            ]
        })
    }
}

#[async_trait]
impl NotificationChannel for SlackNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        let payload = self.format_message(&notification);
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_without_job_has_single_field() {
        let notifier = SlackNotifier::new("https://hooks.example/x".into());
        let payload = notifier.format_message(&Notification {
            title: "Sensor refresh error".into(),
            message: "timed out".into(),
            host: "nas:8200".into(),
            job_id: None,
        });

        assert_eq!(payload["blocks"][0]["text"]["text"], "Sensor refresh error");
        assert_eq!(payload["blocks"][1]["fields"].as_array().unwrap().len(), 1);
        assert_eq!(payload["blocks"][2]["text"]["text"], "```timed out```");
    }
}
