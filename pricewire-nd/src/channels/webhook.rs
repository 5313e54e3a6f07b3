//! Webhook channel: POST the glitch to a subscriber-supplied URL

use super::ChannelProvider;
use async_trait::async_trait;
use pricewire_common::models::{Channel, ChannelOutcome, Subscriber, ValidatedGlitch};

pub struct WebhookProvider {
    http: reqwest::Client,
}

impl WebhookProvider {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChannelProvider for WebhookProvider {
    fn channel(&self) -> Channel {
        Channel::Webhook
    }

    async fn send(&self, glitch: &ValidatedGlitch, target: &Subscriber) -> ChannelOutcome {
        let Some(url) = &target.webhook_url else {
            return ChannelOutcome::failed(Channel::Webhook, "subscriber has no webhook URL");
        };

        match self.http.post(url).json(glitch).send().await {
            Ok(resp) if resp.status().is_success() => {
                ChannelOutcome::ok(Channel::Webhook, Some(glitch.id.clone()))
            }
            Ok(resp) => ChannelOutcome::failed(
                Channel::Webhook,
                format!("subscriber endpoint returned {}", resp.status()),
            ),
            Err(e) => ChannelOutcome::failed(Channel::Webhook, e.to_string()),
        }
    }
}
