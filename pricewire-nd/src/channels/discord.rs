//! Discord channel via per-subscriber webhooks

use super::{glitch_body, ChannelProvider};
use async_trait::async_trait;
use pricewire_common::models::{Channel, ChannelOutcome, Subscriber, ValidatedGlitch};
use serde::Serialize;

#[derive(Serialize)]
struct WebhookMessage {
    content: String,
}

pub struct DiscordProvider {
    http: reqwest::Client,
}

impl DiscordProvider {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChannelProvider for DiscordProvider {
    fn channel(&self) -> Channel {
        Channel::Discord
    }

    async fn send(&self, glitch: &ValidatedGlitch, target: &Subscriber) -> ChannelOutcome {
        let Some(webhook) = &target.discord_webhook else {
            return ChannelOutcome::failed(Channel::Discord, "subscriber has no discord webhook");
        };

        let message = WebhookMessage {
            content: glitch_body(glitch),
        };

        match self.http.post(webhook).json(&message).send().await {
            // Discord replies 204 No Content on success.
            Ok(resp) if resp.status().is_success() => ChannelOutcome::ok(Channel::Discord, None),
            Ok(resp) => ChannelOutcome::failed(
                Channel::Discord,
                format!("discord webhook returned {}", resp.status()),
            ),
            Err(e) => ChannelOutcome::failed(Channel::Discord, e.to_string()),
        }
    }
}
