//! Priority channel: high-urgency push via an ntfy-compatible gateway

use super::{glitch_headline, ChannelProvider};
use crate::config::PushConfig;
use async_trait::async_trait;
use pricewire_common::models::{Channel, ChannelOutcome, Subscriber, ValidatedGlitch};

pub struct PriorityPushProvider {
    http: reqwest::Client,
    config: PushConfig,
}

impl PriorityPushProvider {
    pub fn new(http: reqwest::Client, config: PushConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl ChannelProvider for PriorityPushProvider {
    fn channel(&self) -> Channel {
        Channel::Priority
    }

    async fn send(&self, glitch: &ValidatedGlitch, target: &Subscriber) -> ChannelOutcome {
        let Some(topic) = &target.push_topic else {
            return ChannelOutcome::failed(Channel::Priority, "subscriber has no push topic");
        };

        let url = format!("{}/{topic}", self.config.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .header("Title", glitch_headline(glitch))
            .header("Priority", "urgent")
            .header("Click", glitch.product.url.clone())
            .body(format!(
                "Confidence {:.0}/100, margin {:.1}%",
                glitch.confidence, glitch.profit_margin
            ))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                ChannelOutcome::ok(Channel::Priority, None)
            }
            Ok(resp) => ChannelOutcome::failed(
                Channel::Priority,
                format!("push gateway returned {}", resp.status()),
            ),
            Err(e) => ChannelOutcome::failed(Channel::Priority, e.to_string()),
        }
    }
}
