//! WhatsApp channel via the Cloud API, text-message mode
//!
//! Text mode keeps one send contract for every channel; template mode
//! would need per-template parameter plumbing the dispatcher has no
//! business knowing about. Sends on this channel are additionally gated by
//! the per-user daily cap in the tier policy.

use super::{glitch_headline, ChannelProvider};
use crate::config::WhatsappConfig;
use async_trait::async_trait;
use pricewire_common::models::{Channel, ChannelOutcome, Subscriber, ValidatedGlitch};
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct TextMessage<'a> {
    messaging_product: &'static str,
    to: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    text: TextBody,
}

#[derive(Serialize)]
struct TextBody {
    body: String,
}

#[derive(Deserialize)]
struct CloudResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Deserialize)]
struct SentMessage {
    id: String,
}

pub struct WhatsappProvider {
    http: reqwest::Client,
    config: Option<WhatsappConfig>,
}

impl WhatsappProvider {
    pub fn new(http: reqwest::Client, config: Option<WhatsappConfig>) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl ChannelProvider for WhatsappProvider {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    async fn send(&self, glitch: &ValidatedGlitch, target: &Subscriber) -> ChannelOutcome {
        let Some(config) = &self.config else {
            return ChannelOutcome::failed(Channel::Whatsapp, "whatsapp cloud API not configured");
        };
        let Some(number) = &target.whatsapp_number else {
            return ChannelOutcome::failed(Channel::Whatsapp, "subscriber has no whatsapp number");
        };

        let url = format!(
            "https://graph.facebook.com/v19.0/{}/messages",
            config.phone_number_id
        );
        let message = TextMessage {
            messaging_product: "whatsapp",
            to: number,
            kind: "text",
            text: TextBody {
                body: format!("{}\n{}", glitch_headline(glitch), glitch.product.url),
            },
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&config.access_token)
            .json(&message)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let message_id = resp
                    .json::<CloudResponse>()
                    .await
                    .ok()
                    .and_then(|body| body.messages.into_iter().next())
                    .map(|m| m.id);
                ChannelOutcome::ok(Channel::Whatsapp, message_id)
            }
            Ok(resp) => ChannelOutcome::failed(
                Channel::Whatsapp,
                format!("cloud API returned {}", resp.status()),
            ),
            Err(e) => ChannelOutcome::failed(Channel::Whatsapp, e.to_string()),
        }
    }
}
