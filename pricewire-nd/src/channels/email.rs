//! Email channel via a REST mail relay

use super::{glitch_body, glitch_headline, ChannelProvider};
use crate::config::EmailConfig;
use async_trait::async_trait;
use pricewire_common::models::{Channel, ChannelOutcome, Subscriber, ValidatedGlitch};
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: String,
    text: String,
}

#[derive(Deserialize)]
struct SendResponse {
    #[serde(default)]
    id: Option<String>,
}

pub struct EmailProvider {
    http: reqwest::Client,
    config: Option<EmailConfig>,
}

impl EmailProvider {
    pub fn new(http: reqwest::Client, config: Option<EmailConfig>) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl ChannelProvider for EmailProvider {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, glitch: &ValidatedGlitch, target: &Subscriber) -> ChannelOutcome {
        let Some(config) = &self.config else {
            return ChannelOutcome::failed(Channel::Email, "email relay not configured");
        };
        let Some(address) = &target.email else {
            return ChannelOutcome::failed(Channel::Email, "subscriber has no email address");
        };

        let request = SendRequest {
            from: &config.from,
            to: address,
            subject: glitch_headline(glitch),
            text: glitch_body(glitch),
        };

        let response = self
            .http
            .post(&config.api_url)
            .bearer_auth(&config.api_key)
            .json(&request)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let message_id = resp
                    .json::<SendResponse>()
                    .await
                    .ok()
                    .and_then(|body| body.id);
                ChannelOutcome::ok(Channel::Email, message_id)
            }
            Ok(resp) => ChannelOutcome::failed(
                Channel::Email,
                format!("mail relay returned {}", resp.status()),
            ),
            Err(e) => ChannelOutcome::failed(Channel::Email, e.to_string()),
        }
    }
}
