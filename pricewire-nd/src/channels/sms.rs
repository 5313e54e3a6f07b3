//! SMS channel via the Twilio messages API

use super::{glitch_headline, ChannelProvider};
use crate::config::TwilioConfig;
use async_trait::async_trait;
use pricewire_common::models::{Channel, ChannelOutcome, Subscriber, ValidatedGlitch};
use serde::Deserialize;

#[derive(Deserialize)]
struct MessageResponse {
    #[serde(default)]
    sid: Option<String>,
}

pub struct SmsProvider {
    http: reqwest::Client,
    config: Option<TwilioConfig>,
}

impl SmsProvider {
    pub fn new(http: reqwest::Client, config: Option<TwilioConfig>) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl ChannelProvider for SmsProvider {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, glitch: &ValidatedGlitch, target: &Subscriber) -> ChannelOutcome {
        let Some(config) = &self.config else {
            return ChannelOutcome::failed(Channel::Sms, "twilio not configured");
        };
        let Some(phone) = &target.phone else {
            return ChannelOutcome::failed(Channel::Sms, "subscriber has no phone number");
        };

        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            config.account_sid
        );
        let body = format!("{}\n{}", glitch_headline(glitch), glitch.product.url);
        let form = [
            ("To", phone.as_str()),
            ("From", config.from_number.as_str()),
            ("Body", body.as_str()),
        ];

        let response = self
            .http
            .post(&url)
            .basic_auth(&config.account_sid, Some(&config.auth_token))
            .form(&form)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let sid = resp
                    .json::<MessageResponse>()
                    .await
                    .ok()
                    .and_then(|body| body.sid);
                ChannelOutcome::ok(Channel::Sms, sid)
            }
            Ok(resp) => ChannelOutcome::failed(
                Channel::Sms,
                format!("twilio returned {}", resp.status()),
            ),
            Err(e) => ChannelOutcome::failed(Channel::Sms, e.to_string()),
        }
    }
}
