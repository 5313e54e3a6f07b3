//! Telegram channel via the bot API

use super::{glitch_body, ChannelProvider};
use crate::config::TelegramConfig;
use async_trait::async_trait;
use pricewire_common::models::{Channel, ChannelOutcome, Subscriber, ValidatedGlitch};
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
}

#[derive(Deserialize)]
struct BotResponse {
    ok: bool,
    #[serde(default)]
    result: Option<SentMessage>,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: i64,
}

pub struct TelegramProvider {
    http: reqwest::Client,
    config: Option<TelegramConfig>,
}

impl TelegramProvider {
    pub fn new(http: reqwest::Client, config: Option<TelegramConfig>) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl ChannelProvider for TelegramProvider {
    fn channel(&self) -> Channel {
        Channel::Telegram
    }

    async fn send(&self, glitch: &ValidatedGlitch, target: &Subscriber) -> ChannelOutcome {
        let Some(config) = &self.config else {
            return ChannelOutcome::failed(Channel::Telegram, "telegram bot not configured");
        };
        let Some(chat_id) = &target.telegram_chat_id else {
            return ChannelOutcome::failed(Channel::Telegram, "subscriber has no telegram chat");
        };

        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            config.bot_token
        );
        let message = SendMessage {
            chat_id,
            text: glitch_body(glitch),
        };

        match self.http.post(&url).json(&message).send().await {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<BotResponse>().await {
                    Ok(body) if body.ok => ChannelOutcome::ok(
                        Channel::Telegram,
                        body.result.map(|m| m.message_id.to_string()),
                    ),
                    Ok(_) => ChannelOutcome::failed(Channel::Telegram, "bot API reported not ok"),
                    Err(e) => ChannelOutcome::failed(Channel::Telegram, e.to_string()),
                }
            }
            Ok(resp) => ChannelOutcome::failed(
                Channel::Telegram,
                format!("telegram returned {}", resp.status()),
            ),
            Err(e) => ChannelOutcome::failed(Channel::Telegram, e.to_string()),
        }
    }
}
