//! Channel providers
//!
//! The channel provider is a capability: a uniform `send` over a glitch
//! and a target subscriber, one implementation per channel. The dispatcher
//! holds a name→provider map and never knows transport details. Providers
//! read their own credentials from the startup config; a provider without
//! credentials fails only its own channel.

use crate::config::DispatcherConfig;
use async_trait::async_trait;
use pricewire_common::models::{Channel, ChannelOutcome, Subscriber, ValidatedGlitch};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

mod discord;
mod email;
mod push;
mod sms;
mod telegram;
mod webhook;
mod whatsapp;

pub use discord::DiscordProvider;
pub use email::EmailProvider;
pub use push::PriorityPushProvider;
pub use sms::SmsProvider;
pub use telegram::TelegramProvider;
pub use webhook::WebhookProvider;
pub use whatsapp::WhatsappProvider;

/// Deadline for one provider HTTP call
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(20);

const USER_AGENT: &str = concat!("pricewire/", env!("CARGO_PKG_VERSION"));

/// Uniform send capability implemented by every channel
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, glitch: &ValidatedGlitch, target: &Subscriber) -> ChannelOutcome;
}

/// Channel → provider map held by the dispatcher
pub struct ProviderRegistry {
    providers: HashMap<Channel, Arc<dyn ChannelProvider>>,
}

impl ProviderRegistry {
    /// Build the full production provider set from startup config
    pub fn from_config(cfg: &DispatcherConfig) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .map_err(|e| format!("http client: {e}"))?;

        let providers: Vec<Arc<dyn ChannelProvider>> = vec![
            Arc::new(EmailProvider::new(http.clone(), cfg.email.clone())),
            Arc::new(DiscordProvider::new(http.clone())),
            Arc::new(SmsProvider::new(http.clone(), cfg.twilio.clone())),
            Arc::new(TelegramProvider::new(http.clone(), cfg.telegram.clone())),
            Arc::new(WhatsappProvider::new(http.clone(), cfg.whatsapp.clone())),
            Arc::new(WebhookProvider::new(http.clone())),
            Arc::new(PriorityPushProvider::new(http, cfg.push.clone())),
        ];

        Ok(Self::from_providers(providers))
    }

    /// Build a registry from explicit providers (tests, partial deployments)
    pub fn from_providers(providers: Vec<Arc<dyn ChannelProvider>>) -> Self {
        Self {
            providers: providers.into_iter().map(|p| (p.channel(), p)).collect(),
        }
    }

    pub fn get(&self, channel: Channel) -> Option<&Arc<dyn ChannelProvider>> {
        self.providers.get(&channel)
    }
}

/// One-line summary used by the short-form channels
pub fn glitch_headline(glitch: &ValidatedGlitch) -> String {
    let was = glitch
        .product
        .original_price
        .map(|p| format!(" (was ${p:.2})"))
        .unwrap_or_default();
    format!(
        "PRICE GLITCH: {} at ${:.2}{} from {}",
        glitch.product.title, glitch.product.current_price, was, glitch.product.retailer
    )
}

/// Multi-line body for channels with room
pub fn glitch_body(glitch: &ValidatedGlitch) -> String {
    format!(
        "{}\n\nConfidence: {:.0}/100\nProfit margin: {:.1}%\nCategory: {}\n{}",
        glitch_headline(glitch),
        glitch.confidence,
        glitch.profit_margin,
        glitch.product.category,
        glitch.product.url
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pricewire_common::models::{GlitchType, ProductSnapshot, StockStatus};

    fn glitch() -> ValidatedGlitch {
        ValidatedGlitch {
            id: "g1".into(),
            anomaly_id: "a1".into(),
            product: ProductSnapshot {
                title: "Espresso Machine".into(),
                current_price: 24.99,
                original_price: Some(449.99),
                stock_status: StockStatus::InStock,
                retailer: "bestbuy".into(),
                url: "https://example.com/espresso".into(),
                category: "Kitchen".into(),
            },
            is_glitch: true,
            confidence: 91.0,
            reasoning: "decimal shift".into(),
            glitch_type: GlitchType::DecimalError,
            profit_margin: 94.4,
            validated_at: Utc::now(),
        }
    }

    #[test]
    fn headline_carries_prices_and_retailer() {
        let line = glitch_headline(&glitch());
        assert!(line.contains("$24.99"));
        assert!(line.contains("was $449.99"));
        assert!(line.contains("bestbuy"));
    }

    #[test]
    fn body_includes_url_and_margin() {
        let body = glitch_body(&glitch());
        assert!(body.contains("94.4%"));
        assert!(body.contains("https://example.com/espresso"));
    }
}
