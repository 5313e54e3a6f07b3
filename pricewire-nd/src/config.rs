//! Dispatcher configuration
//!
//! Provider credentials are read once at startup; a provider whose
//! credentials are absent stays registered but fails only its own channel
//! at send time, so one unconfigured integration never blocks the rest.

use pricewire_common::config::{env_optional, env_parse, CoreConfig};
use pricewire_common::Result;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
}

#[derive(Debug, Clone)]
pub struct WhatsappConfig {
    pub access_token: String,
    pub phone_number_id: String,
}

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub base_url: String,
}

/// Non-user-targeted broadcast targets, fired synchronously per glitch
#[derive(Debug, Clone, Default)]
pub struct BroadcastConfig {
    pub discord_webhook_url: Option<String>,
    pub feed_webhook_url: Option<String>,
}

/// Immutable dispatcher service configuration, loaded once at startup
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub core: CoreConfig,
    pub host: String,
    pub port: u16,
    /// Concurrent dispatch jobs
    pub notify_concurrency: usize,
    pub email: Option<EmailConfig>,
    pub twilio: Option<TwilioConfig>,
    pub telegram: Option<TelegramConfig>,
    pub whatsapp: Option<WhatsappConfig>,
    pub push: PushConfig,
    pub broadcast: BroadcastConfig,
}

impl DispatcherConfig {
    pub fn from_env(data_dir_override: Option<&Path>) -> Result<Self> {
        let core = CoreConfig::from_env(data_dir_override)?;

        let email = match (
            env_optional("EMAIL_API_URL"),
            env_optional("EMAIL_API_KEY"),
            env_optional("EMAIL_FROM"),
        ) {
            (Some(api_url), Some(api_key), Some(from)) => Some(EmailConfig {
                api_url,
                api_key,
                from,
            }),
            _ => None,
        };

        let twilio = match (
            env_optional("TWILIO_ACCOUNT_SID"),
            env_optional("TWILIO_AUTH_TOKEN"),
            env_optional("TWILIO_FROM_NUMBER"),
        ) {
            (Some(account_sid), Some(auth_token), Some(from_number)) => Some(TwilioConfig {
                account_sid,
                auth_token,
                from_number,
            }),
            _ => None,
        };

        let telegram = env_optional("TELEGRAM_BOT_TOKEN").map(|bot_token| TelegramConfig { bot_token });

        let whatsapp = match (
            env_optional("WHATSAPP_ACCESS_TOKEN"),
            env_optional("WHATSAPP_PHONE_NUMBER_ID"),
        ) {
            (Some(access_token), Some(phone_number_id)) => Some(WhatsappConfig {
                access_token,
                phone_number_id,
            }),
            _ => None,
        };

        Ok(Self {
            core,
            host: env_optional("ND_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            port: env_parse("ND_PORT", 5731)?,
            notify_concurrency: env_parse("NOTIFY_CONCURRENCY", 4)?,
            email,
            twilio,
            telegram,
            whatsapp,
            push: PushConfig {
                base_url: env_optional("PUSH_BASE_URL")
                    .unwrap_or_else(|| "https://ntfy.sh".into()),
            },
            broadcast: BroadcastConfig {
                discord_webhook_url: env_optional("DISCORD_ANNOUNCE_WEBHOOK_URL"),
                feed_webhook_url: env_optional("FEED_WEBHOOK_URL"),
            },
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_nd_env() {
        for name in [
            "ND_HOST",
            "ND_PORT",
            "NOTIFY_CONCURRENCY",
            "EMAIL_API_URL",
            "EMAIL_API_KEY",
            "EMAIL_FROM",
            "TWILIO_ACCOUNT_SID",
            "TWILIO_AUTH_TOKEN",
            "TWILIO_FROM_NUMBER",
            "TELEGRAM_BOT_TOKEN",
            "WHATSAPP_ACCESS_TOKEN",
            "WHATSAPP_PHONE_NUMBER_ID",
            "PUSH_BASE_URL",
            "DISCORD_ANNOUNCE_WEBHOOK_URL",
            "FEED_WEBHOOK_URL",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn providers_without_credentials_stay_unconfigured() {
        clear_nd_env();

        let config = DispatcherConfig::from_env(None).unwrap();
        assert!(config.email.is_none());
        assert!(config.twilio.is_none());
        assert!(config.telegram.is_none());
        assert!(config.whatsapp.is_none());
        assert_eq!(config.push.base_url, "https://ntfy.sh");
        assert_eq!(config.bind_addr(), "127.0.0.1:5731");
    }

    #[test]
    #[serial]
    fn partial_email_credentials_do_not_configure_the_relay() {
        clear_nd_env();
        env::set_var("EMAIL_API_URL", "https://mail.example/send");
        // API key and sender missing.

        let config = DispatcherConfig::from_env(None).unwrap();
        assert!(config.email.is_none());

        clear_nd_env();
    }

    #[test]
    #[serial]
    fn complete_credentials_configure_providers() {
        clear_nd_env();
        env::set_var("EMAIL_API_URL", "https://mail.example/send");
        env::set_var("EMAIL_API_KEY", "key");
        env::set_var("EMAIL_FROM", "deals@example.com");
        env::set_var("TELEGRAM_BOT_TOKEN", "bot-token");

        let config = DispatcherConfig::from_env(None).unwrap();
        assert_eq!(config.email.unwrap().from, "deals@example.com");
        assert!(config.telegram.is_some());
        assert!(config.twilio.is_none());

        clear_nd_env();
    }
}
