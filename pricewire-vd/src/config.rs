//! Validator daemon configuration

use pricewire_common::config::{env_optional, env_required, CoreConfig};
use pricewire_common::Result;
use std::path::Path;

/// Immutable validator service configuration, loaded once at startup
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub core: CoreConfig,
    /// Base URL of the chat-completions endpoint
    pub llm_api_url: String,
    pub llm_api_key: String,
    pub host: String,
    pub port: u16,
    /// Model ids toggled off via `PRICEWIRE_DISABLED_MODELS` (comma list)
    pub disabled_models: Vec<String>,
}

impl ValidatorConfig {
    pub fn from_env(data_dir_override: Option<&Path>) -> Result<Self> {
        let core = CoreConfig::from_env(data_dir_override)?;

        let llm_api_url =
            env_optional("LLM_API_URL").unwrap_or_else(|| "https://openrouter.ai/api/v1".into());
        let llm_api_key = env_required("LLM_API_KEY")?;

        let disabled_models = env_optional("PRICEWIRE_DISABLED_MODELS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            core,
            llm_api_url,
            llm_api_key,
            host: env_optional("VD_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            port: pricewire_common::config::env_parse("VD_PORT", 5730)?,
            disabled_models,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
