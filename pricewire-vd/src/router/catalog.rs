//! Model catalog
//!
//! The catalog is a static table filtered by environment toggles at
//! startup. Catalog order is the stable order used by weighted selection
//! tie-breaks, so entries are never re-sorted after load.

use pricewire_common::models::{ModelConfig, ModelTier};

/// Built-in model pool: free workhorses plus paid escalation targets
pub fn builtin_catalog() -> Vec<ModelConfig> {
    vec![
        ModelConfig {
            id: "meta-llama/llama-3.3-70b-instruct".into(),
            name: "Llama 3.3 70B Instruct".into(),
            provider: "meta".into(),
            base_weight: 80,
            context_window: 131_072,
            tier: ModelTier::Mid,
            capabilities: vec!["reasoning".into(), "json".into()],
            supports_tools: true,
            is_free: true,
            timeout_ms: 30_000,
            enabled: true,
        },
        ModelConfig {
            id: "qwen/qwen-2.5-72b-instruct".into(),
            name: "Qwen 2.5 72B Instruct".into(),
            provider: "qwen".into(),
            base_weight: 70,
            context_window: 131_072,
            tier: ModelTier::Mid,
            capabilities: vec!["reasoning".into(), "json".into()],
            supports_tools: true,
            is_free: true,
            timeout_ms: 30_000,
            enabled: true,
        },
        ModelConfig {
            id: "mistralai/mistral-small-3.1".into(),
            name: "Mistral Small 3.1".into(),
            provider: "mistral".into(),
            base_weight: 60,
            context_window: 128_000,
            tier: ModelTier::Base,
            capabilities: vec!["json".into()],
            supports_tools: true,
            is_free: true,
            timeout_ms: 20_000,
            enabled: true,
        },
        ModelConfig {
            id: "google/gemma-3-27b-it".into(),
            name: "Gemma 3 27B".into(),
            provider: "google".into(),
            base_weight: 45,
            context_window: 96_000,
            tier: ModelTier::Base,
            capabilities: vec!["json".into()],
            supports_tools: false,
            is_free: true,
            timeout_ms: 20_000,
            enabled: true,
        },
        ModelConfig {
            id: "openai/gpt-4o".into(),
            name: "GPT-4o".into(),
            provider: "openai".into(),
            base_weight: 90,
            context_window: 128_000,
            tier: ModelTier::High,
            capabilities: vec!["reasoning".into(), "json".into(), "vision".into()],
            supports_tools: true,
            is_free: false,
            timeout_ms: 45_000,
            enabled: true,
        },
        ModelConfig {
            id: "anthropic/claude-sonnet-4".into(),
            name: "Claude Sonnet 4".into(),
            provider: "anthropic".into(),
            base_weight: 85,
            context_window: 200_000,
            tier: ModelTier::High,
            capabilities: vec!["reasoning".into(), "json".into()],
            supports_tools: true,
            is_free: false,
            timeout_ms: 45_000,
            enabled: true,
        },
    ]
}

/// Apply environment toggles: ids listed in `disabled` are kept in the
/// catalog (stable order matters) but marked disabled.
pub fn load_catalog(disabled: &[String]) -> Vec<ModelConfig> {
    let mut catalog = builtin_catalog();
    for model in &mut catalog {
        if disabled.iter().any(|d| d.eq_ignore_ascii_case(&model.id)) {
            model.enabled = false;
        }
    }
    catalog
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_has_free_and_paid_partitions() {
        let catalog = builtin_catalog();
        assert!(catalog.iter().any(|m| m.is_free));
        assert!(catalog.iter().any(|m| !m.is_free));
        for model in &catalog {
            assert!((1..=100).contains(&model.base_weight), "{}", model.id);
        }
    }

    #[test]
    fn disabled_toggle_keeps_order_but_disables() {
        let catalog = builtin_catalog();
        let first = catalog[0].id.clone();
        let toggled = load_catalog(&[first.clone()]);
        assert_eq!(toggled[0].id, first);
        assert!(!toggled[0].enabled);
        assert!(toggled[1].enabled);
    }
}
