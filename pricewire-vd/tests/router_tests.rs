//! Weighted model router tests: selection proportionality, circuit
//! suppression and recovery, all-open fallback, and SOTA escalation.

use pricewire_common::db::init_database;
use pricewire_common::kv::KvStore;
use pricewire_common::models::{
    CircuitBreakerState, CircuitState, ModelConfig, ModelTier,
};
use pricewire_vd::router::{EscalationContext, ModelRouter, RouterConfig};
use std::collections::HashMap;

const WINDOW_MS: u64 = 300_000;

fn model(id: &str, base_weight: u32, is_free: bool) -> ModelConfig {
    ModelConfig {
        id: id.to_string(),
        name: id.to_string(),
        provider: "test".into(),
        base_weight,
        context_window: 32_768,
        tier: ModelTier::Mid,
        capabilities: vec!["json".into()],
        supports_tools: true,
        is_free,
        timeout_ms: 10_000,
        enabled: true,
    }
}

fn plain_ctx() -> EscalationContext {
    EscalationContext {
        discount: 10.0,
        confidence: 10.0,
        z_score: None,
    }
}

fn unicorn_ctx() -> EscalationContext {
    EscalationContext {
        discount: 95.0,
        confidence: 90.0,
        z_score: Some(5.0),
    }
}

async fn router_with(
    catalog: Vec<ModelConfig>,
    enable_sota: bool,
) -> (ModelRouter, KvStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = init_database(&dir.path().join("test.db"))
        .await
        .expect("init db");
    let kv = KvStore::new(pool);
    let router = ModelRouter::new(
        catalog,
        kv.clone(),
        RouterConfig {
            enable_sota,
            breaker_threshold: 3,
            breaker_window_ms: WINDOW_MS,
        },
    );
    (router, kv, dir)
}

#[tokio::test]
async fn selection_frequency_tracks_base_weights() {
    let (router, _kv, _dir) = router_with(
        vec![model("heavy", 75, true), model("light", 25, true)],
        false,
    )
    .await;

    let mut counts: HashMap<String, u32> = HashMap::new();
    let draws = 4000;
    for _ in 0..draws {
        let chosen = router.select(&plain_ctx()).await.unwrap();
        *counts.entry(chosen.id).or_insert(0) += 1;
    }

    let heavy_share = counts["heavy"] as f64 / draws as f64;
    assert!(
        (heavy_share - 0.75).abs() < 0.07,
        "heavy selected {heavy_share} of draws, expected ~0.75"
    );
    assert!(counts.contains_key("light"));
}

#[tokio::test]
async fn circuit_opens_at_failure_threshold_and_suppresses_selection() {
    let (router, _kv, _dir) = router_with(
        vec![model("model-x", 90, true), model("model-y", 10, true)],
        false,
    )
    .await;

    for _ in 0..3 {
        router.record_failure("model-x").await;
    }

    let stats = router.stats().await;
    let x = stats.iter().find(|s| s.id == "model-x").unwrap();
    assert_eq!(x.circuit, CircuitState::Open);

    for _ in 0..20 {
        let chosen = router.select(&plain_ctx()).await.unwrap();
        assert_eq!(chosen.id, "model-y", "open circuit must be suppressed");
    }
}

#[tokio::test]
async fn opened_circuit_becomes_selectable_after_window_elapses() {
    let (router, _kv, _dir) = router_with(
        vec![model("model-x", 90, true), model("model-y", 10, true)],
        false,
    )
    .await;

    // An open circuit whose window has already elapsed.
    let opened_at = chrono::Utc::now().timestamp_millis() - (WINDOW_MS as i64 + 1000);
    router
        .apply_circuit_snapshot(
            "model-x",
            &CircuitBreakerState {
                state: CircuitState::Open,
                opened_at: Some(opened_at),
                error_timestamps: vec![opened_at],
            },
        )
        .await;

    let stats = router.stats().await;
    let x = stats.iter().find(|s| s.id == "model-x").unwrap();
    assert_eq!(x.circuit, CircuitState::HalfOpen);

    let mut seen_x = false;
    for _ in 0..100 {
        if router.select(&plain_ctx()).await.unwrap().id == "model-x" {
            seen_x = true;
            break;
        }
    }
    assert!(seen_x, "half-open model never re-selected in 100 draws");
}

#[tokio::test]
async fn all_open_pool_resets_the_oldest_circuit() {
    let (router, _kv, _dir) = router_with(
        vec![
            model("first-opened", 50, true),
            model("second-opened", 50, true),
        ],
        false,
    )
    .await;

    let now = chrono::Utc::now().timestamp_millis();
    router
        .apply_circuit_snapshot(
            "first-opened",
            &CircuitBreakerState {
                state: CircuitState::Open,
                opened_at: Some(now - 60_000),
                error_timestamps: vec![now - 60_000],
            },
        )
        .await;
    router
        .apply_circuit_snapshot(
            "second-opened",
            &CircuitBreakerState {
                state: CircuitState::Open,
                opened_at: Some(now - 10_000),
                error_timestamps: vec![now - 10_000],
            },
        )
        .await;

    let chosen = router.select(&plain_ctx()).await.unwrap();
    assert_eq!(chosen.id, "first-opened");

    let stats = router.stats().await;
    let first = stats.iter().find(|s| s.id == "first-opened").unwrap();
    assert_eq!(first.circuit, CircuitState::HalfOpen);
}

#[tokio::test]
async fn half_open_success_closes_and_failure_reopens() {
    let (router, _kv, _dir) = router_with(vec![model("m", 50, true)], false).await;

    for _ in 0..3 {
        router.record_failure("m").await;
    }
    // Only candidate: handed out as a forced half-open probe.
    let chosen = router.select(&plain_ctx()).await.unwrap();
    assert_eq!(chosen.id, "m");

    router.record_success("m", 120).await;
    let stats = router.stats().await;
    assert_eq!(stats[0].circuit, CircuitState::Closed);
    assert_eq!(stats[0].consecutive_failures, 0);
}

#[tokio::test]
async fn unicorn_requests_use_sota_pool_when_enabled() {
    let (router, _kv, _dir) = router_with(
        vec![model("free-a", 80, true), model("paid-p", 90, false)],
        true,
    )
    .await;

    for _ in 0..20 {
        let chosen = router.select(&unicorn_ctx()).await.unwrap();
        assert_eq!(chosen.id, "paid-p");
    }
    for _ in 0..20 {
        let chosen = router.select(&plain_ctx()).await.unwrap();
        assert_eq!(chosen.id, "free-a");
    }
}

#[tokio::test]
async fn sota_stays_off_without_the_toggle() {
    let (router, _kv, _dir) = router_with(
        vec![model("free-a", 80, true), model("paid-p", 90, false)],
        false,
    )
    .await;

    for _ in 0..20 {
        let chosen = router.select(&unicorn_ctx()).await.unwrap();
        assert_eq!(chosen.id, "free-a");
    }
}

#[tokio::test]
async fn empty_sota_pool_falls_back_to_standard() {
    let (router, _kv, _dir) =
        router_with(vec![model("free-a", 80, true)], true).await;

    let chosen = router.select(&unicorn_ctx()).await.unwrap();
    assert_eq!(chosen.id, "free-a");
}

#[tokio::test]
async fn tool_capable_selection_filters_non_tool_models() {
    let mut no_tools = model("no-tools", 95, true);
    no_tools.supports_tools = false;
    let (router, _kv, _dir) =
        router_with(vec![no_tools, model("with-tools", 5, true)], false).await;

    for _ in 0..20 {
        let chosen = router.select_tool_capable(&plain_ctx()).await.unwrap();
        assert_eq!(chosen.id, "with-tools");
    }
}

#[tokio::test]
async fn disabled_models_are_never_selected() {
    let mut off = model("off", 99, true);
    off.enabled = false;
    let (router, _kv, _dir) = router_with(vec![off, model("on", 1, true)], false).await;

    for _ in 0..10 {
        assert_eq!(router.select(&plain_ctx()).await.unwrap().id, "on");
    }
}

#[tokio::test]
async fn mirrored_state_survives_a_cold_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = init_database(&dir.path().join("test.db"))
        .await
        .expect("init db");
    let kv = KvStore::new(pool);
    let cfg = RouterConfig {
        enable_sota: false,
        breaker_threshold: 3,
        breaker_window_ms: WINDOW_MS,
    };

    let first = ModelRouter::new(vec![model("m", 50, true)], kv.clone(), cfg.clone());
    first.record_success("m", 100).await;
    first.record_failure("m").await;
    first.record_failure("m").await;
    first.record_failure("m").await;
    drop(first);

    let second = ModelRouter::new(vec![model("m", 50, true)], kv, cfg);
    second.hydrate().await.unwrap();

    let stats = second.stats().await;
    assert_eq!(stats[0].success, 1);
    assert_eq!(stats[0].failure, 3);
    assert_eq!(stats[0].consecutive_failures, 3);
    assert_eq!(stats[0].circuit, CircuitState::Open);
}
