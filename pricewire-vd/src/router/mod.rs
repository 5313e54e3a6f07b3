//! Weighted model router
//!
//! Chooses a model for each AI request from a partitioned pool (standard =
//! free models, SOTA = paid fallbacks), weights candidates by observed
//! performance, suppresses models with open circuits, and escalates unicorn
//! requests to the SOTA pool when enabled.
//!
//! Router state is instance-encapsulated with per-model locks and mirrored
//! to KV (`model.perf.{id}`, `model.circuit.{id}`, 24h TTL) so replicas
//! converge after cold starts. Last-writer-wins is acceptable there;
//! selection is randomized anyway.

pub mod breaker;
pub mod catalog;
pub mod weight;

use breaker::CircuitBreaker;
use chrono::{DateTime, Utc};
use pricewire_common::config::CoreConfig;
use pricewire_common::kv::KvStore;
use pricewire_common::models::{
    CircuitBreakerState, CircuitState, ModelConfig, ModelPerformance, PricingAnomaly,
};
use pricewire_common::{Error, Result};
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use weight::effective_weight;

/// TTL for state mirrored to KV
const MIRROR_TTL_SECONDS: u64 = 86_400;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub enable_sota: bool,
    pub breaker_threshold: u32,
    pub breaker_window_ms: u64,
}

impl RouterConfig {
    pub fn from_core(core: &CoreConfig) -> Self {
        Self {
            enable_sota: core.enable_sota_models,
            breaker_threshold: core.circuit_breaker_threshold,
            breaker_window_ms: core.circuit_breaker_window_ms,
        }
    }
}

/// Request strength signals driving unicorn escalation
#[derive(Debug, Clone, Copy)]
pub struct EscalationContext {
    pub discount: f64,
    pub confidence: f64,
    pub z_score: Option<f64>,
}

impl EscalationContext {
    pub fn from_anomaly(anomaly: &PricingAnomaly) -> Self {
        Self {
            discount: anomaly.discount_percentage,
            confidence: anomaly.initial_confidence,
            z_score: anomaly.z_score,
        }
    }
}

/// A request is a unicorn when at least two strength signals fire
pub fn is_unicorn(ctx: &EscalationContext) -> bool {
    let mut hits = 0;
    if ctx.discount >= 80.0 {
        hits += 1;
    }
    if ctx.confidence >= 85.0 {
        hits += 1;
    }
    if ctx.z_score.is_some_and(|z| z >= 4.0) {
        hits += 1;
    }
    hits >= 2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolKind {
    Standard,
    Sota,
}

struct ModelState {
    perf: Mutex<ModelPerformance>,
    breaker: Mutex<CircuitBreaker>,
}

/// Per-model stats snapshot for the inspection API
#[derive(Debug, Clone, Serialize)]
pub struct ModelStats {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub is_free: bool,
    pub effective_weight: u32,
    pub success: u64,
    pub failure: u64,
    pub tool_success: u64,
    pub tool_failure: u64,
    pub consecutive_failures: u32,
    pub avg_latency_ms: Option<u64>,
    pub circuit: CircuitState,
    pub last_used: Option<DateTime<Utc>>,
}

pub struct ModelRouter {
    catalog: Vec<ModelConfig>,
    states: HashMap<String, ModelState>,
    kv: KvStore,
    cfg: RouterConfig,
}

impl ModelRouter {
    pub fn new(catalog: Vec<ModelConfig>, kv: KvStore, cfg: RouterConfig) -> Self {
        let states = catalog
            .iter()
            .map(|m| {
                (
                    m.id.clone(),
                    ModelState {
                        perf: Mutex::new(ModelPerformance::default()),
                        breaker: Mutex::new(CircuitBreaker::new(
                            cfg.breaker_threshold,
                            cfg.breaker_window_ms,
                        )),
                    },
                )
            })
            .collect();
        Self {
            catalog,
            states,
            kv,
            cfg,
        }
    }

    /// Load mirrored performance and circuit state from KV after a cold
    /// start. Missing or unreadable snapshots leave the fresh defaults.
    pub async fn hydrate(&self) -> Result<()> {
        for model in &self.catalog {
            if let Some(raw) = self.kv.get(&perf_key(&model.id)).await? {
                match serde_json::from_str::<ModelPerformance>(&raw) {
                    Ok(perf) => {
                        *self.states[&model.id].perf.lock().await = perf;
                    }
                    Err(e) => debug!(model = %model.id, error = %e, "stale perf snapshot ignored"),
                }
            }
            if let Some(raw) = self.kv.get(&circuit_key(&model.id)).await? {
                match serde_json::from_str::<CircuitBreakerState>(&raw) {
                    Ok(snapshot) => self.apply_circuit_snapshot(&model.id, &snapshot).await,
                    Err(e) => debug!(model = %model.id, error = %e, "stale circuit snapshot ignored"),
                }
            }
        }
        Ok(())
    }

    /// Replace a model's circuit state wholesale (hydration, admin resets)
    pub async fn apply_circuit_snapshot(&self, model_id: &str, snapshot: &CircuitBreakerState) {
        if let Some(state) = self.states.get(model_id) {
            *state.breaker.lock().await = CircuitBreaker::from_snapshot(
                snapshot,
                self.cfg.breaker_threshold,
                self.cfg.breaker_window_ms,
            );
        }
    }

    /// Select a model for a request.
    ///
    /// Unicorn requests use the SOTA pool when `ENABLE_SOTA_MODELS` is on;
    /// everything else (including a SOTA pool that filters empty) selects
    /// from the standard pool.
    pub async fn select(&self, ctx: &EscalationContext) -> Result<ModelConfig> {
        self.select_inner(ctx, false, &HashSet::new()).await
    }

    /// Like [`select`](Self::select) but restricted to tool-capable models
    pub async fn select_tool_capable(&self, ctx: &EscalationContext) -> Result<ModelConfig> {
        self.select_inner(ctx, true, &HashSet::new()).await
    }

    /// Weighted selection skipping already-tried model ids, so fallback
    /// walks distinct models.
    pub async fn select_excluding(
        &self,
        ctx: &EscalationContext,
        exclude: &HashSet<String>,
    ) -> Result<ModelConfig> {
        self.select_inner(ctx, false, exclude).await
    }

    async fn select_inner(
        &self,
        ctx: &EscalationContext,
        require_tools: bool,
        exclude: &HashSet<String>,
    ) -> Result<ModelConfig> {
        if self.cfg.enable_sota && is_unicorn(ctx) {
            match self.select_from_pool(PoolKind::Sota, require_tools, exclude).await {
                Ok(model) => {
                    info!(model = %model.id, "unicorn request escalated to SOTA pool");
                    return Ok(model);
                }
                Err(e) => debug!(error = %e, "SOTA pool unavailable, using standard selection"),
            }
        }
        self.select_from_pool(PoolKind::Standard, require_tools, exclude)
            .await
    }

    fn pool(
        &self,
        kind: PoolKind,
        require_tools: bool,
        exclude: &HashSet<String>,
    ) -> Vec<&ModelConfig> {
        self.catalog
            .iter()
            .filter(|m| m.enabled)
            .filter(|m| match kind {
                PoolKind::Standard => m.is_free,
                PoolKind::Sota => !m.is_free,
            })
            .filter(|m| !require_tools || m.supports_tools)
            .filter(|m| !exclude.contains(&m.id))
            .collect()
    }

    async fn select_from_pool(
        &self,
        kind: PoolKind,
        require_tools: bool,
        exclude: &HashSet<String>,
    ) -> Result<ModelConfig> {
        let pool = self.pool(kind, require_tools, exclude);
        if pool.is_empty() {
            return Err(Error::NotFound(format!("no enabled models in {kind:?} pool")));
        }

        let now_ms = Utc::now().timestamp_millis();

        // Walk the pool in catalog order collecting selectable candidates
        // with their effective weights.
        let mut candidates: Vec<(&ModelConfig, u64)> = Vec::with_capacity(pool.len());
        for model in pool.iter().copied() {
            let state = &self.states[&model.id];
            let circuit = {
                let mut breaker = state.breaker.lock().await;
                breaker.promote_half_open(now_ms);
                breaker.effective_state(now_ms)
            };
            if circuit == CircuitState::Open {
                continue;
            }
            let weight = {
                let perf = state.perf.lock().await;
                effective_weight(model, &perf)
            };
            candidates.push((model, weight as u64));
        }

        if candidates.is_empty() {
            return self.reset_oldest(&pool).await;
        }

        let total: u64 = candidates.iter().map(|(_, w)| w).sum();
        let draw = {
            let mut rng = rand::thread_rng();
            rng.gen_range(0..total)
        };

        let mut cumulative = 0u64;
        for (model, weight) in &candidates {
            cumulative += weight;
            if draw < cumulative {
                return Ok((*model).clone());
            }
        }
        // Unreachable with total = Σ weights; keep the last as a guard.
        Ok(candidates[candidates.len() - 1].0.clone())
    }

    /// Every circuit in the pool is open: reset the oldest-opened one to
    /// half-open and hand it out as a probe.
    async fn reset_oldest(&self, pool: &[&ModelConfig]) -> Result<ModelConfig> {
        let mut oldest: Option<(&ModelConfig, i64)> = None;
        for model in pool.iter().copied() {
            let breaker = self.states[&model.id].breaker.lock().await;
            if let Some(opened_at) = breaker.opened_at() {
                if oldest.is_none_or(|(_, t)| opened_at < t) {
                    oldest = Some((model, opened_at));
                }
            }
        }

        match oldest {
            Some((model, _)) => {
                self.states[&model.id].breaker.lock().await.force_half_open();
                self.mirror_circuit(&model.id).await;
                info!(model = %model.id, "all circuits open, resetting oldest to half-open");
                Ok(model.clone())
            }
            // No breaker has ever opened; fall back to the pool head.
            None => Ok(pool[0].clone()),
        }
    }

    pub async fn record_success(&self, model_id: &str, latency_ms: u64) {
        let Some(state) = self.states.get(model_id) else {
            warn!(model = model_id, "success reported for unknown model");
            return;
        };
        state.perf.lock().await.record_success(latency_ms, Utc::now());
        state.breaker.lock().await.record_success();
        self.mirror(model_id).await;
    }

    pub async fn record_failure(&self, model_id: &str) {
        let Some(state) = self.states.get(model_id) else {
            warn!(model = model_id, "failure reported for unknown model");
            return;
        };
        let now = Utc::now();
        let consecutive = {
            let mut perf = state.perf.lock().await;
            perf.record_failure(now);
            perf.consecutive_failures
        };
        state
            .breaker
            .lock()
            .await
            .record_failure(now.timestamp_millis(), consecutive);
        self.mirror(model_id).await;
    }

    pub async fn record_tool_outcome(&self, model_id: &str, success: bool) {
        let Some(state) = self.states.get(model_id) else {
            warn!(model = model_id, "tool outcome reported for unknown model");
            return;
        };
        state.perf.lock().await.record_tool_outcome(success);
        self.mirror_perf(model_id).await;
    }

    /// Per-model stats for the inspection API
    pub async fn stats(&self) -> Vec<ModelStats> {
        let now_ms = Utc::now().timestamp_millis();
        let mut stats = Vec::with_capacity(self.catalog.len());
        for model in &self.catalog {
            let state = &self.states[&model.id];
            let perf = state.perf.lock().await.clone();
            let circuit = state.breaker.lock().await.effective_state(now_ms);
            stats.push(ModelStats {
                id: model.id.clone(),
                name: model.name.clone(),
                provider: model.provider.clone(),
                is_free: model.is_free,
                effective_weight: effective_weight(model, &perf),
                success: perf.success,
                failure: perf.failure,
                tool_success: perf.tool_success,
                tool_failure: perf.tool_failure,
                consecutive_failures: perf.consecutive_failures,
                avg_latency_ms: perf.avg_latency_ms(),
                circuit,
                last_used: perf.last_used,
            });
        }
        stats
    }

    async fn mirror(&self, model_id: &str) {
        self.mirror_perf(model_id).await;
        self.mirror_circuit(model_id).await;
    }

    async fn mirror_perf(&self, model_id: &str) {
        let Some(state) = self.states.get(model_id) else {
            return;
        };
        let perf = state.perf.lock().await.clone();
        match serde_json::to_string(&perf) {
            Ok(raw) => {
                if let Err(e) = self
                    .kv
                    .set(&perf_key(model_id), &raw, Some(MIRROR_TTL_SECONDS))
                    .await
                {
                    debug!(model = model_id, error = %e, "perf mirror write dropped");
                }
            }
            Err(e) => debug!(model = model_id, error = %e, "perf mirror encode failed"),
        }
    }

    async fn mirror_circuit(&self, model_id: &str) {
        let Some(state) = self.states.get(model_id) else {
            return;
        };
        let snapshot = state.breaker.lock().await.snapshot();
        match serde_json::to_string(&snapshot) {
            Ok(raw) => {
                if let Err(e) = self
                    .kv
                    .set(&circuit_key(model_id), &raw, Some(MIRROR_TTL_SECONDS))
                    .await
                {
                    debug!(model = model_id, error = %e, "circuit mirror write dropped");
                }
            }
            Err(e) => debug!(model = model_id, error = %e, "circuit mirror encode failed"),
        }
    }
}

fn perf_key(model_id: &str) -> String {
    format!("model.perf.{model_id}")
}

fn circuit_key(model_id: &str) -> String {
    format!("model.circuit.{model_id}")
}
