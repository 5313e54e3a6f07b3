//! AI validator worker
//!
//! Consumes `anomaly.detected`, asks a routed model whether the anomaly is
//! a real pricing glitch, and emits a [`ValidatedGlitch`] to
//! `anomaly.confirmed` when the model confirms with enough confidence.
//! Parse failures and dead endpoints fall back to the next distinct model;
//! exhausting all attempts surfaces as a transient handler failure so the
//! stream framework retries the entry.

use crate::llm::{ChatBackend, ChatMessage};
use crate::router::{EscalationContext, ModelRouter};
use crate::verdict::{parse_verdict, ModelVerdict};
use async_trait::async_trait;
use chrono::Utc;
use pricewire_common::bus::{StreamBus, StreamEntry, STREAM_ANOMALY_CONFIRMED};
use pricewire_common::consumer::StreamHandler;
use pricewire_common::db;
use pricewire_common::metrics::Metrics;
use pricewire_common::models::{
    AnomalyStatus, ModelConfig, PricingAnomaly, ValidatedGlitch,
};
use pricewire_common::WorkerError;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Distinct models tried before the handler invocation fails
const MAX_MODEL_ATTEMPTS: usize = 3;

/// Confirmation floor: below this the anomaly is rejected
const CONFIDENCE_FLOOR: f64 = 50.0;

const TEMPERATURE: f32 = 0.1;
const MAX_TOKENS: u32 = 500;

pub struct ValidatorHandler {
    router: Arc<ModelRouter>,
    llm: Arc<dyn ChatBackend>,
    bus: StreamBus,
    db: SqlitePool,
    metrics: Metrics,
}

impl ValidatorHandler {
    pub fn new(
        router: Arc<ModelRouter>,
        llm: Arc<dyn ChatBackend>,
        bus: StreamBus,
        db: SqlitePool,
        metrics: Metrics,
    ) -> Self {
        Self {
            router,
            llm,
            bus,
            db,
            metrics,
        }
    }

    /// Ask routed models for a verdict, walking to the next distinct model
    /// on network errors, empty responses, and unparseable output.
    async fn obtain_verdict(
        &self,
        anomaly: &PricingAnomaly,
    ) -> Result<(ModelVerdict, ModelConfig), WorkerError> {
        let ctx = EscalationContext::from_anomaly(anomaly);
        let messages = build_prompt(anomaly);
        let mut tried: HashSet<String> = HashSet::new();

        while tried.len() < MAX_MODEL_ATTEMPTS {
            let Some(model) = self.select_untried(&ctx, &tried).await else {
                break;
            };
            tried.insert(model.id.clone());

            let started = Instant::now();
            match self.llm.chat(&model, &messages, TEMPERATURE, MAX_TOKENS).await {
                Ok(content) => match parse_verdict(&content) {
                    Ok(verdict) => {
                        let latency_ms = started.elapsed().as_millis() as u64;
                        self.router.record_success(&model.id, latency_ms).await;
                        // Structured-output adherence is the tool-discipline
                        // signal for tool-capable models.
                        if model.supports_tools {
                            self.router.record_tool_outcome(&model.id, true).await;
                        }
                        self.metrics
                            .observe_duration_ms(
                                "validation",
                                &[("model", model.id.as_str())],
                                latency_ms,
                            )
                            .await;
                        return Ok((verdict, model));
                    }
                    Err(e) => {
                        warn!(model = %model.id, error = %e, "unparseable model verdict");
                        self.router.record_failure(&model.id).await;
                        if model.supports_tools {
                            self.router.record_tool_outcome(&model.id, false).await;
                        }
                    }
                },
                Err(e) => {
                    warn!(model = %model.id, error = %e, "model call failed");
                    if e.is_rate_limited() {
                        self.metrics
                            .incr("model_rate_limited", &[("model", model.id.as_str())])
                            .await;
                    }
                    self.router.record_failure(&model.id).await;
                }
            }
        }

        Err(WorkerError::Transient(format!(
            "no verdict after {} model attempts",
            tried.len().max(1)
        )))
    }

    /// Select a model not yet tried this invocation
    async fn select_untried(
        &self,
        ctx: &EscalationContext,
        tried: &HashSet<String>,
    ) -> Option<ModelConfig> {
        match self.router.select_excluding(ctx, tried).await {
            Ok(model) => Some(model),
            Err(e) => {
                debug!(error = %e, "no untried model available");
                None
            }
        }
    }

    async fn confirm(
        &self,
        anomaly: &PricingAnomaly,
        verdict: ModelVerdict,
    ) -> Result<(), WorkerError> {
        let glitch = ValidatedGlitch {
            id: Uuid::new_v4().to_string(),
            anomaly_id: anomaly.id.clone(),
            product: anomaly.product.clone(),
            is_glitch: true,
            confidence: verdict.confidence,
            reasoning: verdict.reasoning,
            glitch_type: verdict.glitch_type,
            profit_margin: profit_margin(anomaly),
            validated_at: Utc::now(),
        };

        db::glitches::insert(&self.db, &glitch)
            .await
            .map_err(WorkerError::from)?;
        self.bus
            .publish_json(STREAM_ANOMALY_CONFIRMED, &glitch)
            .await
            .map_err(WorkerError::from)?;
        db::anomalies::set_status(&self.db, &anomaly.id, AnomalyStatus::Validated)
            .await
            .map_err(WorkerError::from)?;

        info!(
            anomaly_id = %anomaly.id,
            glitch_id = %glitch.id,
            confidence = glitch.confidence,
            profit_margin = glitch.profit_margin,
            "glitch confirmed"
        );
        self.metrics.incr("anomalies_confirmed", &[]).await;
        Ok(())
    }

    async fn reject(&self, anomaly: &PricingAnomaly, verdict: &ModelVerdict) -> Result<(), WorkerError> {
        db::anomalies::set_status(&self.db, &anomaly.id, AnomalyStatus::Rejected)
            .await
            .map_err(WorkerError::from)?;
        info!(
            anomaly_id = %anomaly.id,
            is_glitch = verdict.is_glitch,
            confidence = verdict.confidence,
            "anomaly rejected"
        );
        self.metrics.incr("anomalies_rejected", &[]).await;
        Ok(())
    }
}

#[async_trait]
impl StreamHandler for ValidatorHandler {
    async fn handle(&self, entry: &StreamEntry) -> Result<(), WorkerError> {
        let anomaly: PricingAnomaly = entry
            .parse_payload()
            .map_err(|e| WorkerError::Malformed(e.to_string()))?;

        // Replays must always find a row to advance.
        db::anomalies::upsert_detected(&self.db, &anomaly)
            .await
            .map_err(WorkerError::from)?;

        let (verdict, _model) = self.obtain_verdict(&anomaly).await?;

        if verdict.is_glitch && verdict.confidence >= CONFIDENCE_FLOOR {
            self.confirm(&anomaly, verdict).await
        } else {
            self.reject(&anomaly, &verdict).await
        }
    }
}

/// Resale headroom: `(original - current) / original`, floored at zero.
/// Without a known original price the detector's discount stands in.
pub fn profit_margin(anomaly: &PricingAnomaly) -> f64 {
    match anomaly.product.original_price {
        Some(original) if original > 0.0 => {
            ((original - anomaly.product.current_price) / original * 100.0).max(0.0)
        }
        _ => anomaly.discount_percentage,
    }
}

/// Structured prompt requesting a strict JSON verdict
pub fn build_prompt(anomaly: &PricingAnomaly) -> Vec<ChatMessage> {
    let system = "You are a retail pricing analyst. Decide whether the reported price is a \
                  genuine pricing error (decimal slip, database fault, stacked coupon) or an \
                  ordinary discount/clearance. Respond with a single JSON object and nothing \
                  else: {\"is_glitch\": bool, \"confidence\": 0-100, \"reasoning\": string, \
                  \"glitch_type\": \"decimal_error\"|\"database_error\"|\"clearance\"|\"coupon_stack\"|\"unknown\"}";

    let original = anomaly
        .product
        .original_price
        .map(|p| format!("{p:.2}"))
        .unwrap_or_else(|| "unknown".to_string());
    let z_score = anomaly
        .z_score
        .map(|z| format!("{z:.2}"))
        .unwrap_or_else(|| "n/a".to_string());

    let user = format!(
        "Product: {title}\nRetailer: {retailer}\nCategory: {category}\n\
         Current price: {current:.2}\nOriginal price: {original}\n\
         Discount: {discount:.1}%\nStock: {stock:?}\n\
         Detector: {detector:?} (z-score {z_score}, confidence {confidence:.0}/100)\nURL: {url}",
        title = anomaly.product.title,
        retailer = anomaly.product.retailer,
        category = anomaly.product.category,
        current = anomaly.product.current_price,
        original = original,
        discount = anomaly.discount_percentage,
        stock = anomaly.product.stock_status,
        detector = anomaly.anomaly_type,
        z_score = z_score,
        confidence = anomaly.initial_confidence,
        url = anomaly.product.url,
    );

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricewire_common::models::{AnomalyType, ProductSnapshot, StockStatus};

    fn anomaly(current: f64, original: Option<f64>, discount: f64) -> PricingAnomaly {
        PricingAnomaly {
            id: "a1".into(),
            product: ProductSnapshot {
                title: "Widget".into(),
                current_price: current,
                original_price: original,
                stock_status: StockStatus::InStock,
                retailer: "amazon".into(),
                url: "https://example.com".into(),
                category: "Electronics".into(),
            },
            anomaly_type: AnomalyType::DecimalError,
            z_score: None,
            discount_percentage: discount,
            initial_confidence: 85.0,
            detected_at: Utc::now(),
            status: AnomalyStatus::Pending,
        }
    }

    #[test]
    fn profit_margin_from_original_price() {
        let margin = profit_margin(&anomaly(9.99, Some(999.99), 99.0));
        assert!((margin - 99.0).abs() < 0.01, "margin was {margin}");
    }

    #[test]
    fn profit_margin_floors_at_zero() {
        assert_eq!(profit_margin(&anomaly(120.0, Some(100.0), 0.0)), 0.0);
    }

    #[test]
    fn profit_margin_falls_back_to_discount() {
        assert_eq!(profit_margin(&anomaly(9.99, None, 42.5)), 42.5);
        assert_eq!(profit_margin(&anomaly(9.99, Some(0.0), 42.5)), 42.5);
    }

    #[test]
    fn prompt_includes_product_facts() {
        let messages = build_prompt(&anomaly(9.99, Some(999.99), 99.0));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.contains("is_glitch"));
        assert!(messages[1].content.contains("Widget"));
        assert!(messages[1].content.contains("999.99"));
        assert!(messages[1].content.contains("amazon"));
    }
}
