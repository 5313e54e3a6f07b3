//! Effective weight computation
//!
//! A model's base weight is scaled by its observed success rate, penalized
//! for consecutive failures, and nudged up for good tool-call behavior.
//! The result never drops below 1 so a struggling model keeps a nonzero
//! chance to redeem itself.

use pricewire_common::models::{ModelConfig, ModelPerformance};

/// Penalty per consecutive failure, capped at [`MAX_CONSECUTIVE_PENALTY`]
const CONSECUTIVE_PENALTY_STEP: i64 = 10;
const MAX_CONSECUTIVE_PENALTY: i64 = 80;

/// Maximum bonus for a perfect tool-call record
const TOOL_BONUS_SCALE: f64 = 5.0;

pub fn effective_weight(model: &ModelConfig, perf: &ModelPerformance) -> u32 {
    let Some(success_rate) = perf.success_rate() else {
        return model.base_weight;
    };

    let penalty =
        ((perf.consecutive_failures as i64) * CONSECUTIVE_PENALTY_STEP).min(MAX_CONSECUTIVE_PENALTY);

    let tool_total = perf.tool_success + perf.tool_failure;
    let tool_bonus = if tool_total > 0 {
        ((perf.tool_success as f64 / tool_total as f64) * TOOL_BONUS_SCALE).round() as i64
    } else {
        0
    };

    let scaled = (model.base_weight as f64 * success_rate).round() as i64;
    (scaled - penalty + tool_bonus).max(1) as u32
}
