//! Shared data model for PriceWire services
//!
//! Entities crossing service boundaries: anomalies emitted by the detector,
//! glitches emitted by the validator, the model catalog and its runtime
//! state, subscribers with notification preferences, and dispatch jobs.
//! Product snapshots are stored by value at emission time; downstream
//! consumers never re-resolve them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stock status of a product at detection time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    InStock,
    LowStock,
    OutOfStock,
    Unknown,
}

/// How the detector flagged the anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    ZScore,
    PercentageDrop,
    DecimalError,
    Historical,
}

/// Lifecycle status of an anomaly
///
/// Transitions are monotonic: pending → validated|rejected → notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyStatus {
    Pending,
    Validated,
    Rejected,
    Notified,
}

impl AnomalyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyStatus::Pending => "pending",
            AnomalyStatus::Validated => "validated",
            AnomalyStatus::Rejected => "rejected",
            AnomalyStatus::Notified => "notified",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            AnomalyStatus::Pending => 0,
            AnomalyStatus::Validated | AnomalyStatus::Rejected => 1,
            AnomalyStatus::Notified => 2,
        }
    }

    /// Whether a transition to `next` is allowed.
    ///
    /// Setting the same status twice is allowed (idempotent writers), moving
    /// backwards is not.
    pub fn can_advance_to(&self, next: AnomalyStatus) -> bool {
        *self == next || next.rank() > self.rank()
    }
}

impl FromStr for AnomalyStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AnomalyStatus::Pending),
            "validated" => Ok(AnomalyStatus::Validated),
            "rejected" => Ok(AnomalyStatus::Rejected),
            "notified" => Ok(AnomalyStatus::Notified),
            other => Err(format!("unknown anomaly status: {other}")),
        }
    }
}

/// Classification of a confirmed pricing glitch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlitchType {
    DecimalError,
    DatabaseError,
    Clearance,
    CouponStack,
    Unknown,
}

impl FromStr for GlitchType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "decimal_error" => Ok(GlitchType::DecimalError),
            "database_error" => Ok(GlitchType::DatabaseError),
            "clearance" => Ok(GlitchType::Clearance),
            "coupon_stack" => Ok(GlitchType::CouponStack),
            "unknown" => Ok(GlitchType::Unknown),
            other => Err(format!("unknown glitch type: {other}")),
        }
    }
}

/// Product state captured at emission time
///
/// Embedded flat (serde `flatten`) in both anomaly and glitch payloads so
/// the wire format stays a single JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub title: String,
    pub current_price: f64,
    #[serde(default)]
    pub original_price: Option<f64>,
    pub stock_status: StockStatus,
    pub retailer: String,
    pub url: String,
    pub category: String,
}

/// A statistically flagged candidate price, pre-validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingAnomaly {
    pub id: String,
    #[serde(flatten)]
    pub product: ProductSnapshot,
    pub anomaly_type: AnomalyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_score: Option<f64>,
    pub discount_percentage: f64,
    /// Detector confidence in [0,100]
    pub initial_confidence: f64,
    pub detected_at: DateTime<Utc>,
    pub status: AnomalyStatus,
}

/// A validated pricing error worth broadcasting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedGlitch {
    pub id: String,
    pub anomaly_id: String,
    #[serde(flatten)]
    pub product: ProductSnapshot,
    pub is_glitch: bool,
    /// Model confidence clamped to [0,100]
    pub confidence: f64,
    pub reasoning: String,
    pub glitch_type: GlitchType,
    /// Resale headroom as a percentage of the original price
    pub profit_margin: f64,
    pub validated_at: DateTime<Utc>,
}

/// Capability tier of a model in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    High,
    Mid,
    Base,
}

/// Immutable model catalog entry, loaded at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub name: String,
    pub provider: String,
    /// Selection weight in [1,100] before performance adjustment
    pub base_weight: u32,
    pub context_window: u32,
    pub tier: ModelTier,
    pub capabilities: Vec<String>,
    pub supports_tools: bool,
    pub is_free: bool,
    pub timeout_ms: u64,
    pub enabled: bool,
}

/// Mutable per-model performance record, mirrored to KV with a 24h TTL
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelPerformance {
    pub success: u64,
    pub failure: u64,
    pub tool_success: u64,
    pub tool_failure: u64,
    pub total_latency_ms: u64,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl ModelPerformance {
    pub fn record_success(&mut self, latency_ms: u64, now: DateTime<Utc>) {
        self.success += 1;
        self.total_latency_ms += latency_ms;
        self.consecutive_failures = 0;
        self.last_used = Some(now);
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.failure += 1;
        self.consecutive_failures += 1;
        self.last_used = Some(now);
    }

    pub fn record_tool_outcome(&mut self, success: bool) {
        if success {
            self.tool_success += 1;
        } else {
            self.tool_failure += 1;
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.success + self.failure
    }

    pub fn success_rate(&self) -> Option<f64> {
        let total = self.total_requests();
        if total == 0 {
            None
        } else {
            Some(self.success as f64 / total as f64)
        }
    }

    pub fn avg_latency_ms(&self) -> Option<u64> {
        if self.success == 0 {
            None
        } else {
            Some(self.total_latency_ms / self.success)
        }
    }
}

/// Circuit breaker state for a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Serializable circuit breaker snapshot, mirrored to KV with a 24h TTL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    /// Epoch millis; only meaningful when open or half-open
    #[serde(default)]
    pub opened_at: Option<i64>,
    /// Sliding-window error timestamps (epoch millis)
    #[serde(default)]
    pub error_timestamps: Vec<i64>,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            error_timestamps: Vec::new(),
        }
    }
}

/// Subscription level of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Starter,
    Pro,
    Elite,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Starter => "starter",
            Tier::Pro => "pro",
            Tier::Elite => "elite",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "free" => Ok(Tier::Free),
            "starter" => Ok(Tier::Starter),
            "pro" => Ok(Tier::Pro),
            "elite" => Ok(Tier::Elite),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// Delivery channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Discord,
    Sms,
    Telegram,
    Whatsapp,
    Webhook,
    Priority,
}

impl Channel {
    pub const ALL: [Channel; 7] = [
        Channel::Email,
        Channel::Discord,
        Channel::Sms,
        Channel::Telegram,
        Channel::Whatsapp,
        Channel::Webhook,
        Channel::Priority,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Discord => "discord",
            Channel::Sms => "sms",
            Channel::Telegram => "telegram",
            Channel::Whatsapp => "whatsapp",
            Channel::Webhook => "webhook",
            Channel::Priority => "priority",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_max_price() -> f64 {
    f64::MAX
}

fn default_true() -> bool {
    true
}

/// Per-user notification preferences, stored as a JSON column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPrefs {
    #[serde(default)]
    pub min_profit_margin: f64,
    /// Case-insensitive substring match against the glitch category;
    /// empty means "any category"
    #[serde(default)]
    pub categories: Vec<String>,
    /// Case-insensitive exact retailer match; empty means "any retailer"
    #[serde(default)]
    pub retailers: Vec<String>,
    #[serde(default)]
    pub min_price: f64,
    #[serde(default = "default_max_price")]
    pub max_price: f64,
    #[serde(default = "default_true")]
    pub enable_email: bool,
    #[serde(default)]
    pub enable_discord: bool,
    #[serde(default)]
    pub enable_sms: bool,
    #[serde(default)]
    pub enable_telegram: bool,
    #[serde(default)]
    pub enable_whatsapp: bool,
    #[serde(default)]
    pub enable_webhook: bool,
    #[serde(default)]
    pub enable_priority: bool,
}

impl Default for NotificationPrefs {
    fn default() -> Self {
        Self {
            min_profit_margin: 0.0,
            categories: Vec::new(),
            retailers: Vec::new(),
            min_price: 0.0,
            max_price: f64::MAX,
            enable_email: true,
            enable_discord: false,
            enable_sms: false,
            enable_telegram: false,
            enable_whatsapp: false,
            enable_webhook: false,
            enable_priority: false,
        }
    }
}

impl NotificationPrefs {
    pub fn channel_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Email => self.enable_email,
            Channel::Discord => self.enable_discord,
            Channel::Sms => self.enable_sms,
            Channel::Telegram => self.enable_telegram,
            Channel::Whatsapp => self.enable_whatsapp,
            Channel::Webhook => self.enable_webhook,
            Channel::Priority => self.enable_priority,
        }
    }
}

/// A notification subscriber with per-channel contact handles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub telegram_chat_id: Option<String>,
    #[serde(default)]
    pub whatsapp_number: Option<String>,
    #[serde(default)]
    pub discord_webhook: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub push_topic: Option<String>,
    pub tier: Tier,
    pub active: bool,
    #[serde(default)]
    pub prefs: NotificationPrefs,
}

/// A scheduled per-tier-group fan-out job
///
/// Carries the glitch snapshot by value so job execution never re-resolves
/// upstream entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchJob {
    pub glitch: ValidatedGlitch,
    pub tiers: Vec<Tier>,
    pub scheduled_at: DateTime<Utc>,
}

impl DispatchJob {
    /// Delay-queue uniqueness key: `notify-{glitch_id}-{joined-tiers}`
    pub fn unique_id(&self) -> String {
        let tiers: Vec<&str> = self.tiers.iter().map(Tier::as_str).collect();
        format!("notify-{}-{}", self.glitch.id, tiers.join("-"))
    }
}

/// Result of one channel provider invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelOutcome {
    pub success: bool,
    pub channel: Channel,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
}

impl ChannelOutcome {
    pub fn ok(channel: Channel, message_id: Option<String>) -> Self {
        Self {
            success: true,
            channel,
            message_id,
            error: None,
            sent_at: Utc::now(),
        }
    }

    pub fn failed(channel: Channel, error: impl Into<String>) -> Self {
        Self {
            success: false,
            channel,
            message_id: None,
            error: Some(error.into()),
            sent_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anomaly_status_is_monotonic() {
        assert!(AnomalyStatus::Pending.can_advance_to(AnomalyStatus::Validated));
        assert!(AnomalyStatus::Pending.can_advance_to(AnomalyStatus::Rejected));
        assert!(AnomalyStatus::Validated.can_advance_to(AnomalyStatus::Notified));
        assert!(AnomalyStatus::Notified.can_advance_to(AnomalyStatus::Notified));
        assert!(!AnomalyStatus::Validated.can_advance_to(AnomalyStatus::Pending));
        assert!(!AnomalyStatus::Notified.can_advance_to(AnomalyStatus::Validated));
    }

    #[test]
    fn dispatch_job_unique_id_joins_tiers() {
        let glitch = ValidatedGlitch {
            id: "g1".into(),
            anomaly_id: "a1".into(),
            product: ProductSnapshot {
                title: "Widget".into(),
                current_price: 9.99,
                original_price: Some(99.99),
                stock_status: StockStatus::InStock,
                retailer: "amazon".into(),
                url: "https://example.com/widget".into(),
                category: "Electronics".into(),
            },
            is_glitch: true,
            confidence: 95.0,
            reasoning: "decimal shift".into(),
            glitch_type: GlitchType::DecimalError,
            profit_margin: 90.0,
            validated_at: Utc::now(),
        };
        let job = DispatchJob {
            glitch,
            tiers: vec![Tier::Pro, Tier::Elite],
            scheduled_at: Utc::now(),
        };
        assert_eq!(job.unique_id(), "notify-g1-pro-elite");
    }

    #[test]
    fn prefs_deserialize_with_defaults() {
        let prefs: NotificationPrefs = serde_json::from_str("{}").unwrap();
        assert!(prefs.enable_email);
        assert!(!prefs.enable_sms);
        assert_eq!(prefs.min_price, 0.0);
        assert_eq!(prefs.max_price, f64::MAX);
        assert!(prefs.categories.is_empty());
    }

    #[test]
    fn anomaly_wire_format_is_flat() {
        let json = serde_json::json!({
            "id": "a1",
            "title": "4K TV",
            "current_price": 9.99,
            "original_price": 999.99,
            "stock_status": "in_stock",
            "retailer": "amazon",
            "url": "https://example.com/tv",
            "category": "Electronics",
            "anomaly_type": "decimal_error",
            "discount_percentage": 99.0,
            "initial_confidence": 85.0,
            "detected_at": "2025-11-02T10:00:00Z",
            "status": "pending"
        });
        let anomaly: PricingAnomaly = serde_json::from_value(json).unwrap();
        assert_eq!(anomaly.product.retailer, "amazon");
        assert_eq!(anomaly.status, AnomalyStatus::Pending);
        assert!(anomaly.z_score.is_none());
    }
}
