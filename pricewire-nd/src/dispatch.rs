//! Tiered notification dispatcher
//!
//! Turns one confirmed glitch into per-user channel deliveries. The flow:
//! glitch-level dedup (set-if-absent), synchronous non-user broadcasts,
//! then one delayed job per tier group from the policy table. Job
//! execution filters subscribers by preference, dedups per user, walks the
//! channels authorized by prefs ∩ tier policy, and marks the anomaly
//! notified once anything was delivered.
//!
//! Channel failures never cross user boundaries, and the per-user dedup
//! key is set only after at least one successful channel, so a user either got a
//! notification or is still eligible on retry.

use crate::channels::{glitch_body, ProviderRegistry};
use crate::config::BroadcastConfig;
use crate::filter::passes_filter;
use crate::policy::TierPolicy;
use crate::rate_limit::DailyCapLimiter;
use async_trait::async_trait;
use chrono::Utc;
use pricewire_common::bus::StreamEntry;
use pricewire_common::consumer::StreamHandler;
use pricewire_common::db;
use pricewire_common::delay::{DelayQueue, DelayedJob, DelayedJobHandler};
use pricewire_common::kv::KvStore;
use pricewire_common::metrics::Metrics;
use pricewire_common::models::{
    AnomalyStatus, Channel, DispatchJob, Subscriber, ValidatedGlitch,
};
use pricewire_common::WorkerError;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Delay queue consumed by this worker
pub const NOTIFY_QUEUE: &str = "notify";

const USER_DEDUP_TTL_SECONDS: u64 = 7 * 86_400;

pub struct Dispatcher {
    db: SqlitePool,
    kv: KvStore,
    delay: DelayQueue,
    metrics: Metrics,
    policy: TierPolicy,
    providers: Arc<ProviderRegistry>,
    limiter: DailyCapLimiter,
    dedup_ttl_seconds: u64,
    broadcast: BroadcastConfig,
    http: reqwest::Client,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: SqlitePool,
        kv: KvStore,
        delay: DelayQueue,
        metrics: Metrics,
        policy: TierPolicy,
        providers: Arc<ProviderRegistry>,
        dedup_ttl_seconds: u64,
        broadcast: BroadcastConfig,
        http: reqwest::Client,
    ) -> Self {
        let limiter = DailyCapLimiter::new(kv.clone());
        Self {
            db,
            kv,
            delay,
            metrics,
            policy,
            providers,
            limiter,
            dedup_ttl_seconds,
            broadcast,
            http,
        }
    }

    /// Entry point for one confirmed glitch off the stream
    pub async fn handle_confirmed(&self, glitch: &ValidatedGlitch) -> Result<(), WorkerError> {
        let dedup_key = glitch_dedup_key(&glitch.id);
        let created = self
            .kv
            .set_if_absent(&dedup_key, "1", Some(self.dedup_ttl_seconds))
            .await
            .map_err(WorkerError::from)?;

        if !created {
            info!(glitch_id = %glitch.id, "glitch already dispatched, skipping");
            self.metrics.incr("glitches_deduped", &[]).await;
            return Ok(());
        }

        self.run_broadcasts(glitch).await;

        let now = Utc::now();
        for group in self.policy.delay_groups() {
            let job = DispatchJob {
                glitch: glitch.clone(),
                tiers: group.tiers.clone(),
                scheduled_at: now + chrono::Duration::milliseconds(group.delay_ms as i64),
            };
            let unique_id = job.unique_id();
            let payload =
                serde_json::to_value(&job).map_err(|e| WorkerError::Malformed(e.to_string()))?;

            match self
                .delay
                .add(NOTIFY_QUEUE, &payload, group.delay_ms, Some(&unique_id))
                .await
            {
                Ok(true) => {
                    debug!(glitch_id = %glitch.id, %unique_id, delay_ms = group.delay_ms,
                           "dispatch job scheduled");
                    self.metrics.incr("dispatch_jobs_scheduled", &[]).await;
                }
                Ok(false) => {
                    debug!(glitch_id = %glitch.id, %unique_id, "dispatch job already scheduled");
                }
                Err(e) => {
                    // Backpressure: release the glitch dedup so the
                    // stream-level retry can schedule the remaining groups.
                    if let Err(del_err) = self.kv.del(&dedup_key).await {
                        warn!(glitch_id = %glitch.id, error = %del_err,
                              "failed to release dedup key after enqueue failure");
                    }
                    return Err(WorkerError::from(e));
                }
            }
        }

        match self.delay.pending(NOTIFY_QUEUE).await {
            Ok(pending) => {
                self.metrics
                    .set_gauge("dispatch_jobs_pending", &[], pending)
                    .await;
            }
            Err(e) => debug!(error = %e, "queue depth read failed"),
        }

        Ok(())
    }

    /// Immediate, non-user-targeted broadcasts. Failures are logged and
    /// metered; they never block subscriber scheduling.
    async fn run_broadcasts(&self, glitch: &ValidatedGlitch) {
        if let Some(url) = &self.broadcast.discord_webhook_url {
            let message = serde_json::json!({ "content": glitch_body(glitch) });
            self.post_broadcast("discord", url, &message).await;
        }
        if let Some(url) = &self.broadcast.feed_webhook_url {
            let message =
                serde_json::to_value(glitch).unwrap_or_else(|_| serde_json::json!({}));
            self.post_broadcast("feed", url, &message).await;
        }
    }

    async fn post_broadcast(&self, name: &str, url: &str, body: &serde_json::Value) {
        match self.http.post(url).json(body).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.metrics
                    .incr("broadcast_sends", &[("target", name), ("status", "ok")])
                    .await;
            }
            Ok(resp) => {
                warn!(target = name, status = %resp.status(), "broadcast rejected");
                self.metrics
                    .incr("broadcast_sends", &[("target", name), ("status", "error")])
                    .await;
            }
            Err(e) => {
                warn!(target = name, error = %e, "broadcast failed");
                self.metrics
                    .incr("broadcast_sends", &[("target", name), ("status", "error")])
                    .await;
            }
        }
    }

    /// Execute one per-tier-group dispatch job
    pub async fn run_dispatch_job(&self, job: &DispatchJob) -> Result<(), WorkerError> {
        let subscribers = db::subscribers::load_active_by_tiers(&self.db, &job.tiers)
            .await
            .map_err(WorkerError::from)?;

        debug!(
            glitch_id = %job.glitch.id,
            tiers = ?job.tiers,
            subscribers = subscribers.len(),
            "dispatch job started"
        );

        let mut any_success = false;
        for subscriber in &subscribers {
            if self.notify_subscriber(subscriber, &job.glitch).await {
                any_success = true;
            }
        }

        if any_success {
            // Idempotent; a stale or missing anomaly row must not fail the
            // job after deliveries went out.
            if let Err(e) =
                db::anomalies::set_status(&self.db, &job.glitch.anomaly_id, AnomalyStatus::Notified)
                    .await
            {
                warn!(anomaly_id = %job.glitch.anomaly_id, error = %e,
                      "could not mark anomaly notified");
            }
        }

        Ok(())
    }

    /// Deliver one glitch to one subscriber. Returns whether any channel
    /// succeeded.
    async fn notify_subscriber(&self, subscriber: &Subscriber, glitch: &ValidatedGlitch) -> bool {
        if !passes_filter(&subscriber.prefs, glitch) {
            return false;
        }

        let user_key = user_dedup_key(&subscriber.id, &glitch.id);
        match self.kv.exists(&user_key).await {
            Ok(true) => {
                debug!(user_id = %subscriber.id, glitch_id = %glitch.id, "user already notified");
                return false;
            }
            Ok(false) => {}
            Err(e) => {
                // Without the dedup answer, sending risks a duplicate and
                // skipping risks nothing but delay; skip.
                warn!(user_id = %subscriber.id, error = %e, "user dedup check failed");
                return false;
            }
        }

        let mut user_success = false;
        for channel in Channel::ALL {
            if !subscriber.prefs.channel_enabled(channel) {
                continue;
            }
            if !self.policy.allows(subscriber.tier, channel) {
                continue;
            }
            if !self.reserve_daily_cap(subscriber, channel).await {
                continue;
            }
            let Some(provider) = self.providers.get(channel) else {
                continue;
            };

            let outcome = provider.send(glitch, subscriber).await;
            let status = if outcome.success { "ok" } else { "error" };
            self.metrics
                .incr(
                    "channel_sends",
                    &[("channel", channel.as_str()), ("status", status)],
                )
                .await;

            if outcome.success {
                user_success = true;
            } else {
                warn!(
                    user_id = %subscriber.id,
                    channel = %channel,
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "channel delivery failed"
                );
            }
        }

        if user_success {
            if let Err(e) = self
                .kv
                .set(&user_key, "1", Some(USER_DEDUP_TTL_SECONDS))
                .await
            {
                warn!(user_id = %subscriber.id, error = %e, "user dedup write failed");
            }
        }
        user_success
    }

    /// Consult the daily cap for capped channels; uncapped channels always
    /// pass.
    async fn reserve_daily_cap(&self, subscriber: &Subscriber, channel: Channel) -> bool {
        let Some(cap) = self.policy.daily_cap(channel) else {
            return true;
        };
        let today = Utc::now().date_naive();
        match self
            .limiter
            .reserve(&subscriber.id, channel, today, cap)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                debug!(user_id = %subscriber.id, channel = %channel, "daily cap exhausted");
                self.metrics
                    .incr("daily_cap_exceeded", &[("channel", channel.as_str())])
                    .await;
                false
            }
            Err(e) => {
                warn!(user_id = %subscriber.id, channel = %channel, error = %e,
                      "cap reservation failed");
                false
            }
        }
    }
}

/// Stream handler feeding the dispatcher from `anomaly.confirmed`
pub struct ConfirmedGlitchHandler {
    dispatcher: Arc<Dispatcher>,
}

impl ConfirmedGlitchHandler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl StreamHandler for ConfirmedGlitchHandler {
    async fn handle(&self, entry: &StreamEntry) -> Result<(), WorkerError> {
        let glitch: ValidatedGlitch = entry
            .parse_payload()
            .map_err(|e| WorkerError::Malformed(e.to_string()))?;
        self.dispatcher.handle_confirmed(&glitch).await
    }
}

/// Delay-queue handler executing scheduled dispatch jobs
pub struct NotifyJobHandler {
    dispatcher: Arc<Dispatcher>,
}

impl NotifyJobHandler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl DelayedJobHandler for NotifyJobHandler {
    async fn handle(&self, job: &DelayedJob) -> Result<(), WorkerError> {
        let dispatch: DispatchJob = serde_json::from_value(job.payload.clone())
            .map_err(|e| WorkerError::Malformed(e.to_string()))?;
        self.dispatcher.run_dispatch_job(&dispatch).await
    }
}

pub fn glitch_dedup_key(glitch_id: &str) -> String {
    format!("notify.glitch.{glitch_id}")
}

pub fn user_dedup_key(user_id: &str, glitch_id: &str) -> String {
    format!("notify.user.{user_id}.glitch.{glitch_id}")
}
