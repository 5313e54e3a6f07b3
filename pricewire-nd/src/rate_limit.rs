//! Per-user daily send caps
//!
//! Reservations are plain KV counter increments keyed by
//! `{channel}.limit.{uid}.{YYYY-MM-DD}` with a 24h TTL, compared against
//! the channel's policy maximum. Counting past the cap is harmless; the
//! comparison is what gates the send.

use chrono::NaiveDate;
use pricewire_common::kv::KvStore;
use pricewire_common::models::Channel;
use pricewire_common::Result;

const RESERVATION_TTL_SECONDS: u64 = 86_400;

#[derive(Clone)]
pub struct DailyCapLimiter {
    kv: KvStore,
}

impl DailyCapLimiter {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    /// Reserve one send for (user, channel, day). Returns false once the
    /// day's cap is exhausted.
    pub async fn reserve(
        &self,
        user_id: &str,
        channel: Channel,
        day: NaiveDate,
        max_per_day: u32,
    ) -> Result<bool> {
        let key = reservation_key(user_id, channel, day);
        let count = self.kv.incr(&key, Some(RESERVATION_TTL_SECONDS)).await?;
        Ok(count <= max_per_day as i64)
    }
}

fn reservation_key(user_id: &str, channel: Channel, day: NaiveDate) -> String {
    format!("{channel}.limit.{user_id}.{}", day.format("%Y-%m-%d"))
}
