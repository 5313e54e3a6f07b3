//! Stream consumer framework
//!
//! Drives any [`StreamHandler`] against a named bus stream with
//! at-least-once semantics. The committed cursor lives in KV under
//! `cursor.stream.{stream}.{group}` and never advances past an entry until
//! that entry either completed or was dead-lettered.
//!
//! Retry counters are in-process only. Losing them on restart is fine:
//! at-least-once means the entry is re-read anyway, bounded again by
//! `max_retries`.

use crate::bus::{EntryId, StreamBus, StreamEntry};
use crate::config::CoreConfig;
use crate::error::WorkerError;
use crate::kv::KvStore;
use crate::metrics::Metrics;
use crate::shutdown::ShutdownCoordinator;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Per-consumer tuning knobs
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub max_retries: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval_ms: 2000,
            max_retries: 5,
        }
    }
}

impl ConsumerConfig {
    pub fn from_core(core: &CoreConfig) -> Self {
        Self {
            batch_size: core.stream_batch_size,
            poll_interval_ms: core.stream_poll_interval_ms,
            max_retries: core.stream_max_retries,
        }
    }
}

/// One stream entry handler.
///
/// The returned [`WorkerError`] class selects the disposition: retryable
/// classes retry in place and dead-letter at the budget, `Malformed`
/// advances with a warning, `Shutdown` abandons without advancing, `Fatal`
/// aborts the consumer.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, entry: &StreamEntry) -> std::result::Result<(), WorkerError>;
}

/// Cursor-based stream consumer with bounded retries and DLQ routing
pub struct StreamConsumer {
    bus: StreamBus,
    kv: KvStore,
    metrics: Metrics,
    shutdown: Arc<ShutdownCoordinator>,
    cfg: ConsumerConfig,
}

impl StreamConsumer {
    pub fn new(
        bus: StreamBus,
        kv: KvStore,
        metrics: Metrics,
        shutdown: Arc<ShutdownCoordinator>,
        cfg: ConsumerConfig,
    ) -> Self {
        Self {
            bus,
            kv,
            metrics,
            shutdown,
            cfg,
        }
    }

    /// Consume `stream` until shutdown.
    ///
    /// Returns `Ok(())` on graceful stop and `Err` only for fatal handler
    /// errors; infrastructure hiccups (bus/KV unavailability) are logged and
    /// retried after the poll interval.
    pub async fn run(
        &self,
        stream: &str,
        group: &str,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<()> {
        let cursor_key = cursor_key(stream, group);
        let mut failures: HashMap<String, u32> = HashMap::new();

        info!(stream, group, "stream consumer started");

        while !self.shutdown.is_shutdown() {
            let cursor = match self.load_cursor(&cursor_key).await {
                Ok(cursor) => cursor,
                Err(e) => {
                    warn!(stream, error = %e, "cursor load failed");
                    self.sleep_cooperatively().await;
                    continue;
                }
            };

            let entries = match self.bus.xread(stream, cursor, self.cfg.batch_size).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(stream, error = %e, "stream read failed");
                    self.sleep_cooperatively().await;
                    continue;
                }
            };

            if entries.is_empty() {
                self.sleep_cooperatively().await;
                continue;
            }

            for entry in &entries {
                if self.shutdown.is_shutdown() {
                    // Unprocessed entries stay behind the cursor.
                    break;
                }

                let entry_key = entry.id.to_string();
                let _guard = self.shutdown.begin_operation();

                match handler.handle(entry).await {
                    Ok(()) => {
                        failures.remove(&entry_key);
                        self.advance_cursor(&cursor_key, entry.id).await;
                        self.metrics
                            .incr("stream_entries_consumed", &[("stream", stream)])
                            .await;
                    }
                    Err(WorkerError::Malformed(msg)) => {
                        warn!(stream, entry_id = %entry.id, error = %msg,
                              "malformed entry, advancing without dead-letter");
                        failures.remove(&entry_key);
                        self.advance_cursor(&cursor_key, entry.id).await;
                        self.metrics
                            .incr("stream_entries_malformed", &[("stream", stream)])
                            .await;
                    }
                    Err(WorkerError::Shutdown) => {
                        debug!(stream, entry_id = %entry.id, "handler observed shutdown");
                        break;
                    }
                    Err(WorkerError::Fatal(msg)) => {
                        error!(stream, entry_id = %entry.id, error = %msg, "fatal handler error");
                        self.metrics.incr("fatal_errors", &[("stream", stream)]).await;
                        return Err(Error::Internal(msg));
                    }
                    Err(err) => {
                        let attempts = failures.entry(entry_key.clone()).or_insert(0);
                        *attempts += 1;
                        self.metrics
                            .incr("stream_entry_retries", &[("stream", stream)])
                            .await;

                        if *attempts < self.cfg.max_retries {
                            warn!(stream, entry_id = %entry.id, attempt = *attempts,
                                  error = %err, "handler failed, entry will be retried");
                            // Re-read the same entry next iteration.
                            break;
                        }

                        warn!(stream, entry_id = %entry.id, attempts = *attempts,
                              error = %err, "retry budget exhausted, dead-lettering");
                        if let Err(e) = self.bus.push_dlq(stream, entry, &err.to_string()).await {
                            // Keep the cursor behind the entry so it is
                            // retried rather than silently lost.
                            warn!(stream, entry_id = %entry.id, error = %e,
                                  "dead-letter append failed, entry will be retried");
                            break;
                        }
                        failures.remove(&entry_key);
                        self.advance_cursor(&cursor_key, entry.id).await;
                        self.metrics
                            .incr("stream_entries_dlq", &[("stream", stream)])
                            .await;
                    }
                }
            }

            self.sleep_cooperatively().await;
        }

        info!(stream, group, "stream consumer stopped");
        Ok(())
    }

    async fn load_cursor(&self, cursor_key: &str) -> Result<EntryId> {
        match self.kv.get(cursor_key).await? {
            None => Ok(EntryId::ZERO),
            Some(raw) => match EntryId::from_str(&raw) {
                Ok(id) => Ok(id),
                Err(e) => {
                    warn!(cursor_key, error = %e, "unreadable cursor, restarting from 0-0");
                    Ok(EntryId::ZERO)
                }
            },
        }
    }

    /// Commit the cursor. The entry is already complete, so a failed write
    /// only means reprocessing under at-least-once.
    async fn advance_cursor(&self, cursor_key: &str, id: EntryId) {
        if let Err(e) = self.kv.set(cursor_key, &id.to_string(), None).await {
            warn!(cursor_key, entry_id = %id, error = %e, "cursor commit failed");
        }
    }

    async fn sleep_cooperatively(&self) {
        tokio::select! {
            _ = sleep(Duration::from_millis(self.cfg.poll_interval_ms)) => {}
            _ = self.shutdown.wait() => {}
        }
    }
}

/// KV key of the committed cursor for a (stream, group) pair
pub fn cursor_key(stream: &str, group: &str) -> String {
    format!("cursor.stream.{stream}.{group}")
}
