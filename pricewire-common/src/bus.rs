//! Stream bus adapter
//!
//! A durable append-only log over the `stream_entries` table. Entry ids are
//! `{ms}-{seq}` and strictly increase per stream, including under clock
//! regression (the sequence number bumps instead). Readers page strictly
//! after a cursor; dead-letter streams are plain streams named
//! `dlq.{original}`.

use crate::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Stream carrying detector output
pub const STREAM_ANOMALY_DETECTED: &str = "anomaly.detected";
/// Stream carrying validator output
pub const STREAM_ANOMALY_CONFIRMED: &str = "anomaly.confirmed";

/// Field under which [`StreamBus::publish_json`] stores the document
pub const PAYLOAD_FIELD: &str = "payload";

/// Monotonically increasing stream entry id of the form `{ms}-{seq}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    pub ms: i64,
    pub seq: i64,
}

impl EntryId {
    /// Cursor value meaning "before the first entry"
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| format!("malformed entry id: {s:?}"))?;
        let ms = ms.parse().map_err(|_| format!("malformed entry id: {s:?}"))?;
        let seq = seq.parse().map_err(|_| format!("malformed entry id: {s:?}"))?;
        Ok(EntryId { ms, seq })
    }
}

/// One entry read from a stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEntry {
    #[serde(with = "entry_id_string")]
    pub id: EntryId,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    /// Deserialize the JSON document stored under [`PAYLOAD_FIELD`].
    ///
    /// A missing field and an unparseable document are both invalid input;
    /// handlers map this to a malformed-payload disposition.
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let raw = self
            .fields
            .get(PAYLOAD_FIELD)
            .ok_or_else(|| Error::InvalidInput(format!("entry {} has no payload field", self.id)))?;
        Ok(serde_json::from_str(raw)?)
    }
}

mod entry_id_string {
    use super::EntryId;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(id: &EntryId, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&id.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<EntryId, D::Error> {
        let raw = String::deserialize(de)?;
        EntryId::from_str(&raw).map_err(serde::de::Error::custom)
    }
}

/// Durable append-only stream log with cursor-paged reads
#[derive(Clone)]
pub struct StreamBus {
    pool: SqlitePool,
}

impl StreamBus {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an entry, returning its generated id.
    ///
    /// Ids are allocated inside a transaction against the last id of the
    /// stream, so they stay strictly increasing even when the wall clock
    /// steps backwards.
    pub async fn xadd(&self, stream: &str, fields: &HashMap<String, String>) -> Result<EntryId> {
        let now_ms = Utc::now().timestamp_millis();
        let fields_json = serde_json::to_string(fields)?;

        let mut tx = self.pool.begin().await?;

        let last: Option<(i64, i64)> = sqlx::query_as(
            "SELECT ms, seq FROM stream_entries WHERE stream = ? ORDER BY ms DESC, seq DESC LIMIT 1",
        )
        .bind(stream)
        .fetch_optional(&mut *tx)
        .await?;

        let id = match last {
            Some((last_ms, last_seq)) if now_ms <= last_ms => EntryId {
                ms: last_ms,
                seq: last_seq + 1,
            },
            _ => EntryId { ms: now_ms, seq: 0 },
        };

        sqlx::query("INSERT INTO stream_entries (stream, ms, seq, fields) VALUES (?, ?, ?, ?)")
            .bind(stream)
            .bind(id.ms)
            .bind(id.seq)
            .bind(&fields_json)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(id)
    }

    /// Serialize `payload` to JSON and append it under the `payload` field
    pub async fn publish_json<T: Serialize>(&self, stream: &str, payload: &T) -> Result<EntryId> {
        let mut fields = HashMap::with_capacity(1);
        fields.insert(PAYLOAD_FIELD.to_string(), serde_json::to_string(payload)?);
        self.xadd(stream, &fields).await
    }

    /// Read up to `count` entries strictly after `after`, in insertion order
    pub async fn xread(&self, stream: &str, after: EntryId, count: usize) -> Result<Vec<StreamEntry>> {
        let rows: Vec<(i64, i64, String)> = sqlx::query_as(
            "SELECT ms, seq, fields FROM stream_entries
             WHERE stream = ? AND (ms > ? OR (ms = ? AND seq > ?))
             ORDER BY ms, seq LIMIT ?",
        )
        .bind(stream)
        .bind(after.ms)
        .bind(after.ms)
        .bind(after.seq)
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for (ms, seq, fields_json) in rows {
            let fields: HashMap<String, String> = serde_json::from_str(&fields_json)?;
            entries.push(StreamEntry {
                id: EntryId { ms, seq },
                fields,
            });
        }
        Ok(entries)
    }

    /// Entry count of a stream
    pub async fn xlen(&self, stream: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM stream_entries WHERE stream = ?")
                .bind(stream)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Dead-letter an entry that exhausted its retry budget.
    ///
    /// The DLQ entry keeps the original payload verbatim alongside the
    /// source stream, entry id, error description and a timestamp.
    pub async fn push_dlq(
        &self,
        stream: &str,
        entry: &StreamEntry,
        error: &str,
    ) -> Result<EntryId> {
        let mut fields = HashMap::with_capacity(5);
        fields.insert("stream".to_string(), stream.to_string());
        fields.insert("entry_id".to_string(), entry.id.to_string());
        fields.insert("payload".to_string(), serde_json::to_string(&entry.fields)?);
        fields.insert("error".to_string(), error.to_string());
        fields.insert("ts".to_string(), Utc::now().to_rfc3339());
        self.xadd(&dlq_stream(stream), &fields).await
    }
}

/// Name of the dead-letter stream for `stream`
pub fn dlq_stream(stream: &str) -> String {
    format!("dlq.{stream}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_id_round_trips() {
        let id = EntryId { ms: 1730540000123, seq: 7 };
        assert_eq!(id.to_string(), "1730540000123-7");
        assert_eq!(EntryId::from_str("1730540000123-7").unwrap(), id);
        assert!(EntryId::from_str("nonsense").is_err());
        assert!(EntryId::from_str("12x-0").is_err());
    }

    #[test]
    fn entry_id_orders_numerically_not_lexically() {
        let small = EntryId { ms: 999, seq: 0 };
        let big = EntryId { ms: 1000, seq: 0 };
        assert!(small < big);
        // Lexicographic comparison of the string forms would say otherwise.
        assert!(small.to_string() > big.to_string());
    }

    #[test]
    fn dlq_stream_naming() {
        assert_eq!(dlq_stream("anomaly.detected"), "dlq.anomaly.detected");
    }
}
