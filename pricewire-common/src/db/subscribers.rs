//! Subscriber storage
//!
//! Contact handles live in dedicated columns so operators can inspect them;
//! notification preferences ride along as a JSON column with serde defaults,
//! so rows written by older builds keep loading.

use crate::models::{NotificationPrefs, Subscriber, Tier};
use crate::{Error, Result};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::warn;

type SubscriberRow = (
    String,         // id
    Option<String>, // email
    Option<String>, // phone
    Option<String>, // telegram_chat_id
    Option<String>, // whatsapp_number
    Option<String>, // discord_webhook
    Option<String>, // webhook_url
    Option<String>, // push_topic
    String,         // tier
    i64,            // active
    String,         // prefs
);

const SELECT_COLUMNS: &str = "id, email, phone, telegram_chat_id, whatsapp_number, \
     discord_webhook, webhook_url, push_topic, tier, active, prefs";

/// Insert or replace a subscriber
pub async fn upsert(pool: &SqlitePool, sub: &Subscriber) -> Result<()> {
    let prefs = serde_json::to_string(&sub.prefs)?;
    sqlx::query(
        r#"
        INSERT INTO subscribers
            (id, email, phone, telegram_chat_id, whatsapp_number, discord_webhook,
             webhook_url, push_topic, tier, active, prefs, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
        ON CONFLICT(id) DO UPDATE SET
            email = excluded.email,
            phone = excluded.phone,
            telegram_chat_id = excluded.telegram_chat_id,
            whatsapp_number = excluded.whatsapp_number,
            discord_webhook = excluded.discord_webhook,
            webhook_url = excluded.webhook_url,
            push_topic = excluded.push_topic,
            tier = excluded.tier,
            active = excluded.active,
            prefs = excluded.prefs,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(&sub.id)
    .bind(&sub.email)
    .bind(&sub.phone)
    .bind(&sub.telegram_chat_id)
    .bind(&sub.whatsapp_number)
    .bind(&sub.discord_webhook)
    .bind(&sub.webhook_url)
    .bind(&sub.push_topic)
    .bind(sub.tier.as_str())
    .bind(sub.active as i64)
    .bind(&prefs)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<Subscriber>> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM subscribers WHERE id = ?");
    let row: Option<SubscriberRow> = sqlx::query_as(&sql).bind(id).fetch_optional(pool).await?;
    row.map(from_row).transpose()
}

/// Load active subscribers whose tier is in `tiers`
pub async fn load_active_by_tiers(pool: &SqlitePool, tiers: &[Tier]) -> Result<Vec<Subscriber>> {
    if tiers.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; tiers.len()].join(", ");
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM subscribers \
         WHERE active = 1 AND tier IN ({placeholders}) ORDER BY id"
    );

    let mut query = sqlx::query_as::<_, SubscriberRow>(&sql);
    for tier in tiers {
        query = query.bind(tier.as_str());
    }
    let rows = query.fetch_all(pool).await?;

    let mut subscribers = Vec::with_capacity(rows.len());
    for row in rows {
        subscribers.push(from_row(row)?);
    }
    Ok(subscribers)
}

fn from_row(row: SubscriberRow) -> Result<Subscriber> {
    let (
        id,
        email,
        phone,
        telegram_chat_id,
        whatsapp_number,
        discord_webhook,
        webhook_url,
        push_topic,
        tier,
        active,
        prefs,
    ) = row;

    let tier = Tier::from_str(&tier).map_err(Error::InvalidInput)?;
    let prefs: NotificationPrefs = match serde_json::from_str(&prefs) {
        Ok(prefs) => prefs,
        Err(e) => {
            warn!(subscriber_id = %id, error = %e, "unreadable prefs, using defaults");
            NotificationPrefs::default()
        }
    };

    Ok(Subscriber {
        id,
        email,
        phone,
        telegram_chat_id,
        whatsapp_number,
        discord_webhook,
        webhook_url,
        push_topic,
        tier,
        active: active != 0,
        prefs,
    })
}
