// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The embedded SQL store: WAL-mode SQLite holding `events`, `messages`,
//! `assets`, `message_assets`, and `user_sequences` (§3, §4.1 step 2).
//!
//! All mutations here are issued by the single-writer queue (`crate::writer`);
//! this module only owns the pool, schema, and query surface.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use crate::ids::{AssetId, EventId, UserId};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS user_sequences (
    user_id TEXT PRIMARY KEY,
    next_sequence INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    originating_device_id TEXT,
    event_type TEXT NOT NULL,
    streaming INTEGER NOT NULL,
    payload_json TEXT NOT NULL,
    payload_bytes INTEGER NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    UNIQUE (user_id, sequence)
);
CREATE INDEX IF NOT EXISTS idx_events_user_sequence ON events (user_id, sequence);

CREATE TABLE IF NOT EXISTS messages (
    device_id TEXT NOT NULL,
    client_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    server_event_id TEXT REFERENCES events(id),
    server_sequence INTEGER,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    attachments_hash TEXT NOT NULL,
    attachments_json TEXT NOT NULL,
    byte_size INTEGER NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    streaming INTEGER NOT NULL,
    ack_sent INTEGER NOT NULL,
    PRIMARY KEY (device_id, client_id)
);

CREATE TABLE IF NOT EXISTS assets (
    asset_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    uploader_device_id TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    size INTEGER NOT NULL,
    created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS message_assets (
    device_id TEXT NOT NULL,
    client_id TEXT NOT NULL,
    asset_id TEXT NOT NULL,
    FOREIGN KEY (device_id, client_id) REFERENCES messages(device_id, client_id) ON DELETE CASCADE,
    FOREIGN KEY (asset_id) REFERENCES assets(asset_id) ON DELETE RESTRICT,
    PRIMARY KEY (device_id, client_id, asset_id)
);
"#;

/// A row in `events`.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: EventId,
    pub user_id: UserId,
    pub sequence: i64,
    pub originating_device_id: Option<String>,
    pub event_type: String,
    pub streaming: i64,
    pub payload_json: String,
    pub payload_bytes: i64,
    pub timestamp_ms: i64,
}

/// A row in `assets`.
#[derive(Debug, Clone)]
pub struct AssetRow {
    pub asset_id: AssetId,
    pub user_id: UserId,
    pub uploader_device_id: String,
    pub mime_type: String,
    pub size: i64,
    pub created_at_ms: i64,
}

/// State of a `messages` row relevant to idempotent intake (§4.6 step 2).
#[derive(Debug, Clone)]
pub struct MessageLookup {
    pub content_hash: String,
    pub attachments_hash: String,
    pub streaming: i64,
    pub server_event_id: Option<String>,
}

pub struct SqlStore {
    pool: SqlitePool,
}

impl SqlStore {
    /// Open the pool, enable WAL and FK enforcement, and verify/initialize
    /// `schema_version` (§4.1 step 2).
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        let current: i64 = sqlx::query_scalar("PRAGMA user_version").fetch_one(&pool).await?;
        if current == 0 {
            sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}")).execute(&pool).await?;
        } else if current != SCHEMA_VERSION {
            anyhow::bail!("schema_version {current} is not the expected {SCHEMA_VERSION}");
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Allocate the next sequence for `user_id`, starting at 1 (§4.3).
    pub async fn allocate_sequence(
        &self,
        executor: &mut sqlx::SqliteConnection,
        user_id: &UserId,
    ) -> anyhow::Result<i64> {
        sqlx::query(
            "INSERT INTO user_sequences (user_id, next_sequence) VALUES (?1, 2)
             ON CONFLICT(user_id) DO UPDATE SET next_sequence = next_sequence + 1",
        )
        .bind(user_id.as_str())
        .execute(&mut *executor)
        .await?;
        let row = sqlx::query("SELECT next_sequence FROM user_sequences WHERE user_id = ?1")
            .bind(user_id.as_str())
            .fetch_one(&mut *executor)
            .await?;
        let next: i64 = row.try_get("next_sequence")?;
        Ok(next - 1)
    }

    pub async fn insert_event(
        &self,
        executor: &mut sqlx::SqliteConnection,
        row: &EventRow,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO events (id, user_id, sequence, originating_device_id, event_type, streaming, payload_json, payload_bytes, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(row.id.as_str())
        .bind(row.user_id.as_str())
        .bind(row.sequence)
        .bind(&row.originating_device_id)
        .bind(&row.event_type)
        .bind(row.streaming)
        .bind(&row.payload_json)
        .bind(row.payload_bytes)
        .bind(row.timestamp_ms)
        .execute(&mut *executor)
        .await?;
        Ok(())
    }

    pub async fn update_event_payload(
        &self,
        executor: &mut sqlx::SqliteConnection,
        id: &EventId,
        payload_json: &str,
        streaming: i64,
        timestamp_ms: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE events SET payload_json = ?1, streaming = ?2, timestamp_ms = ?3, payload_bytes = ?4 WHERE id = ?5",
        )
        .bind(payload_json)
        .bind(streaming)
        .bind(timestamp_ms)
        .bind(payload_json.len() as i64)
        .bind(id.as_str())
        .execute(&mut *executor)
        .await?;
        Ok(())
    }

    pub async fn insert_message(
        &self,
        executor: &mut sqlx::SqliteConnection,
        device_id: &str,
        client_id: &str,
        user_id: &UserId,
        server_event_id: &EventId,
        server_sequence: i64,
        content: &str,
        content_hash: &str,
        attachments_hash: &str,
        attachments_json: &str,
        byte_size: i64,
        timestamp_ms: i64,
        streaming: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO messages (device_id, client_id, user_id, server_event_id, server_sequence, content, content_hash, attachments_hash, attachments_json, byte_size, timestamp_ms, streaming, ack_sent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0)",
        )
        .bind(device_id)
        .bind(client_id)
        .bind(user_id.as_str())
        .bind(server_event_id.as_str())
        .bind(server_sequence)
        .bind(content)
        .bind(content_hash)
        .bind(attachments_hash)
        .bind(attachments_json)
        .bind(byte_size)
        .bind(timestamp_ms)
        .bind(streaming)
        .execute(&mut *executor)
        .await?;
        Ok(())
    }

    pub async fn insert_message_asset(
        &self,
        executor: &mut sqlx::SqliteConnection,
        device_id: &str,
        client_id: &str,
        asset_id: &AssetId,
    ) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO message_assets (device_id, client_id, asset_id) VALUES (?1, ?2, ?3)")
            .bind(device_id)
            .bind(client_id)
            .bind(asset_id.as_str())
            .execute(&mut *executor)
            .await?;
        Ok(())
    }

    pub async fn mark_ack_sent(
        &self,
        executor: &mut sqlx::SqliteConnection,
        device_id: &str,
        client_id: &str,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE messages SET ack_sent = 1 WHERE device_id = ?1 AND client_id = ?2")
            .bind(device_id)
            .bind(client_id)
            .execute(&mut *executor)
            .await?;
        Ok(())
    }

    pub async fn update_message_streaming(
        &self,
        executor: &mut sqlx::SqliteConnection,
        device_id: &str,
        client_id: &str,
        streaming: i64,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE messages SET streaming = ?1 WHERE device_id = ?2 AND client_id = ?3")
            .bind(streaming)
            .bind(device_id)
            .bind(client_id)
            .execute(&mut *executor)
            .await?;
        Ok(())
    }

    /// Look up an existing `(deviceId, clientId)` message for idempotency (§4.6 step 2).
    pub async fn lookup_message(&self, device_id: &str, client_id: &str) -> anyhow::Result<Option<MessageLookup>> {
        let row = sqlx::query(
            "SELECT content_hash, attachments_hash, streaming, server_event_id FROM messages WHERE device_id = ?1 AND client_id = ?2",
        )
        .bind(device_id)
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| MessageLookup {
            content_hash: r.get("content_hash"),
            attachments_hash: r.get("attachments_hash"),
            streaming: r.get("streaming"),
            server_event_id: r.get("server_event_id"),
        }))
    }

    pub async fn asset_exists_for_user(&self, asset_id: &AssetId, user_id: &UserId) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT 1 FROM assets WHERE asset_id = ?1 AND user_id = ?2")
            .bind(asset_id.as_str())
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn insert_asset(
        &self,
        executor: &mut sqlx::SqliteConnection,
        row: &AssetRow,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO assets (asset_id, user_id, uploader_device_id, mime_type, size, created_at_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(row.asset_id.as_str())
        .bind(row.user_id.as_str())
        .bind(&row.uploader_device_id)
        .bind(&row.mime_type)
        .bind(row.size)
        .bind(row.created_at_ms)
        .execute(&mut *executor)
        .await?;
        Ok(())
    }

    pub async fn fetch_asset(&self, asset_id: &AssetId) -> anyhow::Result<Option<AssetRow>> {
        let row = sqlx::query(
            "SELECT asset_id, user_id, uploader_device_id, mime_type, size, created_at_ms FROM assets WHERE asset_id = ?1",
        )
        .bind(asset_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(AssetRow {
                asset_id: r.get::<String, _>("asset_id").parse()?,
                user_id: r.get::<String, _>("user_id").parse()?,
                uploader_device_id: r.get("uploader_device_id"),
                mime_type: r.get("mime_type"),
                size: r.get("size"),
                created_at_ms: r.get("created_at_ms"),
            })
        })
        .transpose()
    }

    pub async fn delete_asset_row(&self, asset_id: &AssetId) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM assets WHERE asset_id = ?1").bind(asset_id.as_str()).execute(&self.pool).await?;
        Ok(())
    }

    /// Delete `assets` rows older than `cutoff_ms` with no referencing `message_assets` row (§4.9).
    pub async fn sweep_unreferenced_assets(&self, cutoff_ms: i64) -> anyhow::Result<Vec<AssetId>> {
        let rows = sqlx::query(
            "SELECT asset_id FROM assets
             WHERE created_at_ms < ?1
               AND NOT EXISTS (SELECT 1 FROM message_assets WHERE asset_id = assets.asset_id)",
        )
        .bind(cutoff_ms)
        .fetch_all(&self.pool)
        .await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let raw: String = row.get("asset_id");
            ids.push(raw.parse().map_err(|_| anyhow::anyhow!("corrupt asset_id in row"))?);
        }
        sqlx::query(
            "DELETE FROM assets
             WHERE created_at_ms < ?1
               AND NOT EXISTS (SELECT 1 FROM message_assets WHERE asset_id = assets.asset_id)",
        )
        .bind(cutoff_ms)
        .execute(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Fetch the most recent `limit` events for `user_id`, oldest-to-newest,
    /// excluding partial (`streaming=1`) rows (§4.8).
    pub async fn fetch_last_events(&self, user_id: &UserId, limit: i64) -> anyhow::Result<(Vec<EventRow>, i64)> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM events WHERE user_id = ?1 AND streaming != 1",
        )
        .bind(user_id.as_str())
        .fetch_one(&self.pool)
        .await?;
        let rows = sqlx::query(
            "SELECT id, user_id, sequence, originating_device_id, event_type, streaming, payload_json, payload_bytes, timestamp_ms
             FROM events WHERE user_id = ?1 AND streaming != 1 ORDER BY sequence DESC LIMIT ?2",
        )
        .bind(user_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        let mut events = rows_to_events(rows)?;
        events.reverse();
        Ok((events, total))
    }

    /// Fetch events after `anchor_sequence`, oldest-to-newest, excluding partials (§4.8).
    pub async fn fetch_events_since(
        &self,
        user_id: &UserId,
        anchor_sequence: i64,
        cap: i64,
    ) -> anyhow::Result<(Vec<EventRow>, bool)> {
        let rows = sqlx::query(
            "SELECT id, user_id, sequence, originating_device_id, event_type, streaming, payload_json, payload_bytes, timestamp_ms
             FROM events WHERE user_id = ?1 AND sequence > ?2 AND streaming != 1 ORDER BY sequence ASC",
        )
        .bind(user_id.as_str())
        .bind(anchor_sequence)
        .fetch_all(&self.pool)
        .await?;
        let mut events = rows_to_events(rows)?;
        let truncated = events.len() as i64 > cap;
        if truncated {
            let drop_count = events.len() - cap as usize;
            events.drain(0..drop_count);
        }
        Ok((events, truncated))
    }

    pub async fn find_event_sequence(&self, user_id: &UserId, event_id: &EventId) -> anyhow::Result<Option<i64>> {
        let row = sqlx::query("SELECT sequence FROM events WHERE user_id = ?1 AND id = ?2")
            .bind(user_id.as_str())
            .bind(event_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("sequence")))
    }

    /// Startup recovery (§4.1 step 5): finalize stale in-flight streams and
    /// drop orphaned message rows with no paired event.
    pub async fn recover_stale_streams(&self, stream_inactivity_cutoff_ms: i64) -> anyhow::Result<(u64, u64)> {
        let mut tx = self.pool.begin().await?;
        let messages = sqlx::query(
            "UPDATE messages SET streaming = 2 WHERE streaming = 1 AND timestamp_ms < ?1",
        )
        .bind(stream_inactivity_cutoff_ms)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let events = sqlx::query(
            "UPDATE events SET streaming = 2 WHERE streaming = 1 AND timestamp_ms < ?1",
        )
        .bind(stream_inactivity_cutoff_ms)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        sqlx::query("DELETE FROM message_assets WHERE (device_id, client_id) IN (SELECT device_id, client_id FROM messages WHERE server_event_id IS NULL)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM messages WHERE server_event_id IS NULL").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok((messages, events))
    }
}

fn rows_to_events(rows: Vec<sqlx::sqlite::SqliteRow>) -> anyhow::Result<Vec<EventRow>> {
    rows.into_iter()
        .map(|r| {
            Ok(EventRow {
                id: r.get::<String, _>("id").parse()?,
                user_id: r.get::<String, _>("user_id").parse()?,
                sequence: r.get("sequence"),
                originating_device_id: r.get("originating_device_id"),
                event_type: r.get("event_type"),
                streaming: r.get("streaming"),
                payload_json: r.get("payload_json"),
                payload_bytes: r.get("payload_bytes"),
                timestamp_ms: r.get("timestamp_ms"),
            })
        })
        .collect()
}
