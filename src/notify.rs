//! Notification service: persistence, immediate and scheduled delivery, and
//! read-state operations.
//!
//! Delivery is claim-based: `sent_at` is stamped by an UPDATE guarded on
//! `sent_at IS NULL`, so an immediate send racing a flush, or two overlapping
//! flushes, can never dispatch the same record twice.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{error, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::directory;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::models::{
    Channel, Metadata, NewNotification, Notification, NotificationKind, Priority,
};

/// Default and maximum page size for per-user listings.
const LIST_DEFAULT_LIMIT: usize = 20;
const LIST_MAX_LIMIT: usize = 100;

fn notification_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Notification> {
    let channels: Vec<Channel> = serde_json::from_str(row.get("channels"))?;
    let metadata: Metadata = serde_json::from_str(row.get("metadata"))?;
    Ok(Notification {
        id: row.get("id"),
        recipient_id: row.get("recipient_id"),
        kind: NotificationKind::from_str(row.get("kind"))?,
        title: row.get("title"),
        message: row.get("message"),
        priority: Priority::from_str(row.get("priority"))?,
        channels,
        read: row.get("read"),
        read_at: row.get("read_at"),
        metadata,
        scheduled_for: row.get("scheduled_for"),
        sent_at: row.get("sent_at"),
        created_at: row.get("created_at"),
    })
}

const SELECT_COLUMNS: &str = "id, recipient_id, kind, title, message, priority, channels, \
     read, read_at, metadata, scheduled_for, sent_at, created_at";

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub kind: Option<NotificationKind>,
    pub unread_only: bool,
    pub limit: Option<usize>,
}

#[derive(Clone)]
pub struct Notifier {
    pool: DbPool,
    dispatcher: Arc<Dispatcher>,
}

impl Notifier {
    pub fn new(pool: DbPool, dispatcher: Arc<Dispatcher>) -> Self {
        Self { pool, dispatcher }
    }

    /// Persist a notification and, unless it is scheduled for later, dispatch
    /// it immediately.
    pub async fn send(&self, recipient_id: Uuid, new: NewNotification) -> Result<Notification> {
        // Resolve the recipient up front so a bad id is a NotFound, not a
        // foreign key violation.
        directory::user_by_id(&self.pool, recipient_id).await?;

        let id = Uuid::new_v4();
        let channels_json = serde_json::to_string(&new.channels)?;
        let metadata_json = serde_json::to_string(&new.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO notifications
                (id, recipient_id, kind, title, message, priority, channels,
                 read, read_at, metadata, scheduled_for, sent_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, NULL, ?, ?, NULL, ?)
            "#,
        )
        .bind(id)
        .bind(recipient_id)
        .bind(new.kind.as_str())
        .bind(&new.title)
        .bind(&new.message)
        .bind(new.priority.as_str())
        .bind(&channels_json)
        .bind(&metadata_json)
        .bind(new.scheduled_for)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if new.scheduled_for.is_none() {
            self.claim_and_dispatch(id).await?;
        }

        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM notifications WHERE id = ?"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        notification_from_row(&row)
    }

    /// Sequential fan-out over `send`. A failing recipient is logged and
    /// skipped; the rest of the batch still goes out.
    pub async fn send_bulk(
        &self,
        recipient_ids: &[Uuid],
        new: NewNotification,
    ) -> Result<Vec<Notification>> {
        let mut sent = Vec::with_capacity(recipient_ids.len());
        for &recipient_id in recipient_ids {
            match self.send(recipient_id, new.clone()).await {
                Ok(notification) => sent.push(notification),
                Err(e) if e.is_client_error() => {
                    warn!(recipient = %recipient_id, error = %e, "bulk send skipped recipient");
                }
                Err(e) => {
                    error!(recipient = %recipient_id, error = %e, "bulk send failed for recipient, skipping");
                }
            }
        }
        Ok(sent)
    }

    /// `send` with a future delivery time; the record sits unsent until the
    /// flush job picks it up.
    pub async fn schedule(
        &self,
        recipient_id: Uuid,
        when: DateTime<Utc>,
        new: NewNotification,
    ) -> Result<Notification> {
        self.send(recipient_id, new.scheduled_for(when)).await
    }

    /// Deliver every notification whose scheduled time has arrived.
    ///
    /// The stamp is a single UPDATE over all due rows, so concurrent flushes
    /// partition the due set instead of both delivering it.
    pub async fn flush_due(&self) -> Result<usize> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE notifications SET sent_at = ?
            WHERE sent_at IS NULL
              AND scheduled_for IS NOT NULL
              AND scheduled_for <= ?
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(Utc::now())
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;

        let mut processed = 0usize;
        for row in rows {
            let notification = notification_from_row(&row)?;
            self.dispatcher.deliver(&notification).await;
            processed += 1;
        }
        Ok(processed)
    }

    /// Atomically claim the record for delivery; a no-op when another caller
    /// already stamped it.
    async fn claim_and_dispatch(&self, id: Uuid) -> Result<()> {
        let rows = sqlx::query(&format!(
            "UPDATE notifications SET sent_at = ? WHERE id = ? AND sent_at IS NULL \
             RETURNING {SELECT_COLUMNS}"
        ))
        .bind(Utc::now())
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        if let Some(row) = rows.first() {
            let notification = notification_from_row(row)?;
            self.dispatcher.deliver(&notification).await;
        }
        Ok(())
    }

    pub async fn unread_count(&self, user_id: Uuid) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM notifications WHERE recipient_id = ? AND read = 0",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    /// Mark one notification read. Returns `None` for an unknown id or a
    /// scheduled record that has not been delivered yet. The first read
    /// wins: `read_at` is never overwritten.
    pub async fn mark_read(&self, id: Uuid) -> Result<Option<Notification>> {
        let rows = sqlx::query(&format!(
            "UPDATE notifications SET read = 1, read_at = COALESCE(read_at, ?) \
             WHERE id = ? AND sent_at IS NOT NULL RETURNING {SELECT_COLUMNS}"
        ))
        .bind(Utc::now())
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.first().map(notification_from_row).transpose()
    }

    pub async fn mark_all_read(&self, user_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE notifications SET read = 1, read_at = COALESCE(read_at, ?) \
             WHERE recipient_id = ? AND read = 0",
        )
        .bind(Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Newest-first listing for one user, optionally filtered, capped at
    /// `LIST_MAX_LIMIT` rows.
    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        filter: &ListFilter,
    ) -> Result<Vec<Notification>> {
        let limit = filter
            .limit
            .unwrap_or(LIST_DEFAULT_LIMIT)
            .min(LIST_MAX_LIMIT);

        let mut query = format!(
            "SELECT {SELECT_COLUMNS} FROM notifications WHERE recipient_id = ?"
        );
        if filter.kind.is_some() {
            query.push_str(" AND kind = ?");
        }
        if filter.unread_only {
            query.push_str(" AND read = 0");
        }
        query.push_str(" ORDER BY created_at DESC LIMIT ?");

        let mut rows = sqlx::query(&query).bind(user_id);
        if let Some(kind) = filter.kind {
            rows = rows.bind(kind.as_str());
        }
        rows = rows.bind(limit as i64);

        let records = rows.fetch_all(&self.pool).await?;
        records.iter().map(notification_from_row).collect()
    }

    /// Delete a notification, but only when it belongs to the caller.
    pub async fn delete_own(&self, user_id: Uuid, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = ? AND recipient_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
