//! Notification repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use uuid::Uuid;

use crate::database::models::NotificationDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::datetime_to_ms;
use crate::database::{DbPool, begin_immediate};
use crate::notification::{Notification, NotificationStatus, NotificationType, StatusGuard};
use crate::{Error, Result};

/// Outcome of an idempotent insert.
#[derive(Debug, Clone, PartialEq)]
pub enum Insertion {
    /// No live record existed for the key; this one was stored.
    Created(Notification),
    /// A live record already holds the key; it is returned unchanged.
    Existing(Notification),
}

impl Insertion {
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Filter for [`NotificationRepository::list_by_user`]. Newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationQuery {
    pub user_id: i64,
    #[serde(default)]
    pub status: Option<NotificationStatus>,
    #[serde(default)]
    pub notification_type: Option<NotificationType>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    50
}

impl NotificationQuery {
    pub fn for_user(user_id: i64) -> Self {
        Self {
            user_id,
            status: None,
            notification_type: None,
            limit: default_limit(),
            offset: 0,
        }
    }

    pub fn with_status(mut self, status: NotificationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, notification_type: NotificationType) -> Self {
        self.notification_type = Some(notification_type);
        self
    }

    pub fn page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

/// Filter for exhausted (FAILED at the retry cap) records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExhaustedFilter {
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub notification_type: Option<NotificationType>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

impl ExhaustedFilter {
    pub fn all() -> Self {
        Self {
            limit: default_limit(),
            ..Default::default()
        }
    }

    pub fn for_user(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::all()
        }
    }
}

/// Keyset position for scans ordered by `(updated_at, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCursor {
    pub updated_at: DateTime<Utc>,
    pub id: Uuid,
}

impl ScanCursor {
    pub fn after(notification: &Notification) -> Self {
        Self {
            updated_at: notification.updated_at,
            id: notification.id,
        }
    }
}

/// Durable store of notification records.
///
/// Every mutation is scoped to one record and conditional on the state the
/// writer observed.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Store `notification` unless a live record already exists for its
    /// `(event_id, channel)` key.
    async fn insert_unique(&self, notification: &Notification, max_retries: u32)
    -> Result<Insertion>;

    async fn get(&self, id: Uuid) -> Result<Notification>;

    /// Write `updated` only if the stored record still matches `expected`.
    /// Returns `false` when another writer got there first.
    async fn compare_and_swap(&self, expected: StatusGuard, updated: &Notification)
    -> Result<bool>;

    /// FAILED records under the cap with `updated_at <= updated_before`,
    /// ordered by `(updated_at, id)` and starting after `after`.
    async fn scan_failed(
        &self,
        max_retries: u32,
        updated_before: DateTime<Utc>,
        after: Option<ScanCursor>,
        limit: u32,
    ) -> Result<Vec<Notification>>;

    /// PENDING records with `updated_at <= updated_before`, in the same
    /// keyset order as [`scan_failed`](Self::scan_failed). These are attempts
    /// whose outcome was never written.
    async fn scan_stale_pending(
        &self,
        updated_before: DateTime<Utc>,
        after: Option<ScanCursor>,
        limit: u32,
    ) -> Result<Vec<Notification>>;

    async fn list_by_user(&self, query: &NotificationQuery) -> Result<Vec<Notification>>;

    /// SENT or DELIVERED records for the user.
    async fn count_unread(&self, user_id: i64) -> Result<u64>;

    async fn list_exhausted(
        &self,
        filter: &ExhaustedFilter,
        max_retries: u32,
    ) -> Result<Vec<Notification>>;

    /// Terminal records last updated before `cutoff`, oldest first.
    async fn list_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        max_retries: u32,
        limit: u32,
    ) -> Result<Vec<Notification>>;

    async fn count_by_status(&self) -> Result<Vec<(NotificationStatus, u64)>>;

    /// FAILED records that have used every attempt.
    async fn count_exhausted(&self, max_retries: u32) -> Result<u64>;
}

/// SQLx implementation of NotificationRepository.
pub struct SqlxNotificationRepository {
    pool: DbPool,
}

impl SqlxNotificationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn into_domain(rows: Vec<NotificationDbModel>) -> Result<Vec<Notification>> {
        rows.into_iter().map(Notification::try_from).collect()
    }

    /// `updated_at` bound, keyset position and `(updated_at, id)` order for scans.
    fn push_keyset(
        qb: &mut QueryBuilder<'_, Sqlite>,
        updated_before: DateTime<Utc>,
        after: Option<ScanCursor>,
        limit: u32,
    ) {
        qb.push(" AND updated_at <= ");
        qb.push_bind(datetime_to_ms(updated_before));
        if let Some(cursor) = after {
            let cursor_ms = datetime_to_ms(cursor.updated_at);
            qb.push(" AND (updated_at > ");
            qb.push_bind(cursor_ms);
            qb.push(" OR (updated_at = ");
            qb.push_bind(cursor_ms);
            qb.push(" AND id > ");
            qb.push_bind(cursor.id.to_string());
            qb.push("))");
        }
        qb.push(" ORDER BY updated_at ASC, id ASC LIMIT ");
        qb.push_bind(i64::from(limit));
    }

    async fn insert_unique_in(
        conn: &mut SqliteConnection,
        notification: &Notification,
        max_retries: u32,
    ) -> Result<Insertion> {
        let existing = sqlx::query_as::<_, NotificationDbModel>(
            "SELECT * FROM notification WHERE event_id = ? AND channel = ? ORDER BY created_at DESC",
        )
        .bind(&notification.event_id)
        .bind(&notification.channel)
        .fetch_all(&mut *conn)
        .await?;

        for row in existing {
            let record = Notification::try_from(row)?;
            if record.is_live(max_retries) {
                return Ok(Insertion::Existing(record));
            }
        }

        let row = NotificationDbModel::from(notification);
        sqlx::query(
            r#"
            INSERT INTO notification (
                id, event_id, service_origin, user_id, notification_type, channel,
                title, content, recipient_address, status, retry_count, last_error,
                read_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.event_id)
        .bind(&row.service_origin)
        .bind(row.user_id)
        .bind(&row.notification_type)
        .bind(&row.channel)
        .bind(&row.title)
        .bind(&row.content)
        .bind(&row.recipient_address)
        .bind(&row.status)
        .bind(row.retry_count)
        .bind(&row.last_error)
        .bind(row.read_at)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&mut *conn)
        .await?;

        Ok(Insertion::Created(notification.clone()))
    }

    fn push_terminal_clause(qb: &mut QueryBuilder<'_, Sqlite>, max_retries: u32) {
        qb.push("(status IN ('READ', 'CANCELLED') OR (status = 'FAILED' AND retry_count >= ");
        qb.push_bind(i64::from(max_retries));
        qb.push("))");
    }
}

#[async_trait]
impl NotificationRepository for SqlxNotificationRepository {
    async fn insert_unique(
        &self,
        notification: &Notification,
        max_retries: u32,
    ) -> Result<Insertion> {
        let mut tx = begin_immediate(&self.pool).await?;
        match Self::insert_unique_in(&mut tx, notification, max_retries).await {
            Ok(insertion) => {
                tx.commit().await?;
                Ok(insertion)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    async fn get(&self, id: Uuid) -> Result<Notification> {
        let row = sqlx::query_as::<_, NotificationDbModel>("SELECT * FROM notification WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Notification", id.to_string()))?;
        Notification::try_from(row)
    }

    async fn compare_and_swap(
        &self,
        expected: StatusGuard,
        updated: &Notification,
    ) -> Result<bool> {
        let row = NotificationDbModel::from(updated);
        retry_on_sqlite_busy("notification_cas", || async {
            let result = sqlx::query(
                r#"
                UPDATE notification SET
                    status = ?,
                    retry_count = ?,
                    last_error = ?,
                    read_at = ?,
                    updated_at = ?
                WHERE id = ? AND status = ? AND retry_count = ?
                "#,
            )
            .bind(&row.status)
            .bind(row.retry_count)
            .bind(&row.last_error)
            .bind(row.read_at)
            .bind(row.updated_at)
            .bind(&row.id)
            .bind(expected.status.as_str())
            .bind(i64::from(expected.retry_count))
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn scan_failed(
        &self,
        max_retries: u32,
        updated_before: DateTime<Utc>,
        after: Option<ScanCursor>,
        limit: u32,
    ) -> Result<Vec<Notification>> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT * FROM notification WHERE status = 'FAILED' AND retry_count < ",
        );
        qb.push_bind(i64::from(max_retries));
        Self::push_keyset(&mut qb, updated_before, after, limit);

        let rows = qb
            .build_query_as::<NotificationDbModel>()
            .fetch_all(&self.pool)
            .await?;
        Self::into_domain(rows)
    }

    async fn scan_stale_pending(
        &self,
        updated_before: DateTime<Utc>,
        after: Option<ScanCursor>,
        limit: u32,
    ) -> Result<Vec<Notification>> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT * FROM notification WHERE status = 'PENDING'");
        Self::push_keyset(&mut qb, updated_before, after, limit);

        let rows = qb
            .build_query_as::<NotificationDbModel>()
            .fetch_all(&self.pool)
            .await?;
        Self::into_domain(rows)
    }

    async fn list_by_user(&self, query: &NotificationQuery) -> Result<Vec<Notification>> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT * FROM notification WHERE user_id = ");
        qb.push_bind(query.user_id);
        if let Some(status) = query.status {
            qb.push(" AND status = ");
            qb.push_bind(status.as_str());
        }
        if let Some(ty) = query.notification_type {
            qb.push(" AND notification_type = ");
            qb.push_bind(ty.as_str());
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ");
        qb.push_bind(i64::from(query.limit));
        qb.push(" OFFSET ");
        qb.push_bind(i64::from(query.offset));

        let rows = qb
            .build_query_as::<NotificationDbModel>()
            .fetch_all(&self.pool)
            .await?;
        Self::into_domain(rows)
    }

    async fn count_unread(&self, user_id: i64) -> Result<u64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM notification WHERE user_id = ? AND status IN ('SENT', 'DELIVERED')",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0.max(0) as u64)
    }

    async fn list_exhausted(
        &self,
        filter: &ExhaustedFilter,
        max_retries: u32,
    ) -> Result<Vec<Notification>> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT * FROM notification WHERE status = 'FAILED' AND retry_count >= ",
        );
        qb.push_bind(i64::from(max_retries));
        if let Some(user_id) = filter.user_id {
            qb.push(" AND user_id = ");
            qb.push_bind(user_id);
        }
        if let Some(ty) = filter.notification_type {
            qb.push(" AND notification_type = ");
            qb.push_bind(ty.as_str());
        }
        qb.push(" ORDER BY updated_at DESC, id DESC LIMIT ");
        qb.push_bind(i64::from(filter.limit));

        let rows = qb
            .build_query_as::<NotificationDbModel>()
            .fetch_all(&self.pool)
            .await?;
        Self::into_domain(rows)
    }

    async fn list_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        max_retries: u32,
        limit: u32,
    ) -> Result<Vec<Notification>> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT * FROM notification WHERE updated_at < ");
        qb.push_bind(datetime_to_ms(cutoff));
        qb.push(" AND ");
        Self::push_terminal_clause(&mut qb, max_retries);
        qb.push(" ORDER BY updated_at ASC, id ASC LIMIT ");
        qb.push_bind(i64::from(limit));

        let rows = qb
            .build_query_as::<NotificationDbModel>()
            .fetch_all(&self.pool)
            .await?;
        Self::into_domain(rows)
    }

    async fn count_by_status(&self) -> Result<Vec<(NotificationStatus, u64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM notification GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = Vec::with_capacity(NotificationStatus::ALL.len());
        for status in NotificationStatus::ALL {
            let count = rows
                .iter()
                .find(|(s, _)| s == status.as_str())
                .map(|(_, c)| (*c).max(0) as u64)
                .unwrap_or(0);
            counts.push((status, count));
        }
        Ok(counts)
    }

    async fn count_exhausted(&self, max_retries: u32) -> Result<u64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM notification WHERE status = 'FAILED' AND retry_count >= ?",
        )
        .bind(i64::from(max_retries))
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0.max(0) as u64)
    }
}
