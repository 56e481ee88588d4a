//! In-memory stores.
//!
//! Used by tests and by embedders that do not need durability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::notification::{
    ExhaustedFilter, Insertion, NotificationQuery, NotificationRepository, ScanCursor,
};
use super::preferences::PreferenceStore;
use crate::notification::{
    Notification, NotificationStatus, StatusGuard, UserNotificationSettings,
};
use crate::{Error, Result};

/// DashMap-backed notification store.
#[derive(Debug, Default)]
pub struct InMemoryNotificationRepository {
    records: DashMap<Uuid, Notification>,
    /// `(event_id, channel)` -> ids, newest last.
    keys: DashMap<(String, String), Vec<Uuid>>,
}

impl InMemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Overwrite a record unconditionally. Test fixtures use this to age records.
    pub fn put(&self, notification: Notification) {
        {
            let mut ids = self
                .keys
                .entry((notification.event_id.clone(), notification.channel.clone()))
                .or_default();
            ids.retain(|id| *id != notification.id);
            ids.push(notification.id);
        }
        self.records.insert(notification.id, notification);
    }

    fn collect<F>(&self, predicate: F) -> Vec<Notification>
    where
        F: Fn(&Notification) -> bool,
    {
        self.records
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[async_trait]
impl NotificationRepository for InMemoryNotificationRepository {
    async fn insert_unique(
        &self,
        notification: &Notification,
        max_retries: u32,
    ) -> Result<Insertion> {
        // The key entry stays locked until the new id is recorded.
        let mut ids = self
            .keys
            .entry((notification.event_id.clone(), notification.channel.clone()))
            .or_default();

        for id in ids.iter().rev() {
            if let Some(existing) = self.records.get(id)
                && existing.is_live(max_retries)
            {
                return Ok(Insertion::Existing(existing.clone()));
            }
        }

        self.records.insert(notification.id, notification.clone());
        ids.push(notification.id);
        Ok(Insertion::Created(notification.clone()))
    }

    async fn get(&self, id: Uuid) -> Result<Notification> {
        self.records
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found("Notification", id.to_string()))
    }

    async fn compare_and_swap(
        &self,
        expected: StatusGuard,
        updated: &Notification,
    ) -> Result<bool> {
        let Some(mut current) = self.records.get_mut(&updated.id) else {
            return Err(Error::not_found("Notification", updated.id.to_string()));
        };
        if current.guard() != expected {
            return Ok(false);
        }
        current.status = updated.status;
        current.retry_count = updated.retry_count;
        current.last_error = updated.last_error.clone();
        current.read_at = updated.read_at;
        current.updated_at = updated.updated_at;
        Ok(true)
    }

    async fn scan_failed(
        &self,
        max_retries: u32,
        updated_before: DateTime<Utc>,
        after: Option<ScanCursor>,
        limit: u32,
    ) -> Result<Vec<Notification>> {
        let mut rows = self.collect(|n| {
            n.status == NotificationStatus::Failed
                && n.retry_count < max_retries
                && n.updated_at <= updated_before
                && after.is_none_or(|c| (n.updated_at, n.id) > (c.updated_at, c.id))
        });
        rows.sort_by_key(|n| (n.updated_at, n.id));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn scan_stale_pending(
        &self,
        updated_before: DateTime<Utc>,
        after: Option<ScanCursor>,
        limit: u32,
    ) -> Result<Vec<Notification>> {
        let mut rows = self.collect(|n| {
            n.status == NotificationStatus::Pending
                && n.updated_at <= updated_before
                && after.is_none_or(|c| (n.updated_at, n.id) > (c.updated_at, c.id))
        });
        rows.sort_by_key(|n| (n.updated_at, n.id));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn list_by_user(&self, query: &NotificationQuery) -> Result<Vec<Notification>> {
        let mut rows = self.collect(|n| {
            n.user_id == query.user_id
                && query.status.is_none_or(|s| n.status == s)
                && query.notification_type.is_none_or(|t| n.notification_type == t)
        });
        rows.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(rows
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .collect())
    }

    async fn count_unread(&self, user_id: i64) -> Result<u64> {
        Ok(self
            .records
            .iter()
            .filter(|e| e.user_id == user_id && e.status.is_unread())
            .count() as u64)
    }

    async fn list_exhausted(
        &self,
        filter: &ExhaustedFilter,
        max_retries: u32,
    ) -> Result<Vec<Notification>> {
        let mut rows = self.collect(|n| {
            n.is_exhausted(max_retries)
                && filter.user_id.is_none_or(|u| n.user_id == u)
                && filter.notification_type.is_none_or(|t| n.notification_type == t)
        });
        rows.sort_by(|a, b| (b.updated_at, b.id).cmp(&(a.updated_at, a.id)));
        rows.truncate(filter.limit as usize);
        Ok(rows)
    }

    async fn list_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        max_retries: u32,
        limit: u32,
    ) -> Result<Vec<Notification>> {
        let mut rows = self.collect(|n| n.updated_at < cutoff && n.is_terminal(max_retries));
        rows.sort_by_key(|n| (n.updated_at, n.id));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn count_by_status(&self) -> Result<Vec<(NotificationStatus, u64)>> {
        let mut counts: Vec<(NotificationStatus, u64)> =
            NotificationStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for entry in self.records.iter() {
            if let Some((_, count)) = counts.iter_mut().find(|(s, _)| *s == entry.status) {
                *count += 1;
            }
        }
        Ok(counts)
    }

    async fn count_exhausted(&self, max_retries: u32) -> Result<u64> {
        Ok(self
            .records
            .iter()
            .filter(|e| e.is_exhausted(max_retries))
            .count() as u64)
    }
}

/// DashMap-backed settings store.
#[derive(Debug, Default)]
pub struct InMemoryPreferenceStore {
    settings: DashMap<i64, UserNotificationSettings>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferenceStore for InMemoryPreferenceStore {
    async fn get_settings(&self, user_id: i64) -> Result<Option<UserNotificationSettings>> {
        Ok(self.settings.get(&user_id).map(|s| s.value().clone()))
    }

    async fn upsert_settings(&self, settings: &UserNotificationSettings) -> Result<()> {
        self.settings.insert(settings.user_id, settings.clone());
        Ok(())
    }
}
