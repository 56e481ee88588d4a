//! Integration tests for the notifier.
//!
//! These tests use a real SQLite database (in-memory) to verify the store,
//! the engine and the retry scheduler against the actual schema.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};

use notifier::Error;
use notifier::config::EngineConfig;
use notifier::database::repositories::{
    ExhaustedFilter, Insertion, NotificationQuery, NotificationRepository, PreferenceStore,
    ScanCursor, SqlxNotificationRepository, SqlxPreferenceStore,
};
use notifier::database::{DbPool, init_pool_with_size, run_migrations};
use notifier::notification::channels::{ChannelProvider, EMAIL, PUSH, SMS};
use notifier::notification::{
    DispatchOutcome, InboundEvent, Notification, NotificationEngine, NotificationStatus,
    NotificationType, ProviderRegistry, UserNotificationSettings,
};

const MAX: u32 = 3;

/// Helper to create a test database pool with migrations applied.
async fn setup_test_db() -> DbPool {
    let pool = init_pool_with_size("sqlite::memory:", 1)
        .await
        .expect("Failed to create test pool");

    run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

fn event(event_id: &str, user_id: i64) -> InboundEvent {
    InboundEvent::new(NotificationType::TaskAssigned, user_id, "Task assigned", "Review PR")
        .with_event_id(event_id)
        .with_origin("task")
        .with_recipient(EMAIL, "dev@example.com")
}

fn record(event_id: &str, user_id: i64, channel: &str) -> Notification {
    Notification::from_event(&event(event_id, user_id), channel)
}

mod database_tests {
    use super::*;

    #[tokio::test]
    async fn test_database_migrations() {
        let pool = setup_test_db().await;

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .expect("Failed to query tables");
        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();

        assert!(table_names.contains(&"notification"), "notification table missing");
        assert!(
            table_names.contains(&"user_notification_settings"),
            "user_notification_settings table missing"
        );

        let indexes: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='index' AND tbl_name='notification'",
        )
        .fetch_all(&pool)
        .await
        .expect("Failed to query indexes");
        assert!(indexes.len() >= 5);
    }

    #[tokio::test]
    async fn test_status_check_constraint() {
        let pool = setup_test_db().await;
        let result = sqlx::query(
            r#"
            INSERT INTO notification (
                id, event_id, service_origin, user_id, notification_type, channel,
                title, content, recipient_address, status, retry_count, created_at, updated_at
            ) VALUES ('x', 'e', 'task', 1, 'REMINDER', 'EMAIL', 't', 'c', '', 'BOUNCED', 0, 0, 0)
            "#,
        )
        .execute(&pool)
        .await;
        assert!(result.is_err());
    }
}

mod file_database_tests {
    use super::*;
    use notifier::database::init_pool;

    #[tokio::test]
    async fn test_concurrent_duplicates_on_shared_file() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("notifier.db").display());
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let mode: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode.0, "wal");

        let repo = Arc::new(SqlxNotificationRepository::new(pool));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.insert_unique(&record("evt-race", 1, EMAIL), MAX).await
            }));
        }

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_created() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(
            repo.list_by_user(&NotificationQuery::for_user(1))
                .await
                .unwrap()
                .len(),
            1
        );
    }
}

mod notification_repository_tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_unique_blocks_live_duplicates() {
        let pool = setup_test_db().await;
        let repo = SqlxNotificationRepository::new(pool);

        let first = record("evt-1", 42, EMAIL);
        let created = repo.insert_unique(&first, MAX).await.unwrap();
        assert!(created.is_created());
        assert_eq!(repo.get(first.id).await.unwrap(), first);

        let second = record("evt-1", 42, EMAIL);
        match repo.insert_unique(&second, MAX).await.unwrap() {
            Insertion::Existing(existing) => assert_eq!(existing.id, first.id),
            Insertion::Created(_) => panic!("duplicate record created"),
        }

        let other_channel = record("evt-1", 42, PUSH);
        assert!(repo.insert_unique(&other_channel, MAX).await.unwrap().is_created());
    }

    #[tokio::test]
    async fn test_terminal_record_frees_idempotency_key() {
        let pool = setup_test_db().await;
        let repo = SqlxNotificationRepository::new(pool);

        let first = record("evt-2", 42, EMAIL);
        repo.insert_unique(&first, MAX).await.unwrap();
        let mut cancelled = first.clone();
        cancelled.cancel("superseded", MAX).unwrap();
        assert!(repo.compare_and_swap(first.guard(), &cancelled).await.unwrap());

        let again = record("evt-2", 42, EMAIL);
        match repo.insert_unique(&again, MAX).await.unwrap() {
            Insertion::Created(created) => assert_eq!(created.id, again.id),
            Insertion::Existing(existing) => panic!("key still held by {}", existing.id),
        }
    }

    #[tokio::test]
    async fn test_compare_and_swap_rejects_stale_writer() {
        let pool = setup_test_db().await;
        let repo = SqlxNotificationRepository::new(pool);

        let pending = record("evt-3", 7, EMAIL);
        repo.insert_unique(&pending, MAX).await.unwrap();

        let mut sent = pending.clone();
        sent.mark_sent(MAX).unwrap();
        let mut failed = pending.clone();
        failed.mark_failed("late", MAX).unwrap();

        assert!(repo.compare_and_swap(pending.guard(), &sent).await.unwrap());
        assert!(!repo.compare_and_swap(pending.guard(), &failed).await.unwrap());
        assert_eq!(repo.get(pending.id).await.unwrap(), sent);

        let err = repo.get(uuid::Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_scan_failed_pages_in_order() {
        let pool = setup_test_db().await;
        let repo = SqlxNotificationRepository::new(pool);
        let base = Utc::now() - TimeDelta::hours(1);

        for i in 0..5 {
            let mut n = record(&format!("evt-scan-{i}"), 1, PUSH);
            n.status = NotificationStatus::Failed;
            n.retry_count = 1;
            n.updated_at = base + TimeDelta::seconds(i);
            repo.insert_unique(&n, MAX).await.unwrap();
        }
        let mut exhausted = record("evt-scan-x", 1, PUSH);
        exhausted.status = NotificationStatus::Failed;
        exhausted.retry_count = MAX;
        exhausted.updated_at = base;
        repo.insert_unique(&exhausted, MAX).await.unwrap();

        let mut seen = Vec::new();
        let mut cursor: Option<ScanCursor> = None;
        loop {
            let page = repo.scan_failed(MAX, Utc::now(), cursor, 2).await.unwrap();
            let Some(last) = page.last() else { break };
            cursor = Some(ScanCursor::after(last));
            seen.extend(page.into_iter().map(|n| n.event_id));
        }
        assert_eq!(
            seen,
            (0..5).map(|i| format!("evt-scan-{i}")).collect::<Vec<_>>()
        );

        let early = repo
            .scan_failed(MAX, base + TimeDelta::seconds(1), None, 10)
            .await
            .unwrap();
        assert_eq!(early.len(), 2);
    }

    #[tokio::test]
    async fn test_scan_stale_pending() {
        let pool = setup_test_db().await;
        let repo = SqlxNotificationRepository::new(pool);
        let base = Utc::now() - TimeDelta::hours(1);

        for i in 0..3 {
            let mut n = record(&format!("evt-stuck-{i}"), 1, EMAIL);
            n.updated_at = base + TimeDelta::seconds(i);
            repo.insert_unique(&n, MAX).await.unwrap();
        }
        repo.insert_unique(&record("evt-fresh", 1, EMAIL), MAX)
            .await
            .unwrap();
        let mut failed = record("evt-failed", 1, EMAIL);
        failed.status = NotificationStatus::Failed;
        failed.retry_count = 1;
        failed.updated_at = base;
        repo.insert_unique(&failed, MAX).await.unwrap();

        let cutoff = Utc::now() - TimeDelta::minutes(1);
        let first = repo.scan_stale_pending(cutoff, None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let rest = repo
            .scan_stale_pending(cutoff, Some(ScanCursor::after(&first[1])), 2)
            .await
            .unwrap();
        let seen: Vec<_> = first.iter().chain(&rest).map(|n| n.event_id.clone()).collect();
        assert_eq!(
            seen,
            (0..3).map(|i| format!("evt-stuck-{i}")).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_queries() {
        let pool = setup_test_db().await;
        let repo = SqlxNotificationRepository::new(pool);

        let mut sent = record("evt-q1", 42, EMAIL);
        sent.status = NotificationStatus::Sent;
        sent.created_at -= TimeDelta::minutes(2);
        repo.insert_unique(&sent, MAX).await.unwrap();

        let mut delivered = record("evt-q2", 42, EMAIL);
        delivered.status = NotificationStatus::Delivered;
        delivered.created_at -= TimeDelta::minutes(1);
        repo.insert_unique(&delivered, MAX).await.unwrap();

        let mut exhausted = record("evt-q3", 42, PUSH);
        exhausted.notification_type = NotificationType::Reminder;
        exhausted.status = NotificationStatus::Failed;
        exhausted.retry_count = MAX;
        exhausted.updated_at -= TimeDelta::hours(2);
        repo.insert_unique(&exhausted, MAX).await.unwrap();

        repo.insert_unique(&record("evt-q4", 7, EMAIL), MAX)
            .await
            .unwrap();

        assert_eq!(repo.count_unread(42).await.unwrap(), 2);
        assert_eq!(repo.count_unread(7).await.unwrap(), 0);

        let newest_first = repo
            .list_by_user(&NotificationQuery::for_user(42))
            .await
            .unwrap();
        assert_eq!(
            newest_first
                .iter()
                .map(|n| n.event_id.as_str())
                .collect::<Vec<_>>(),
            vec!["evt-q3", "evt-q2", "evt-q1"]
        );

        let page = repo
            .list_by_user(&NotificationQuery::for_user(42).page(1, 1))
            .await
            .unwrap();
        assert_eq!(page[0].event_id, "evt-q2");

        let reminders = repo
            .list_by_user(&NotificationQuery::for_user(42).with_type(NotificationType::Reminder))
            .await
            .unwrap();
        assert_eq!(reminders.len(), 1);

        let failed = repo
            .list_exhausted(&ExhaustedFilter::for_user(42), MAX)
            .await
            .unwrap();
        assert_eq!(failed, vec![exhausted.clone()]);
        assert!(
            repo.list_exhausted(&ExhaustedFilter::for_user(7), MAX)
                .await
                .unwrap()
                .is_empty()
        );

        let old = repo
            .list_terminal_before(Utc::now() - TimeDelta::hours(1), MAX, 10)
            .await
            .unwrap();
        assert_eq!(old, vec![exhausted]);

        let counts = repo.count_by_status().await.unwrap();
        let count = |status: NotificationStatus| counts.iter().find(|(s, _)| *s == status).unwrap().1;
        assert_eq!(count(NotificationStatus::Pending), 1);
        assert_eq!(count(NotificationStatus::Sent), 1);
        assert_eq!(count(NotificationStatus::Failed), 1);
        assert_eq!(count(NotificationStatus::Read), 0);
        assert_eq!(repo.count_exhausted(MAX).await.unwrap(), 1);
    }
}

mod preference_store_tests {
    use super::*;

    #[tokio::test]
    async fn test_settings_round_trip() {
        let pool = setup_test_db().await;
        let store = SqlxPreferenceStore::new(pool);

        assert!(store.get_settings(42).await.unwrap().is_none());

        let settings = UserNotificationSettings::new(42)
            .with_channel("sms", false)
            .with_type(NotificationType::UserLogin, true);
        store.upsert_settings(&settings).await.unwrap();
        assert_eq!(store.get_settings(42).await.unwrap(), Some(settings));

        let updated = UserNotificationSettings::new(42).with_channel(EMAIL, false);
        store.upsert_settings(&updated).await.unwrap();
        let loaded = store.get_settings(42).await.unwrap().unwrap();
        assert!(!loaded.channel_enabled(EMAIL));
        assert!(loaded.channel_enabled(SMS));
    }

    #[tokio::test]
    async fn test_type_flags_accept_aliases() {
        let pool = setup_test_db().await;
        sqlx::query(
            "INSERT INTO user_notification_settings (user_id, channels, types, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(5_i64)
        .bind(r#"{"push": false}"#)
        .bind(r#"{"taskAssigned": false, "systemAlerts": true, "nonsense": false}"#)
        .bind(0_i64)
        .execute(&pool)
        .await
        .unwrap();

        let store = SqlxPreferenceStore::new(pool);
        let settings = store.get_settings(5).await.unwrap().unwrap();
        assert!(!settings.channel_enabled(PUSH));
        assert!(!settings.type_enabled(NotificationType::TaskAssigned));
        assert!(settings.type_enabled(NotificationType::SystemAlert));
        assert_eq!(settings.types.len(), 2);
    }
}

mod engine_tests {
    use super::*;

    /// Provider whose answer can be flipped at runtime.
    struct MockProvider {
        channel: &'static str,
        succeed: AtomicBool,
        enabled: AtomicBool,
        calls: AtomicU32,
    }

    impl MockProvider {
        fn new(channel: &'static str, succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                channel,
                succeed: AtomicBool::new(succeed),
                enabled: AtomicBool::new(true),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ChannelProvider for MockProvider {
        fn channel(&self) -> &str {
            self.channel
        }

        fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }

        fn set_enabled(&self, enabled: bool) {
            self.enabled.store(enabled, Ordering::SeqCst);
        }

        async fn send_notification(&self, _notification: &Notification) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.succeed.load(Ordering::SeqCst)
        }
    }

    struct Setup {
        engine: NotificationEngine,
        repo: Arc<SqlxNotificationRepository>,
        preferences: Arc<SqlxPreferenceStore>,
        email: Arc<MockProvider>,
        push: Arc<MockProvider>,
    }

    async fn setup() -> Setup {
        let pool = setup_test_db().await;
        let registry = Arc::new(ProviderRegistry::new());
        let email = MockProvider::new(EMAIL, true);
        let push = MockProvider::new(PUSH, false);
        registry.register(email.clone());
        registry.register(push.clone());

        let repo = Arc::new(SqlxNotificationRepository::new(pool.clone()));
        let preferences = Arc::new(SqlxPreferenceStore::new(pool));
        let engine = NotificationEngine::new(
            EngineConfig::default(),
            registry,
            repo.clone(),
            preferences.clone(),
        )
        .unwrap();

        Setup {
            engine,
            repo,
            preferences,
            email,
            push,
        }
    }

    fn task_assigned() -> InboundEvent {
        event("evt-assigned", 42).with_recipient(PUSH, "device-42")
    }

    /// A PENDING row whose attempt outcome was never written.
    async fn abandoned(s: &Setup, event_id: &str) -> Notification {
        let mut stuck = record(event_id, 42, EMAIL);
        stuck.updated_at = Utc::now() - TimeDelta::minutes(10);
        assert!(s.repo.insert_unique(&stuck, MAX).await.unwrap().is_created());
        stuck
    }

    #[tokio::test]
    async fn test_retry_pass_recovers_abandoned_pending() {
        let s = setup().await;
        let stuck = abandoned(&s, "evt-lost").await;

        let report = s.engine.run_retry_pass().await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(
            s.repo.get(stuck.id).await.unwrap().status,
            NotificationStatus::Sent
        );

        let results = s.engine.dispatch(&event("evt-lost", 42)).await.unwrap();
        assert_eq!(results[0].outcome, DispatchOutcome::Duplicate);
        assert_eq!(s.email.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_redelivery_resumes_abandoned_pending() {
        let s = setup().await;
        let stuck = abandoned(&s, "evt-lost").await;

        let results = s.engine.dispatch(&event("evt-lost", 42)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, DispatchOutcome::Sent);
        assert_eq!(results[0].notification.id, stuck.id);
        assert_eq!(s.email.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_manual_retry_of_pending() {
        let s = setup().await;
        let stuck = abandoned(&s, "evt-lost").await;
        let result = s.engine.retry(stuck.id).await.unwrap();
        assert_eq!(result.outcome, DispatchOutcome::Sent);

        let fresh = record("evt-busy", 42, EMAIL);
        s.repo.insert_unique(&fresh, MAX).await.unwrap();
        let err = s.engine.retry(fresh.id).await.unwrap_err();
        assert!(err.is_invalid_transition());
        assert_eq!(
            s.repo.get(fresh.id).await.unwrap().status,
            NotificationStatus::Pending
        );
        assert_eq!(s.email.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_task_assigned_email_sent_push_failed() {
        let s = setup().await;
        let results = s.engine.dispatch(&task_assigned()).await.unwrap();
        assert_eq!(results.len(), 2);

        let email = results
            .iter()
            .find(|r| r.notification.channel == EMAIL)
            .unwrap();
        assert_eq!(email.notification.status, NotificationStatus::Sent);

        let push = results
            .iter()
            .find(|r| r.notification.channel == PUSH)
            .unwrap();
        assert_eq!(push.notification.status, NotificationStatus::Failed);
        assert_eq!(push.notification.retry_count, 1);

        let stored = s.repo.get(push.notification.id).await.unwrap();
        assert_eq!(stored, push.notification);
    }

    #[tokio::test]
    async fn test_duplicate_dispatch_sends_once() {
        let s = setup().await;
        s.engine.dispatch(&task_assigned()).await.unwrap();
        let again = s.engine.dispatch(&task_assigned()).await.unwrap();

        assert!(again.iter().all(|r| r.outcome == DispatchOutcome::Duplicate));
        assert_eq!(s.email.calls.load(Ordering::SeqCst), 1);
        assert_eq!(s.push.calls.load(Ordering::SeqCst), 1);
        let stats = s.engine.stats().await.unwrap();
        assert_eq!(stats.total, 2);
    }

    #[tokio::test]
    async fn test_last_retry_leaves_terminal_failed() {
        let s = setup().await;
        let mut failing = record("evt-last", 42, PUSH);
        failing.status = NotificationStatus::Failed;
        failing.retry_count = MAX - 1;
        failing.updated_at = Utc::now() - TimeDelta::days(1);
        s.repo.insert_unique(&failing, MAX).await.unwrap();

        let report = s.engine.run_retry_pass().await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.exhausted, 1);

        let stored = s.repo.get(failing.id).await.unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        assert_eq!(stored.retry_count, MAX);

        let report = s.engine.run_retry_pass().await.unwrap();
        assert_eq!(report.scanned, 0);
        assert_eq!(s.push.calls.load(Ordering::SeqCst), 1);

        let exhausted = s
            .engine
            .list_exhausted(&ExhaustedFilter::all())
            .await
            .unwrap();
        assert_eq!(exhausted.len(), 1);
        assert_eq!(s.engine.stats().await.unwrap().exhausted, 1);
    }

    #[tokio::test]
    async fn test_backoff_window_respected() {
        let s = setup().await;
        let mut recent = record("evt-recent", 42, PUSH);
        recent.status = NotificationStatus::Failed;
        recent.retry_count = 1;
        recent.updated_at = Utc::now() - TimeDelta::seconds(30);
        s.repo.insert_unique(&recent, MAX).await.unwrap();

        let report = s.engine.run_retry_pass().await.unwrap();
        assert_eq!(report.retried, 0);
        assert_eq!(s.push.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsupported_sms_is_cancelled() {
        let s = setup().await;
        let event = InboundEvent::new(NotificationType::SystemAlert, 9, "Alert", "Disk full")
            .with_recipient("sms", "+15550100");

        let results = s.engine.dispatch(&event).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, DispatchOutcome::UnsupportedChannel);
        assert_eq!(results[0].notification.channel, SMS);
        assert_eq!(results[0].notification.status, NotificationStatus::Cancelled);
        assert_eq!(results[0].notification.service_origin, "system");

        let stored = s.repo.get(results[0].notification.id).await.unwrap();
        assert_eq!(stored.status, NotificationStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_pending_then_deliver_rejected() {
        let s = setup().await;
        let pending = record("evt-pending", 42, EMAIL);
        s.repo.insert_unique(&pending, MAX).await.unwrap();

        let cancelled = s.engine.cancel(pending.id, "task deleted").await.unwrap();
        assert_eq!(cancelled.status, NotificationStatus::Cancelled);

        let err = s.engine.mark_delivered(pending.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert_eq!(s.repo.get(pending.id).await.unwrap(), cancelled);
    }

    #[tokio::test]
    async fn test_preferences_filter_channels_and_types() {
        let s = setup().await;
        s.preferences
            .upsert_settings(&UserNotificationSettings::new(42).with_channel(PUSH, false))
            .await
            .unwrap();
        let results = s.engine.dispatch(&task_assigned()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].notification.channel, EMAIL);

        s.engine
            .update_preferences(
                &UserNotificationSettings::new(43)
                    .with_type(NotificationType::TaskAssigned, false),
            )
            .await
            .unwrap();
        let muted = s
            .engine
            .dispatch(&event("evt-muted", 43).with_recipient(PUSH, "device-43"))
            .await
            .unwrap();
        assert!(muted.is_empty());
        assert_eq!(s.push.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_provider_is_retryable() {
        let s = setup().await;
        s.engine.set_channel_enabled(EMAIL, false).unwrap();

        let results = s.engine.dispatch(&event("evt-off", 42)).await.unwrap();
        assert_eq!(results[0].outcome, DispatchOutcome::ProviderDisabled);
        assert_eq!(results[0].notification.status, NotificationStatus::Failed);
        assert_eq!(s.email.calls.load(Ordering::SeqCst), 0);

        s.engine.set_channel_enabled(EMAIL, true).unwrap();
        let retried = s.engine.retry(results[0].notification.id).await.unwrap();
        assert_eq!(retried.outcome, DispatchOutcome::Sent);
        assert_eq!(s.email.calls.load(Ordering::SeqCst), 1);
    }
}
