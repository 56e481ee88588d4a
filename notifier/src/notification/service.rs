//! Notification engine.
//!
//! Wires the registry, preference filter, store, dispatcher, retry scheduler
//! and event bus together, runs the dispatch workers and exposes the
//! administrative hooks and queries.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bus::{EventBus, EventReceiver};
use super::dispatcher::{DispatchResult, Dispatcher};
use super::events::InboundEvent;
use super::model::Notification;
use super::preferences::{PreferenceFilter, UserNotificationSettings};
use super::registry::ProviderRegistry;
use super::scheduler::{RetryScheduler, ScanReport};
use crate::config::EngineConfig;
use crate::database::repositories::{
    ExhaustedFilter, NotificationQuery, NotificationRepository, PreferenceStore,
};
use crate::{Error, Result};

/// Attempts at an administrative transition before giving up on a record
/// that keeps changing underneath.
const MAX_CAS_ATTEMPTS: usize = 5;

/// Registered channel and its kill-switch state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelState {
    pub channel: String,
    pub enabled: bool,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationStats {
    pub total: u64,
    /// Record count per status name.
    pub by_status: BTreeMap<String, u64>,
    /// FAILED records with no attempts left.
    pub exhausted: u64,
    pub channels: Vec<ChannelState>,
    /// Events waiting on the inbound queue.
    pub queued_events: usize,
}

pub struct NotificationEngine {
    config: EngineConfig,
    registry: Arc<ProviderRegistry>,
    repository: Arc<dyn NotificationRepository>,
    preferences: Arc<dyn PreferenceStore>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<RetryScheduler>,
    bus: EventBus,
    cancellation_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NotificationEngine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<ProviderRegistry>,
        repository: Arc<dyn NotificationRepository>,
        preferences: Arc<dyn PreferenceStore>,
    ) -> Result<Self> {
        config.validate()?;

        let filter = Arc::new(PreferenceFilter::new(preferences.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            filter,
            repository.clone(),
            config.max_retries(),
            config.send_timeout(),
        ));
        let scheduler = Arc::new(RetryScheduler::new(
            dispatcher.clone(),
            repository.clone(),
            config.retry_policy.clone(),
            config.scan_interval(),
            config.scan_page_size,
            config.worker_count,
        ));
        let bus = EventBus::new(config.queue_capacity);

        Ok(Self {
            config,
            registry,
            repository,
            preferences,
            dispatcher,
            scheduler,
            bus,
            cancellation_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Spawn the dispatch workers and the retry scheduler.
    pub fn start(&self) -> Result<()> {
        if self.cancellation_token.is_cancelled() {
            return Err(Error::Other("Notification engine already stopped".to_string()));
        }

        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("Notification engine already running");
            return Ok(());
        }

        for worker_id in 0..self.config.worker_count {
            tasks.push(self.spawn_worker(worker_id));
        }
        if self.config.enabled {
            tasks.push(
                self.scheduler
                    .clone()
                    .spawn(self.cancellation_token.child_token()),
            );
        }

        info!(
            workers = self.config.worker_count,
            channels = ?self.registry.channels(),
            enabled = self.config.enabled,
            "Notification engine started"
        );
        Ok(())
    }

    fn spawn_worker(&self, worker_id: usize) -> JoinHandle<()> {
        let receiver: EventReceiver = self.bus.receiver();
        let dispatcher = self.dispatcher.clone();
        let token = self.cancellation_token.clone();
        let enabled = self.config.enabled;

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break,
                    event = async { receiver.lock().await.recv().await } => event,
                };
                let Some(event) = next else {
                    break;
                };

                if !enabled {
                    debug!(worker_id, event_id = %event.event_id, "Engine disabled, event dropped");
                    continue;
                }

                match dispatcher.dispatch(&event).await {
                    Ok(results) => debug!(
                        worker_id,
                        event_id = %event.event_id,
                        records = results.len(),
                        "Event dispatched"
                    ),
                    Err(e) => warn!(
                        worker_id,
                        event_id = %event.event_id,
                        "Failed to dispatch event: {}", e
                    ),
                }
            }
            debug!(worker_id, "Dispatch worker stopped");
        })
    }

    /// Cancel the workers and scheduler and wait for them to finish.
    ///
    /// Events still queued are not dispatched.
    pub async fn stop(&self) {
        info!("Stopping notification engine");
        self.cancellation_token.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Notification task ended abnormally: {}", e);
            }
        }

        let dropped = self.bus.len();
        if dropped > 0 {
            warn!(dropped, "Queued events discarded at shutdown");
        }
        info!("Notification engine stopped");
    }

    /// Queue an event for the workers.
    pub async fn publish(&self, topic: &str, event: InboundEvent) -> Result<()> {
        self.bus.publish(topic, event).await
    }

    /// Dispatch an event on the caller's task, bypassing the queue.
    pub async fn dispatch(&self, event: &InboundEvent) -> Result<Vec<DispatchResult>> {
        if !self.config.enabled {
            debug!(event_id = %event.event_id, "Engine disabled, event not dispatched");
            return Ok(Vec::new());
        }
        self.dispatcher.dispatch(event).await
    }

    /// Retry one FAILED record now, ignoring its backoff window. Also
    /// re-attempts a PENDING record whose previous outcome was lost.
    pub async fn retry(&self, id: Uuid) -> Result<DispatchResult> {
        let record = self.repository.get(id).await?;
        self.dispatcher.retry(record).await
    }

    /// Run one retry scan immediately.
    pub async fn run_retry_pass(&self) -> Result<ScanReport> {
        self.scheduler.run_once().await
    }

    /// Delivery receipt: SENT -> DELIVERED.
    pub async fn mark_delivered(&self, id: Uuid) -> Result<Notification> {
        self.transition(id, "deliver", |n, max| n.mark_delivered(max))
            .await
    }

    /// Read receipt: DELIVERED -> READ.
    pub async fn mark_read(&self, id: Uuid) -> Result<Notification> {
        self.transition(id, "read", |n, max| n.mark_read(max)).await
    }

    /// Cancel a live record. Terminal records are rejected unchanged.
    pub async fn cancel(&self, id: Uuid, reason: &str) -> Result<Notification> {
        self.transition(id, "cancel", |n, max| n.cancel(reason, max))
            .await
    }

    async fn transition<F>(&self, id: Uuid, action: &str, apply: F) -> Result<Notification>
    where
        F: Fn(&mut Notification, u32) -> Result<()>,
    {
        let max_retries = self.config.max_retries();
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.repository.get(id).await?;
            let guard = current.guard();
            let mut updated = current;
            apply(&mut updated, max_retries)?;

            if self.repository.compare_and_swap(guard, &updated).await? {
                info!(
                    notification_id = %id,
                    action,
                    status = %updated.status,
                    "Notification updated"
                );
                return Ok(updated);
            }
            debug!(notification_id = %id, action, "Record changed concurrently, re-reading");
        }
        Err(Error::Other(format!(
            "Notification {id} kept changing, {action} abandoned after {MAX_CAS_ATTEMPTS} attempts"
        )))
    }

    /// Flip a provider's kill-switch.
    pub fn set_channel_enabled(&self, channel: &str, enabled: bool) -> Result<()> {
        self.registry.set_enabled(channel, enabled)
    }

    pub async fn get(&self, id: Uuid) -> Result<Notification> {
        self.repository.get(id).await
    }

    pub async fn list_by_user(&self, query: &NotificationQuery) -> Result<Vec<Notification>> {
        self.repository.list_by_user(query).await
    }

    pub async fn count_unread(&self, user_id: i64) -> Result<u64> {
        self.repository.count_unread(user_id).await
    }

    pub async fn list_exhausted(&self, filter: &ExhaustedFilter) -> Result<Vec<Notification>> {
        self.repository
            .list_exhausted(filter, self.config.max_retries())
            .await
    }

    pub async fn list_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Notification>> {
        self.repository
            .list_terminal_before(cutoff, self.config.max_retries(), limit)
            .await
    }

    pub async fn preferences(&self, user_id: i64) -> Result<Option<UserNotificationSettings>> {
        self.preferences.get_settings(user_id).await
    }

    pub async fn update_preferences(&self, settings: &UserNotificationSettings) -> Result<()> {
        self.preferences.upsert_settings(settings).await
    }

    pub async fn stats(&self) -> Result<NotificationStats> {
        let counts = self.repository.count_by_status().await?;
        let exhausted = self
            .repository
            .count_exhausted(self.config.max_retries())
            .await?;

        let channels = self
            .registry
            .channels()
            .into_iter()
            .filter_map(|channel| {
                let enabled = self.registry.resolve(&channel).ok()?.is_enabled();
                Some(ChannelState { channel, enabled })
            })
            .collect();

        Ok(NotificationStats {
            total: counts.iter().map(|(_, c)| c).sum(),
            by_status: counts
                .into_iter()
                .map(|(status, count)| (status.as_str().to_string(), count))
                .collect(),
            exhausted,
            channels,
            queued_events: self.bus.len(),
        })
    }
}
