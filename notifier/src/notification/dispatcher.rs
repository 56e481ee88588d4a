//! Dispatch coordinator.
//!
//! Expands an inbound event into one record per permitted channel, makes one
//! delivery attempt per record and applies the outcome to the state machine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::channels::ChannelProvider;
use super::events::InboundEvent;
use super::model::{Notification, StatusGuard, now};
use super::preferences::PreferenceFilter;
use super::registry::ProviderRegistry;
use super::state::NotificationStatus;
use crate::database::repositories::{Insertion, NotificationRepository};
use crate::{Error, Result};

pub(crate) const REASON_UNSUPPORTED: &str = "unsupported channel";
const REASON_DISABLED: &str = "provider disabled";
const REASON_REJECTED: &str = "transport rejected the message";
const REASON_TIMEOUT: &str = "send timed out";

/// Added to the send timeout before a PENDING record counts as abandoned.
const STALE_PENDING_MARGIN: Duration = Duration::from_secs(30);

/// What happened to one channel of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The provider accepted the message; record is SENT.
    Sent,
    /// The provider refused or timed out; record is FAILED.
    Failed,
    /// The provider's kill-switch is off; record is FAILED and retryable.
    ProviderDisabled,
    /// No provider for the channel; record is CANCELLED.
    UnsupportedChannel,
    /// A live record already exists for `(event_id, channel)`; returned unchanged.
    Duplicate,
    /// Another writer changed the record first; the current record is returned.
    Superseded,
}

/// One record produced or touched by a dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchResult {
    pub notification: Notification,
    pub outcome: DispatchOutcome,
}

impl DispatchResult {
    fn new(notification: Notification, outcome: DispatchOutcome) -> Self {
        Self {
            notification,
            outcome,
        }
    }
}

pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    filter: Arc<PreferenceFilter>,
    repository: Arc<dyn NotificationRepository>,
    max_retries: u32,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        filter: Arc<PreferenceFilter>,
        repository: Arc<dyn NotificationRepository>,
        max_retries: u32,
        send_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            filter,
            repository,
            max_retries,
            send_timeout,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// PENDING records last touched at or before this instant were left behind
    /// by an attempt whose outcome never reached the store.
    pub fn stale_pending_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let window = TimeDelta::from_std(self.send_timeout.saturating_add(STALE_PENDING_MARGIN))
            .unwrap_or(TimeDelta::MAX);
        now.checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn is_stale_pending(&self, record: &Notification) -> bool {
        record.status == NotificationStatus::Pending
            && record.updated_at <= self.stale_pending_cutoff(now())
    }

    /// Dispatch an event to every channel the user allows.
    ///
    /// Channels are handled concurrently and independently. A store error on
    /// one channel is logged and that channel is left out of the result; the
    /// call only fails when every channel failed that way.
    pub async fn dispatch(&self, event: &InboundEvent) -> Result<Vec<DispatchResult>> {
        event.validate()?;

        let candidates = event.candidate_channels();
        let allowed = self
            .filter
            .allowed_channels(event.user_id, event.notification_type, &candidates)
            .await;

        if allowed.is_empty() {
            debug!(
                event_id = %event.event_id,
                user_id = event.user_id,
                "No permitted channels for event"
            );
            return Ok(Vec::new());
        }

        let attempts = allowed
            .iter()
            .map(|channel| self.dispatch_channel(event, channel));
        let outcomes = join_all(attempts).await;

        let mut results = Vec::with_capacity(outcomes.len());
        let mut last_error = None;
        for (channel, outcome) in allowed.iter().zip(outcomes) {
            match outcome {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(
                        event_id = %event.event_id,
                        channel = %channel,
                        "Dispatch failed for channel: {}", e
                    );
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if results.is_empty() => Err(e),
            _ => Ok(results),
        }
    }

    async fn dispatch_channel(&self, event: &InboundEvent, channel: &str) -> Result<DispatchResult> {
        let record = Notification::from_event(event, channel);

        let record = match self
            .repository
            .insert_unique(&record, self.max_retries)
            .await?
        {
            Insertion::Created(record) => record,
            Insertion::Existing(existing) if self.is_stale_pending(&existing) => {
                return self.resume(existing).await;
            }
            Insertion::Existing(existing) => {
                debug!(
                    notification_id = %existing.id,
                    event_id = %event.event_id,
                    channel = %existing.channel,
                    status = %existing.status,
                    "Duplicate event for channel, returning existing record"
                );
                return Ok(DispatchResult::new(existing, DispatchOutcome::Duplicate));
            }
        };

        self.send_or_cancel(record).await
    }

    /// Single-channel retry. A FAILED record is requeued to PENDING, then
    /// attempted. A stale PENDING record is attempted as it stands; a fresh
    /// one may still have an attempt in flight and is refused.
    pub async fn retry(&self, record: Notification) -> Result<DispatchResult> {
        if record.status == NotificationStatus::Pending {
            if !self.is_stale_pending(&record) {
                return Err(Error::invalid_transition(
                    record.status,
                    NotificationStatus::Pending,
                ));
            }
            return self.resume(record).await;
        }

        let guard = record.guard();
        let mut pending = record;
        pending.requeue(self.max_retries)?;

        if !self.repository.compare_and_swap(guard, &pending).await? {
            return self.superseded(pending.id).await;
        }

        debug!(
            notification_id = %pending.id,
            channel = %pending.channel,
            retry_count = pending.retry_count,
            "Retrying notification"
        );

        self.send_or_cancel(pending).await
    }

    /// Attempt a PENDING record whose previous outcome was lost. The attempt
    /// is made against the PENDING guard, so a late writer for the lost
    /// attempt and this one cannot both apply.
    async fn resume(&self, record: Notification) -> Result<DispatchResult> {
        warn!(
            notification_id = %record.id,
            channel = %record.channel,
            retry_count = record.retry_count,
            updated_at = %record.updated_at,
            "Resuming notification left PENDING"
        );
        self.send_or_cancel(record).await
    }

    async fn send_or_cancel(&self, record: Notification) -> Result<DispatchResult> {
        match self.registry.resolve(&record.channel) {
            Ok(provider) => self.attempt(record, provider).await,
            Err(Error::UnsupportedChannel(_)) => self.cancel_unsupported(record).await,
            Err(e) => Err(e),
        }
    }

    /// One delivery attempt for a PENDING record.
    async fn attempt(
        &self,
        record: Notification,
        provider: Arc<dyn ChannelProvider>,
    ) -> Result<DispatchResult> {
        let guard = record.guard();

        let failure = if !provider.is_enabled() {
            Some((REASON_DISABLED, DispatchOutcome::ProviderDisabled))
        } else {
            match tokio::time::timeout(self.send_timeout, provider.send_notification(&record)).await
            {
                Ok(true) => None,
                Ok(false) => Some((REASON_REJECTED, DispatchOutcome::Failed)),
                Err(_) => Some((REASON_TIMEOUT, DispatchOutcome::Failed)),
            }
        };

        let mut updated = record;
        let outcome = match failure {
            None => {
                updated.mark_sent(self.max_retries)?;
                DispatchOutcome::Sent
            }
            Some((reason, outcome)) => {
                updated.mark_failed(reason, self.max_retries)?;
                outcome
            }
        };

        match outcome {
            DispatchOutcome::Sent => debug!(
                notification_id = %updated.id,
                channel = %updated.channel,
                "Notification sent"
            ),
            _ => warn!(
                notification_id = %updated.id,
                channel = %updated.channel,
                retry_count = updated.retry_count,
                exhausted = updated.is_exhausted(self.max_retries),
                "Notification attempt failed: {}",
                updated.last_error.as_deref().unwrap_or_default()
            ),
        }

        self.apply(guard, updated, outcome).await
    }

    async fn cancel_unsupported(&self, record: Notification) -> Result<DispatchResult> {
        let guard = record.guard();
        let mut cancelled = record;
        cancelled.cancel(REASON_UNSUPPORTED, self.max_retries)?;
        warn!(
            notification_id = %cancelled.id,
            channel = %cancelled.channel,
            "No provider registered for channel, notification cancelled"
        );
        self.apply(guard, cancelled, DispatchOutcome::UnsupportedChannel)
            .await
    }

    async fn apply(
        &self,
        guard: StatusGuard,
        updated: Notification,
        outcome: DispatchOutcome,
    ) -> Result<DispatchResult> {
        if self.repository.compare_and_swap(guard, &updated).await? {
            Ok(DispatchResult::new(updated, outcome))
        } else {
            self.superseded(updated.id).await
        }
    }

    async fn superseded(&self, id: uuid::Uuid) -> Result<DispatchResult> {
        let current = self.repository.get(id).await?;
        info!(
            notification_id = %id,
            status = %current.status,
            "Record changed concurrently, outcome discarded"
        );
        Ok(DispatchResult::new(current, DispatchOutcome::Superseded))
    }
}
