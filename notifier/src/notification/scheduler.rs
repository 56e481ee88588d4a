//! Retry scheduler.
//!
//! Periodically scans FAILED records that still have attempts left and whose
//! backoff window has elapsed, and hands each to the dispatcher's
//! single-channel retry path. The same pass picks up PENDING records whose
//! attempt outcome was never written.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatcher::{DispatchOutcome, Dispatcher};
use super::model::{Notification, now};
use super::retry_policy::RetryPolicy;
use crate::Result;
use crate::database::repositories::{NotificationRepository, ScanCursor};

/// Counters for one scheduler pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// FAILED and stale PENDING records read from the store.
    pub scanned: usize,
    /// Records past their backoff window that were retried.
    pub retried: usize,
    /// Stale PENDING records attempted again.
    pub recovered: usize,
    pub sent: usize,
    pub failed: usize,
    /// Retries that used the last attempt and left the record terminal.
    pub exhausted: usize,
    /// Records another writer changed first, or that were no longer retryable.
    pub skipped: usize,
    pub errors: usize,
}

/// Floor for the scan interval; `tokio::time::interval` rejects zero.
const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(100);

pub struct RetryScheduler {
    dispatcher: Arc<Dispatcher>,
    repository: Arc<dyn NotificationRepository>,
    policy: RetryPolicy,
    scan_interval: Duration,
    page_size: u32,
    concurrency: usize,
}

impl RetryScheduler {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        repository: Arc<dyn NotificationRepository>,
        policy: RetryPolicy,
        scan_interval: Duration,
        page_size: u32,
        concurrency: usize,
    ) -> Self {
        Self {
            dispatcher,
            repository,
            policy,
            scan_interval: scan_interval.max(MIN_SCAN_INTERVAL),
            page_size: page_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    /// Run one pass now.
    pub async fn run_once(&self) -> Result<ScanReport> {
        self.run_pass(now(), &CancellationToken::new()).await
    }

    /// Run one pass as if the current time were `now`.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<ScanReport> {
        self.run_pass(now, &CancellationToken::new()).await
    }

    async fn run_pass(&self, now: DateTime<Utc>, token: &CancellationToken) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        self.retry_failed(now, token, &mut report).await?;
        self.recover_pending(now, token, &mut report).await?;
        Ok(report)
    }

    async fn retry_failed(
        &self,
        now: DateTime<Utc>,
        token: &CancellationToken,
        report: &mut ScanReport,
    ) -> Result<()> {
        let min_backoff =
            TimeDelta::from_std(self.policy.min_backoff()).unwrap_or(TimeDelta::zero());
        let updated_before = now - min_backoff;
        let max_retries = self.policy.max_retries;
        let mut cursor: Option<ScanCursor> = None;

        loop {
            if token.is_cancelled() {
                debug!("Retry pass interrupted by shutdown");
                break;
            }

            let page = self
                .repository
                .scan_failed(max_retries, updated_before, cursor, self.page_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(ScanCursor::after(last));
            let full_page = page.len() as u32 >= self.page_size;
            report.scanned += page.len();

            let due: Vec<_> = page
                .into_iter()
                .filter(|n| self.policy.is_due(n.retry_count, n.updated_at, now))
                .collect();
            report.retried += due.len();
            self.run_batch(due, report).await;

            if !full_page {
                break;
            }
        }

        Ok(())
    }

    async fn recover_pending(
        &self,
        now: DateTime<Utc>,
        token: &CancellationToken,
        report: &mut ScanReport,
    ) -> Result<()> {
        let updated_before = self.dispatcher.stale_pending_cutoff(now);
        let mut cursor: Option<ScanCursor> = None;

        loop {
            if token.is_cancelled() {
                break;
            }

            let page = self
                .repository
                .scan_stale_pending(updated_before, cursor, self.page_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(ScanCursor::after(last));
            let full_page = page.len() as u32 >= self.page_size;
            report.scanned += page.len();
            report.recovered += page.len();
            self.run_batch(page, report).await;

            if !full_page {
                break;
            }
        }

        Ok(())
    }

    async fn run_batch(&self, records: Vec<Notification>, report: &mut ScanReport) {
        let max_retries = self.policy.max_retries;
        let outcomes: Vec<_> = stream::iter(records)
            .map(|record| {
                let id = record.id;
                async move { (id, self.dispatcher.retry(record).await) }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (id, outcome) in outcomes {
            match outcome {
                Ok(result) => match result.outcome {
                    DispatchOutcome::Sent => report.sent += 1,
                    DispatchOutcome::Failed | DispatchOutcome::ProviderDisabled => {
                        report.failed += 1;
                        if result.notification.is_exhausted(max_retries) {
                            report.exhausted += 1;
                            warn!(
                                notification_id = %id,
                                user_id = result.notification.user_id,
                                channel = %result.notification.channel,
                                "Notification exhausted its retries"
                            );
                        }
                    }
                    _ => report.skipped += 1,
                },
                Err(e) if e.is_invalid_transition() => {
                    debug!(notification_id = %id, "Skipping retry: {}", e);
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(notification_id = %id, "Retry failed: {}", e);
                    report.errors += 1;
                }
            }
        }
    }

    /// Spawn the periodic loop. The first pass runs immediately.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.scan_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                interval_secs = self.scan_interval.as_secs(),
                page_size = self.page_size,
                "Retry scheduler started"
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.run_pass(now(), &token).await {
                            Ok(report) if report.retried + report.recovered > 0 => info!(
                                retried = report.retried,
                                recovered = report.recovered,
                                sent = report.sent,
                                failed = report.failed,
                                exhausted = report.exhausted,
                                "Retry pass finished"
                            ),
                            Ok(report) => debug!(scanned = report.scanned, "Retry pass found nothing due"),
                            Err(e) => error!("Retry pass failed: {}", e),
                        }
                    }
                }
            }

            info!("Retry scheduler stopped");
        })
    }
}
