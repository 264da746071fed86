//! Presence (BLF) subscriptions
//!
//! [`PresenceManager`] keeps one dialog-event subscription per monitored
//! extension, refreshes it before it expires, re-subscribes when the notifier
//! terminates it or falls silent, and publishes every presence change on the
//! event bus.
//!
//! Subscribe requests for one extension never overlap: each request run owns
//! the record through an epoch, and a run that was superseded (unsubscribe,
//! invalidation) releases whatever handle it obtained.

mod subscription;
mod value;

pub use subscription::{SubscriptionInfo, SubscriptionStatus};
pub use value::PresenceValue;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PresenceConfig;
use crate::engine::{SignalingEngine, SubscriptionHandle};
use crate::error::{PhoneError, PhoneResult};
use crate::events::{EventBus, PhoneEvent};
use crate::recovery::{retry_with_backoff, with_timeout, RetryFailure};
use crate::timer::{refresh_delay, TimerScope, TimerSet};
use subscription::Subscription;

/// Outcome of [`PresenceManager::batch_subscribe`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub subscribed: Vec<String>,
    /// Already tracked with a live subscription; no request was sent
    pub already_active: Vec<String>,
    /// Extension and failure reason
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PresenceTimer {
    Refresh(String),
    HealthSweep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    /// User request: creates the record, skips live subscriptions
    Initial,
    /// Refresh, re-attach or stale renewal of an existing record
    Renew,
}

enum Begin {
    Existing(SubscriptionInfo),
    Missing,
    Started {
        epoch: u64,
        token: CancellationToken,
    },
}

/// Pool of BLF subscriptions, one per extension
///
/// Subscriptions are refreshed before they expire and swept for staleness
/// while registered. A registration loss invalidates them all; [`resume`]
/// restores them together with the monitored extensions.
///
/// [`resume`]: PresenceManager::resume
pub struct PresenceManager {
    me: Weak<PresenceManager>,
    engine: Arc<dyn SignalingEngine>,
    config: PresenceConfig,
    events: EventBus,
    subscriptions: DashMap<String, Subscription>,
    timers: TimerSet<PresenceTimer>,
    epochs: AtomicU64,
    /// Extensions to restore after the registration comes back
    remembered: Mutex<Vec<String>>,
    monitored: Vec<String>,
}

impl PresenceManager {
    pub fn new(
        engine: Arc<dyn SignalingEngine>,
        config: PresenceConfig,
        events: EventBus,
        scope: Arc<TimerScope>,
        monitored: Vec<String>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            engine,
            config,
            events,
            subscriptions: DashMap::new(),
            timers: TimerSet::new(scope),
            epochs: AtomicU64::new(1),
            remembered: Mutex::new(Vec::new()),
            monitored,
        })
    }

    fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed)
    }

    /// Snapshot of the subscription for `extension`
    pub fn subscription(&self, extension: &str) -> Option<SubscriptionInfo> {
        self.subscriptions.get(extension).map(|entry| entry.info())
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let mut all: Vec<_> = self.subscriptions.iter().map(|entry| entry.info()).collect();
        all.sort_by(|a, b| a.extension.cmp(&b.extension));
        all
    }

    /// Whether a refresh timer is pending for `extension`
    pub fn is_refresh_scheduled(&self, extension: &str) -> bool {
        self.timers.is_scheduled(&PresenceTimer::Refresh(extension.to_string()))
    }

    /// When the refresh for `extension` is due
    pub fn refresh_due(&self, extension: &str) -> Option<Instant> {
        self.timers.due_at(&PresenceTimer::Refresh(extension.to_string()))
    }

    fn status_changed(&self, extension: &str, previous: Option<SubscriptionStatus>, current: SubscriptionStatus) {
        if previous != Some(current) {
            debug!(extension, ?previous, ?current, "Subscription status changed");
            self.events.emit(PhoneEvent::SubscriptionStatusChanged {
                extension: extension.to_string(),
                previous,
                current,
            });
        }
    }

    // ===== Subscribe =====

    /// Subscribe once, without retries
    pub async fn subscribe(&self, extension: &str) -> PhoneResult<SubscriptionInfo> {
        self.run(extension, 0, RunMode::Initial).await
    }

    /// Subscribe, retrying up to `max_retries` times with exponential backoff
    pub async fn subscribe_with_retry(&self, extension: &str, max_retries: u32) -> PhoneResult<SubscriptionInfo> {
        self.run(extension, max_retries, RunMode::Initial).await
    }

    async fn renew(&self, extension: &str) -> PhoneResult<SubscriptionInfo> {
        self.run(extension, self.config.max_retries, RunMode::Renew).await
    }

    fn spawn_renew(&self, extension: String) {
        let Some(manager) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = manager.renew(&extension).await {
                debug!(extension = %extension, error = %e, "Subscription renewal did not complete");
            }
        });
    }

    fn begin(&self, extension: &str, mode: RunMode) -> Begin {
        let epoch = self.next_epoch();
        let token = self.timers.scope().token();

        let (previous, current) = match self.subscriptions.entry(extension.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if mode == RunMode::Initial && entry.status.is_live() {
                    return Begin::Existing(entry.info());
                }
                if mode == RunMode::Renew && entry.in_flight {
                    return Begin::Existing(entry.info());
                }
                let previous = entry.status;
                entry.token.cancel();
                entry.token = token.clone();
                entry.epoch = epoch;
                entry.in_flight = true;
                entry.retry_count = 0;
                entry.status = if mode == RunMode::Renew && entry.status == SubscriptionStatus::Active {
                    SubscriptionStatus::Refreshing
                } else {
                    SubscriptionStatus::Pending
                };
                (Some(previous), entry.status)
            }
            Entry::Vacant(_) if mode == RunMode::Renew => return Begin::Missing,
            Entry::Vacant(vacant) => {
                let mut entry = Subscription::new(extension, epoch, token.clone());
                entry.in_flight = true;
                entry.status = SubscriptionStatus::Pending;
                vacant.insert(entry);
                (None, SubscriptionStatus::Pending)
            }
        };

        self.status_changed(extension, previous, current);
        Begin::Started { epoch, token }
    }

    async fn run(&self, extension: &str, max_retries: u32, mode: RunMode) -> PhoneResult<SubscriptionInfo> {
        let (epoch, token) = match self.begin(extension, mode) {
            Begin::Existing(info) => {
                debug!(extension, status = ?info.status, "Subscription already tracked");
                return Ok(info);
            }
            Begin::Missing => return Err(PhoneError::cancelled(format!("renew {}", extension))),
            Begin::Started { epoch, token } => (epoch, token),
        };

        let policy = self.config.retry_policy(max_retries);
        let package = self.config.event_package.as_str();
        let timeout = self.config.request_timeout();
        let this = self;

        let result = retry_with_backoff("subscribe", &policy, &token, move |attempt| async move {
            if let Some(mut entry) = this.subscriptions.get_mut(extension) {
                if entry.epoch == epoch {
                    entry.retry_count = attempt - 1;
                }
            }
            with_timeout("subscribe", timeout, this.engine.subscribe(extension, package)).await
        })
        .await;

        match result {
            Ok(outcome) => self.subscribed(extension, epoch, outcome.handle, outcome.expires).await,
            Err(RetryFailure::Exhausted { attempts, last_error }) => {
                let current = {
                    match self.subscriptions.get_mut(extension) {
                        Some(mut entry) if entry.epoch == epoch => {
                            let previous = entry.status;
                            entry.status = SubscriptionStatus::Failed;
                            entry.in_flight = false;
                            entry.retry_count = attempts.saturating_sub(1);
                            Some(previous)
                        }
                        _ => None,
                    }
                };
                let Some(previous) = current else {
                    return Err(PhoneError::cancelled(format!("subscribe {}", extension)));
                };

                let reason = last_error.to_string();
                warn!(extension, attempts, reason = %reason, "Subscription failed");
                self.status_changed(extension, Some(previous), SubscriptionStatus::Failed);
                self.events.emit(PhoneEvent::SubscriptionFailed {
                    extension: extension.to_string(),
                    attempts,
                    reason: reason.clone(),
                });
                Err(PhoneError::SubscriptionFailed {
                    extension: extension.to_string(),
                    attempts,
                    reason,
                })
            }
            Err(RetryFailure::Cancelled { .. }) => {
                if let Some(mut entry) = self.subscriptions.get_mut(extension) {
                    if entry.epoch == epoch {
                        entry.in_flight = false;
                    }
                }
                Err(PhoneError::cancelled(format!("subscribe {}", extension)))
            }
        }
    }

    /// Store a granted subscription, or release it if its run was superseded
    async fn subscribed(
        &self,
        extension: &str,
        epoch: u64,
        handle: SubscriptionHandle,
        expires: Option<u32>,
    ) -> PhoneResult<SubscriptionInfo> {
        let stored = match self.subscriptions.get_mut(extension) {
            Some(mut entry) if entry.epoch == epoch => {
                let previous = entry.status;
                let replaced = entry.handle.replace(handle.clone()).filter(|old| *old != handle);
                entry.expires = expires;
                entry.in_flight = false;
                entry.last_heard = Instant::now();
                if entry.status == SubscriptionStatus::Refreshing {
                    entry.status = SubscriptionStatus::Active;
                }
                Some((previous, entry.status, replaced, entry.info()))
            }
            _ => None,
        };

        let Some((previous, current, replaced, info)) = stored else {
            debug!(extension, handle = %handle, "Releasing handle of superseded subscription");
            if let Err(e) = with_timeout("unsubscribe", self.config.request_timeout(), self.engine.unsubscribe(&handle)).await {
                warn!(extension, error = %e, "Failed to release superseded subscription");
            }
            return Err(PhoneError::cancelled(format!("subscribe {}", extension)));
        };

        if let Some(old) = replaced {
            if let Err(e) = with_timeout("unsubscribe", self.config.request_timeout(), self.engine.unsubscribe(&old)).await {
                warn!(extension, error = %e, "Failed to release replaced subscription");
            }
        }

        let expires = expires.unwrap_or(self.config.default_expires_secs);
        self.schedule_refresh(extension, expires);
        self.status_changed(extension, Some(previous), current);
        info!(extension, expires, "Subscribed to presence");
        Ok(info)
    }

    fn schedule_refresh(&self, extension: &str, expires_secs: u32) {
        let delay = refresh_delay(expires_secs, self.config.refresh_ratio);
        let manager = self.me.clone();
        let ext = extension.to_string();
        self.timers.schedule(PresenceTimer::Refresh(ext.clone()), delay, move || async move {
            if let Some(manager) = manager.upgrade() {
                debug!(extension = %ext, "Refreshing subscription");
                if let Err(e) = manager.renew(&ext).await {
                    debug!(extension = %ext, error = %e, "Refresh did not complete");
                }
            }
        });
    }

    /// Subscribe to many extensions in groups
    ///
    /// Duplicates are dropped. Each group of `batch_size` runs concurrently and
    /// groups are separated by the configured batch delay. One failure never
    /// stops the rest.
    pub async fn batch_subscribe<I, S>(&self, extensions: I, batch_size: usize) -> BatchReport
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let unique: Vec<String> = extensions
            .into_iter()
            .map(Into::into)
            .filter(|ext| seen.insert(ext.clone()))
            .collect();

        let token = self.timers.scope().token();
        let max_retries = self.config.max_retries;
        let mut report = BatchReport::default();

        for (index, chunk) in unique.chunks(batch_size.max(1)).enumerate() {
            if index > 0 {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Batch subscribe cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(self.config.batch_delay()) => {}
                }
            }

            let results = join_all(chunk.iter().map(|ext| async move {
                let live = self.subscription(ext).is_some_and(|info| info.status.is_live());
                (ext, live, self.subscribe_with_retry(ext, max_retries).await)
            }))
            .await;

            for (ext, live, result) in results {
                match result {
                    Ok(_) if live => report.already_active.push(ext.clone()),
                    Ok(_) => report.subscribed.push(ext.clone()),
                    Err(e) => report.failed.push((ext.clone(), e.to_string())),
                }
            }
        }

        info!(
            subscribed = report.subscribed.len(),
            already_active = report.already_active.len(),
            failed = report.failed.len(),
            "Batch subscribe finished"
        );
        report
    }

    // ===== Notifications =====

    /// Apply a NOTIFY for `extension`
    pub fn handle_notification(&self, extension: &str, body: &str, expires: Option<u32>, terminated: bool) {
        let decoded = (!body.trim().is_empty()).then(|| PresenceValue::from_notification(body));

        let update = match self.subscriptions.get_mut(extension) {
            Some(mut entry) => {
                let previous_status = entry.status;
                let previous_presence = entry.presence;
                entry.last_heard = Instant::now();
                entry.last_notification_at = Some(Utc::now());
                if let Some(value) = decoded {
                    entry.presence = value;
                }
                if terminated {
                    entry.status = SubscriptionStatus::Expired;
                    entry.handle = None;
                    entry.in_flight = false;
                    entry.token.cancel();
                } else if entry.status == SubscriptionStatus::Pending {
                    entry.status = SubscriptionStatus::Active;
                }
                if let Some(expires) = expires.filter(|secs| *secs > 0 && !terminated) {
                    entry.expires = Some(expires);
                }
                Some((previous_status, entry.status, previous_presence, entry.presence))
            }
            None => None,
        };

        let Some((previous_status, status, previous_presence, presence)) = update else {
            debug!(extension, "Notification for untracked extension");
            return;
        };

        self.status_changed(extension, Some(previous_status), status);
        if previous_presence != presence {
            debug!(extension, %previous_presence, %presence, "Presence changed");
            self.events.emit(PhoneEvent::PresenceChanged {
                extension: extension.to_string(),
                previous: previous_presence,
                current: presence,
            });
        }

        if terminated {
            info!(extension, "Subscription terminated by notifier, re-subscribing");
            self.timers.cancel(&PresenceTimer::Refresh(extension.to_string()));
            self.spawn_renew(extension.to_string());
        } else if let Some(expires) = expires.filter(|secs| *secs > 0) {
            self.schedule_refresh(extension, expires);
        }
    }

    /// The engine reports the subscription for `extension` ended
    pub fn handle_terminated(&self, extension: &str, reason: &str) {
        debug!(extension, reason, "Subscription terminated");
        self.handle_notification(extension, "", None, true);
    }

    /// Flag and renew active subscriptions that have gone quiet
    pub fn sweep_stale(&self) -> Vec<String> {
        let threshold = self.config.stale_threshold();
        let now = Instant::now();
        let stale: Vec<(String, Duration)> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.status == SubscriptionStatus::Active && !entry.in_flight)
            .filter_map(|entry| {
                let silent_for = now.saturating_duration_since(entry.last_heard);
                (silent_for > threshold).then(|| (entry.extension.clone(), silent_for))
            })
            .collect();

        for (extension, silent_for) in &stale {
            warn!(extension = %extension, silent_secs = silent_for.as_secs(), "Subscription is stale");
            self.events.emit(PhoneEvent::SubscriptionStale {
                extension: extension.clone(),
                silent_for: *silent_for,
            });
            self.spawn_renew(extension.clone());
        }
        stale.into_iter().map(|(extension, _)| extension).collect()
    }

    /// Start the periodic health sweep
    pub fn start(&self) {
        let manager = self.me.clone();
        self.timers
            .schedule_repeating(PresenceTimer::HealthSweep, self.config.health_check_interval(), move || {
                let manager = manager.clone();
                async move {
                    if let Some(manager) = manager.upgrade() {
                        manager.sweep_stale();
                    }
                }
            });
    }

    // ===== Teardown =====

    /// Release the subscription for `extension`
    ///
    /// Idempotent. If the engine fails to release it the record stays, marked
    /// failed with its handle, so the call can be repeated.
    pub async fn unsubscribe(&self, extension: &str) -> PhoneResult<()> {
        self.timers.cancel(&PresenceTimer::Refresh(extension.to_string()));
        self.remembered.lock().retain(|ext| ext != extension);

        let handle = match self.subscriptions.get_mut(extension) {
            Some(mut entry) => {
                entry.token.cancel();
                entry.in_flight = false;
                entry.epoch = self.next_epoch();
                entry.handle.clone()
            }
            None => return Ok(()),
        };

        if let Some(handle) = handle {
            let result = with_timeout("unsubscribe", self.config.request_timeout(), self.engine.unsubscribe(&handle)).await;
            if let Err(e) = result {
                let previous = self.subscriptions.get_mut(extension).map(|mut entry| {
                    let previous = entry.status;
                    entry.status = SubscriptionStatus::Failed;
                    previous
                });
                warn!(extension, error = %e, "Failed to release subscription");
                if let Some(previous) = previous {
                    self.status_changed(extension, Some(previous), SubscriptionStatus::Failed);
                }
                return Err(e);
            }
        }

        if self.subscriptions.remove(extension).is_some() {
            info!(extension, "Unsubscribed");
            self.events.emit(PhoneEvent::SubscriptionRemoved {
                extension: extension.to_string(),
            });
        }
        Ok(())
    }

    /// Unsubscribe everything, returning the extensions that could not be released
    pub async fn unsubscribe_all(&self) -> Vec<String> {
        let extensions: Vec<String> = self.subscriptions.iter().map(|entry| entry.key().clone()).collect();
        let mut failed = Vec::new();
        for extension in extensions {
            if self.unsubscribe(&extension).await.is_err() {
                failed.push(extension);
            }
        }
        failed
    }

    /// Expire every subscription without touching the network
    ///
    /// Used when the registration is lost. The extensions are remembered for
    /// [`resume`](Self::resume).
    pub fn invalidate_all(&self) {
        let mut changed = Vec::new();
        for mut entry in self.subscriptions.iter_mut() {
            entry.token.cancel();
            entry.epoch = self.next_epoch();
            entry.in_flight = false;
            entry.handle = None;
            if entry.status != SubscriptionStatus::Expired {
                changed.push((entry.extension.clone(), entry.status));
                entry.status = SubscriptionStatus::Expired;
            }
        }

        {
            let mut remembered = self.remembered.lock();
            for entry in self.subscriptions.iter() {
                if !remembered.contains(entry.key()) {
                    remembered.push(entry.key().clone());
                }
            }
        }

        for (extension, _) in &changed {
            self.timers.cancel(&PresenceTimer::Refresh(extension.clone()));
        }
        if !changed.is_empty() {
            info!(count = changed.len(), "Presence subscriptions invalidated");
        }
        for (extension, previous) in changed {
            self.status_changed(&extension, Some(previous), SubscriptionStatus::Expired);
        }
    }

    /// Re-subscribe remembered and configured extensions
    pub async fn resume(&self) -> BatchReport {
        let mut extensions = self.remembered.lock().clone();
        extensions.extend(self.monitored.iter().cloned());
        if extensions.is_empty() {
            return BatchReport::default();
        }
        debug!(count = extensions.len(), "Resuming presence subscriptions");
        self.batch_subscribe(extensions, self.config.batch_size).await
    }

    /// Drop every record and the remembered list
    pub fn clear(&self) {
        for entry in self.subscriptions.iter() {
            entry.token.cancel();
        }
        self.subscriptions.clear();
        self.remembered.lock().clear();
        self.timers.cancel_all();
    }
}
