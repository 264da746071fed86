//! SIP registration with bounded retry
//!
//! ```text
//! Unregistered ──register──▶ Registering ──ok──▶ Registered
//!       ▲                        │                   │
//!       │                        └──exhausted──▶ Failed
//!       └──────────── unregister / invalidate ───────┘
//! ```
//!
//! A run makes at most `max_attempts` attempts and reports exhaustion once.
//! It observes the connection scope, so losing the transport cancels it
//! without a terminal failure.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Credentials, RegistrationConfig};
use crate::engine::SignalingEngine;
use crate::error::{PhoneError, PhoneResult};
use crate::events::{EventBus, PhoneEvent};
use crate::recovery::{retry_with_backoff, with_timeout, RetryConfig, RetryFailure};
use crate::timer::{refresh_delay, TimerScope, TimerSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RegistrationState {
    #[default]
    Unregistered,
    Registering,
    Registered,
    /// Attempts exhausted; needs user action
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RefreshTimer;

#[derive(Default)]
struct RegistrationInner {
    /// Bumped by every run and every invalidation
    generation: u64,
    run: Option<CancellationToken>,
    expires: Option<u32>,
}

/// Registration state machine for the configured credentials
///
/// Registers with retry and exponential backoff, refreshes before the granted
/// expiry runs out and publishes every state change on a watch channel.
pub struct RegistrationController {
    me: Weak<RegistrationController>,
    engine: Arc<dyn SignalingEngine>,
    config: RegistrationConfig,
    credentials: Credentials,
    events: EventBus,
    scope: Arc<TimerScope>,
    timers: TimerSet<RefreshTimer>,
    inner: Mutex<RegistrationInner>,
    state: watch::Sender<RegistrationState>,
}

impl RegistrationController {
    pub fn new(
        engine: Arc<dyn SignalingEngine>,
        config: RegistrationConfig,
        credentials: Credentials,
        events: EventBus,
        scope: Arc<TimerScope>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(RegistrationState::Unregistered);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            engine,
            config,
            credentials,
            events,
            timers: TimerSet::new(scope.clone()),
            scope,
            inner: Mutex::new(RegistrationInner::default()),
            state,
        })
    }

    pub fn state(&self) -> RegistrationState {
        *self.state.borrow()
    }

    /// True only in [`RegistrationState::Registered`]
    pub fn is_registered(&self) -> bool {
        self.state() == RegistrationState::Registered
    }

    /// Watch channel following [`state`](Self::state)
    pub fn state_watch(&self) -> watch::Receiver<RegistrationState> {
        self.state.subscribe()
    }

    /// Expiry granted by the last successful REGISTER
    pub fn expires(&self) -> Option<u32> {
        self.inner.lock().expires
    }

    pub fn is_refresh_scheduled(&self) -> bool {
        self.timers.is_scheduled(&RefreshTimer)
    }

    fn set_state(&self, next: RegistrationState) {
        let mut previous = next;
        let changed = self.state.send_if_modified(|state| {
            previous = *state;
            if *state != next {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(?previous, current = ?next, "Registration state changed");
            self.events.emit(PhoneEvent::RegistrationStateChanged { previous, current: next });
        }
    }

    /// Register with the configured retry policy
    pub async fn register(&self) -> PhoneResult<()> {
        self.register_with_retry(self.config.max_attempts, self.config.initial_retry_delay())
            .await
    }

    /// Register, making at most `max_attempts` attempts
    ///
    /// The first attempt is immediate; retry *k* waits
    /// `initial_delay × 2^(k-1)`, capped at the configured maximum delay.
    pub async fn register_with_retry(&self, max_attempts: u32, initial_delay: Duration) -> PhoneResult<()> {
        let (token, generation) = {
            let mut inner = self.inner.lock();
            if inner.run.is_some() {
                return Err(PhoneError::in_progress("registration"));
            }
            let token = self.scope.token();
            inner.generation += 1;
            inner.run = Some(token.clone());
            (token, inner.generation)
        };
        self.timers.cancel(&RefreshTimer);
        self.set_state(RegistrationState::Registering);
        info!(username = %self.credentials.username, max_attempts, "Registering");

        let policy = RetryConfig::new(max_attempts, initial_delay).with_max_delay(self.config.max_retry_delay());
        let timeout = self.config.request_timeout();
        let result = retry_with_backoff("register", &policy, &token, |_| {
            with_timeout("register", timeout, self.engine.register(&self.credentials))
        })
        .await;

        let current = {
            let mut inner = self.inner.lock();
            let current = inner.generation == generation;
            if current {
                inner.run = None;
                if let Ok(outcome) = &result {
                    inner.expires = outcome.expires;
                }
            }
            current
        };
        if !current {
            debug!("Registration run superseded");
            return Err(PhoneError::cancelled("registration"));
        }

        match result {
            Ok(outcome) => {
                self.set_state(RegistrationState::Registered);
                info!(expires = ?outcome.expires, "Registered");
                if let Some(expires) = outcome.expires {
                    self.schedule_refresh(expires);
                }
                Ok(())
            }
            Err(RetryFailure::Exhausted { attempts, last_error }) => {
                let reason = last_error.to_string();
                error!(attempts, reason = %reason, "Registration failed");
                self.set_state(RegistrationState::Failed);
                self.events.emit(PhoneEvent::RegistrationFailed {
                    attempts,
                    reason: reason.clone(),
                });
                Err(PhoneError::RegistrationFailed { attempts, reason })
            }
            Err(RetryFailure::Cancelled { attempts }) => {
                debug!(attempts, "Registration cancelled");
                self.set_state(RegistrationState::Unregistered);
                Err(PhoneError::cancelled("registration"))
            }
        }
    }

    fn schedule_refresh(&self, expires: u32) {
        let delay = refresh_delay(expires, self.config.refresh_ratio);
        let controller = self.me.clone();
        debug!(delay_secs = delay.as_secs(), "Scheduling registration refresh");
        self.timers.schedule(RefreshTimer, delay, move || async move {
            if let Some(controller) = controller.upgrade() {
                controller.refresh().await;
            }
        });
    }

    /// Re-REGISTER once; fall back to a full retry run if it fails
    async fn refresh(&self) {
        let token = {
            let inner = self.inner.lock();
            if inner.run.is_some() || self.state() != RegistrationState::Registered {
                return;
            }
            self.scope.token()
        };

        let result = tokio::select! {
            _ = token.cancelled() => return,
            result = with_timeout("register refresh", self.config.request_timeout(), self.engine.register(&self.credentials)) => result,
        };

        match result {
            Ok(outcome) => {
                self.inner.lock().expires = outcome.expires;
                debug!(expires = ?outcome.expires, "Registration refreshed");
                if let Some(expires) = outcome.expires {
                    self.schedule_refresh(expires);
                }
            }
            Err(e) => {
                warn!(error = %e, "Registration refresh failed, re-registering");
                if let Err(e) = self.register().await {
                    debug!(error = %e, "Re-registration after failed refresh did not succeed");
                }
            }
        }
    }

    fn stop_run(&self) -> Option<CancellationToken> {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.expires = None;
        inner.run.take()
    }

    /// Drop the registration locally, without network traffic
    pub fn invalidate(&self, reason: &str) {
        if let Some(run) = self.stop_run() {
            run.cancel();
        }
        self.timers.cancel(&RefreshTimer);
        if self.state() != RegistrationState::Unregistered {
            info!(reason, "Registration invalidated");
        }
        self.set_state(RegistrationState::Unregistered);
    }

    /// Unregister from the server, best effort
    pub async fn unregister(&self) {
        let was_registered = self.is_registered();
        if let Some(run) = self.stop_run() {
            run.cancel();
        }
        self.timers.cancel(&RefreshTimer);

        if was_registered {
            match with_timeout("unregister", self.config.request_timeout(), self.engine.unregister()).await {
                Ok(()) => info!("Unregistered"),
                Err(e) => warn!(error = %e, "Unregister failed"),
            }
        }
        self.set_state(RegistrationState::Unregistered);
    }
}
