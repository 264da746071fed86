//! Connection supervision: connect, keep-alive and reconnection
//!
//! The supervisor owns the *connection scope*. Everything that only makes sense
//! while connected (heartbeat, presence refreshes and health sweep, batch
//! delays, registration runs, call timers) takes its cancellation token from
//! that scope, and an unexpected disconnect cancels them all in one step.
//! Reconnect timers live in a separate scope so they survive that.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::engine::SignalingEngine;
use crate::error::{PhoneError, PhoneResult};
use crate::events::{EventBus, PhoneEvent};
use crate::recovery::{cancellable, with_timeout, Backoff};
use crate::timer::{TimerScope, TimerSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransportState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Connectivity changes reported to the phone
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    /// Connection restored after a loss
    Connected,
    Lost { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TransportTimer {
    Reconnect,
    Heartbeat,
}

struct TransportInner {
    state: TransportState,
    /// Set while the user is tearing the connection down
    stopping: bool,
    backoff: Backoff,
}

/// Supervisor of the single signaling connection
///
/// Reports connectivity changes to the phone as [`TransportSignal`]s and
/// reconnects with exponential backoff after an unexpected loss. A failed
/// keep-alive ping counts as a loss.
pub struct TransportSupervisor {
    me: Weak<TransportSupervisor>,
    engine: Arc<dyn SignalingEngine>,
    config: TransportConfig,
    events: EventBus,
    connection_scope: Arc<TimerScope>,
    reconnect: TimerSet<TransportTimer>,
    heartbeat: TimerSet<TransportTimer>,
    inner: Mutex<TransportInner>,
    signals: mpsc::UnboundedSender<TransportSignal>,
}

impl TransportSupervisor {
    pub fn new(
        engine: Arc<dyn SignalingEngine>,
        config: TransportConfig,
        events: EventBus,
        connection_scope: Arc<TimerScope>,
        signals: mpsc::UnboundedSender<TransportSignal>,
    ) -> Arc<Self> {
        let backoff = Backoff::new(config.reconnect_policy());
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            engine,
            config,
            events,
            reconnect: TimerSet::new(Arc::new(TimerScope::new("transport"))),
            heartbeat: TimerSet::new(connection_scope.clone()),
            connection_scope,
            inner: Mutex::new(TransportInner {
                state: TransportState::Disconnected,
                stopping: false,
                backoff,
            }),
            signals,
        })
    }

    pub fn state(&self) -> TransportState {
        self.inner.lock().state
    }

    /// True only in [`TransportState::Connected`]
    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    /// Scope cancelled whenever the connection goes away
    pub fn connection_scope(&self) -> &Arc<TimerScope> {
        &self.connection_scope
    }

    pub fn is_heartbeat_running(&self) -> bool {
        self.heartbeat.is_scheduled(&TransportTimer::Heartbeat)
    }

    pub fn is_reconnect_scheduled(&self) -> bool {
        self.reconnect.is_scheduled(&TransportTimer::Reconnect)
    }

    fn state_changed(&self, previous: TransportState, current: TransportState) {
        if previous != current {
            debug!(?previous, ?current, "Transport state changed");
            self.events.emit(PhoneEvent::TransportStateChanged { previous, current });
        }
    }

    fn signal(&self, signal: TransportSignal) {
        if self.signals.send(signal).is_err() {
            debug!("No transport signal receiver");
        }
    }

    /// Open the connection
    ///
    /// A no-op while connected. A failed connect is not retried.
    pub async fn connect(&self) -> PhoneResult<()> {
        let previous = {
            let mut inner = self.inner.lock();
            match inner.state {
                TransportState::Connecting => return Err(PhoneError::in_progress("transport")),
                TransportState::Connected => return Ok(()),
                TransportState::Disconnected => {}
            }
            inner.stopping = false;
            inner.backoff.reset();
            inner.state = TransportState::Connecting;
            TransportState::Disconnected
        };
        self.state_changed(previous, TransportState::Connecting);
        info!(server = %self.config.server_uri, "Connecting");

        let token = self.reconnect.scope().token();
        let result = cancellable(
            "connect",
            self.config.connect_timeout(),
            &token,
            self.engine.connect(&self.config.server_uri),
        )
        .await;

        let next = match &result {
            Ok(()) => TransportState::Connected,
            Err(_) => TransportState::Disconnected,
        };
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            if previous == TransportState::Connecting {
                inner.state = next;
            }
            previous
        };
        if previous == TransportState::Connecting {
            self.state_changed(previous, next);
        }

        match result {
            Ok(()) => {
                info!(server = %self.config.server_uri, "Connected");
                Ok(())
            }
            Err(e) => {
                warn!(server = %self.config.server_uri, error = %e, "Connect failed");
                Err(e)
            }
        }
    }

    /// The connection dropped without the user asking
    pub fn connection_lost(&self, reason: &str) {
        let previous = {
            let mut inner = self.inner.lock();
            if inner.stopping || inner.state != TransportState::Connected {
                return;
            }
            inner.state = TransportState::Disconnected;
            TransportState::Connected
        };

        warn!(reason, "Connection lost");
        self.connection_scope.cancel_all();
        self.state_changed(previous, TransportState::Disconnected);
        self.signal(TransportSignal::Lost {
            reason: reason.to_string(),
        });
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        let (delay, attempts) = {
            let mut inner = self.inner.lock();
            if inner.stopping {
                return;
            }
            let delay = inner.backoff.next_delay();
            (delay, inner.backoff.attempts())
        };

        let Some(delay) = delay else {
            warn!(attempts, "Reconnection attempts exhausted");
            self.events.emit(PhoneEvent::ReconnectionFailed { attempts });
            return;
        };

        info!(attempt = attempts, delay_ms = delay.as_millis() as u64, "Scheduling reconnection");
        self.events.emit(PhoneEvent::ReconnectionAttempting {
            attempt: attempts,
            delay,
        });
        let supervisor = self.me.clone();
        self.reconnect.schedule(TransportTimer::Reconnect, delay, move || async move {
            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.reconnect_attempt().await;
            }
        });
    }

    async fn reconnect_attempt(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.stopping || inner.state != TransportState::Disconnected {
                return;
            }
            inner.state = TransportState::Connecting;
        }
        self.state_changed(TransportState::Disconnected, TransportState::Connecting);

        let token = self.reconnect.scope().token();
        let result = cancellable(
            "reconnect",
            self.config.connect_timeout(),
            &token,
            self.engine.connect(&self.config.server_uri),
        )
        .await;

        match result {
            Ok(()) => {
                let restored = {
                    let mut inner = self.inner.lock();
                    let restored = inner.state == TransportState::Connecting;
                    if restored {
                        inner.state = TransportState::Connected;
                        inner.backoff.reset();
                    }
                    restored
                };
                if restored {
                    info!("Reconnected");
                    self.state_changed(TransportState::Connecting, TransportState::Connected);
                    self.signal(TransportSignal::Connected);
                }
            }
            Err(PhoneError::Cancelled { .. }) => {}
            Err(e) => {
                let failed = {
                    let mut inner = self.inner.lock();
                    let failed = inner.state == TransportState::Connecting;
                    if failed {
                        inner.state = TransportState::Disconnected;
                    }
                    failed
                };
                if failed {
                    warn!(error = %e, "Reconnection attempt failed");
                    self.state_changed(TransportState::Connecting, TransportState::Disconnected);
                    self.schedule_reconnect();
                }
            }
        }
    }

    /// The engine restored the connection on its own
    pub fn engine_reconnected(&self) {
        let previous = {
            let mut inner = self.inner.lock();
            if inner.stopping || inner.state == TransportState::Connected {
                return;
            }
            let previous = inner.state;
            inner.state = TransportState::Connected;
            inner.backoff.reset();
            previous
        };
        self.reconnect.cancel(&TransportTimer::Reconnect);
        info!("Engine reconnected");
        self.state_changed(previous, TransportState::Connected);
        self.signal(TransportSignal::Connected);
    }

    /// Probe the connection every heartbeat interval
    pub fn start_heartbeat(&self) {
        let supervisor = self.me.clone();
        let interval = self.config.heartbeat_interval();
        debug!(interval_secs = interval.as_secs(), "Starting heartbeat");
        self.heartbeat
            .schedule_repeating(TransportTimer::Heartbeat, interval, move || {
                let supervisor = supervisor.clone();
                async move {
                    if let Some(supervisor) = supervisor.upgrade() {
                        supervisor.probe().await;
                    }
                }
            });
    }

    pub fn stop_heartbeat(&self) {
        if self.heartbeat.cancel(&TransportTimer::Heartbeat) {
            debug!("Heartbeat stopped");
        }
    }

    async fn probe(&self) {
        match with_timeout("ping", self.config.heartbeat_timeout(), self.engine.ping()).await {
            Ok(()) => debug!("Heartbeat ok"),
            Err(e) => self.connection_lost(&format!("keep-alive failed: {}", e)),
        }
    }

    /// Mark the coming disconnect as user-initiated
    pub fn prepare_shutdown(&self) {
        self.inner.lock().stopping = true;
    }

    /// Close the connection and cancel every connection-bound timer
    pub async fn disconnect(&self) -> PhoneResult<()> {
        let previous = {
            let mut inner = self.inner.lock();
            inner.stopping = true;
            let previous = inner.state;
            inner.state = TransportState::Disconnected;
            previous
        };

        self.reconnect.cancel_all();
        self.reconnect.scope().cancel_all();
        self.connection_scope.cancel_all();

        if previous != TransportState::Disconnected {
            if let Err(e) = with_timeout("disconnect", self.config.connect_timeout(), self.engine.disconnect()).await {
                warn!(error = %e, "Engine disconnect failed");
            }
            info!("Disconnected");
        }
        self.state_changed(previous, TransportState::Disconnected);
        Ok(())
    }
}
