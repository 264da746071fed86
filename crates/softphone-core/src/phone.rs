//! The softphone facade
//!
//! [`Softphone`] wires the components together and owns the event pump: a
//! task that routes engine events, transport signals and registration changes
//! to the component responsible for them.
//!
//! ```rust
//! # use std::sync::Arc;
//! # use rvoip_softphone_core::{LineStatus, PhoneConfig, SoftphoneBuilder};
//! # use rvoip_softphone_core::mock::MockEngine;
//! # tokio_test::block_on(async {
//! let config = PhoneConfig::new("wss://pbx.example.com:8089/ws")
//!     .with_credentials("1001", "secret")
//!     .with_monitored_extensions(["201", "202"]);
//!
//! let phone = SoftphoneBuilder::new(config)
//!     .engine(Arc::new(MockEngine::new()))
//!     .build()?;
//!
//! phone.connect().await?;
//! let call = phone.place_call("sip:300@pbx.example.com").await?;
//! assert_eq!(phone.line(call.line).status, LineStatus::Connecting);
//! phone.hangup(call.line).await?;
//! phone.disconnect().await?;
//! # Ok::<(), rvoip_softphone_core::PhoneError>(())
//! # }).unwrap();
//! ```

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentActionOutcome, AgentAdminApi, AgentContext, AgentCoordinator, AgentState};
use crate::call::{CallInfo, TerminationReason};
use crate::config::{ConfigStore, PhoneConfig, StaticConfigStore};
use crate::engine::{EngineEvent, SignalingEngine};
use crate::error::{PhoneError, PhoneResult};
use crate::events::{EventBus, EventStream, PhoneEvent, RejectionReason};
use crate::line::{CallActivityListener, LineId, LineManager, LineSnapshot};
use crate::presence::{BatchReport, PresenceManager, SubscriptionInfo};
use crate::recovery::with_timeout;
use crate::registration::{RegistrationController, RegistrationState};
use crate::timer::TimerScope;
use crate::transport::{TransportSignal, TransportState, TransportSupervisor};

/// Response code for an invite arriving while unregistered
const TEMPORARILY_UNAVAILABLE: u16 = 480;

/// Builder for [`Softphone`]
pub struct SoftphoneBuilder {
    config: PhoneConfig,
    engine: Option<Arc<dyn SignalingEngine>>,
    config_store: Option<Arc<dyn ConfigStore>>,
    admin_api: Option<Arc<dyn AgentAdminApi>>,
}

impl SoftphoneBuilder {
    pub fn new(config: PhoneConfig) -> Self {
        Self {
            config,
            engine: None,
            config_store: None,
            admin_api: None,
        }
    }

    pub fn engine(mut self, engine: Arc<dyn SignalingEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Source of credentials, monitored extensions and agent id
    ///
    /// Defaults to the values in the [`PhoneConfig`].
    pub fn config_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.config_store = Some(store);
        self
    }

    pub fn admin_api(mut self, api: Arc<dyn AgentAdminApi>) -> Self {
        self.admin_api = Some(api);
        self
    }

    /// Build the phone and start its event pump
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> PhoneResult<Arc<Softphone>> {
        self.config.validate()?;
        let engine = self
            .engine
            .ok_or_else(|| PhoneError::invalid_configuration("engine", "no signaling engine provided"))?;
        let runtime = Handle::try_current()
            .map_err(|_| PhoneError::internal_error("softphone must be built inside a tokio runtime"))?;

        let store = self
            .config_store
            .unwrap_or_else(|| Arc::new(StaticConfigStore::from_config(&self.config)));
        let credentials = store.credentials();
        if credentials.username.is_empty() {
            return Err(PhoneError::invalid_configuration("credentials.username", "must not be empty"));
        }
        let monitored = store.monitored_extensions();
        let agent_id = store.agent_id().or_else(|| self.config.agent.agent_id.clone());

        let config = self.config;
        let events = EventBus::new(config.event_capacity);
        let connection_scope = Arc::new(TimerScope::new("connection"));
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let transport = TransportSupervisor::new(
            engine.clone(),
            config.transport.clone(),
            events.clone(),
            connection_scope.clone(),
            signal_tx,
        );
        let registration = RegistrationController::new(
            engine.clone(),
            config.registration.clone(),
            credentials,
            events.clone(),
            connection_scope.clone(),
        );
        let lines = LineManager::new(engine.clone(), config.calls.clone(), events.clone(), connection_scope.clone());
        let presence = PresenceManager::new(
            engine.clone(),
            config.presence.clone(),
            events.clone(),
            connection_scope.clone(),
            monitored,
        );
        let agent = AgentCoordinator::new(
            engine.clone(),
            lines.clone(),
            self.admin_api,
            config.agent.clone(),
            agent_id,
            events.clone(),
        );
        let listener: Arc<dyn CallActivityListener> = agent.clone();
        lines.set_listener(Arc::downgrade(&listener));

        let pump = EventPump {
            engine: engine.clone(),
            transport: transport.clone(),
            registration: registration.clone(),
            lines: lines.clone(),
            presence: presence.clone(),
            events: events.clone(),
            registration_state: RegistrationState::Unregistered,
            call_timeout: config.calls.request_timeout(),
        };
        let cancel = CancellationToken::new();
        runtime.spawn(pump.run(
            engine.subscribe_events(),
            signal_rx,
            registration.state_watch(),
            cancel.clone(),
        ));

        info!(server = %config.transport.server_uri, "Softphone created");
        Ok(Arc::new(Softphone {
            events,
            transport,
            registration,
            lines,
            presence,
            agent,
            presence_retries: config.presence.max_retries,
            batch_size: config.presence.batch_size,
            pump: cancel,
        }))
    }
}

/// Routes unsolicited traffic to the owning component
struct EventPump {
    engine: Arc<dyn SignalingEngine>,
    transport: Arc<TransportSupervisor>,
    registration: Arc<RegistrationController>,
    lines: Arc<LineManager>,
    presence: Arc<PresenceManager>,
    events: EventBus,
    registration_state: RegistrationState,
    call_timeout: std::time::Duration,
}

impl EventPump {
    async fn run(
        mut self,
        mut engine_events: broadcast::Receiver<EngineEvent>,
        mut signals: mpsc::UnboundedReceiver<TransportSignal>,
        mut registration: watch::Receiver<RegistrationState>,
        cancel: CancellationToken,
    ) {
        debug!("Event pump started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = engine_events.recv() => match event {
                    Ok(event) => self.on_engine_event(event),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event pump lagged behind the engine"),
                    Err(RecvError::Closed) => {
                        warn!("Engine event channel closed");
                        break;
                    }
                },
                Some(signal) = signals.recv() => self.on_transport_signal(signal),
                changed = registration.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *registration.borrow_and_update();
                    self.on_registration_state(state);
                }
            }
        }
        debug!("Event pump stopped");
    }

    fn on_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::TransportConnected => self.transport.engine_reconnected(),
            EngineEvent::TransportDisconnected { reason } => self.transport.connection_lost(&reason),
            EngineEvent::InviteReceived {
                session,
                from,
                display_name,
            } => {
                if !self.registration.is_registered() {
                    info!(from = %from, "Rejecting invite while unregistered");
                    let engine = self.engine.clone();
                    let events = self.events.clone();
                    let timeout = self.call_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = with_timeout("reject", timeout, engine.reject(&session, TEMPORARILY_UNAVAILABLE)).await {
                            warn!(error = %e, "Failed to reject invite");
                        }
                        events.emit(PhoneEvent::CallRejected {
                            remote: from,
                            reason: RejectionReason::NotRegistered,
                        });
                    });
                    return;
                }
                let lines = self.lines.clone();
                tokio::spawn(async move { lines.handle_incoming(session, from, display_name).await });
            }
            EngineEvent::SessionStateChanged { session, state } => self.lines.handle_session_event(&session, state),
            EngineEvent::NotificationReceived {
                extension,
                body,
                expires,
                terminated,
            } => self.presence.handle_notification(&extension, &body, expires, terminated),
            EngineEvent::SubscriptionTerminated { extension, reason } => {
                self.presence.handle_terminated(&extension, &reason)
            }
        }
    }

    fn on_transport_signal(&self, signal: TransportSignal) {
        match signal {
            TransportSignal::Lost { reason } => {
                self.registration.invalidate(&reason);
                self.presence.invalidate_all();
                self.lines.terminate_all(TerminationReason::TransportLost);
            }
            TransportSignal::Connected => {
                let registration = self.registration.clone();
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    match registration.register().await {
                        Ok(()) => {}
                        Err(PhoneError::RegistrationFailed { .. }) => {
                            warn!("Registration failed after reconnect, closing transport");
                            let _ = transport.disconnect().await;
                        }
                        Err(e) => debug!(error = %e, "Re-registration did not complete"),
                    }
                });
            }
        }
    }

    fn on_registration_state(&mut self, state: RegistrationState) {
        let previous = std::mem::replace(&mut self.registration_state, state);
        if previous == state {
            return;
        }
        if state == RegistrationState::Registered {
            self.transport.start_heartbeat();
            self.presence.start();
            let presence = self.presence.clone();
            tokio::spawn(async move {
                let report = presence.resume().await;
                if !report.failed.is_empty() {
                    warn!(failed = report.failed.len(), "Some presence subscriptions could not be restored");
                }
            });
        } else if previous == RegistrationState::Registered {
            self.transport.stop_heartbeat();
            self.presence.invalidate_all();
        }
    }
}

/// A three-line softphone with presence and agent state
pub struct Softphone {
    events: EventBus,
    transport: Arc<TransportSupervisor>,
    registration: Arc<RegistrationController>,
    lines: Arc<LineManager>,
    presence: Arc<PresenceManager>,
    agent: Arc<AgentCoordinator>,
    presence_retries: u32,
    batch_size: usize,
    pump: CancellationToken,
}

impl Softphone {
    pub fn builder(config: PhoneConfig) -> SoftphoneBuilder {
        SoftphoneBuilder::new(config)
    }

    // ===== Events =====

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PhoneEvent> {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> EventStream {
        self.events.stream()
    }

    /// Publish a failed command and hand the error back
    fn report<T>(&self, result: PhoneResult<T>, line: Option<LineId>, extension: Option<&str>) -> PhoneResult<T> {
        if let Err(e) = &result {
            self.events.emit(PhoneEvent::Error {
                category: e.category(),
                details: e.to_string(),
                line,
                extension: extension.map(str::to_string),
            });
        }
        result
    }

    fn require_registered(&self) -> PhoneResult<()> {
        if !self.transport.is_connected() {
            return Err(PhoneError::NotConnected);
        }
        if !self.registration.is_registered() {
            return Err(PhoneError::NotRegistered);
        }
        Ok(())
    }

    // ===== Connection =====

    /// Connect and register
    ///
    /// If registration fails the transport is closed again.
    pub async fn connect(&self) -> PhoneResult<()> {
        if self.transport.is_connected() && self.registration.is_registered() {
            return Ok(());
        }
        let result = self.connect_inner().await;
        self.report(result, None, None)
    }

    async fn connect_inner(&self) -> PhoneResult<()> {
        self.transport.connect().await?;
        if let Err(e) = self.registration.register().await {
            warn!(error = %e, "Registration failed, closing transport");
            self.transport.disconnect().await?;
            return Err(e);
        }
        Ok(())
    }

    /// Hang up, release subscriptions, unregister and close the connection
    pub async fn disconnect(&self) -> PhoneResult<()> {
        info!("Disconnecting");
        self.transport.prepare_shutdown();
        self.lines.hangup_all().await;
        let unreleased = self.presence.unsubscribe_all().await;
        if !unreleased.is_empty() {
            warn!(count = unreleased.len(), "Some subscriptions could not be released");
        }
        self.registration.unregister().await;
        self.transport.disconnect().await?;
        self.lines.terminate_all(TerminationReason::LocalHangup);
        self.presence.clear();
        Ok(())
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport.state()
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.registration.state()
    }

    // ===== Calls =====

    pub async fn place_call(&self, target: &str) -> PhoneResult<CallInfo> {
        let result = match self.require_registered() {
            Ok(()) => self.lines.place_call(target).await,
            Err(e) => Err(e),
        };
        self.report(result, None, None)
    }

    pub async fn answer(&self, line: LineId) -> PhoneResult<CallInfo> {
        let result = match self.require_registered() {
            Ok(()) => self.lines.answer(line).await,
            Err(e) => Err(e),
        };
        self.report(result, Some(line), None)
    }

    pub async fn reject(&self, line: LineId) -> PhoneResult<()> {
        let result = self.lines.reject(line).await;
        self.report(result, Some(line), None)
    }

    /// Always allowed, even while unregistered
    pub async fn hangup(&self, line: LineId) -> PhoneResult<()> {
        let result = self.lines.hangup(line).await;
        self.report(result, Some(line), None)
    }

    pub async fn hold(&self, line: LineId) -> PhoneResult<()> {
        let result = match self.require_registered() {
            Ok(()) => self.lines.hold(line).await,
            Err(e) => Err(e),
        };
        self.report(result, Some(line), None)
    }

    pub async fn resume(&self, line: LineId) -> PhoneResult<()> {
        let result = match self.require_registered() {
            Ok(()) => self.lines.resume(line).await,
            Err(e) => Err(e),
        };
        self.report(result, Some(line), None)
    }

    pub async fn set_active(&self, line: LineId) -> PhoneResult<()> {
        let result = match self.require_registered() {
            Ok(()) => self.lines.set_active(line).await,
            Err(e) => Err(e),
        };
        self.report(result, Some(line), None)
    }

    pub async fn send_dtmf(&self, line: LineId, digits: &str) -> PhoneResult<()> {
        let result = match self.require_registered() {
            Ok(()) => self.lines.send_dtmf(line, digits).await,
            Err(e) => Err(e),
        };
        self.report(result, Some(line), None)
    }

    pub async fn blind_transfer(&self, line: LineId, target: &str) -> PhoneResult<()> {
        let result = match self.require_registered() {
            Ok(()) => self.lines.blind_transfer(line, target).await,
            Err(e) => Err(e),
        };
        self.report(result, Some(line), None)
    }

    pub async fn start_attended_transfer(&self, line: LineId, target: &str) -> PhoneResult<LineId> {
        let result = match self.require_registered() {
            Ok(()) => self.lines.start_attended_transfer(line, target).await,
            Err(e) => Err(e),
        };
        self.report(result, Some(line), None)
    }

    pub async fn complete_attended_transfer(&self, line: LineId) -> PhoneResult<()> {
        let result = match self.require_registered() {
            Ok(()) => self.lines.complete_attended_transfer(line).await,
            Err(e) => Err(e),
        };
        self.report(result, Some(line), None)
    }

    pub async fn cancel_attended_transfer(&self, line: LineId) -> PhoneResult<()> {
        let result = self.lines.cancel_attended_transfer(line).await;
        self.report(result, Some(line), None)
    }

    pub fn lines(&self) -> Vec<LineSnapshot> {
        self.lines.lines()
    }

    pub fn line(&self, line: LineId) -> LineSnapshot {
        self.lines.line(line)
    }

    pub fn active_line(&self) -> Option<LineId> {
        self.lines.active_line()
    }

    pub fn line_manager(&self) -> &Arc<LineManager> {
        &self.lines
    }

    // ===== Presence =====

    pub async fn subscribe_presence(&self, extension: &str) -> PhoneResult<SubscriptionInfo> {
        let result = match self.require_registered() {
            Ok(()) => self.presence.subscribe_with_retry(extension, self.presence_retries).await,
            Err(e) => Err(e),
        };
        self.report(result, None, Some(extension))
    }

    pub async fn unsubscribe_presence(&self, extension: &str) -> PhoneResult<()> {
        let result = self.presence.unsubscribe(extension).await;
        self.report(result, None, Some(extension))
    }

    pub async fn batch_subscribe_presence<I, S>(&self, extensions: I) -> PhoneResult<BatchReport>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let result = match self.require_registered() {
            Ok(()) => Ok(self.presence.batch_subscribe(extensions, self.batch_size).await),
            Err(e) => Err(e),
        };
        self.report(result, None, None)
    }

    pub fn subscription(&self, extension: &str) -> Option<SubscriptionInfo> {
        self.presence.subscription(extension)
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.presence.subscriptions()
    }

    pub fn presence_manager(&self) -> &Arc<PresenceManager> {
        &self.presence
    }

    // ===== Agent =====

    pub async fn agent_login(&self) -> PhoneResult<AgentActionOutcome> {
        let result = match self.require_registered() {
            Ok(()) => self.agent.login().await,
            Err(e) => Err(e),
        };
        self.report(result, None, None)
    }

    pub async fn agent_logout(&self) -> PhoneResult<AgentActionOutcome> {
        let result = match self.require_registered() {
            Ok(()) => self.agent.logout().await,
            Err(e) => Err(e),
        };
        self.report(result, None, None)
    }

    pub async fn agent_pause(&self, reason: Option<String>) -> PhoneResult<AgentActionOutcome> {
        let result = match self.require_registered() {
            Ok(()) => self.agent.pause(reason).await,
            Err(e) => Err(e),
        };
        self.report(result, None, None)
    }

    pub async fn agent_resume(&self) -> PhoneResult<AgentActionOutcome> {
        let result = match self.require_registered() {
            Ok(()) => self.agent.resume().await,
            Err(e) => Err(e),
        };
        self.report(result, None, None)
    }

    pub fn agent_state(&self) -> AgentState {
        self.agent.state()
    }

    pub fn agent_context(&self) -> AgentContext {
        self.agent.context()
    }
}

impl Drop for Softphone {
    fn drop(&mut self) {
        self.pump.cancel();
    }
}
