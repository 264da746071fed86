//! Call-center agent state
//!
//! Queue actions (login, logout, pause, resume) go to the administrative API
//! first. When it is missing or fails, the configured feature code is dialed
//! on a background line so an active conversation is never disturbed. With no
//! free line the action is aborted and the state reverts.
//!
//! The coordinator also follows call activity: an agent who is available or
//! paused goes on-call while any call is established and returns to the
//! previous state when the last one ends.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::engine::SignalingEngine;
use crate::error::{AdminApiError, PhoneError, PhoneResult};
use crate::events::{EventBus, PhoneEvent};
use crate::line::{CallActivityListener, LineId, LineManager};
use crate::recovery::with_timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AgentState {
    #[default]
    LoggedOut,
    LoggingIn,
    Available,
    Pausing,
    Paused,
    OnCall,
}

impl AgentState {
    /// States an on-call agent returns to
    fn is_resting(&self) -> bool {
        matches!(self, AgentState::Available | AgentState::Paused)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentAction {
    Login,
    Logout,
    Pause { reason: Option<String> },
    Resume,
}

impl AgentAction {
    pub fn name(&self) -> &'static str {
        match self {
            AgentAction::Login => "login",
            AgentAction::Logout => "logout",
            AgentAction::Pause { .. } => "pause",
            AgentAction::Resume => "resume",
        }
    }

    fn target(&self) -> AgentState {
        match self {
            AgentAction::Login | AgentAction::Resume => AgentState::Available,
            AgentAction::Logout => AgentState::LoggedOut,
            AgentAction::Pause { .. } => AgentState::Paused,
        }
    }
}

impl fmt::Display for AgentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a queue action reached the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentActionOutcome {
    ViaApi,
    ViaSignal { line: LineId },
    /// The API failed and no background line was free
    AbortedNoCapacity,
}

/// Administrative queue API of the call center
#[async_trait]
pub trait AgentAdminApi: Send + Sync {
    async fn execute(&self, agent_id: &str, action: &AgentAction) -> Result<(), AdminApiError>;
}

/// Snapshot of the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentContext {
    pub agent_id: Option<String>,
    pub state: AgentState,
    pub pause_reason: Option<String>,
    /// State restored when the last call ends
    pub previous_state: Option<AgentState>,
}

struct AgentInner {
    state: AgentState,
    pause_reason: Option<String>,
    previous_state: Option<AgentState>,
    established: HashSet<LineId>,
    action_in_flight: bool,
}

struct ActionGuard<'a>(&'a AgentCoordinator);

impl Drop for ActionGuard<'_> {
    fn drop(&mut self) {
        self.0.inner.lock().action_in_flight = false;
    }
}

pub struct AgentCoordinator {
    engine: Arc<dyn SignalingEngine>,
    lines: Arc<LineManager>,
    api: Option<Arc<dyn AgentAdminApi>>,
    config: AgentConfig,
    agent_id: Option<String>,
    events: EventBus,
    inner: Mutex<AgentInner>,
}

impl AgentCoordinator {
    pub fn new(
        engine: Arc<dyn SignalingEngine>,
        lines: Arc<LineManager>,
        api: Option<Arc<dyn AgentAdminApi>>,
        config: AgentConfig,
        agent_id: Option<String>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            lines,
            api,
            config,
            agent_id,
            events,
            inner: Mutex::new(AgentInner {
                state: AgentState::LoggedOut,
                pause_reason: None,
                previous_state: None,
                established: HashSet::new(),
                action_in_flight: false,
            }),
        })
    }

    pub fn state(&self) -> AgentState {
        self.inner.lock().state
    }

    pub fn context(&self) -> AgentContext {
        let inner = self.inner.lock();
        AgentContext {
            agent_id: self.agent_id.clone(),
            state: inner.state,
            pause_reason: inner.pause_reason.clone(),
            previous_state: inner.previous_state,
        }
    }

    fn emit_change(&self, previous: AgentState, current: AgentState) {
        if previous != current {
            info!(?previous, ?current, "Agent state changed");
            self.events.emit(PhoneEvent::AgentStateChanged { previous, current });
        }
    }

    pub async fn login(&self) -> PhoneResult<AgentActionOutcome> {
        Self::require_delivered(self.perform(AgentAction::Login).await)
    }

    pub async fn logout(&self) -> PhoneResult<AgentActionOutcome> {
        Self::require_delivered(self.perform(AgentAction::Logout).await)
    }

    pub async fn pause(&self, reason: Option<String>) -> PhoneResult<AgentActionOutcome> {
        Self::require_delivered(self.perform(AgentAction::Pause { reason }).await)
    }

    pub async fn resume(&self) -> PhoneResult<AgentActionOutcome> {
        Self::require_delivered(self.perform(AgentAction::Resume).await)
    }

    fn require_delivered(outcome: PhoneResult<AgentActionOutcome>) -> PhoneResult<AgentActionOutcome> {
        match outcome? {
            AgentActionOutcome::AbortedNoCapacity => Err(PhoneError::NoCapacity { resource: "line" }),
            delivered => Ok(delivered),
        }
    }

    fn validate(state: AgentState, action: &AgentAction) -> PhoneResult<()> {
        let allowed = match action {
            AgentAction::Login => state == AgentState::LoggedOut,
            AgentAction::Logout => matches!(state, AgentState::Available | AgentState::Paused | AgentState::OnCall),
            AgentAction::Pause { .. } => matches!(state, AgentState::Available | AgentState::OnCall),
            AgentAction::Resume => matches!(state, AgentState::Paused | AgentState::OnCall),
        };
        if allowed {
            Ok(())
        } else {
            Err(PhoneError::InvalidAgentState {
                state,
                action: action.name(),
            })
        }
    }

    /// Run one queue action, API first with in-band fallback
    ///
    /// Returns the delivery path. `AbortedNoCapacity` leaves the agent in the
    /// state it had before the call.
    pub async fn perform(&self, action: AgentAction) -> PhoneResult<AgentActionOutcome> {
        let agent_id = self
            .agent_id
            .clone()
            .ok_or_else(|| PhoneError::invalid_configuration("agent.agent_id", "no agent id configured"))?;

        let (original, transient) = {
            let mut inner = self.inner.lock();
            if inner.action_in_flight {
                return Err(PhoneError::in_progress("agent action"));
            }
            Self::validate(inner.state, &action)?;
            if inner.state == AgentState::OnCall {
                if let AgentAction::Resume = action {
                    if inner.previous_state != Some(AgentState::Paused) {
                        return Err(PhoneError::InvalidAgentState {
                            state: AgentState::OnCall,
                            action: action.name(),
                        });
                    }
                }
            }
            inner.action_in_flight = true;
            let original = inner.state;
            let transient = match (&action, original) {
                (_, AgentState::OnCall) => None,
                (AgentAction::Login, _) => Some(AgentState::LoggingIn),
                (AgentAction::Pause { .. }, _) => Some(AgentState::Pausing),
                _ => None,
            };
            if let Some(transient) = transient {
                inner.state = transient;
            }
            (original, transient)
        };
        let _guard = ActionGuard(self);
        if let Some(transient) = transient {
            self.emit_change(original, transient);
        }

        info!(agent_id = %agent_id, action = %action, "Agent action");
        let delivery = self.deliver(&agent_id, &action).await;

        match delivery {
            Ok(AgentActionOutcome::AbortedNoCapacity) => {
                warn!(action = %action, "No background line for agent action, aborting");
                self.revert(transient, original);
                self.events.emit(PhoneEvent::AgentActionCompleted {
                    action,
                    outcome: AgentActionOutcome::AbortedNoCapacity,
                });
                Ok(AgentActionOutcome::AbortedNoCapacity)
            }
            Ok(outcome) => {
                self.complete(&action);
                debug!(action = %action, ?outcome, "Agent action delivered");
                self.events.emit(PhoneEvent::AgentActionCompleted { action, outcome });
                Ok(outcome)
            }
            Err(e) => {
                warn!(action = %action, error = %e, "Agent action failed");
                self.revert(transient, original);
                Err(e)
            }
        }
    }

    async fn deliver(&self, agent_id: &str, action: &AgentAction) -> PhoneResult<AgentActionOutcome> {
        if let Some(api) = &self.api {
            match with_timeout("agent api", self.config.api_timeout(), api.execute(agent_id, action)).await {
                Ok(()) => return Ok(AgentActionOutcome::ViaApi),
                Err(e) => warn!(action = %action, error = %e, "Admin API failed, falling back to in-band signal"),
            }
        }

        let sequence = self.sequence_for(agent_id, action);
        let engine = self.engine.clone();
        let timeout = self.config.api_timeout();
        let sent = self
            .lines
            .with_background_line(|line| async move {
                debug!(line = %line, sequence = %sequence, "Sending in-band agent signal");
                with_timeout("in-band signal", timeout, engine.send_in_band_signal(line, &sequence))
                    .await
                    .map(|()| line)
            })
            .await;

        match sent {
            None => Ok(AgentActionOutcome::AbortedNoCapacity),
            Some(Ok(line)) => Ok(AgentActionOutcome::ViaSignal { line }),
            Some(Err(e)) => Err(e),
        }
    }

    fn sequence_for(&self, agent_id: &str, action: &AgentAction) -> String {
        let (template, reason) = match action {
            AgentAction::Login => (&self.config.login_sequence, None),
            AgentAction::Logout => (&self.config.logout_sequence, None),
            AgentAction::Pause { reason } => (&self.config.pause_sequence, reason.as_deref()),
            AgentAction::Resume => (&self.config.resume_sequence, None),
        };
        template
            .replace("{agent}", agent_id)
            .replace("{reason}", reason.unwrap_or_default())
    }

    fn revert(&self, transient: Option<AgentState>, original: AgentState) {
        let Some(transient) = transient else {
            return;
        };
        let reverted = {
            let mut inner = self.inner.lock();
            if inner.state == transient {
                inner.state = original;
                true
            } else {
                false
            }
        };
        if reverted {
            self.emit_change(transient, original);
        }
    }

    fn complete(&self, action: &AgentAction) {
        let target = action.target();
        let (previous, current) = {
            let mut inner = self.inner.lock();
            match action {
                AgentAction::Pause { reason } => inner.pause_reason = reason.clone(),
                _ => inner.pause_reason = None,
            }
            let previous = inner.state;

            if previous == AgentState::OnCall && target.is_resting() {
                inner.previous_state = Some(target);
            } else if target.is_resting() && !inner.established.is_empty() {
                inner.previous_state = Some(target);
                inner.state = AgentState::OnCall;
            } else {
                inner.state = target;
                if target == AgentState::LoggedOut {
                    inner.previous_state = None;
                }
            }
            (previous, inner.state)
        };
        self.emit_change(previous, current);
    }
}

impl CallActivityListener for AgentCoordinator {
    fn call_established(&self, line: LineId) {
        let change = {
            let mut inner = self.inner.lock();
            inner.established.insert(line);
            if inner.state.is_resting() {
                let previous = inner.state;
                inner.previous_state = Some(previous);
                inner.state = AgentState::OnCall;
                Some(previous)
            } else {
                None
            }
        };
        if let Some(previous) = change {
            self.emit_change(previous, AgentState::OnCall);
        }
    }

    fn call_ended(&self, line: LineId) {
        let change = {
            let mut inner = self.inner.lock();
            inner.established.remove(&line);
            if inner.established.is_empty() && inner.state == AgentState::OnCall {
                let restored = inner.previous_state.take().unwrap_or(AgentState::Available);
                inner.state = restored;
                Some(restored)
            } else {
                None
            }
        };
        if let Some(restored) = change {
            self.emit_change(AgentState::OnCall, restored);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CallConfig;
    use crate::mock::MockEngine;
    use crate::timer::TimerScope;

    fn coordinator(agent_id: Option<&str>) -> Arc<AgentCoordinator> {
        let engine = Arc::new(MockEngine::new());
        let lines = LineManager::new(
            engine.clone(),
            CallConfig::default(),
            EventBus::default(),
            Arc::new(TimerScope::new("test")),
        );
        AgentCoordinator::new(
            engine,
            lines,
            None,
            AgentConfig::default(),
            agent_id.map(str::to_string),
            EventBus::default(),
        )
    }

    #[test]
    fn test_sequence_templating() {
        let agent = coordinator(Some("4001"));
        assert_eq!(agent.sequence_for("4001", &AgentAction::Login), "*454001#");
        assert_eq!(
            agent.sequence_for("4001", &AgentAction::Pause { reason: Some("2".into()) }),
            "*474001*2#"
        );
        assert_eq!(agent.sequence_for("4001", &AgentAction::Pause { reason: None }), "*474001*#");
    }

    #[test]
    fn test_transition_validation() {
        assert!(AgentCoordinator::validate(AgentState::LoggedOut, &AgentAction::Login).is_ok());
        assert!(AgentCoordinator::validate(AgentState::Available, &AgentAction::Login).is_err());
        assert!(AgentCoordinator::validate(AgentState::LoggedOut, &AgentAction::Pause { reason: None }).is_err());
        assert!(AgentCoordinator::validate(AgentState::Paused, &AgentAction::Resume).is_ok());
    }

    #[tokio::test]
    async fn test_missing_agent_id_is_a_configuration_error() {
        let agent = coordinator(None);
        assert!(matches!(
            agent.login().await,
            Err(PhoneError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_auto_on_call_restores_previous_state() {
        let agent = coordinator(Some("4001"));
        agent.inner.lock().state = AgentState::Paused;
        let line = LineId::new(1).unwrap();

        agent.call_established(line);
        assert_eq!(agent.state(), AgentState::OnCall);
        agent.call_ended(line);
        assert_eq!(agent.state(), AgentState::Paused);
    }
}
