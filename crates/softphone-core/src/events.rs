//! Event system for the softphone
//!
//! Every component publishes onto one [`EventBus`]. UI collaborators either take a
//! raw [`broadcast::Receiver`] with [`EventBus::subscribe`] or a `Stream` with
//! [`EventBus::stream`]. A slow subscriber lags and skips events. It never
//! blocks the engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use crate::agent::{AgentAction, AgentActionOutcome, AgentState};
use crate::call::CallInfo;
use crate::error::ErrorCategory;
use crate::line::{LineId, LineSnapshot};
use crate::presence::{PresenceValue, SubscriptionStatus};
use crate::registration::RegistrationState;
use crate::transport::TransportState;

/// Why an incoming call was refused without reaching a line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    /// All lines were occupied
    NoCapacity,
    /// The invite arrived while not registered
    NotRegistered,
}

/// Events emitted by the softphone
#[derive(Debug, Clone, PartialEq)]
pub enum PhoneEvent {
    // Transport events
    TransportStateChanged {
        previous: TransportState,
        current: TransportState,
    },
    ReconnectionAttempting {
        attempt: u32,
        delay: Duration,
    },
    /// Reconnect attempts exhausted; the transport stays down
    ReconnectionFailed {
        attempts: u32,
    },

    // Registration events
    RegistrationStateChanged {
        previous: RegistrationState,
        current: RegistrationState,
    },
    /// Emitted once per exhausted registration run
    RegistrationFailed {
        attempts: u32,
        reason: String,
    },

    // Line and call events
    LineStateChanged(LineSnapshot),
    ActiveLineChanged {
        previous: Option<LineId>,
        current: Option<LineId>,
    },
    CallStateChanged(CallInfo),
    IncomingCall {
        line: LineId,
        call: CallInfo,
    },
    CallRejected {
        remote: String,
        reason: RejectionReason,
    },

    // Presence events
    PresenceChanged {
        extension: String,
        previous: PresenceValue,
        current: PresenceValue,
    },
    SubscriptionStatusChanged {
        extension: String,
        previous: Option<SubscriptionStatus>,
        current: SubscriptionStatus,
    },
    SubscriptionFailed {
        extension: String,
        attempts: u32,
        reason: String,
    },
    /// No notification within the staleness threshold
    SubscriptionStale {
        extension: String,
        silent_for: Duration,
    },
    SubscriptionRemoved {
        extension: String,
    },

    // Agent events
    AgentStateChanged {
        previous: AgentState,
        current: AgentState,
    },
    AgentActionCompleted {
        action: AgentAction,
        outcome: AgentActionOutcome,
    },

    /// A command failed
    Error {
        category: ErrorCategory,
        details: String,
        line: Option<LineId>,
        extension: Option<String>,
    },
}

impl PhoneEvent {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            PhoneEvent::TransportStateChanged { .. } => "transport_state_changed",
            PhoneEvent::ReconnectionAttempting { .. } => "reconnection_attempting",
            PhoneEvent::ReconnectionFailed { .. } => "reconnection_failed",
            PhoneEvent::RegistrationStateChanged { .. } => "registration_state_changed",
            PhoneEvent::RegistrationFailed { .. } => "registration_failed",
            PhoneEvent::LineStateChanged(_) => "line_state_changed",
            PhoneEvent::ActiveLineChanged { .. } => "active_line_changed",
            PhoneEvent::CallStateChanged(_) => "call_state_changed",
            PhoneEvent::IncomingCall { .. } => "incoming_call",
            PhoneEvent::CallRejected { .. } => "call_rejected",
            PhoneEvent::PresenceChanged { .. } => "presence_changed",
            PhoneEvent::SubscriptionStatusChanged { .. } => "subscription_status_changed",
            PhoneEvent::SubscriptionFailed { .. } => "subscription_failed",
            PhoneEvent::SubscriptionStale { .. } => "subscription_stale",
            PhoneEvent::SubscriptionRemoved { .. } => "subscription_removed",
            PhoneEvent::AgentStateChanged { .. } => "agent_state_changed",
            PhoneEvent::AgentActionCompleted { .. } => "agent_action_completed",
            PhoneEvent::Error { .. } => "error",
        }
    }
}

/// Stream of phone events
pub type EventStream = BroadcastStream<PhoneEvent>;

/// Broadcast hub shared by all components
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PhoneEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: PhoneEvent) {
        trace!(event = event.name(), "Publishing event");
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PhoneEvent> {
        self.sender.subscribe()
    }

    pub fn stream(&self) -> EventStream {
        BroadcastStream::new(self.sender.subscribe())
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_stream_receives_published_events() {
        let bus = EventBus::new(8);
        let mut stream = bus.stream();

        bus.emit(PhoneEvent::ReconnectionFailed { attempts: 3 });

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event, PhoneEvent::ReconnectionFailed { attempts: 3 });
        assert_eq!(event.name(), "reconnection_failed");
    }

    #[test]
    fn test_emit_without_receivers_is_silent() {
        let bus = EventBus::default();
        bus.emit(PhoneEvent::ReconnectionFailed { attempts: 1 });
        assert_eq!(bus.receiver_count(), 0);
    }
}
