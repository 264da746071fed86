//! Per-call session state machine
//!
//! A [`Call`] lives on exactly one line from creation until it reaches
//! `Terminated`. All state changes go through [`Call::transition`], which
//! enforces the lifecycle below and leaves the call untouched when a trigger
//! does not apply:
//!
//! ```text
//! Initial ──dial/arrive──▶ Establishing ──accepted──▶ Established ◀──resume── OnHold
//!                               │                        │  │ hold ──────────▶ │
//!                               │                        │  └──transfer──┐     │
//!                               ▼                        ▼               ▼     │
//!                           Terminated ◀──────────── (any) ◀──── Transferring ◀┘
//! ```
//!
//! The talk-time accumulator only runs while the call is `Established`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use std::time::Duration;
use uuid::Uuid;

use crate::engine::SessionHandle;
use crate::error::{PhoneError, PhoneResult};
use crate::line::LineId;

/// Unique identifier for a call
pub type CallId = Uuid;

/// Lifecycle state of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    Initial,
    /// Outbound invite sent, or inbound invite waiting for the user
    Establishing,
    /// Media flowing in both directions
    Established,
    /// Remote party held by us
    OnHold,
    /// REFER sent, waiting for the outcome
    Transferring,
    Terminated,
}

impl CallState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, CallState::Terminated)
    }

    /// Connected to the remote party, whether held or not
    pub fn is_connected(&self) -> bool {
        matches!(self, CallState::Established | CallState::OnHold | CallState::Transferring)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// Why a call ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    LocalHangup,
    RemoteHangup,
    Rejected { code: u16 },
    Cancelled,
    TimedOut,
    TransportLost,
    Transferred,
    Failed { reason: String },
}

/// Events that drive [`Call::transition`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTrigger {
    /// Outbound invite sent
    Dial,
    /// Inbound invite bound to a line
    Arrive,
    /// The remote party answered our invite
    RemoteAccepted,
    /// We answered an inbound invite
    LocalAccepted,
    Hold,
    Resume,
    TransferStarted,
    TransferFailed,
    Terminate(TerminationReason),
}

impl CallTrigger {
    fn operation(&self) -> &'static str {
        match self {
            CallTrigger::Dial => "dial",
            CallTrigger::Arrive => "receive",
            CallTrigger::RemoteAccepted | CallTrigger::LocalAccepted => "accept",
            CallTrigger::Hold => "hold",
            CallTrigger::Resume => "resume",
            CallTrigger::TransferStarted => "transfer",
            CallTrigger::TransferFailed => "revert transfer of",
            CallTrigger::Terminate(_) => "terminate",
        }
    }
}

/// Role of a call in an attended transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferRole {
    /// The held call being transferred, consulting on `consultation`
    Original { consultation: LineId },
    /// The consultation call placed on behalf of `original`
    Consultation { original: LineId },
}

/// One call occupying a line
#[derive(Debug, Clone)]
pub struct Call {
    id: CallId,
    line: LineId,
    direction: CallDirection,
    remote: String,
    display_name: Option<String>,
    session: Option<SessionHandle>,
    state: CallState,
    remote_ringing: bool,
    created_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    talk_time: Duration,
    established_since: Option<Instant>,
    termination: Option<TerminationReason>,
    transfer: Option<TransferRole>,
    state_before_transfer: Option<CallState>,
}

impl Call {
    pub fn outbound(line: LineId, remote: impl Into<String>) -> Self {
        Self::new(line, CallDirection::Outbound, remote.into(), None, None)
    }

    pub fn inbound(
        line: LineId,
        session: SessionHandle,
        remote: impl Into<String>,
        display_name: Option<String>,
    ) -> Self {
        Self::new(line, CallDirection::Inbound, remote.into(), display_name, Some(session))
    }

    fn new(
        line: LineId,
        direction: CallDirection,
        remote: String,
        display_name: Option<String>,
        session: Option<SessionHandle>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            line,
            direction,
            remote,
            display_name,
            session,
            state: CallState::Initial,
            remote_ringing: false,
            created_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            talk_time: Duration::ZERO,
            established_since: None,
            termination: None,
            transfer: None,
            state_before_transfer: None,
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn line(&self) -> LineId {
        self.line
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }

    pub fn set_session(&mut self, session: SessionHandle) {
        self.session = Some(session);
    }

    pub fn set_remote_ringing(&mut self) {
        self.remote_ringing = true;
    }

    pub fn termination(&self) -> Option<&TerminationReason> {
        self.termination.as_ref()
    }

    pub fn transfer(&self) -> Option<TransferRole> {
        self.transfer
    }

    pub fn set_transfer(&mut self, role: Option<TransferRole>) {
        self.transfer = role;
    }

    /// Apply `trigger`, returning the new state
    pub fn transition(&mut self, trigger: CallTrigger) -> PhoneResult<CallState> {
        let next = match (self.state, &trigger) {
            (CallState::Terminated, _) => None,
            (_, CallTrigger::Terminate(_)) => Some(CallState::Terminated),

            (CallState::Initial, CallTrigger::Dial) if self.direction == CallDirection::Outbound => {
                Some(CallState::Establishing)
            }
            (CallState::Initial, CallTrigger::Arrive) if self.direction == CallDirection::Inbound => {
                Some(CallState::Establishing)
            }

            (CallState::Establishing, CallTrigger::RemoteAccepted)
                if self.direction == CallDirection::Outbound =>
            {
                Some(CallState::Established)
            }
            (CallState::Establishing, CallTrigger::LocalAccepted)
                if self.direction == CallDirection::Inbound =>
            {
                Some(CallState::Established)
            }

            (CallState::Established, CallTrigger::Hold) => Some(CallState::OnHold),
            (CallState::OnHold, CallTrigger::Resume) => Some(CallState::Established),

            (CallState::Established | CallState::OnHold, CallTrigger::TransferStarted) => {
                Some(CallState::Transferring)
            }
            (CallState::Transferring, CallTrigger::TransferFailed) => {
                Some(self.state_before_transfer.unwrap_or(CallState::OnHold))
            }

            _ => None,
        };

        let Some(next) = next else {
            return Err(PhoneError::InvalidCallState {
                line: self.line,
                state: self.state,
                operation: trigger.operation(),
            });
        };

        let now = Instant::now();
        if self.state == CallState::Established && next != CallState::Established {
            if let Some(since) = self.established_since.take() {
                self.talk_time += now.saturating_duration_since(since);
            }
        }
        if next == CallState::Established && self.state != CallState::Established {
            self.established_since = Some(now);
            if self.connected_at.is_none() {
                self.connected_at = Some(Utc::now());
            }
        }

        match trigger {
            CallTrigger::TransferStarted => self.state_before_transfer = Some(self.state),
            CallTrigger::TransferFailed => self.state_before_transfer = None,
            CallTrigger::Terminate(reason) => {
                self.termination = Some(reason);
                self.ended_at = Some(Utc::now());
                self.transfer = None;
            }
            _ => {}
        }

        self.state = next;
        Ok(next)
    }

    /// Accumulated talk time, including the current established stretch
    pub fn duration(&self) -> Duration {
        match self.established_since {
            Some(since) => self.talk_time + Instant::now().saturating_duration_since(since),
            None => self.talk_time,
        }
    }

    pub fn info(&self) -> CallInfo {
        CallInfo {
            call_id: self.id,
            line: self.line,
            direction: self.direction,
            remote: self.remote.clone(),
            display_name: self.display_name.clone(),
            state: self.state,
            remote_ringing: self.remote_ringing,
            created_at: self.created_at,
            connected_at: self.connected_at,
            ended_at: self.ended_at,
            duration: self.duration(),
            termination: self.termination.clone(),
            transfer: self.transfer,
        }
    }
}

/// Point-in-time snapshot of a [`Call`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallInfo {
    pub call_id: CallId,
    pub line: LineId,
    pub direction: CallDirection,
    pub remote: String,
    pub display_name: Option<String>,
    pub state: CallState,
    pub remote_ringing: bool,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Duration,
    pub termination: Option<TerminationReason>,
    pub transfer: Option<TransferRole>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: u8) -> LineId {
        LineId::new(n).unwrap()
    }

    fn established_outbound() -> Call {
        let mut call = Call::outbound(line(1), "sip:bob@example.com");
        call.transition(CallTrigger::Dial).unwrap();
        call.transition(CallTrigger::RemoteAccepted).unwrap();
        call
    }

    #[test]
    fn test_outbound_lifecycle() {
        let mut call = established_outbound();
        assert_eq!(call.state(), CallState::Established);
        assert_eq!(call.transition(CallTrigger::Hold).unwrap(), CallState::OnHold);
        assert_eq!(call.transition(CallTrigger::Resume).unwrap(), CallState::Established);
        assert_eq!(
            call.transition(CallTrigger::Terminate(TerminationReason::LocalHangup)).unwrap(),
            CallState::Terminated
        );
        assert_eq!(call.termination(), Some(&TerminationReason::LocalHangup));
    }

    #[test]
    fn test_direction_specific_accept() {
        let mut outbound = Call::outbound(line(1), "200");
        outbound.transition(CallTrigger::Dial).unwrap();
        assert!(outbound.transition(CallTrigger::LocalAccepted).is_err());

        let mut inbound = Call::inbound(line(2), SessionHandle::new("s1"), "300", None);
        assert!(inbound.transition(CallTrigger::Dial).is_err());
        inbound.transition(CallTrigger::Arrive).unwrap();
        assert!(inbound.transition(CallTrigger::RemoteAccepted).is_err());
        assert_eq!(inbound.transition(CallTrigger::LocalAccepted).unwrap(), CallState::Established);
    }

    #[test]
    fn test_terminated_is_absorbing() {
        let mut call = established_outbound();
        call.transition(CallTrigger::Terminate(TerminationReason::RemoteHangup)).unwrap();

        let err = call.transition(CallTrigger::Resume).unwrap_err();
        assert!(matches!(
            err,
            PhoneError::InvalidCallState { state: CallState::Terminated, operation: "resume", .. }
        ));
        assert!(call.transition(CallTrigger::Terminate(TerminationReason::LocalHangup)).is_err());
        assert_eq!(call.termination(), Some(&TerminationReason::RemoteHangup));
    }

    #[test]
    fn test_invalid_trigger_leaves_state() {
        let mut call = established_outbound();
        assert!(call.transition(CallTrigger::Resume).is_err());
        assert_eq!(call.state(), CallState::Established);
    }

    #[test]
    fn test_failed_transfer_restores_prior_state() {
        let mut call = established_outbound();
        call.transition(CallTrigger::Hold).unwrap();
        call.transition(CallTrigger::TransferStarted).unwrap();
        assert_eq!(call.transition(CallTrigger::TransferFailed).unwrap(), CallState::OnHold);

        call.transition(CallTrigger::Resume).unwrap();
        call.transition(CallTrigger::TransferStarted).unwrap();
        assert_eq!(call.transition(CallTrigger::TransferFailed).unwrap(), CallState::Established);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_only_counts_established_time() {
        let mut call = Call::outbound(line(1), "200");
        call.transition(CallTrigger::Dial).unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(call.duration(), Duration::ZERO);

        call.transition(CallTrigger::RemoteAccepted).unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        call.transition(CallTrigger::Hold).unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(call.duration(), Duration::from_secs(10));

        call.transition(CallTrigger::Resume).unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        call.transition(CallTrigger::Terminate(TerminationReason::LocalHangup)).unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(call.duration(), Duration::from_secs(15));
        assert!(call.info().connected_at.is_some());
    }
}
