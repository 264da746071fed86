//! In-memory [`SignalingEngine`] for tests and the simulator
//!
//! `MockEngine` records every request with the (tokio) instant it was made,
//! answers successfully by default, and can be scripted to fail, to fail for a
//! single subscription target, or to never answer at all. Remote activity is
//! injected with [`MockEngine::emit`].
//!
//! ```rust
//! # use rvoip_softphone_core::mock::{MockEngine, MockOp};
//! # use rvoip_softphone_core::EngineError;
//! let engine = MockEngine::new();
//! engine.fail_times(MockOp::Register, 2, EngineError::Timeout);
//! assert_eq!(engine.count(MockOp::Register), 0);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::trace;

use crate::config::Credentials;
use crate::engine::{
    EngineEvent, MediaOptions, RegisterOutcome, Renegotiation, SessionHandle, SignalingEngine,
    SubscribeOutcome, SubscriptionHandle,
};
use crate::error::EngineError;
use crate::line::LineId;

/// Kinds of engine requests, used to script failures and count calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Connect,
    Disconnect,
    Ping,
    Register,
    Unregister,
    Invite,
    Accept,
    Reject,
    Terminate,
    Renegotiate,
    Refer,
    SendDtmf,
    Subscribe,
    Unsubscribe,
    InBandSignal,
}

/// One recorded engine request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Connect { server_uri: String },
    Disconnect,
    Ping,
    Register { username: String },
    Unregister,
    Invite { target: String, session: SessionHandle },
    Accept { session: SessionHandle },
    Reject { session: SessionHandle, code: u16 },
    Terminate { session: SessionHandle },
    Renegotiate { session: SessionHandle, direction: Renegotiation },
    Refer { session: SessionHandle, target: String, replaces: Option<SessionHandle> },
    SendDtmf { session: SessionHandle, digits: String },
    Subscribe { target: String, event_package: String },
    Unsubscribe { handle: SubscriptionHandle },
    InBandSignal { line: LineId, sequence: String },
}

impl EngineCall {
    pub fn op(&self) -> MockOp {
        match self {
            EngineCall::Connect { .. } => MockOp::Connect,
            EngineCall::Disconnect => MockOp::Disconnect,
            EngineCall::Ping => MockOp::Ping,
            EngineCall::Register { .. } => MockOp::Register,
            EngineCall::Unregister => MockOp::Unregister,
            EngineCall::Invite { .. } => MockOp::Invite,
            EngineCall::Accept { .. } => MockOp::Accept,
            EngineCall::Reject { .. } => MockOp::Reject,
            EngineCall::Terminate { .. } => MockOp::Terminate,
            EngineCall::Renegotiate { .. } => MockOp::Renegotiate,
            EngineCall::Refer { .. } => MockOp::Refer,
            EngineCall::SendDtmf { .. } => MockOp::SendDtmf,
            EngineCall::Subscribe { .. } => MockOp::Subscribe,
            EngineCall::Unsubscribe { .. } => MockOp::Unsubscribe,
            EngineCall::InBandSignal { .. } => MockOp::InBandSignal,
        }
    }
}

#[derive(Default)]
struct MockState {
    calls: Vec<(Instant, EngineCall)>,
    queued_failures: HashMap<MockOp, VecDeque<EngineError>>,
    persistent_failures: HashMap<MockOp, EngineError>,
    subscribe_failures: HashMap<String, VecDeque<EngineError>>,
    hanging: HashSet<MockOp>,
    register_expires: Option<u32>,
    subscribe_expires: Option<u32>,
}

pub struct MockEngine {
    state: Mutex<MockState>,
    events: broadcast::Sender<EngineEvent>,
    next_id: AtomicU64,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(MockState::default()),
            events,
            next_id: AtomicU64::new(1),
        }
    }

    /// Fail the next call of `op`
    pub fn fail_next(&self, op: MockOp, error: EngineError) {
        self.fail_times(op, 1, error);
    }

    /// Fail the next `times` calls of `op`
    pub fn fail_times(&self, op: MockOp, times: usize, error: EngineError) {
        let mut state = self.state.lock();
        let queue = state.queued_failures.entry(op).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// Fail every call of `op` until [`clear_failures`](Self::clear_failures)
    pub fn fail_always(&self, op: MockOp, error: EngineError) {
        self.state.lock().persistent_failures.insert(op, error);
    }

    /// Fail the next `times` subscriptions to `target`
    pub fn fail_subscribe_for(&self, target: &str, times: usize, error: EngineError) {
        let mut state = self.state.lock();
        let queue = state.subscribe_failures.entry(target.to_string()).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    pub fn clear_failures(&self, op: MockOp) {
        let mut state = self.state.lock();
        state.queued_failures.remove(&op);
        state.persistent_failures.remove(&op);
    }

    /// Never answer calls of `op`
    pub fn hang(&self, op: MockOp) {
        self.state.lock().hanging.insert(op);
    }

    pub fn unhang(&self, op: MockOp) {
        self.state.lock().hanging.remove(&op);
    }

    pub fn set_register_expires(&self, expires: Option<u32>) {
        self.state.lock().register_expires = expires;
    }

    pub fn set_subscribe_expires(&self, expires: Option<u32>) {
        self.state.lock().subscribe_expires = expires;
    }

    /// Inject an unsolicited engine event
    pub fn emit(&self, event: EngineEvent) {
        trace!(?event, "Mock engine emitting event");
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.iter().map(|(_, call)| call.clone()).collect()
    }

    pub fn timed_calls(&self) -> Vec<(Instant, EngineCall)> {
        self.state.lock().calls.clone()
    }

    pub fn calls_of(&self, op: MockOp) -> Vec<EngineCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(_, call)| call.op() == op)
            .map(|(_, call)| call.clone())
            .collect()
    }

    /// Instants at which `op` was requested
    pub fn instants_of(&self, op: MockOp) -> Vec<Instant> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(_, call)| call.op() == op)
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn count(&self, op: MockOp) -> usize {
        self.state.lock().calls.iter().filter(|(_, call)| call.op() == op).count()
    }

    pub fn subscribe_count(&self, target: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(_, call)| matches!(call, EngineCall::Subscribe { target: t, .. } if t == target))
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Session created by the most recent invite
    pub fn last_invited_session(&self) -> Option<SessionHandle> {
        self.state.lock().calls.iter().rev().find_map(|(_, call)| match call {
            EngineCall::Invite { session, .. } => Some(session.clone()),
            _ => None,
        })
    }

    fn next_handle(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Record `call` and decide how it is answered
    async fn handle(&self, call: EngineCall) -> Result<(), EngineError> {
        let op = call.op();
        let outcome = {
            let mut state = self.state.lock();
            let target_failure = match &call {
                EngineCall::Subscribe { target, .. } => state
                    .subscribe_failures
                    .get_mut(target)
                    .and_then(|queue| queue.pop_front()),
                _ => None,
            };
            state.calls.push((Instant::now(), call));

            if state.hanging.contains(&op) {
                None
            } else if let Some(error) = target_failure {
                Some(Err(error))
            } else if let Some(error) = state.queued_failures.get_mut(&op).and_then(|q| q.pop_front()) {
                Some(Err(error))
            } else if let Some(error) = state.persistent_failures.get(&op) {
                Some(Err(error.clone()))
            } else {
                Some(Ok(()))
            }
        };

        match outcome {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

#[async_trait]
impl SignalingEngine for MockEngine {
    async fn connect(&self, server_uri: &str) -> Result<(), EngineError> {
        self.handle(EngineCall::Connect { server_uri: server_uri.to_string() }).await
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        self.handle(EngineCall::Disconnect).await
    }

    async fn ping(&self) -> Result<(), EngineError> {
        self.handle(EngineCall::Ping).await
    }

    async fn register(&self, credentials: &Credentials) -> Result<RegisterOutcome, EngineError> {
        self.handle(EngineCall::Register { username: credentials.username.clone() }).await?;
        Ok(RegisterOutcome {
            expires: self.state.lock().register_expires,
        })
    }

    async fn unregister(&self) -> Result<(), EngineError> {
        self.handle(EngineCall::Unregister).await
    }

    async fn invite(&self, target: &str, _media: MediaOptions) -> Result<SessionHandle, EngineError> {
        let session = SessionHandle::new(self.next_handle("session"));
        self.handle(EngineCall::Invite {
            target: target.to_string(),
            session: session.clone(),
        })
        .await?;
        Ok(session)
    }

    async fn accept(&self, session: &SessionHandle, _media: MediaOptions) -> Result<(), EngineError> {
        self.handle(EngineCall::Accept { session: session.clone() }).await
    }

    async fn reject(&self, session: &SessionHandle, code: u16) -> Result<(), EngineError> {
        self.handle(EngineCall::Reject { session: session.clone(), code }).await
    }

    async fn terminate(&self, session: &SessionHandle) -> Result<(), EngineError> {
        self.handle(EngineCall::Terminate { session: session.clone() }).await
    }

    async fn renegotiate(&self, session: &SessionHandle, direction: Renegotiation) -> Result<(), EngineError> {
        self.handle(EngineCall::Renegotiate {
            session: session.clone(),
            direction,
        })
        .await
    }

    async fn refer(
        &self,
        session: &SessionHandle,
        target: &str,
        replaces: Option<&SessionHandle>,
    ) -> Result<(), EngineError> {
        self.handle(EngineCall::Refer {
            session: session.clone(),
            target: target.to_string(),
            replaces: replaces.cloned(),
        })
        .await
    }

    async fn send_dtmf(&self, session: &SessionHandle, digits: &str) -> Result<(), EngineError> {
        self.handle(EngineCall::SendDtmf {
            session: session.clone(),
            digits: digits.to_string(),
        })
        .await
    }

    async fn subscribe(&self, target: &str, event_package: &str) -> Result<SubscribeOutcome, EngineError> {
        self.handle(EngineCall::Subscribe {
            target: target.to_string(),
            event_package: event_package.to_string(),
        })
        .await?;
        Ok(SubscribeOutcome {
            handle: SubscriptionHandle::new(self.next_handle(&format!("sub-{}", target))),
            expires: self.state.lock().subscribe_expires,
        })
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), EngineError> {
        self.handle(EngineCall::Unsubscribe { handle: handle.clone() }).await
    }

    async fn send_in_band_signal(&self, line: LineId, sequence: &str) -> Result<(), EngineError> {
        self.handle(EngineCall::InBandSignal {
            line,
            sequence: sequence.to_string(),
        })
        .await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let engine = MockEngine::new();
        engine.fail_times(MockOp::Ping, 2, EngineError::Timeout);

        assert_eq!(engine.ping().await, Err(EngineError::Timeout));
        assert_eq!(engine.ping().await, Err(EngineError::Timeout));
        assert_eq!(engine.ping().await, Ok(()));
        assert_eq!(engine.count(MockOp::Ping), 3);
    }

    #[tokio::test]
    async fn test_per_target_subscribe_failure() {
        let engine = MockEngine::new();
        engine.fail_subscribe_for("201", 1, EngineError::rejected(404, "Not Found"));

        assert!(engine.subscribe("201", "dialog").await.is_err());
        assert!(engine.subscribe("202", "dialog").await.is_ok());
        assert!(engine.subscribe("201", "dialog").await.is_ok());
        assert_eq!(engine.subscribe_count("201"), 2);
    }
}
