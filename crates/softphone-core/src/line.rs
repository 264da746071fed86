//! Line pool and call commands
//!
//! The phone has exactly three lines. A line is `Free`, `Reserved` (allocated
//! but not yet carrying a user call, also used for in-band agent signalling) or
//! occupied by one [`Call`]. At most one line is *active*, meaning it holds the
//! media focus. Other connected lines are held before a line takes focus.
//!
//! Mutating commands on one line are serialized: while an operation is in
//! flight a second one is rejected with
//! [`PhoneError::OperationInProgress`]. Hang-up is always accepted and cancels
//! whatever is in flight on that line.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::call::{
    Call, CallDirection, CallId, CallInfo, CallState, CallTrigger, TerminationReason, TransferRole,
};
use crate::config::CallConfig;
use crate::engine::{MediaOptions, RemoteSessionState, Renegotiation, SessionHandle, SignalingEngine};
use crate::error::{EngineError, PhoneError, PhoneResult};
use crate::events::{EventBus, PhoneEvent, RejectionReason};
use crate::recovery::{cancellable, with_timeout};
use crate::timer::{TimerScope, TimerSet};

/// Number of lines on the phone
pub const LINE_COUNT: usize = 3;

/// Response code for an incoming call that finds no free line
const BUSY_HERE: u16 = 486;

/// Response code for a call still unanswered when the establish timer fires
const TEMPORARILY_UNAVAILABLE: u16 = 480;

/// Line number, 1 through [`LINE_COUNT`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct LineId(u8);

impl LineId {
    /// `None` outside 1 through [`LINE_COUNT`]
    pub fn new(number: u8) -> Option<Self> {
        (1..=LINE_COUNT as u8).contains(&number).then_some(Self(number))
    }

    pub fn number(self) -> u8 {
        self.0
    }

    /// All lines in allocation order
    pub fn all() -> impl Iterator<Item = LineId> {
        (1..=LINE_COUNT as u8).map(LineId)
    }

    fn index(self) -> usize {
        usize::from(self.0 - 1)
    }
}

impl TryFrom<u8> for LineId {
    type Error = PhoneError;

    fn try_from(number: u8) -> Result<Self, Self::Error> {
        LineId::new(number).ok_or(PhoneError::InvalidLine { line: number })
    }
}

impl From<LineId> for u8 {
    fn from(line: LineId) -> u8 {
        line.0
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a line shows in the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LineStatus {
    Free,
    Reserved,
    /// Outbound call waiting for an answer
    Connecting,
    /// Inbound call waiting for the user
    Ringing,
    Connected,
    Held,
    Transferring,
}

/// Point-in-time view of one line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineSnapshot {
    pub line: LineId,
    pub status: LineStatus,
    pub is_active: bool,
    pub call: Option<CallInfo>,
}

/// Notified when calls start or stop carrying media
pub trait CallActivityListener: Send + Sync {
    fn call_established(&self, line: LineId);

    fn call_ended(&self, line: LineId);
}

enum Occupancy {
    Free,
    Reserved,
    Occupied(Call),
}

struct LineSlot {
    occupancy: Occupancy,
    /// Identifies one reservation of this slot
    allocation: u64,
    /// Epoch of the operation in flight
    busy: Option<u64>,
    /// Cancels operations in flight on the current occupant
    ops: CancellationToken,
}

impl LineSlot {
    fn new() -> Self {
        Self {
            occupancy: Occupancy::Free,
            allocation: 0,
            busy: None,
            ops: CancellationToken::new(),
        }
    }

    fn call(&self) -> Option<&Call> {
        match &self.occupancy {
            Occupancy::Occupied(call) => Some(call),
            _ => None,
        }
    }

    fn call_mut(&mut self) -> Option<&mut Call> {
        match &mut self.occupancy {
            Occupancy::Occupied(call) => Some(call),
            _ => None,
        }
    }

    fn status(&self) -> LineStatus {
        match &self.occupancy {
            Occupancy::Free => LineStatus::Free,
            Occupancy::Reserved => LineStatus::Reserved,
            Occupancy::Occupied(call) => match (call.state(), call.direction()) {
                (CallState::Initial | CallState::Establishing, CallDirection::Inbound) => LineStatus::Ringing,
                (CallState::Initial | CallState::Establishing, CallDirection::Outbound) => LineStatus::Connecting,
                (CallState::Established, _) => LineStatus::Connected,
                (CallState::OnHold, _) => LineStatus::Held,
                (CallState::Transferring, _) => LineStatus::Transferring,
                (CallState::Terminated, _) => LineStatus::Free,
            },
        }
    }
}

struct LineTable {
    slots: [LineSlot; LINE_COUNT],
    active: Option<LineId>,
    sessions: HashMap<SessionHandle, LineId>,
    /// Attended transfers waiting for the transferee's final NOTIFY, keyed by the original line
    transfer_waiters: HashMap<LineId, oneshot::Sender<Result<(), String>>>,
}

impl LineTable {
    fn slot(&self, line: LineId) -> &LineSlot {
        &self.slots[line.index()]
    }

    fn slot_mut(&mut self, line: LineId) -> &mut LineSlot {
        &mut self.slots[line.index()]
    }

    fn snapshot(&self, line: LineId) -> LineSnapshot {
        let slot = self.slot(line);
        LineSnapshot {
            line,
            status: slot.status(),
            is_active: self.active == Some(line),
            call: slot.call().map(Call::info),
        }
    }

    fn call(&self, line: LineId) -> PhoneResult<&Call> {
        self.slot(line).call().ok_or(PhoneError::LineIdle { line })
    }

    fn call_mut(&mut self, line: LineId) -> PhoneResult<&mut Call> {
        self.slot_mut(line).call_mut().ok_or(PhoneError::LineIdle { line })
    }

    fn set_active(&mut self, line: Option<LineId>, effects: &mut Effects) {
        if self.active != line {
            let previous = self.active;
            self.active = line;
            effects.events.push(PhoneEvent::ActiveLineChanged { previous, current: line });
            for changed in [previous, line].into_iter().flatten() {
                effects.events.push(PhoneEvent::LineStateChanged(self.snapshot(changed)));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CallTimer {
    Establish(CallId),
}

enum Activity {
    Established(LineId),
    Ended(LineId),
}

/// Side effects collected under the table lock and applied after it is released
#[derive(Default)]
struct Effects {
    events: Vec<PhoneEvent>,
    activity: Vec<Activity>,
    cancelled_timers: Vec<CallTimer>,
}

/// Marks a line busy for the duration of one operation
struct LineOp<'a> {
    manager: &'a LineManager,
    line: LineId,
    epoch: u64,
    token: CancellationToken,
}

impl Drop for LineOp<'_> {
    fn drop(&mut self) {
        let mut table = self.manager.table.lock();
        let slot = table.slot_mut(self.line);
        if slot.busy == Some(self.epoch) {
            slot.busy = None;
        }
    }
}

/// Owner of the three lines and every call on them
///
/// Every call command goes through the manager, which keeps at most one line
/// in focus and every other established call on hold. Operations on one line
/// are serialized; a second one is rejected with
/// [`PhoneError::OperationInProgress`] unless it is a hangup.
///
/// ```rust
/// # use std::sync::Arc;
/// # use rvoip_softphone_core::config::CallConfig;
/// # use rvoip_softphone_core::events::EventBus;
/// # use rvoip_softphone_core::line::LineManager;
/// # use rvoip_softphone_core::mock::MockEngine;
/// # use rvoip_softphone_core::timer::TimerScope;
/// let lines = LineManager::new(
///     Arc::new(MockEngine::new()),
///     CallConfig::default(),
///     EventBus::default(),
///     Arc::new(TimerScope::new("connection")),
/// );
///
/// let first = lines.allocate_line().unwrap();
/// assert_eq!(first.number(), 1);
/// assert_eq!(lines.get_available_line().map(|line| line.number()), Some(2));
/// ```
pub struct LineManager {
    me: Weak<LineManager>,
    engine: Arc<dyn SignalingEngine>,
    config: CallConfig,
    events: EventBus,
    table: Mutex<LineTable>,
    timers: TimerSet<CallTimer>,
    epochs: AtomicU64,
    listener: Mutex<Option<Weak<dyn CallActivityListener>>>,
}

impl LineManager {
    pub fn new(
        engine: Arc<dyn SignalingEngine>,
        config: CallConfig,
        events: EventBus,
        scope: Arc<TimerScope>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            engine,
            config,
            events,
            table: Mutex::new(LineTable {
                slots: [LineSlot::new(), LineSlot::new(), LineSlot::new()],
                active: None,
                sessions: HashMap::new(),
                transfer_waiters: HashMap::new(),
            }),
            timers: TimerSet::new(scope),
            epochs: AtomicU64::new(1),
            listener: Mutex::new(None),
        })
    }

    /// Register the party told about established and ended calls
    pub fn set_listener(&self, listener: Weak<dyn CallActivityListener>) {
        *self.listener.lock() = Some(listener);
    }

    fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed)
    }

    fn apply(&self, effects: Effects) {
        for timer in &effects.cancelled_timers {
            self.timers.cancel(timer);
        }
        for event in effects.events {
            self.events.emit(event);
        }
        if effects.activity.is_empty() {
            return;
        }
        let listener = self.listener.lock().as_ref().and_then(Weak::upgrade);
        if let Some(listener) = listener {
            for activity in effects.activity {
                match activity {
                    Activity::Established(line) => listener.call_established(line),
                    Activity::Ended(line) => listener.call_ended(line),
                }
            }
        }
    }

    // ===== Snapshots =====

    /// Snapshots of all three lines, in line order
    pub fn lines(&self) -> Vec<LineSnapshot> {
        let table = self.table.lock();
        LineId::all().map(|line| table.snapshot(line)).collect()
    }

    pub fn line(&self, line: LineId) -> LineSnapshot {
        self.table.lock().snapshot(line)
    }

    /// The line holding the media focus
    pub fn active_line(&self) -> Option<LineId> {
        self.table.lock().active
    }

    pub fn call(&self, line: LineId) -> Option<CallInfo> {
        self.table.lock().slot(line).call().map(Call::info)
    }

    /// Look a call up by id on whichever line carries it
    pub fn find_call(&self, call_id: CallId) -> Option<CallInfo> {
        let table = self.table.lock();
        table
            .slots
            .iter()
            .filter_map(LineSlot::call)
            .find(|call| call.id() == call_id)
            .map(Call::info)
    }

    /// Lines carrying a call
    pub fn occupied_lines(&self) -> Vec<LineId> {
        let table = self.table.lock();
        LineId::all().filter(|line| table.slot(*line).call().is_some()).collect()
    }

    // ===== Allocation =====

    fn reserve(&self) -> Option<(LineId, u64)> {
        let mut effects = Effects::default();
        let reserved = {
            let mut table = self.table.lock();
            let line = LineId::all().find(|line| matches!(table.slot(*line).occupancy, Occupancy::Free))?;
            let allocation = self.next_epoch();
            let ops = self.timers.scope().token();
            let slot = table.slot_mut(line);
            slot.occupancy = Occupancy::Reserved;
            slot.allocation = allocation;
            slot.busy = None;
            slot.ops = ops;
            effects.events.push(PhoneEvent::LineStateChanged(table.snapshot(line)));
            (line, allocation)
        };
        self.apply(effects);
        debug!(line = %reserved.0, "Line reserved");
        Some(reserved)
    }

    /// Reserve the lowest free line
    ///
    /// Returns `None` when every line is in use. Nothing is queued and no
    /// line changes in that case.
    pub fn allocate_line(&self) -> Option<LineId> {
        self.reserve().map(|(line, _)| line)
    }

    /// The line [`allocate_line`](Self::allocate_line) would pick, without reserving it
    pub fn get_available_line(&self) -> Option<LineId> {
        let table = self.table.lock();
        LineId::all().find(|line| matches!(table.slot(*line).occupancy, Occupancy::Free))
    }

    /// Return a line to the pool
    ///
    /// Fails for a line still carrying a live call; hang it up first.
    pub fn release_line(&self, line: LineId) -> PhoneResult<()> {
        let mut effects = Effects::default();
        {
            let mut table = self.table.lock();
            match &table.slot(line).occupancy {
                Occupancy::Free => return Ok(()),
                Occupancy::Occupied(call) if !call.state().is_terminated() => {
                    return Err(PhoneError::InvalidCallState {
                        line,
                        state: call.state(),
                        operation: "release",
                    });
                }
                _ => {}
            }
            Self::free_slot(&mut table, line, &mut effects);
        }
        self.apply(effects);
        debug!(line = %line, "Line released");
        Ok(())
    }

    fn release_reserved(&self, line: LineId, allocation: u64) {
        let mut effects = Effects::default();
        {
            let mut table = self.table.lock();
            let slot = table.slot(line);
            if !matches!(slot.occupancy, Occupancy::Reserved) || slot.allocation != allocation {
                return;
            }
            Self::free_slot(&mut table, line, &mut effects);
        }
        self.apply(effects);
    }

    fn free_slot(table: &mut LineTable, line: LineId, effects: &mut Effects) {
        {
            let slot = table.slot_mut(line);
            slot.ops.cancel();
            slot.occupancy = Occupancy::Free;
            slot.busy = None;
        }
        table.transfer_waiters.remove(&line);
        if table.active == Some(line) {
            table.active = None;
            effects.events.push(PhoneEvent::ActiveLineChanged {
                previous: Some(line),
                current: None,
            });
        }
        effects.events.push(PhoneEvent::LineStateChanged(table.snapshot(line)));
    }

    /// Run `f` on a reserved line that carries no user call
    ///
    /// The line is never the active one and is freed again when `f` finishes.
    /// Returns `None` if no line is free.
    pub async fn with_background_line<F, Fut, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce(LineId) -> Fut,
        Fut: Future<Output = T>,
    {
        let (line, allocation) = self.reserve()?;
        debug!(line = %line, "Using background line");
        let result = f(line).await;
        self.release_reserved(line, allocation);
        Some(result)
    }

    // ===== Operation bookkeeping =====

    fn begin_op(&self, line: LineId, operation: &'static str) -> PhoneResult<LineOp<'_>> {
        let epoch = self.next_epoch();
        let mut table = self.table.lock();
        let slot = table.slot_mut(line);
        if matches!(slot.occupancy, Occupancy::Free) {
            return Err(PhoneError::LineIdle { line });
        }
        if slot.busy.is_some() {
            debug!(line = %line, operation, "Rejecting concurrent line operation");
            return Err(PhoneError::in_progress(format!("line {}", line)));
        }
        slot.busy = Some(epoch);
        Ok(LineOp {
            manager: self,
            line,
            epoch,
            token: slot.ops.clone(),
        })
    }

    /// Session and id of the call on `line`, provided it is in one of `allowed`
    fn prepare(
        &self,
        line: LineId,
        operation: &'static str,
        allowed: &[CallState],
    ) -> PhoneResult<(CallId, SessionHandle)> {
        let table = self.table.lock();
        let call = table.call(line)?;
        let invalid = PhoneError::InvalidCallState {
            line,
            state: call.state(),
            operation,
        };
        if !allowed.contains(&call.state()) {
            return Err(invalid);
        }
        let session = call.session().cloned().ok_or(invalid)?;
        Ok((call.id(), session))
    }

    fn transition(&self, line: LineId, call_id: CallId, trigger: CallTrigger) -> PhoneResult<CallInfo> {
        let mut effects = Effects::default();
        let info = {
            let mut table = self.table.lock();
            let call = table
                .slot_mut(line)
                .call_mut()
                .filter(|call| call.id() == call_id)
                .ok_or(PhoneError::CallNotFound { call_id })?;
            let accepted = matches!(trigger, CallTrigger::RemoteAccepted | CallTrigger::LocalAccepted);
            call.transition(trigger)?;
            let info = call.info();
            if accepted {
                effects.activity.push(Activity::Established(line));
                effects.cancelled_timers.push(CallTimer::Establish(call_id));
            }
            effects.events.push(PhoneEvent::CallStateChanged(info.clone()));
            effects.events.push(PhoneEvent::LineStateChanged(table.snapshot(line)));
            info
        };
        self.apply(effects);
        debug!(line = %line, call_id = %call_id, state = ?info.state, "Call state changed");
        Ok(info)
    }

    /// Put `call` on a reserved line
    fn bind_call(&self, line: LineId, allocation: u64, call: Call, focus: bool) -> PhoneResult<CallInfo> {
        let mut effects = Effects::default();
        let info = {
            let mut table = self.table.lock();
            let slot = table.slot_mut(line);
            if !matches!(slot.occupancy, Occupancy::Reserved) || slot.allocation != allocation {
                return Err(PhoneError::cancelled("bind call"));
            }
            let info = call.info();
            if let Some(session) = call.session() {
                table.sessions.insert(session.clone(), line);
            }
            table.slot_mut(line).occupancy = Occupancy::Occupied(call);
            effects.events.push(PhoneEvent::CallStateChanged(info.clone()));
            effects.events.push(PhoneEvent::LineStateChanged(table.snapshot(line)));
            if focus {
                table.set_active(Some(line), &mut effects);
            }
            info
        };
        self.apply(effects);
        Ok(info)
    }

    /// Terminate the call on `line` locally and free the line
    ///
    /// With `expected` set, only that call is finished. Returns `None` if there
    /// was nothing to finish.
    fn finish_call(&self, line: LineId, expected: Option<CallId>, reason: TerminationReason) -> Option<CallInfo> {
        let mut effects = Effects::default();
        let info = {
            let mut table = self.table.lock();
            let call = table.slot_mut(line).call_mut()?;
            if expected.is_some_and(|id| id != call.id()) {
                return None;
            }
            let role = call.transfer();
            let _ = call.transition(CallTrigger::Terminate(reason));
            let info = call.info();
            if let Some(session) = call.session().cloned() {
                table.sessions.remove(&session);
            }

            let partner = match role {
                Some(TransferRole::Original { consultation }) => Some(consultation),
                Some(TransferRole::Consultation { original }) => Some(original),
                None => None,
            };
            if let Some(partner) = partner {
                if let Some(other) = table.slot_mut(partner).call_mut() {
                    other.set_transfer(None);
                    effects.events.push(PhoneEvent::CallStateChanged(other.info()));
                }
            }

            effects.events.push(PhoneEvent::CallStateChanged(info.clone()));
            effects.cancelled_timers.push(CallTimer::Establish(info.call_id));
            effects.activity.push(Activity::Ended(line));
            Self::free_slot(&mut table, line, &mut effects);
            info
        };
        self.apply(effects);
        info!(
            line = %line,
            call_id = %info.call_id,
            reason = ?info.termination,
            duration_secs = info.duration.as_secs(),
            "Call terminated"
        );
        Some(info)
    }

    fn schedule_establish_timeout(&self, line: LineId, call_id: CallId) {
        let manager = self.me.clone();
        self.timers.schedule(
            CallTimer::Establish(call_id),
            self.config.establish_timeout(),
            move || async move {
                if let Some(manager) = manager.upgrade() {
                    manager.establish_timed_out(line, call_id).await;
                }
            },
        );
    }

    async fn establish_timed_out(&self, line: LineId, call_id: CallId) {
        let pending = {
            let table = self.table.lock();
            table
                .slot(line)
                .call()
                .filter(|call| call.id() == call_id && call.state() == CallState::Establishing)
                .map(|call| (call.session().cloned(), call.direction()))
        };
        let Some((session, direction)) = pending else {
            return;
        };

        warn!(line = %line, call_id = %call_id, "Call did not establish in time");
        if let Some(session) = session {
            let result = match direction {
                CallDirection::Inbound => {
                    with_timeout("reject", self.config.request_timeout(), self.engine.reject(&session, TEMPORARILY_UNAVAILABLE)).await
                }
                CallDirection::Outbound => {
                    with_timeout("cancel", self.config.request_timeout(), self.engine.terminate(&session)).await
                }
            };
            if let Err(e) = result {
                warn!(line = %line, error = %e, "Failed to abandon timed out call");
            }
        }
        self.finish_call(line, Some(call_id), TerminationReason::TimedOut);
    }

    fn termination_for(error: &PhoneError) -> TerminationReason {
        match error {
            PhoneError::Engine(EngineError::Rejected { code, .. }) => TerminationReason::Rejected { code: *code },
            PhoneError::OperationTimeout { .. } => TerminationReason::TimedOut,
            PhoneError::Cancelled { .. } => TerminationReason::Cancelled,
            other => TerminationReason::Failed { reason: other.to_string() },
        }
    }

    // ===== Focus =====

    async fn renegotiate(
        &self,
        line: LineId,
        call_id: CallId,
        session: &SessionHandle,
        direction: Renegotiation,
        token: &CancellationToken,
    ) -> PhoneResult<()> {
        let operation = match direction {
            Renegotiation::Hold => "hold",
            Renegotiation::Resume => "resume",
        };
        cancellable(operation, self.config.request_timeout(), token, self.engine.renegotiate(session, direction)).await?;
        let trigger = match direction {
            Renegotiation::Hold => CallTrigger::Hold,
            Renegotiation::Resume => CallTrigger::Resume,
        };
        self.transition(line, call_id, trigger).map(|_| ())
    }

    /// Hold every established call except the one on `except`
    async fn hold_others(&self, except: LineId) -> PhoneResult<()> {
        let others: Vec<LineId> = {
            let table = self.table.lock();
            LineId::all()
                .filter(|line| *line != except)
                .filter(|line| {
                    table
                        .slot(*line)
                        .call()
                        .is_some_and(|call| call.state() == CallState::Established)
                })
                .collect()
        };
        for other in others {
            self.hold(other).await?;
        }
        Ok(())
    }

    fn focus(&self, line: LineId, call_id: CallId) {
        let mut effects = Effects::default();
        {
            let mut table = self.table.lock();
            if table.slot(line).call().is_some_and(|call| call.id() == call_id) {
                table.set_active(Some(line), &mut effects);
            }
        }
        self.apply(effects);
    }

    /// Give `line` the media focus
    ///
    /// Every other established line is held first. If the target is on hold it
    /// is resumed. If any step fails the focus stays where it was.
    pub async fn set_active(&self, line: LineId) -> PhoneResult<()> {
        let (call_id, state) = {
            let table = self.table.lock();
            let call = table.call(line)?;
            (call.id(), call.state())
        };
        if state == CallState::Transferring {
            return Err(PhoneError::InvalidCallState {
                line,
                state,
                operation: "activate",
            });
        }

        self.hold_others(line).await?;
        if state == CallState::OnHold {
            self.resume_line(line).await?;
        }
        self.focus(line, call_id);
        Ok(())
    }

    // ===== Call commands =====

    /// Place an outbound call on the lowest free line
    pub async fn place_call(&self, target: &str) -> PhoneResult<CallInfo> {
        let (line, allocation) = self.reserve().ok_or(PhoneError::NoCapacity { resource: "line" })?;
        info!(line = %line, target, "Placing call");

        if let Err(e) = self.hold_others(line).await {
            self.release_reserved(line, allocation);
            return Err(e);
        }

        let mut call = Call::outbound(line, target);
        call.transition(CallTrigger::Dial)?;
        let call_id = call.id();
        self.bind_call(line, allocation, call, true)?;
        self.dial(line, call_id, target).await
    }

    /// Send the invite for a call already bound to `line`
    async fn dial(&self, line: LineId, call_id: CallId, target: &str) -> PhoneResult<CallInfo> {
        let op = self.begin_op(line, "place call")?;
        let result = cancellable(
            "invite",
            self.config.request_timeout(),
            &op.token,
            self.engine.invite(target, MediaOptions::default()),
        )
        .await;
        drop(op);

        match result {
            Ok(session) => {
                let mut effects = Effects::default();
                let info = {
                    let mut table = self.table.lock();
                    match table.slot_mut(line).call_mut().filter(|call| call.id() == call_id) {
                        Some(call) => {
                            call.set_session(session.clone());
                            let info = call.info();
                            table.sessions.insert(session.clone(), line);
                            effects.events.push(PhoneEvent::CallStateChanged(info.clone()));
                            Some(info)
                        }
                        None => None,
                    }
                };
                self.apply(effects);

                match info {
                    Some(info) => {
                        self.schedule_establish_timeout(line, call_id);
                        Ok(info)
                    }
                    None => {
                        // Hung up while the invite was in flight
                        if let Err(e) =
                            with_timeout("cancel", self.config.request_timeout(), self.engine.terminate(&session)).await
                        {
                            warn!(line = %line, error = %e, "Failed to cancel abandoned invite");
                        }
                        Err(PhoneError::cancelled("place call"))
                    }
                }
            }
            Err(e) => {
                warn!(line = %line, target, error = %e, "Outbound call failed");
                self.finish_call(line, Some(call_id), Self::termination_for(&e));
                Err(e)
            }
        }
    }

    /// Answer the inbound call ringing on `line`
    pub async fn answer(&self, line: LineId) -> PhoneResult<CallInfo> {
        let (call_id, session) = self.prepare(line, "answer", &[CallState::Establishing])?;
        self.require_inbound(line, "answer")?;
        self.hold_others(line).await?;

        let op = self.begin_op(line, "answer")?;
        let result = cancellable(
            "accept",
            self.config.request_timeout(),
            &op.token,
            self.engine.accept(&session, MediaOptions::default()),
        )
        .await;
        drop(op);

        if let Err(e) = result {
            if !matches!(e, PhoneError::Cancelled { .. }) {
                self.finish_call(line, Some(call_id), Self::termination_for(&e));
            }
            return Err(e);
        }

        let info = self.transition(line, call_id, CallTrigger::LocalAccepted)?;
        self.focus(line, call_id);
        Ok(info)
    }

    fn require_inbound(&self, line: LineId, operation: &'static str) -> PhoneResult<()> {
        let table = self.table.lock();
        let call = table.call(line)?;
        if call.direction() != CallDirection::Inbound {
            return Err(PhoneError::InvalidCallState {
                line,
                state: call.state(),
                operation,
            });
        }
        Ok(())
    }

    /// Decline the inbound call ringing on `line`
    pub async fn reject(&self, line: LineId) -> PhoneResult<()> {
        let (call_id, session) = self.prepare(line, "reject", &[CallState::Establishing])?;
        self.require_inbound(line, "reject")?;

        let op = self.begin_op(line, "reject")?;
        let code = self.config.decline_code;
        let result = cancellable("reject", self.config.request_timeout(), &op.token, self.engine.reject(&session, code)).await;
        drop(op);

        self.finish_call(line, Some(call_id), TerminationReason::Rejected { code });
        result
    }

    /// End the call on `line`
    ///
    /// Always accepted, even while another operation is in flight on the line.
    /// The line is freed locally before the engine is told.
    pub async fn hangup(&self, line: LineId) -> PhoneResult<()> {
        let (call_id, session, state, direction) = {
            let table = self.table.lock();
            let slot = table.slot(line);
            let call = slot.call().ok_or(PhoneError::LineIdle { line })?;
            slot.ops.cancel();
            (call.id(), call.session().cloned(), call.state(), call.direction())
        };

        info!(line = %line, call_id = %call_id, "Hanging up");
        self.finish_call(line, Some(call_id), TerminationReason::LocalHangup);

        if let Some(session) = session {
            let timeout = self.config.request_timeout();
            let result = if state == CallState::Establishing && direction == CallDirection::Inbound {
                with_timeout("reject", timeout, self.engine.reject(&session, self.config.decline_code)).await
            } else {
                with_timeout("terminate", timeout, self.engine.terminate(&session)).await
            };
            if let Err(e) = result {
                warn!(line = %line, error = %e, "Engine failed to terminate session");
            }
        }
        Ok(())
    }

    /// Hang up every line
    pub async fn hangup_all(&self) {
        for line in self.occupied_lines() {
            if let Err(e) = self.hangup(line).await {
                debug!(line = %line, error = %e, "Hangup during teardown failed");
            }
        }
    }

    /// Put the established call on `line` on hold
    ///
    /// The focus does not move. If the renegotiation fails the call stays
    /// established and the error is returned.
    pub async fn hold(&self, line: LineId) -> PhoneResult<()> {
        let op = self.begin_op(line, "hold")?;
        let (call_id, session) = self.prepare(line, "hold", &[CallState::Established])?;
        self.renegotiate(line, call_id, &session, Renegotiation::Hold, &op.token).await
    }

    /// Resume a held call, giving it the focus
    pub async fn resume(&self, line: LineId) -> PhoneResult<()> {
        self.set_active(line).await
    }

    async fn resume_line(&self, line: LineId) -> PhoneResult<()> {
        let op = self.begin_op(line, "resume")?;
        let (call_id, session) = self.prepare(line, "resume", &[CallState::OnHold])?;
        self.renegotiate(line, call_id, &session, Renegotiation::Resume, &op.token).await
    }

    /// Send DTMF digits (`0-9`, `*`, `#`, `A-D`) on an established call
    pub async fn send_dtmf(&self, line: LineId, digits: &str) -> PhoneResult<()> {
        if digits.is_empty() || !digits.chars().all(is_dtmf_digit) {
            return Err(PhoneError::InvalidDtmf { digits: digits.to_string() });
        }
        let (_, session) = self.prepare(line, "send DTMF on", &[CallState::Established])?;
        let token = self.table.lock().slot(line).ops.clone();
        cancellable("dtmf", self.config.request_timeout(), &token, self.engine.send_dtmf(&session, digits)).await
    }

    /// Transfer the call on `line` to `target` without consultation
    ///
    /// The local call ends as soon as the transferee accepts the REFER. No BYE is
    /// sent; the transferee releases the session.
    pub async fn blind_transfer(&self, line: LineId, target: &str) -> PhoneResult<()> {
        let op = self.begin_op(line, "transfer")?;
        let (call_id, session) = self.prepare(line, "transfer", &[CallState::Established, CallState::OnHold])?;
        self.require_no_transfer(line)?;

        self.transition(line, call_id, CallTrigger::TransferStarted)?;
        info!(line = %line, target, "Blind transfer");
        let result = cancellable(
            "refer",
            self.config.transfer_timeout(),
            &op.token,
            self.engine.refer(&session, target, None),
        )
        .await;
        drop(op);

        match result {
            Ok(()) => {
                self.finish_call(line, Some(call_id), TerminationReason::Transferred);
                Ok(())
            }
            Err(e) => {
                warn!(line = %line, error = %e, "Blind transfer failed");
                let _ = self.transition(line, call_id, CallTrigger::TransferFailed);
                Err(e)
            }
        }
    }

    fn require_no_transfer(&self, line: LineId) -> PhoneResult<()> {
        let table = self.table.lock();
        let call = table.call(line)?;
        if call.transfer().is_some() {
            return Err(PhoneError::in_progress(format!("attended transfer on line {}", line)));
        }
        Ok(())
    }

    /// First step of an attended transfer
    ///
    /// Holds the call on `line` and places a consultation call to `target` on
    /// another line, which takes the focus. Returns the consultation line.
    pub async fn start_attended_transfer(&self, line: LineId, target: &str) -> PhoneResult<LineId> {
        let op = self.begin_op(line, "start attended transfer")?;
        let (call_id, session) =
            self.prepare(line, "start attended transfer", &[CallState::Established, CallState::OnHold])?;
        self.require_no_transfer(line)?;

        let (consultation, allocation) = self.reserve().ok_or(PhoneError::NoCapacity { resource: "line" })?;

        let held = self.table.lock().call(line).map(|call| call.state())? == CallState::OnHold;
        if !held {
            if let Err(e) = self.renegotiate(line, call_id, &session, Renegotiation::Hold, &op.token).await {
                self.release_reserved(consultation, allocation);
                return Err(e);
            }
        }

        let mut call = Call::outbound(consultation, target);
        call.transition(CallTrigger::Dial)?;
        call.set_transfer(Some(TransferRole::Consultation { original: line }));
        let consultation_id = call.id();
        self.bind_call(consultation, allocation, call, true)?;
        self.link_original(line, call_id, consultation);
        drop(op);

        info!(line = %line, consultation = %consultation, target, "Attended transfer consultation started");
        self.dial(consultation, consultation_id, target).await?;
        Ok(consultation)
    }

    fn link_original(&self, line: LineId, call_id: CallId, consultation: LineId) {
        let mut effects = Effects::default();
        {
            let mut table = self.table.lock();
            if let Some(call) = table.slot_mut(line).call_mut().filter(|call| call.id() == call_id) {
                call.set_transfer(Some(TransferRole::Original { consultation }));
                effects.events.push(PhoneEvent::CallStateChanged(call.info()));
            }
        }
        self.apply(effects);
    }

    fn consultation_of(&self, line: LineId) -> PhoneResult<LineId> {
        let table = self.table.lock();
        match table.call(line)?.transfer() {
            Some(TransferRole::Original { consultation }) => Ok(consultation),
            _ => Err(PhoneError::NoTransferInProgress { line }),
        }
    }

    /// Final step of an attended transfer
    ///
    /// Refers the held call on `line` to the consultation party, replacing the
    /// consultation session. Completes when the transferee reports success;
    /// both local legs are then terminated. On failure or timeout the original
    /// call returns to hold.
    pub async fn complete_attended_transfer(&self, line: LineId) -> PhoneResult<()> {
        let op = self.begin_op(line, "complete attended transfer")?;
        let consultation = self.consultation_of(line)?;
        let (call_id, session) = self.prepare(line, "complete attended transfer", &[CallState::OnHold])?;
        let (consultation_session, target) = {
            let table = self.table.lock();
            let call = table.call(consultation)?;
            if call.state() != CallState::Established {
                return Err(PhoneError::InvalidCallState {
                    line: consultation,
                    state: call.state(),
                    operation: "complete transfer with",
                });
            }
            let session = call.session().cloned().ok_or(PhoneError::InvalidCallState {
                line: consultation,
                state: call.state(),
                operation: "complete transfer with",
            })?;
            (session, call.remote().to_string())
        };

        self.transition(line, call_id, CallTrigger::TransferStarted)?;
        let (tx, rx) = oneshot::channel();
        self.table.lock().transfer_waiters.insert(line, tx);
        info!(line = %line, consultation = %consultation, "Completing attended transfer");

        let refer = cancellable(
            "refer",
            self.config.request_timeout(),
            &op.token,
            self.engine.refer(&session, &target, Some(&consultation_session)),
        )
        .await;

        let outcome = match refer {
            Err(e) => Err(e),
            Ok(()) => {
                let timeout = self.config.transfer_timeout();
                tokio::select! {
                    _ = op.token.cancelled() => Err(PhoneError::cancelled("attended transfer")),
                    result = tokio::time::timeout(timeout, rx) => match result {
                        Ok(Ok(Ok(()))) => Ok(()),
                        Ok(Ok(Err(reason))) => Err(PhoneError::TransferFailed { line, reason }),
                        Ok(Err(_)) => Err(PhoneError::cancelled("attended transfer")),
                        Err(_) => Err(PhoneError::OperationTimeout {
                            operation: "attended transfer".to_string(),
                            duration_ms: timeout.as_millis() as u64,
                        }),
                    },
                }
            }
        };
        self.table.lock().transfer_waiters.remove(&line);
        drop(op);

        match outcome {
            Ok(()) => {
                self.finish_call(line, Some(call_id), TerminationReason::Transferred);
                self.finish_call(consultation, None, TerminationReason::Transferred);
                info!(line = %line, "Attended transfer completed");
                Ok(())
            }
            Err(e) => {
                warn!(line = %line, error = %e, "Attended transfer failed");
                if !matches!(e, PhoneError::Cancelled { .. }) {
                    let _ = self.transition(line, call_id, CallTrigger::TransferFailed);
                }
                Err(e)
            }
        }
    }

    /// Abandon an attended transfer: hang up the consultation and resume the original call
    pub async fn cancel_attended_transfer(&self, line: LineId) -> PhoneResult<()> {
        let consultation = self.consultation_of(line)?;
        self.hangup(consultation).await?;
        self.set_active(line).await
    }

    // ===== Engine events =====

    /// Bind an incoming invite to a free line, or refuse it with 486
    pub async fn handle_incoming(&self, session: SessionHandle, from: String, display_name: Option<String>) {
        let Some((line, allocation)) = self.reserve() else {
            info!(from = %from, "All lines busy, rejecting incoming call");
            if let Err(e) = with_timeout("reject", self.config.request_timeout(), self.engine.reject(&session, BUSY_HERE)).await {
                warn!(error = %e, "Failed to reject incoming call");
            }
            self.events.emit(PhoneEvent::CallRejected {
                remote: from,
                reason: RejectionReason::NoCapacity,
            });
            return;
        };

        let mut call = Call::inbound(line, session, from, display_name);
        if call.transition(CallTrigger::Arrive).is_err() {
            self.release_reserved(line, allocation);
            return;
        }
        let call_id = call.id();
        let info = match self.bind_call(line, allocation, call, false) {
            Ok(info) => info,
            Err(_) => return,
        };
        info!(line = %line, from = %info.remote, "Incoming call");
        self.events.emit(PhoneEvent::IncomingCall { line, call: info });
        self.schedule_establish_timeout(line, call_id);

        if self.config.focus_incoming_calls {
            match self.hold_others(line).await {
                Ok(()) => self.focus(line, call_id),
                Err(e) => warn!(line = %line, error = %e, "Could not hold other lines for incoming call"),
            }
        }
    }

    /// Apply a remote state change to the call owning `session`
    pub fn handle_session_event(&self, session: &SessionHandle, state: RemoteSessionState) {
        let Some(line) = self.table.lock().sessions.get(session).copied() else {
            debug!(session = %session, ?state, "Event for unknown session");
            return;
        };
        let Some((call_id, call_state, direction)) = self
            .table
            .lock()
            .slot(line)
            .call()
            .map(|call| (call.id(), call.state(), call.direction()))
        else {
            return;
        };

        match state {
            RemoteSessionState::Progress => {}
            RemoteSessionState::Ringing => {
                let mut effects = Effects::default();
                if let Some(call) = self.table.lock().slot_mut(line).call_mut() {
                    call.set_remote_ringing();
                    effects.events.push(PhoneEvent::CallStateChanged(call.info()));
                }
                self.apply(effects);
            }
            RemoteSessionState::Accepted => {
                if call_state == CallState::Establishing && direction == CallDirection::Outbound {
                    if self.transition(line, call_id, CallTrigger::RemoteAccepted).is_ok() {
                        self.settle_answered(line, call_id);
                    }
                }
            }
            RemoteSessionState::Rejected { code, reason } => {
                debug!(line = %line, code, reason = %reason, "Remote rejected call");
                self.finish_call(line, Some(call_id), TerminationReason::Rejected { code });
            }
            RemoteSessionState::Terminated { reason } => {
                debug!(line = %line, reason = %reason, "Remote ended call");
                let termination = if call_state == CallState::Establishing {
                    TerminationReason::Cancelled
                } else {
                    TerminationReason::RemoteHangup
                };
                self.finish_call(line, Some(call_id), termination);
            }
            RemoteSessionState::TransferAccepted => {
                debug!(line = %line, "Transferee accepted REFER");
            }
            RemoteSessionState::TransferSucceeded => self.resolve_transfer(line, Ok(())),
            RemoteSessionState::TransferFailed { reason } => self.resolve_transfer(line, Err(reason)),
        }
    }

    /// Keep a single unheld line after a remote answer
    ///
    /// An answered call without focus is held straight away. With no line in
    /// focus it takes the focus.
    fn settle_answered(&self, line: LineId, call_id: CallId) {
        let active = self.table.lock().active;
        match active {
            Some(active) if active == line => {}
            None => self.focus(line, call_id),
            Some(active) => {
                debug!(line = %line, active = %active, "Answered call has no focus, holding it");
                let Some(manager) = self.me.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    manager.hold_unfocused(line, call_id).await;
                });
            }
        }
    }

    async fn hold_unfocused(&self, line: LineId, call_id: CallId) {
        let still_unfocused = {
            let table = self.table.lock();
            table.active != Some(line) && table.slot(line).call().is_some_and(|call| call.id() == call_id)
        };
        if !still_unfocused {
            return;
        }
        match self.hold(line).await {
            Ok(()) => {}
            // Gone or no longer established
            Err(
                PhoneError::LineIdle { .. }
                | PhoneError::CallNotFound { .. }
                | PhoneError::Cancelled { .. }
                | PhoneError::InvalidCallState { .. },
            ) => {}
            Err(e) => {
                warn!(line = %line, error = %e, "Failed to hold answered call without focus");
                self.events.emit(PhoneEvent::Error {
                    category: e.category(),
                    details: e.to_string(),
                    line: Some(line),
                    extension: None,
                });
            }
        }
    }

    fn resolve_transfer(&self, line: LineId, outcome: Result<(), String>) {
        match self.table.lock().transfer_waiters.remove(&line) {
            Some(waiter) => {
                let _ = waiter.send(outcome);
            }
            None => debug!(line = %line, "Transfer outcome with no transfer pending"),
        }
    }

    /// Terminate every call locally and free every line
    pub fn terminate_all(&self, reason: TerminationReason) {
        for line in LineId::all() {
            if self.finish_call(line, None, reason.clone()).is_none() {
                let mut effects = Effects::default();
                {
                    let mut table = self.table.lock();
                    if matches!(table.slot(line).occupancy, Occupancy::Reserved) {
                        Self::free_slot(&mut table, line, &mut effects);
                    }
                }
                self.apply(effects);
            }
        }
        self.timers.cancel_all();
    }
}

fn is_dtmf_digit(c: char) -> bool {
    matches!(c, '0'..='9' | '*' | '#' | 'A'..='D' | 'a'..='d')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEngine;

    fn manager() -> Arc<LineManager> {
        LineManager::new(
            Arc::new(MockEngine::new()),
            CallConfig::default(),
            EventBus::default(),
            Arc::new(TimerScope::new("test")),
        )
    }

    #[test]
    fn test_line_id_bounds() {
        assert!(LineId::new(0).is_none());
        assert!(LineId::new(4).is_none());
        assert_eq!(LineId::new(3).map(LineId::number), Some(3));
        assert_eq!(LineId::try_from(9), Err(PhoneError::InvalidLine { line: 9 }));
        assert_eq!(LineId::all().count(), LINE_COUNT);
    }

    #[test]
    fn test_allocation_order_and_exhaustion() {
        let lines = manager();
        let allocated: Vec<_> = (0..3).filter_map(|_| lines.allocate_line()).map(LineId::number).collect();
        assert_eq!(allocated, vec![1, 2, 3]);
        assert_eq!(lines.allocate_line(), None);
        assert_eq!(lines.get_available_line(), None);

        lines.release_line(LineId::new(2).unwrap()).unwrap();
        assert_eq!(lines.get_available_line(), LineId::new(2));
        assert_eq!(lines.allocate_line(), LineId::new(2));
    }

    #[test]
    fn test_release_is_idempotent() {
        let lines = manager();
        let line = lines.allocate_line().unwrap();
        lines.release_line(line).unwrap();
        lines.release_line(line).unwrap();
        assert_eq!(lines.line(line).status, LineStatus::Free);
    }

    #[test]
    fn test_dtmf_digit_validation() {
        assert!("0123456789*#ABCDabcd".chars().all(is_dtmf_digit));
        assert!(!is_dtmf_digit('E'));
        assert!(!is_dtmf_digit(' '));
    }

    #[tokio::test]
    async fn test_background_line_is_freed_and_never_active() {
        let lines = manager();
        let seen = lines
            .with_background_line(|line| {
                let lines = lines.clone();
                async move {
                    assert_eq!(lines.line(line).status, LineStatus::Reserved);
                    assert_eq!(lines.active_line(), None);
                    line
                }
            })
            .await;

        assert_eq!(seen, LineId::new(1));
        assert_eq!(lines.line(LineId::new(1).unwrap()).status, LineStatus::Free);
    }

    #[tokio::test]
    async fn test_commands_on_idle_line_fail() {
        let lines = manager();
        let line = LineId::new(1).unwrap();
        assert_eq!(lines.hangup(line).await, Err(PhoneError::LineIdle { line }));
        assert_eq!(lines.hold(line).await, Err(PhoneError::LineIdle { line }));
        assert!(matches!(
            lines.send_dtmf(line, "12x").await,
            Err(PhoneError::InvalidDtmf { .. })
        ));
    }
}
