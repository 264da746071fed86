//! Line pool, focus and call lifecycle

mod common;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use common::{config, connected, line, settle, Harness};
use proptest::prelude::*;
use rvoip_softphone_core::engine::Renegotiation;
use rvoip_softphone_core::mock::{EngineCall, MockOp};
use rvoip_softphone_core::{
    CallDirection, CallState, EngineError, LineStatus, PhoneError, PhoneEvent, RejectionReason, RemoteSessionState,
    SessionHandle, TerminationReason,
};

#[tokio::test(start_paused = true)]
async fn test_calls_take_lowest_free_line() {
    let h = connected(config()).await;

    let first = h.phone.place_call("sip:300@pbx.test").await.unwrap();
    let second = h.phone.place_call("sip:301@pbx.test").await.unwrap();
    assert_eq!(first.line, line(1));
    assert_eq!(second.line, line(2));
    assert_eq!(first.state, CallState::Establishing);

    h.phone.hangup(line(1)).await.unwrap();
    let third = h.phone.place_call("sip:302@pbx.test").await.unwrap();
    assert_eq!(third.line, line(1));
}

#[tokio::test(start_paused = true)]
async fn test_incoming_call_without_free_line_is_refused() {
    let mut h = connected(config()).await;
    for n in 0..3 {
        h.phone.place_call(&format!("sip:30{}@pbx.test", n)).await.unwrap();
    }
    let before: Vec<_> = h
        .phone
        .lines()
        .into_iter()
        .map(|snapshot| (snapshot.status, snapshot.is_active, snapshot.call.map(|call| call.call_id)))
        .collect();
    h.drain();

    h.incoming("in-1", "sip:caller@pbx.test");
    settle().await;

    assert!(h.engine.calls().contains(&EngineCall::Reject {
        session: SessionHandle::new("in-1"),
        code: 486,
    }));
    let events = h.drain();
    assert!(events.iter().any(|event| matches!(
        event,
        PhoneEvent::CallRejected { reason: RejectionReason::NoCapacity, .. }
    )));
    assert!(!events.iter().any(|event| matches!(event, PhoneEvent::LineStateChanged(_))));

    let after: Vec<_> = h
        .phone
        .lines()
        .into_iter()
        .map(|snapshot| (snapshot.status, snapshot.is_active, snapshot.call.map(|call| call.call_id)))
        .collect();
    assert_eq!(before, after);

    assert!(matches!(
        h.phone.place_call("sip:399@pbx.test").await,
        Err(PhoneError::NoCapacity { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_new_call_holds_established_call() {
    let h = connected(config()).await;
    let first = h.established_call("sip:300@pbx.test").await;
    assert_eq!(h.phone.line(first).status, LineStatus::Connected);
    assert_eq!(h.phone.active_line(), Some(first));

    let second = h.phone.place_call("sip:301@pbx.test").await.unwrap();

    let session = h.invited_session("sip:300@pbx.test");
    assert!(h.engine.calls().contains(&EngineCall::Renegotiate {
        session,
        direction: Renegotiation::Hold,
    }));
    assert_eq!(h.phone.line(first).status, LineStatus::Held);
    assert_eq!(h.phone.active_line(), Some(second.line));
}

#[tokio::test(start_paused = true)]
async fn test_resume_moves_focus_back() {
    let h = connected(config()).await;
    let first = h.established_call("sip:300@pbx.test").await;
    let second = h.established_call("sip:301@pbx.test").await;
    assert_eq!(h.phone.active_line(), Some(second));

    h.phone.resume(first).await.unwrap();

    assert_eq!(h.phone.active_line(), Some(first));
    assert_eq!(h.phone.line(first).status, LineStatus::Connected);
    assert_eq!(h.phone.line(second).status, LineStatus::Held);
}

#[tokio::test(start_paused = true)]
async fn test_outbound_answer_without_focus_is_held() {
    let h = connected(config()).await;
    let dialing = h.phone.place_call("sip:300@pbx.test").await.unwrap().line;
    h.incoming("in-1", "sip:caller@pbx.test");
    settle().await;
    assert_eq!(h.phone.active_line(), Some(line(2)));
    h.phone.answer(line(2)).await.unwrap();

    let session = h.invited_session("sip:300@pbx.test");
    h.remote(&session, RemoteSessionState::Accepted);
    settle().await;

    assert!(h.engine.calls().contains(&EngineCall::Renegotiate {
        session,
        direction: Renegotiation::Hold,
    }));
    assert_eq!(h.phone.line(dialing).status, LineStatus::Held);
    assert_eq!(h.phone.line(line(2)).status, LineStatus::Connected);
    assert_eq!(h.phone.active_line(), Some(line(2)));
}

#[tokio::test(start_paused = true)]
async fn test_outbound_answer_takes_free_focus() {
    let h = connected(config()).await;
    let dialing = h.phone.place_call("sip:300@pbx.test").await.unwrap().line;
    h.incoming("in-1", "sip:caller@pbx.test");
    settle().await;
    h.phone.reject(line(2)).await.unwrap();
    assert_eq!(h.phone.active_line(), None);

    h.remote(&h.invited_session("sip:300@pbx.test"), RemoteSessionState::Accepted);
    settle().await;

    assert_eq!(h.phone.line(dialing).status, LineStatus::Connected);
    assert_eq!(h.phone.active_line(), Some(dialing));
    assert_eq!(h.engine.count(MockOp::Renegotiate), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_hold_of_unfocused_answer_is_reported() {
    let mut h = connected(config()).await;
    let dialing = h.phone.place_call("sip:300@pbx.test").await.unwrap().line;
    h.incoming("in-1", "sip:caller@pbx.test");
    settle().await;
    h.phone.answer(line(2)).await.unwrap();
    h.drain();

    h.engine
        .fail_next(MockOp::Renegotiate, EngineError::rejected(488, "Not Acceptable Here"));
    h.remote(&h.invited_session("sip:300@pbx.test"), RemoteSessionState::Accepted);
    settle().await;

    assert!(h.drain().iter().any(|event| matches!(
        event,
        PhoneEvent::Error { line: Some(l), .. } if *l == dialing
    )));
    assert_eq!(h.phone.active_line(), Some(line(2)));
}

#[tokio::test(start_paused = true)]
async fn test_failed_renegotiation_keeps_prior_state() {
    let h = connected(config()).await;
    let first = h.established_call("sip:300@pbx.test").await;

    h.engine
        .fail_next(MockOp::Renegotiate, EngineError::rejected(488, "Not Acceptable Here"));
    assert!(h.phone.hold(first).await.is_err());
    assert_eq!(h.phone.line(first).status, LineStatus::Connected);
    assert_eq!(h.phone.active_line(), Some(first));

    // A new call needs the focus line held first
    h.engine
        .fail_next(MockOp::Renegotiate, EngineError::rejected(488, "Not Acceptable Here"));
    assert!(h.phone.place_call("sip:301@pbx.test").await.is_err());
    assert_eq!(h.phone.line(line(2)).status, LineStatus::Free);
    assert_eq!(h.phone.line(first).status, LineStatus::Connected);
    assert_eq!(h.phone.active_line(), Some(first));
    assert_eq!(h.engine.count(MockOp::Invite), 1);

    h.phone.hold(first).await.unwrap();
    h.engine.fail_next(MockOp::Renegotiate, EngineError::Timeout);
    assert!(h.phone.resume(first).await.is_err());
    assert_eq!(h.phone.line(first).status, LineStatus::Held);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_call_answered() {
    let mut h = connected(config()).await;
    h.drain();

    h.incoming("in-1", "sip:caller@pbx.test");
    settle().await;

    let ringing = h.phone.line(line(1));
    assert_eq!(ringing.status, LineStatus::Ringing);
    assert_eq!(ringing.call.as_ref().unwrap().direction, CallDirection::Inbound);
    assert!(h
        .drain()
        .iter()
        .any(|event| matches!(event, PhoneEvent::IncomingCall { line: l, .. } if *l == line(1))));

    let info = h.phone.answer(line(1)).await.unwrap();
    assert_eq!(info.state, CallState::Established);
    assert!(info.connected_at.is_some());
    assert_eq!(h.phone.active_line(), Some(line(1)));
    assert_eq!(h.engine.count(MockOp::Accept), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reject_inbound_call_frees_line() {
    let h = connected(config()).await;
    h.incoming("in-1", "sip:caller@pbx.test");
    settle().await;

    h.phone.reject(line(1)).await.unwrap();

    assert!(h.engine.calls().contains(&EngineCall::Reject {
        session: SessionHandle::new("in-1"),
        code: 603,
    }));
    assert_eq!(h.phone.line(line(1)).status, LineStatus::Free);
}

#[tokio::test(start_paused = true)]
async fn test_remote_hangup_frees_line() {
    let mut h = connected(config()).await;
    let first = h.established_call("sip:300@pbx.test").await;
    h.drain();

    let session = h.invited_session("sip:300@pbx.test");
    h.remote(&session, RemoteSessionState::Terminated { reason: "BYE".to_string() });
    settle().await;

    assert_eq!(h.phone.line(first).status, LineStatus::Free);
    assert_eq!(h.phone.active_line(), None);
    let ended = h.drain().into_iter().find_map(|event| match event {
        PhoneEvent::CallStateChanged(info) if info.state == CallState::Terminated => Some(info),
        _ => None,
    });
    assert_eq!(ended.unwrap().termination, Some(TerminationReason::RemoteHangup));
    assert_eq!(h.engine.count(MockOp::Terminate), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out() {
    let h = connected(config()).await;
    h.phone.place_call("sip:300@pbx.test").await.unwrap();

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(h.phone.line(line(1)).status, LineStatus::Connecting);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.phone.line(line(1)).status, LineStatus::Free);
    assert_eq!(h.engine.count(MockOp::Terminate), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_operation_on_line_is_rejected() {
    let h = connected(config()).await;
    let first = h.established_call("sip:300@pbx.test").await;
    h.engine.hang(MockOp::Renegotiate);

    let phone = h.phone.clone();
    let hold = tokio::spawn(async move { phone.hold(first).await });
    settle().await;

    assert!(matches!(
        h.phone.hold(first).await,
        Err(PhoneError::OperationInProgress { .. })
    ));

    // Hangup cancels the operation in flight
    h.phone.hangup(first).await.unwrap();
    assert!(matches!(hold.await.unwrap(), Err(PhoneError::Cancelled { .. })));
    assert_eq!(h.phone.line(first).status, LineStatus::Free);
}

#[tokio::test(start_paused = true)]
async fn test_hangup_during_invite_abandons_call() {
    let h = connected(config()).await;
    h.engine.hang(MockOp::Invite);

    let phone = h.phone.clone();
    let dialing = tokio::spawn(async move { phone.place_call("sip:300@pbx.test").await });
    settle().await;
    assert_eq!(h.phone.line(line(1)).status, LineStatus::Connecting);

    h.phone.hangup(line(1)).await.unwrap();

    assert!(matches!(dialing.await.unwrap(), Err(PhoneError::Cancelled { .. })));
    assert_eq!(h.phone.line(line(1)).status, LineStatus::Free);
    // No session was handed back, so there is nothing to terminate
    assert_eq!(h.engine.count(MockOp::Terminate), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dtmf_requires_established_call() {
    let h = connected(config()).await;
    let first = h.established_call("sip:300@pbx.test").await;

    h.phone.send_dtmf(first, "12#*").await.unwrap();
    assert!(matches!(
        h.phone.send_dtmf(first, "12x").await,
        Err(PhoneError::InvalidDtmf { .. })
    ));
    assert!(matches!(
        h.phone.send_dtmf(line(2), "1").await,
        Err(PhoneError::LineIdle { .. })
    ));
    assert_eq!(h.engine.count(MockOp::SendDtmf), 1);
}

#[derive(Debug, Clone)]
enum LineOp {
    Place,
    Incoming,
    RemoteAnswer(u8),
    Answer(u8),
    Hold(u8),
    Resume(u8),
    Hangup(u8),
    RemoteHangup(u8),
}

fn line_op() -> impl Strategy<Value = LineOp> {
    prop_oneof![
        Just(LineOp::Place),
        Just(LineOp::Incoming),
        (1u8..=3).prop_map(LineOp::RemoteAnswer),
        (1u8..=3).prop_map(LineOp::Answer),
        (1u8..=3).prop_map(LineOp::Hold),
        (1u8..=3).prop_map(LineOp::Resume),
        (1u8..=3).prop_map(LineOp::Hangup),
        (1u8..=3).prop_map(LineOp::RemoteHangup),
    ]
}

async fn apply(h: &Harness, op: &LineOp, serial: usize, sessions: &mut HashMap<String, SessionHandle>) {
    let session_on = |number: u8, sessions: &HashMap<String, SessionHandle>| {
        h.phone
            .line(line(number))
            .call
            .and_then(|call| sessions.get(&call.remote).cloned())
    };
    match op {
        LineOp::Place => {
            let target = format!("sip:out-{}@pbx.test", serial);
            if h.phone.place_call(&target).await.is_ok() {
                sessions.insert(target.clone(), h.invited_session(&target));
            }
        }
        LineOp::Incoming => {
            let from = format!("sip:in-{}@pbx.test", serial);
            let session = format!("in-{}", serial);
            sessions.insert(from.clone(), SessionHandle::new(session.clone()));
            h.incoming(&session, &from);
        }
        LineOp::RemoteAnswer(number) => {
            if let Some(session) = session_on(*number, sessions) {
                h.remote(&session, RemoteSessionState::Accepted);
            }
        }
        LineOp::Answer(number) => {
            let _ = h.phone.answer(line(*number)).await;
        }
        LineOp::Hold(number) => {
            let _ = h.phone.hold(line(*number)).await;
        }
        LineOp::Resume(number) => {
            let _ = h.phone.resume(line(*number)).await;
        }
        LineOp::Hangup(number) => {
            let _ = h.phone.hangup(line(*number)).await;
        }
        LineOp::RemoteHangup(number) => {
            if let Some(session) = session_on(*number, sessions) {
                h.remote(&session, RemoteSessionState::Terminated { reason: "BYE".to_string() });
            }
        }
    }
    settle().await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_lines_never_share_calls_or_focus(ops in prop::collection::vec(line_op(), 1..30)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        let result: Result<(), TestCaseError> = runtime.block_on(async {
            let h = connected(config()).await;
            let mut sessions = HashMap::new();

            for (serial, op) in ops.iter().enumerate() {
                apply(&h, op, serial, &mut sessions).await;

                let lines = h.phone.lines();
                let active: Vec<_> = lines.iter().filter(|snapshot| snapshot.is_active).map(|s| s.line).collect();
                prop_assert!(active.len() <= 1, "more than one active line after {:?}", op);
                prop_assert_eq!(active.first().copied(), h.phone.active_line());

                let unheld: Vec<_> = lines
                    .iter()
                    .filter(|snapshot| snapshot.status == LineStatus::Connected)
                    .map(|snapshot| snapshot.line)
                    .collect();
                prop_assert!(unheld.len() <= 1, "lines {:?} connected at once after {:?}", unheld, op);
                for connected_line in &unheld {
                    prop_assert_eq!(Some(*connected_line), h.phone.active_line(), "unfocused connected line after {:?}", op);
                }

                let mut ids = HashSet::new();
                for snapshot in &lines {
                    match &snapshot.call {
                        Some(call) => {
                            prop_assert!(ids.insert(call.call_id), "call on two lines after {:?}", op);
                            prop_assert_eq!(call.line, snapshot.line);
                            prop_assert!(call.state != CallState::Terminated);
                        }
                        None => {
                            prop_assert!(!snapshot.is_active);
                        }
                    }
                }
            }
            Ok(())
        });
        result?;
    }
}
