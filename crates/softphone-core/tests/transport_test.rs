//! Connection loss, reconnection and keep-alive

mod common;

use std::time::Duration;

use common::{config, connected, harness, settle};
use rvoip_softphone_core::mock::MockOp;
use rvoip_softphone_core::{
    CallState, EngineError, EngineEvent, PhoneEvent, RegistrationState, SubscriptionStatus, TerminationReason,
    TransportState,
};

fn lose_connection(h: &common::Harness) {
    h.engine.emit(EngineEvent::TransportDisconnected {
        reason: "socket closed".to_string(),
    });
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_cancels_connection_timers() {
    let mut h = harness(config().with_monitored_extensions(["201"]));
    h.engine.set_register_expires(Some(600));
    h.phone.connect().await.unwrap();
    settle().await;
    let line = h.established_call("sip:300@pbx.test").await;
    h.drain();

    h.engine.fail_always(MockOp::Connect, EngineError::transport("refused"));
    lose_connection(&h);
    settle().await;

    assert_eq!(h.phone.transport_state(), TransportState::Disconnected);
    assert_eq!(h.phone.registration_state(), RegistrationState::Unregistered);
    assert_eq!(h.phone.subscription("201").unwrap().status, SubscriptionStatus::Expired);
    assert!(h.phone.line_manager().occupied_lines().is_empty());

    let ended = h.drain().into_iter().find_map(|event| match event {
        PhoneEvent::CallStateChanged(info) if info.line == line && info.state == CallState::Terminated => Some(info),
        _ => None,
    });
    assert_eq!(ended.unwrap().termination, Some(TerminationReason::TransportLost));

    // Registration refresh (540s), presence refresh (3240s) and heartbeat stay silent
    tokio::time::sleep(Duration::from_secs(4000)).await;
    assert_eq!(h.engine.count(MockOp::Register), 1);
    assert_eq!(h.engine.subscribe_count("201"), 1);
    assert_eq!(h.engine.count(MockOp::Ping), 0);
    assert_eq!(h.engine.count(MockOp::Connect), 11);
    assert!(h.drain().iter().any(|event| matches!(
        event,
        PhoneEvent::ReconnectionFailed { attempts: 10 }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_restores_registration_and_presence() {
    let mut h = connected(config().with_monitored_extensions(["201"])).await;
    assert_eq!(h.engine.subscribe_count("201"), 1);
    h.drain();

    lose_connection(&h);
    settle().await;
    assert_eq!(h.phone.subscription("201").unwrap().status, SubscriptionStatus::Expired);

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(h.phone.transport_state(), TransportState::Connected);
    assert_eq!(h.phone.registration_state(), RegistrationState::Registered);
    assert_eq!(h.engine.count(MockOp::Register), 2);
    assert_eq!(h.engine.subscribe_count("201"), 2);
    assert_eq!(h.phone.subscription("201").unwrap().status, SubscriptionStatus::Pending);
    assert!(h
        .drain()
        .iter()
        .any(|event| matches!(event, PhoneEvent::ReconnectionAttempting { attempt: 1, .. })));
}

#[tokio::test(start_paused = true)]
async fn test_failed_heartbeat_triggers_reconnect() {
    let h = connected(config()).await;
    h.engine.fail_next(MockOp::Ping, EngineError::Timeout);

    tokio::time::sleep(Duration::from_secs(89)).await;
    assert_eq!(h.engine.count(MockOp::Ping), 0);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.engine.count(MockOp::Ping), 1);
    assert_eq!(h.phone.transport_state(), TransportState::Disconnected);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.engine.count(MockOp::Connect), 2);
    assert_eq!(h.engine.count(MockOp::Register), 2);
    assert_eq!(h.phone.registration_state(), RegistrationState::Registered);
}

#[tokio::test(start_paused = true)]
async fn test_failed_initial_connect_is_not_retried() {
    let h = harness(config());
    h.engine.fail_next(MockOp::Connect, EngineError::transport("refused"));

    assert!(h.phone.connect().await.is_err());
    assert_eq!(h.phone.transport_state(), TransportState::Disconnected);
    assert_eq!(h.phone.registration_state(), RegistrationState::Unregistered);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.engine.count(MockOp::Connect), 1);
    assert_eq!(h.engine.count(MockOp::Register), 0);

    // A later explicit connect works
    h.phone.connect().await.unwrap();
    assert_eq!(h.phone.registration_state(), RegistrationState::Registered);
}
