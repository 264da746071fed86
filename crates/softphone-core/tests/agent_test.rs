//! Agent queue state through the admin API and in-band signalling

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use common::{config, line, settle, Harness};
use rvoip_softphone_core::mock::{EngineCall, MockEngine, MockOp};
use rvoip_softphone_core::{
    AdminApiError, AgentAction, AgentActionOutcome, AgentAdminApi, AgentState, LineStatus, PhoneError, PhoneEvent,
    Softphone,
};

#[derive(Default)]
struct RecordingApi {
    actions: Mutex<Vec<(String, AgentAction)>>,
    unavailable: bool,
}

#[async_trait]
impl AgentAdminApi for RecordingApi {
    async fn execute(&self, agent_id: &str, action: &AgentAction) -> Result<(), AdminApiError> {
        self.actions.lock().push((agent_id.to_string(), action.clone()));
        if self.unavailable {
            return Err(AdminApiError::Unavailable {
                reason: "503 from queue service".to_string(),
            });
        }
        Ok(())
    }
}

async fn agent_harness(api: Option<Arc<RecordingApi>>) -> Harness {
    let engine = Arc::new(MockEngine::new());
    let mut builder = Softphone::builder(config().with_agent_id("4001")).engine(engine.clone());
    if let Some(api) = api {
        builder = builder.admin_api(api);
    }
    let phone = builder.build().unwrap();
    let events = phone.subscribe_events();
    phone.connect().await.unwrap();
    settle().await;
    Harness { engine, phone, events }
}

fn signals(h: &Harness) -> Vec<String> {
    h.engine
        .calls_of(MockOp::InBandSignal)
        .into_iter()
        .filter_map(|call| match call {
            EngineCall::InBandSignal { sequence, .. } => Some(sequence),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_in_band_login_uses_background_line() {
    let mut h = agent_harness(None).await;
    h.drain();

    let outcome = h.phone.agent_login().await.unwrap();

    assert_eq!(outcome, AgentActionOutcome::ViaSignal { line: line(1) });
    assert_eq!(signals(&h), vec!["*454001#".to_string()]);
    assert_eq!(h.phone.agent_state(), AgentState::Available);
    assert_eq!(h.phone.line(line(1)).status, LineStatus::Free);
    assert_eq!(h.phone.active_line(), None);

    let states: Vec<AgentState> = h
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            PhoneEvent::AgentStateChanged { current, .. } => Some(current),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![AgentState::LoggingIn, AgentState::Available]);
}

#[tokio::test(start_paused = true)]
async fn test_admin_api_preferred_when_available() {
    let api = Arc::new(RecordingApi::default());
    let h = agent_harness(Some(api.clone())).await;

    let outcome = h.phone.agent_login().await.unwrap();
    assert_eq!(outcome, AgentActionOutcome::ViaApi);
    h.phone.agent_pause(Some("lunch".to_string())).await.unwrap();

    assert!(signals(&h).is_empty());
    let actions = api.actions.lock().clone();
    assert_eq!(
        actions,
        vec![
            ("4001".to_string(), AgentAction::Login),
            (
                "4001".to_string(),
                AgentAction::Pause {
                    reason: Some("lunch".to_string())
                }
            ),
        ]
    );
    let context = h.phone.agent_context();
    assert_eq!(context.state, AgentState::Paused);
    assert_eq!(context.pause_reason.as_deref(), Some("lunch"));
}

#[tokio::test(start_paused = true)]
async fn test_api_failure_falls_back_to_in_band() {
    let api = Arc::new(RecordingApi {
        unavailable: true,
        ..Default::default()
    });
    let h = agent_harness(Some(api.clone())).await;

    h.phone.agent_login().await.unwrap();
    let outcome = h.phone.agent_pause(Some("2".to_string())).await.unwrap();

    assert!(matches!(outcome, AgentActionOutcome::ViaSignal { .. }));
    assert_eq!(api.actions.lock().len(), 2);
    assert_eq!(signals(&h), vec!["*454001#".to_string(), "*474001*2#".to_string()]);
    assert_eq!(h.phone.agent_state(), AgentState::Paused);
}

#[tokio::test(start_paused = true)]
async fn test_on_call_restores_paused_state() {
    let h = agent_harness(None).await;
    h.phone.agent_login().await.unwrap();
    h.phone.agent_pause(Some("2".to_string())).await.unwrap();
    assert_eq!(h.phone.agent_state(), AgentState::Paused);

    let call = h.established_call("sip:300@pbx.test").await;
    assert_eq!(h.phone.agent_state(), AgentState::OnCall);
    assert_eq!(h.phone.agent_context().previous_state, Some(AgentState::Paused));

    h.phone.hangup(call).await.unwrap();
    assert_eq!(h.phone.agent_state(), AgentState::Paused);
}

#[tokio::test(start_paused = true)]
async fn test_on_call_waits_for_last_call() {
    let h = agent_harness(None).await;
    h.phone.agent_login().await.unwrap();

    let first = h.established_call("sip:300@pbx.test").await;
    let second = h.established_call("sip:301@pbx.test").await;
    assert_eq!(h.phone.agent_state(), AgentState::OnCall);

    h.phone.hangup(first).await.unwrap();
    assert_eq!(h.phone.agent_state(), AgentState::OnCall);
    h.phone.hangup(second).await.unwrap();
    assert_eq!(h.phone.agent_state(), AgentState::Available);
}

#[tokio::test(start_paused = true)]
async fn test_in_band_action_aborts_without_free_line() {
    let mut h = agent_harness(None).await;
    for n in 0..3 {
        h.phone.place_call(&format!("sip:30{}@pbx.test", n)).await.unwrap();
    }
    h.drain();

    let result = h.phone.agent_login().await;

    assert!(matches!(result, Err(PhoneError::NoCapacity { .. })));
    assert_eq!(h.phone.agent_state(), AgentState::LoggedOut);
    assert!(signals(&h).is_empty());
    assert!(h.drain().iter().any(|event| matches!(
        event,
        PhoneEvent::AgentActionCompleted {
            action: AgentAction::Login,
            outcome: AgentActionOutcome::AbortedNoCapacity,
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_transitions_rejected() {
    let h = agent_harness(None).await;

    assert!(matches!(
        h.phone.agent_pause(None).await,
        Err(PhoneError::InvalidAgentState { state: AgentState::LoggedOut, .. })
    ));
    h.phone.agent_login().await.unwrap();
    assert!(matches!(
        h.phone.agent_login().await,
        Err(PhoneError::InvalidAgentState { .. })
    ));
    assert!(matches!(
        h.phone.agent_resume().await,
        Err(PhoneError::InvalidAgentState { .. })
    ));

    h.phone.agent_logout().await.unwrap();
    assert_eq!(h.phone.agent_state(), AgentState::LoggedOut);
}
